//! Purpose: Check a shared log for torn or interleaved records.
//! Exports: `VerifyReport`, `InvalidLine`, `verify_log`, `verify_bytes`, `record_regex`.
//! Role: Backs `flocklog verify` and the stress run's final check.
//! Invariants: Input is read as raw bytes; torn writes may not be valid UTF-8.
//! Invariants: A line only counts as valid when newline-terminated and fully matched.
use std::path::Path;
use std::sync::LazyLock;

use bstr::ByteSlice;
use regex::bytes::Regex;
use serde::Serialize;

use crate::core::error::{Error, ErrorKind};
use crate::core::lock::open_error_kind;

/// Any line written through `Record::format_line`.
pub const RECORD_PATTERN: &str = r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2},\d{3} .*$";

static RECORD_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(RECORD_PATTERN).expect("record pattern compiles")
});

pub fn record_regex() -> &'static Regex {
    &RECORD_REGEX
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct InvalidLine {
    pub line: u64,
    pub text: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct VerifyReport {
    pub lines: u64,
    pub valid: u64,
    pub expected: Option<u64>,
    pub first_invalid: Option<InvalidLine>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.first_invalid.is_none() && self.expected.is_none_or(|expected| expected == self.lines)
    }

    pub fn into_result(self) -> Result<Self, Error> {
        if let Some(invalid) = &self.first_invalid {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("invalid record at line {}: {}", invalid.line, invalid.text)));
        }
        if let Some(expected) = self.expected {
            if expected != self.lines {
                return Err(Error::new(ErrorKind::Corrupt).with_message(format!(
                    "expected {expected} records, found {}",
                    self.lines
                )));
            }
        }
        Ok(self)
    }
}

pub fn verify_log(
    path: &Path,
    pattern: &Regex,
    expected: Option<u64>,
) -> Result<VerifyReport, Error> {
    let bytes = std::fs::read(path).map_err(|err| {
        Error::new(open_error_kind(&err))
            .with_message("failed to read log")
            .with_path(path)
            .with_source(err)
    })?;
    let report = verify_bytes(&bytes, pattern, expected);
    tracing::debug!(
        path = %path.display(),
        lines = report.lines,
        valid = report.valid,
        "verified log"
    );
    Ok(report)
}

pub fn verify_bytes(bytes: &[u8], pattern: &Regex, expected: Option<u64>) -> VerifyReport {
    let mut report = VerifyReport {
        lines: 0,
        valid: 0,
        expected,
        first_invalid: None,
    };
    for raw in bytes.lines_with_terminator() {
        report.lines += 1;
        let terminated = raw.ends_with(b"\n");
        let line = raw.trim_end_with(|ch| ch == '\n' || ch == '\r');
        if terminated && pattern.is_match(line) {
            report.valid += 1;
        } else if report.first_invalid.is_none() {
            report.first_invalid = Some(InvalidLine {
                line: report.lines,
                text: line.to_str_lossy().into_owned(),
            });
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::{record_regex, verify_bytes};

    #[test]
    fn clean_log_passes_with_expected_count() {
        let log = b"2026-02-01 00:00:00,001 a\n2026-02-01 00:00:00,002 b\n";
        let report = verify_bytes(log, record_regex(), Some(2));
        assert_eq!(report.lines, 2);
        assert_eq!(report.valid, 2);
        assert!(report.is_ok());
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn interleaved_record_is_reported() {
        let log = b"2026-02-01 00:00:00,001 a\n2026-02-01 002026-02-01 00:00:00,003 c\n:00:00,002 b\n";
        let report = verify_bytes(log, record_regex(), None);
        assert_eq!(report.lines, 3);
        let invalid = report.first_invalid.clone().expect("invalid line");
        assert_eq!(invalid.line, 2);
        assert_eq!(invalid.text, "2026-02-01 002026-02-01 00:00:00,003 c");
        assert_eq!(report.valid, 1);
        assert!(!report.is_ok());
    }

    #[test]
    fn missing_terminator_counts_as_torn() {
        let log = b"2026-02-01 00:00:00,001 a\n2026-02-01 00:00:00,002 b";
        let report = verify_bytes(log, record_regex(), Some(2));
        assert_eq!(report.valid, 1);
        assert_eq!(report.first_invalid.expect("torn").line, 2);
    }

    #[test]
    fn count_mismatch_is_corrupt() {
        let log = b"2026-02-01 00:00:00,001 a\n";
        let report = verify_bytes(log, record_regex(), Some(2));
        let err = report.into_result().expect_err("count mismatch");
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Corrupt);
    }

    #[test]
    fn invalid_utf8_is_reported_lossily() {
        let log = b"\xff\xfe broken\n";
        let report = verify_bytes(log, record_regex(), None);
        assert_eq!(report.valid, 0);
        assert!(report.first_invalid.expect("invalid").text.ends_with(" broken"));
    }
}
