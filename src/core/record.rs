// Log records and their single-line text rendering.
use std::borrow::Cow;

use time::OffsetDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

const TIMESTAMP: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second],[subsecond digits:3]");

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub time: OffsetDateTime,
    pub message: String,
}

impl Record {
    pub fn new(time: OffsetDateTime, message: impl Into<String>) -> Self {
        Self {
            time,
            message: message.into(),
        }
    }

    pub fn now(message: impl Into<String>) -> Self {
        Self::new(OffsetDateTime::now_utc(), message)
    }

    /// `YYYY-MM-DD HH:MM:SS,mmm <message>` terminated by exactly one newline.
    ///
    /// Line breaks inside the message are written as `\n` and `\r` escapes.
    pub fn format_line(&self) -> String {
        let stamp = self
            .time
            .format(TIMESTAMP)
            .unwrap_or_else(|_| "0000-00-00 00:00:00,000".to_string());
        let message = self.message.strip_suffix('\n').unwrap_or(&self.message);
        let message = escape_line_breaks(message);
        format!("{stamp} {message}\n")
    }
}

pub(crate) fn escape_line_breaks(message: &str) -> Cow<'_, str> {
    if !message.contains(['\n', '\r']) {
        return Cow::Borrowed(message);
    }
    let mut escaped = String::with_capacity(message.len() + 8);
    for ch in message.chars() {
        match ch {
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            _ => escaped.push(ch),
        }
    }
    Cow::Owned(escaped)
}

#[cfg(test)]
mod tests {
    use super::Record;
    use time::macros::datetime;

    #[test]
    fn format_line_uses_comma_milliseconds() {
        let record = Record::new(datetime!(2026-02-01 09:05:07.123456 UTC), "proc:0 rec:1");
        assert_eq!(record.format_line(), "2026-02-01 09:05:07,123 proc:0 rec:1\n");
    }

    #[test]
    fn format_line_keeps_single_terminator() {
        let record = Record::new(datetime!(2026-02-01 00:00:00 UTC), "done\n");
        assert_eq!(record.format_line(), "2026-02-01 00:00:00,000 done\n");
    }

    #[test]
    fn format_line_escapes_embedded_line_breaks() {
        let record = Record::new(datetime!(2026-02-01 00:00:00 UTC), "line one\nline two\r\n");
        assert_eq!(
            record.format_line(),
            "2026-02-01 00:00:00,000 line one\\nline two\\r\n"
        );
        assert_eq!(record.format_line().lines().count(), 1);
    }
}
