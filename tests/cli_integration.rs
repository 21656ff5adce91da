// CLI integration tests for write/probe/stress/verify flows.
use std::io::Write;
use std::process::{Command, Stdio};

use serde_json::Value;

fn cmd() -> Command {
    let exe = env!("CARGO_BIN_EXE_flocklog");
    Command::new(exe)
}

fn parse_json(output: &[u8]) -> Value {
    serde_json::from_slice(output).expect("valid json")
}

#[test]
fn write_then_verify_flow() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = temp.path().join("app.log");
    let log_arg = log.to_str().unwrap();

    let write = cmd()
        .args(["write", log_arg, "first", "second"])
        .output()
        .expect("write");
    assert!(write.status.success());
    let summary = parse_json(&write.stdout);
    assert_eq!(summary["written"], 2);
    assert_eq!(summary["unlocked"], 0);
    assert!(temp.path().join("app.log.lock").exists());

    let mut child = cmd()
        .args(["write", log_arg])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("spawn");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(b"third\nfourth\n")
        .expect("feed stdin");
    let piped = child.wait_with_output().expect("wait");
    assert!(piped.status.success());
    assert_eq!(parse_json(&piped.stdout)["written"], 2);

    let verify = cmd()
        .args(["verify", log_arg, "--expected", "4"])
        .output()
        .expect("verify");
    assert!(verify.status.success());
    let report = parse_json(&verify.stdout);
    assert_eq!(report["ok"], true);
    assert_eq!(report["report"]["lines"], 4);

    let text = std::fs::read_to_string(&log).expect("read");
    let messages: Vec<&str> = text
        .lines()
        .map(|line| line.split_once(' ').unwrap().1.split_once(' ').unwrap().1)
        .collect();
    assert_eq!(messages, ["first", "second", "third", "fourth"]);
}

#[test]
fn lock_same_file_skips_sidecar() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = temp.path().join("app.log");
    let write = cmd()
        .args(["write", "--lock-same-file", log.to_str().unwrap(), "one"])
        .output()
        .expect("write");
    assert!(write.status.success());
    assert!(!temp.path().join("app.log.lock").exists());
}

#[test]
fn verify_reports_torn_lines_with_corrupt_exit() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = temp.path().join("torn.log");
    std::fs::write(
        &log,
        "2026-02-01 00:00:00,001 ok\n2026-02-01 00:2026-02-01 00:00:00,002 b\n",
    )
    .expect("seed");

    let verify = cmd()
        .args(["verify", log.to_str().unwrap()])
        .output()
        .expect("verify");
    assert_eq!(verify.status.code(), Some(6));
    let report = parse_json(&verify.stdout);
    assert_eq!(report["ok"], false);
    assert_eq!(report["report"]["first_invalid"]["line"], 2);

    let custom = cmd()
        .args(["verify", log.to_str().unwrap(), "--pattern", "^2026-"])
        .output()
        .expect("verify custom");
    assert!(custom.status.success());
}

#[test]
fn verify_rejects_bad_pattern_as_usage() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = temp.path().join("app.log");
    std::fs::write(&log, "").expect("seed");
    let verify = cmd()
        .args(["verify", log.to_str().unwrap(), "--pattern", "("])
        .output()
        .expect("verify");
    assert_eq!(verify.status.code(), Some(2));
}

#[test]
fn probe_modes_match_flock_semantics() {
    let cases = [
        ("n", true),
        ("N", false),
        ("t", true),
        ("T", false),
        ("f", true),
        ("F", false),
    ];
    for (letter, contender_locks) in cases {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("test.flock");
        let output = cmd()
            .args(["probe", letter, path.to_str().unwrap()])
            .output()
            .expect("probe");
        assert!(output.status.success(), "mode {letter}");
        let value = parse_json(&output.stdout);
        assert_eq!(value["letter"], letter);
        let attempts = value["attempts"].as_array().expect("attempts");
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0]["role"], "holder");
        assert_eq!(attempts[0]["locked"], true);
        assert_eq!(attempts[1]["role"], "contender");
        assert_eq!(attempts[1]["locked"], contender_locks, "mode {letter}");

        let same_pid = attempts[0]["pid"] == attempts[1]["pid"];
        assert_eq!(same_pid, !matches!(letter, "f" | "F"), "mode {letter}");
    }
}

#[test]
fn stress_run_produces_exact_line_count() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = temp.path().join("stress.log");
    let output = cmd()
        .args([
            "stress",
            "--procs",
            "3",
            "--threads",
            "3",
            "--records",
            "200",
            "--lock-tests",
            "50",
            log.to_str().unwrap(),
        ])
        .output()
        .expect("stress");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let value = parse_json(&output.stdout);
    assert_eq!(value["ok"], true);
    let expected = 3 * 3 * (200 + 4 * 50);
    assert_eq!(value["stress"]["verify"]["lines"], expected);
    assert_eq!(value["stress"]["verify"]["valid"], expected);
    assert_eq!(value["stress"]["verify"]["expected"], expected);
}

#[test]
fn stress_keep_appends_without_count_check() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = temp.path().join("stress.log");
    let args = |keep: bool| {
        let mut args = vec![
            "stress".to_string(),
            "--procs=2".to_string(),
            "--threads=2".to_string(),
            "--records=10".to_string(),
            "--lock-tests=5".to_string(),
        ];
        if keep {
            args.push("--keep".to_string());
        }
        args.push(log.to_str().unwrap().to_string());
        args
    };
    assert!(cmd().args(args(false)).output().expect("first").status.success());
    let second = cmd().args(args(true)).output().expect("second");
    assert!(second.status.success());
    let value = parse_json(&second.stdout);
    assert_eq!(value["stress"]["verify"]["expected"], Value::Null);
    assert_eq!(value["stress"]["verify"]["lines"], 2 * 2 * 2 * (10 + 4 * 5));
}

#[test]
fn usage_errors_are_json_on_stderr() {
    let output = cmd()
        .args(["write", "app.log", "--timeout", "soon", "x"])
        .output()
        .expect("write");
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    let err: Value = serde_json::from_str(stderr.lines().next().expect("line")).expect("json");
    assert_eq!(err["error"]["kind"], "Usage");
    assert_eq!(err["error"]["message"], "invalid duration");
}

#[test]
fn log_file_routes_diagnostics_through_the_lock() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = temp.path().join("app.log");
    let diag = temp.path().join("diag.log");
    let output = cmd()
        .env("RUST_LOG", "debug")
        .args([
            "--log-file",
            diag.to_str().unwrap(),
            "write",
            log.to_str().unwrap(),
            "hello",
        ])
        .output()
        .expect("write");
    assert!(output.status.success());
    let text = std::fs::read_to_string(&diag).expect("diag");
    assert!(text.contains("appended records"));
    assert!(temp.path().join("diag.log.lock").exists());
}

#[test]
fn version_is_json() {
    let output = cmd().arg("version").output().expect("version");
    assert!(output.status.success());
    let value = parse_json(&output.stdout);
    assert_eq!(value["name"], "flocklog");
}

#[test]
fn multiline_argument_is_written_as_one_record() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = temp.path().join("app.log");
    let log_arg = log.to_str().unwrap();
    let write = cmd()
        .args(["write", log_arg, "a\nb"])
        .output()
        .expect("write");
    assert!(write.status.success());

    let verify = cmd()
        .args(["verify", log_arg, "--expected", "1"])
        .output()
        .expect("verify");
    assert!(verify.status.success());
    let text = std::fs::read_to_string(&log).expect("read");
    assert!(text.ends_with(" a\\nb\n"), "{text:?}");
}

#[test]
fn stress_rejects_lock_flags() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = temp.path().join("stress.log");
    for flag in ["--lock-same-file", "--nonblocking", "--durability=flush"] {
        let output = cmd()
            .args(["stress", flag, "--procs=1", log.to_str().unwrap()])
            .output()
            .expect("stress");
        assert_eq!(output.status.code(), Some(2), "{flag}");
        let stderr = String::from_utf8_lossy(&output.stderr);
        let err: Value = serde_json::from_str(stderr.lines().next().expect("line")).expect("json");
        assert_eq!(err["error"]["kind"], "Usage");
    }
    assert!(!log.exists());
}
