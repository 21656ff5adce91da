//! Purpose: `flocklog` CLI entry point.
//! Role: Binary crate root; parses args, installs logging, runs commands, emits JSON on stdout.
//! Invariants: Command results are JSON on stdout (pretty on a TTY).
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `flocklog::to_exit_code`.
//! Invariants: All log appends go through `FlockFileHandler` (lock, single write, release).
use std::io::{self, BufRead, IsTerminal};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

mod command_dispatch;

use flocklog::probe::ProbeMode;
use flocklog::{
    AcquireMode, Durability, Error, ErrorKind, HandlerOptions, LockFailurePolicy, LockTarget,
    to_exit_code,
};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse_from(std::env::args_os()) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(clap_error_summary(&err))
                        .with_hint("Run `flocklog --help` for usage."),
                    ColorMode::Auto,
                ));
            }
        },
    };

    let color_mode = cli.color;
    let options = cli.lock.to_options().map_err(|err| (err, color_mode))?;
    init_logging(cli.log_file.as_deref(), &options).map_err(|err| (err, color_mode))?;

    command_dispatch::dispatch_command(cli.command, options, color_mode)
        .map_err(add_corrupt_hint)
        .map_err(add_io_hint)
        .map_err(add_internal_hint)
        .map_err(|err| (err, color_mode))
}

#[derive(Parser)]
#[command(
    name = "flocklog",
    version,
    about = "Multiprocess-safe log appends over advisory flock locks",
    long_about = None,
    before_help = r#"Every record is appended with one write while an exclusive flock is held,
so concurrent writers (threads or processes) never interleave lines.
Locks are advisory: writers that bypass flocklog are not excluded."#,
    after_help = r#"EXAMPLES
  $ flocklog write app.log "service started"
  $ tail -f other.log | flocklog write app.log
  $ flocklog probe separate-handles-fork /tmp/test.flock
  $ flocklog stress --procs 4 --threads 4 /tmp/stress.log
  $ flocklog verify app.log --expected 1200"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics and pretty JSON output: auto|always|never"
    )]
    color: ColorMode,

    #[arg(
        long,
        global = true,
        help = "Send flocklog's own diagnostics to this file (flock-guarded) instead of stderr"
    )]
    log_file: Option<PathBuf>,

    #[command(flatten)]
    lock: LockArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Default)]
struct LockArgs {
    #[arg(
        long,
        global = true,
        conflicts_with_all = ["lock_suffix", "lock_path"],
        help = "Lock the log file itself instead of a sidecar"
    )]
    lock_same_file: bool,
    #[arg(
        long,
        global = true,
        conflicts_with = "lock_path",
        help = "Sidecar lock suffix appended to the log file name (default: .lock)"
    )]
    lock_suffix: Option<String>,
    #[arg(long, global = true, help = "Explicit lock file shared by all writers")]
    lock_path: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        help = "Busy-retry the lock for at most this long (e.g. 250ms, 2s)"
    )]
    timeout: Option<String>,
    #[arg(
        long,
        global = true,
        conflicts_with = "timeout",
        help = "Try the lock once and give up if it is held"
    )]
    nonblocking: bool,
    #[arg(
        long,
        global = true,
        value_enum,
        help = "What to do when the lock cannot be taken (default: write-unlocked)"
    )]
    on_lock_failure: Option<LockFailureArg>,
    #[arg(
        long,
        global = true,
        value_enum,
        help = "fast: write only; flush: fsync data after every record (default: fast)"
    )]
    durability: Option<DurabilityArg>,
}

impl LockArgs {
    fn to_options(&self) -> Result<HandlerOptions, Error> {
        let lock_target = if self.lock_same_file {
            LockTarget::LogFile
        } else if let Some(path) = &self.lock_path {
            LockTarget::Path(path.clone())
        } else if let Some(suffix) = &self.lock_suffix {
            LockTarget::Sidecar {
                suffix: suffix.clone(),
            }
        } else {
            LockTarget::default()
        };
        let acquire = match (&self.timeout, self.nonblocking) {
            (Some(timeout), _) => AcquireMode::timeout(parse_duration(timeout)?),
            (None, true) => AcquireMode::NonBlocking,
            (None, false) => AcquireMode::Blocking,
        };
        let on_lock_failure = match self.on_lock_failure.unwrap_or(LockFailureArg::WriteUnlocked) {
            LockFailureArg::Fail => LockFailurePolicy::Fail,
            LockFailureArg::WriteUnlocked => LockFailurePolicy::WriteUnlocked,
        };
        let durability = match self.durability.unwrap_or(DurabilityArg::Fast) {
            DurabilityArg::Fast => Durability::Fast,
            DurabilityArg::Flush => Durability::Flush,
        };
        Ok(HandlerOptions::new()
            .with_lock_target(lock_target)
            .with_acquire(acquire)
            .with_lock_failure(on_lock_failure)
            .with_durability(durability))
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LockFailureArg {
    Fail,
    WriteUnlocked,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum DurabilityArg {
    Fast,
    Flush,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ProbeModeArg {
    #[value(alias = "n")]
    SameHandle,
    #[value(alias = "N")]
    SeparateHandles,
    #[value(alias = "t")]
    SameHandleThread,
    #[value(alias = "T")]
    SeparateHandlesThread,
    #[value(alias = "f")]
    SameHandleFork,
    #[value(alias = "F")]
    SeparateHandlesFork,
}

impl From<ProbeModeArg> for ProbeMode {
    fn from(mode: ProbeModeArg) -> Self {
        match mode {
            ProbeModeArg::SameHandle => ProbeMode::SameHandle,
            ProbeModeArg::SeparateHandles => ProbeMode::SeparateHandles,
            ProbeModeArg::SameHandleThread => ProbeMode::SameHandleThread,
            ProbeModeArg::SeparateHandlesThread => ProbeMode::SeparateHandlesThread,
            ProbeModeArg::SameHandleFork => ProbeMode::SameHandleFork,
            ProbeModeArg::SeparateHandlesFork => ProbeMode::SeparateHandlesFork,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(
        arg_required_else_help = true,
        about = "Append records to a log file under the lock",
        long_about = r#"Append one record per MESSAGE, or one per stdin line when no MESSAGE is given.

Each record is `YYYY-MM-DD HH:MM:SS,mmm <message>` (UTC) and is written with a single
append while the lock is held."#,
        after_help = r#"EXAMPLES
  $ flocklog write app.log "deploy started" "deploy finished"
  $ flocklog write --lock-same-file --timeout 500ms app.log "tick"
  $ journalctl -f | flocklog write --on-lock-failure fail app.log"#
    )]
    Write {
        #[arg(help = "Log file to append to (created if missing)")]
        log: PathBuf,
        #[arg(help = "Messages to append; reads stdin lines when omitted")]
        messages: Vec<String>,
    },
    #[command(
        arg_required_else_help = true,
        about = "Show which contenders an exclusive flock actually excludes",
        long_about = r#"Lock PATH, then let a contender try LOCK_EX|LOCK_NB on the same handle or a new one,
inline, from a thread, or from a forked child. Short forms: n N t T f F."#
    )]
    Probe {
        #[arg(value_enum, help = "Contender placement")]
        mode: ProbeModeArg,
        #[arg(default_value = "test.flock", help = "File to lock")]
        path: PathBuf,
    },
    #[command(
        about = "Write from many processes and threads at once, then verify the log",
        long_about = r#"Spawn worker processes that log through a handler and take per-thread and shared
locks on the log file itself. Global lock and durability flags are rejected here."#,
        after_help = r#"EXAMPLES
  $ flocklog stress
  $ flocklog stress --procs 8 --threads 2 --records 1000 --lock-tests 100 /tmp/s.log
  $ flocklog stress --keep shared.log      # append to an existing log; skip the count check"#
    )]
    Stress {
        #[arg(default_value = "test.log", help = "Log file to hammer")]
        log: PathBuf,
        #[arg(long, default_value_t = 3, help = "Worker processes")]
        procs: u32,
        #[arg(long, default_value_t = 3, help = "Threads per worker")]
        threads: u32,
        #[arg(long, default_value_t = 5000, help = "Plain records per thread")]
        records: u32,
        #[arg(long, default_value_t = 500, help = "Lock rounds per thread")]
        lock_tests: u32,
        #[arg(long, help = "Keep the existing log instead of deleting it first")]
        keep: bool,
    },
    #[command(
        arg_required_else_help = true,
        about = "Check that every line of a log is a complete record"
    )]
    Verify {
        #[arg(help = "Log file to check")]
        log: PathBuf,
        #[arg(long, help = "Regex each line must match (default: timestamped record)")]
        pattern: Option<String>,
        #[arg(long, help = "Exact number of lines expected")]
        expected: Option<u64>,
    },
    #[command(about = "Generate shell completion scripts")]
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
    #[command(about = "Print version info as JSON")]
    Version,
    #[command(hide = true)]
    StressWorker {
        #[arg(long = "proc")]
        proc_index: u32,
        #[arg(long)]
        threads: u32,
        #[arg(long)]
        records: u32,
        #[arg(long)]
        lock_tests: u32,
        log: PathBuf,
    },
}

fn init_logging(log_file: Option<&Path>, options: &HandlerOptions) -> Result<(), Error> {
    if let Some(path) = log_file {
        return flocklog::subscriber::init_file_logging(path, options.clone(), "info");
    }
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
    Ok(())
}

fn read_stdin_lines() -> Result<Vec<String>, Error> {
    let stdin = io::stdin();
    let mut lines = Vec::new();
    for line in stdin.lock().lines() {
        let line = line.map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read stdin")
                .with_source(err)
        })?;
        lines.push(line);
    }
    Ok(lines)
}

fn parse_duration(input: &str) -> Result<Duration, Error> {
    let invalid = || {
        Error::new(ErrorKind::Usage)
            .with_message("invalid duration")
            .with_hint("Use a number plus ms|s|m (e.g. 250ms).")
    };
    let trimmed = input.trim();
    let split = trimmed.char_indices().find(|(_, ch)| !ch.is_ascii_digit());
    let (num_str, unit) = match split {
        Some((idx, _)) => trimmed.split_at(idx),
        None => ("", ""),
    };
    if num_str.is_empty() || unit.is_empty() {
        return Err(invalid());
    }
    let value: u64 = num_str.parse().map_err(|_| invalid())?;
    let millis = match unit {
        "ms" => value,
        "s" => value.saturating_mul(1_000),
        "m" => value.saturating_mul(60_000),
        _ => return Err(invalid()),
    };
    Ok(Duration::from_millis(millis))
}

fn clap_error_summary(err: &clap::Error) -> String {
    let rendered = err.to_string();
    rendered
        .lines()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.trim_start_matches("error: ").trim().to_string())
        .unwrap_or_else(|| "invalid arguments".to_string())
}

fn add_io_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Permission => {
            err.with_hint("Permission denied. Check file and directory permissions.")
        }
        ErrorKind::Busy => err.with_hint(
            "Another writer holds the lock. Retry, raise --timeout, or allow --on-lock-failure write-unlocked.",
        ),
        ErrorKind::NotFound => err.with_hint("Check that the parent directory exists."),
        ErrorKind::Io => err.with_hint("I/O error. Check the path, filesystem, and disk space."),
        _ => err,
    }
}

fn add_corrupt_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Corrupt || err.hint().is_some() {
        return err;
    }
    err.with_hint("The log has torn or foreign lines. Check for writers that bypass the lock.")
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint("Unexpected internal failure. Retry with RUST_LOG=debug for details.")
}

fn emit_json(value: Value, color_mode: ColorMode) {
    let is_tty = io::stdout().is_terminal();
    let pretty = is_tty || color_mode.use_color(is_tty);
    let encoded = if pretty {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    };
    let json = encoded.unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::Busy => "lock is busy".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Corrupt => "log contains invalid records".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = vec![format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    )];
    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(path) = err.path() {
        lines.push(format!(
            "{} {}",
            colorize_label("path:", use_color, AnsiColor::Yellow),
            path.display()
        ));
    }
    for cause in error_causes(err) {
        lines.push(format!(
            "{} {cause}",
            colorize_label("caused by:", use_color, AnsiColor::Yellow)
        ));
    }
    lines.join("\n")
}
