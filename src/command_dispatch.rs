//! Purpose: Hold top-level CLI command dispatch for `flocklog`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Reports go to stdout as JSON; failed checks map to the `Corrupt` exit code.

use super::*;

use flocklog::probe::probe;
use flocklog::stress::{StressConfig, WorkerConfig, run_stress, run_worker};
use flocklog::verify::{record_regex, verify_log};
use flocklog::{EmitOutcome, FlockFileHandler, MultiprocessHandler};
use regex::bytes::Regex;

pub(super) fn dispatch_command(
    command: Command,
    options: HandlerOptions,
    color_mode: ColorMode,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "flocklog", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Version => {
            emit_json(
                json!({
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                }),
                color_mode,
            );
            Ok(RunOutcome::ok())
        }
        Command::Write { log, messages } => {
            let messages = if messages.is_empty() {
                read_stdin_lines()?
            } else {
                messages
            };
            let handler = FlockFileHandler::open(&log, options)?;
            let mut unlocked = 0u64;
            for message in &messages {
                if handler.log(message)? == EmitOutcome::Unlocked {
                    unlocked += 1;
                }
            }
            tracing::debug!(path = %log.display(), written = messages.len(), "appended records");
            emit_json(
                json!({
                    "path": handler.path().display().to_string(),
                    "written": messages.len(),
                    "unlocked": unlocked,
                }),
                color_mode,
            );
            Ok(RunOutcome::ok())
        }
        Command::Probe { mode, path } => {
            let mode = ProbeMode::from(mode);
            let attempts = probe(mode, &path)?;
            emit_json(
                json!({
                    "mode": mode,
                    "letter": mode.letter().to_string(),
                    "description": mode.describe(),
                    "path": path.display().to_string(),
                    "attempts": attempts,
                }),
                color_mode,
            );
            Ok(RunOutcome::ok())
        }
        Command::Stress {
            log,
            procs,
            threads,
            records,
            lock_tests,
            keep,
        } => {
            if options != HandlerOptions::default() {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("stress does not take lock or durability flags")
                    .with_hint("Stress workers always lock the log file itself and block on it."));
            }
            if procs == 0 || threads == 0 {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("--procs and --threads must be at least 1"));
            }
            let exe = std::env::current_exe().map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("cannot locate the flocklog executable")
                    .with_source(err)
            })?;
            let config = StressConfig {
                path: log,
                procs,
                threads,
                records,
                lock_tests,
                fresh: !keep,
            };
            let report = run_stress(&config, &exe)?;
            let passed = report.verify.is_ok();
            emit_json(json!({ "stress": report, "ok": passed }), color_mode);
            Ok(check_outcome(passed))
        }
        Command::Verify {
            log,
            pattern,
            expected,
        } => {
            let custom = pattern
                .as_deref()
                .map(|pattern| {
                    Regex::new(pattern).map_err(|err| {
                        Error::new(ErrorKind::Usage)
                            .with_message("invalid --pattern")
                            .with_source(err)
                    })
                })
                .transpose()?;
            let regex = match &custom {
                Some(regex) => regex,
                None => record_regex(),
            };
            let report = verify_log(&log, regex, expected)?;
            let passed = report.is_ok();
            emit_json(
                json!({
                    "path": log.display().to_string(),
                    "report": report,
                    "ok": passed,
                }),
                color_mode,
            );
            Ok(check_outcome(passed))
        }
        Command::StressWorker {
            proc_index,
            threads,
            records,
            lock_tests,
            log,
        } => {
            let config = WorkerConfig {
                path: log,
                proc_index,
                threads,
                records,
                lock_tests,
            };
            run_worker(&config)?;
            Ok(RunOutcome::ok())
        }
    }
}

fn check_outcome(passed: bool) -> RunOutcome {
    if passed {
        RunOutcome::ok()
    } else {
        RunOutcome::with_code(to_exit_code(ErrorKind::Corrupt))
    }
}
