//! Purpose: Hammer one log file from many processes and threads, then check it.
//! Exports: `StressConfig`, `WorkerConfig`, `StressReport`, `run_stress`, `run_worker`,
//! `expected_lines`, `stress_regex`.
//! Role: Backs `flocklog stress` and its hidden `stress-worker` subcommand.
//! Invariants: Workers lock the log file itself, so direct writes and handler emits exclude each other.
//! Invariants: Every lock round yields exactly two lines per lock, whatever the outcome.
//! Invariants: The expected line count only holds when the run starts from an empty log.
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use std::thread;
use std::time::Instant;

use regex::bytes::Regex;
use serde::Serialize;
use tracing::{debug, info};

use crate::core::error::{Error, ErrorKind};
use crate::core::handler::{
    FlockFileHandler, HandlerOptions, LockFailurePolicy, MultiprocessHandler,
};
use crate::core::lock::{AcquireMode, FlockRLock, MultiprocessLock};
use crate::core::lock_path::LockTarget;
use crate::verify::{VerifyReport, verify_log};

/// Prefix of lines written straight to a held lock's handle instead of through the handler.
pub const DIRECT_MARKER: &str = "------------------------";
const FILLER: &str = "so nothing to release :)";
const PER_THREAD: &str = "per-thread";
const THREAD_SHARED: &str = "thread-shared";

static STRESS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^(?:\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2},\d{3}|-{24})",
        r" proc:\d+ thread:\d+ rec:",
        r"(?:\d+|(?:per-thread|thread-shared)",
        r" <FlockRLock owner=(?:None|ThreadId\(\d+\)) count=\d+>",
        r" (?:acquired|released|not acquired)",
        r"|so nothing to release :\))$",
    ))
    .expect("stress pattern compiles")
});

pub fn stress_regex() -> &'static Regex {
    &STRESS_REGEX
}

#[derive(Clone, Debug)]
pub struct StressConfig {
    pub path: PathBuf,
    pub procs: u32,
    pub threads: u32,
    pub records: u32,
    pub lock_tests: u32,
    /// Delete the log first so the exact line count can be checked.
    pub fresh: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkerConfig {
    pub path: PathBuf,
    pub proc_index: u32,
    pub threads: u32,
    pub records: u32,
    pub lock_tests: u32,
}

impl WorkerConfig {
    /// Command line understood by `flocklog stress-worker`.
    pub fn command(&self, exe: &Path) -> Command {
        let mut command = Command::new(exe);
        command
            .arg("stress-worker")
            .args(["--proc", &self.proc_index.to_string()])
            .args(["--threads", &self.threads.to_string()])
            .args(["--records", &self.records.to_string()])
            .args(["--lock-tests", &self.lock_tests.to_string()])
            .arg(&self.path);
        command
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StressReport {
    pub path: String,
    pub procs: u32,
    pub threads: u32,
    pub records: u32,
    pub lock_tests: u32,
    pub elapsed_ms: u64,
    pub verify: VerifyReport,
}

pub fn expected_lines(procs: u32, threads: u32, records: u32, lock_tests: u32) -> u64 {
    u64::from(procs) * u64::from(threads) * (u64::from(records) + 4 * u64::from(lock_tests))
}

/// Spawn `config.procs` copies of `exe stress-worker`, wait for all, verify the log.
pub fn run_stress(config: &StressConfig, exe: &Path) -> Result<StressReport, Error> {
    if config.fresh {
        match std::fs::remove_file(&config.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(Error::new(ErrorKind::Io)
                    .with_message("failed to remove previous log")
                    .with_path(&config.path)
                    .with_source(err));
            }
        }
    }

    let started = Instant::now();
    let mut children = Vec::with_capacity(config.procs as usize);
    for proc_index in 0..config.procs {
        let worker = WorkerConfig {
            path: config.path.clone(),
            proc_index,
            threads: config.threads,
            records: config.records,
            lock_tests: config.lock_tests,
        };
        let child = worker
            .command(exe)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to spawn stress worker")
                    .with_path(exe)
                    .with_source(err)
            })?;
        debug!(proc_index, pid = child.id(), "spawned stress worker");
        children.push(child);
    }

    let mut failed = Vec::new();
    for (proc_index, mut child) in children.into_iter().enumerate() {
        let status = child.wait().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to wait for stress worker")
                .with_source(err)
        })?;
        if !status.success() {
            failed.push(format!("proc {proc_index}: {status}"));
        }
    }
    if !failed.is_empty() {
        return Err(Error::new(ErrorKind::Internal)
            .with_message(format!("stress workers failed ({})", failed.join(", ")))
            .with_path(&config.path));
    }
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let expected = config.fresh.then(|| {
        expected_lines(config.procs, config.threads, config.records, config.lock_tests)
    });
    let verify = verify_log(&config.path, stress_regex(), expected)?;
    info!(
        lines = verify.lines,
        valid = verify.valid,
        elapsed_ms,
        "stress run finished"
    );

    Ok(StressReport {
        path: config.path.display().to_string(),
        procs: config.procs,
        threads: config.threads,
        records: config.records,
        lock_tests: config.lock_tests,
        elapsed_ms,
        verify,
    })
}

/// Body of one worker process.
pub fn run_worker(config: &WorkerConfig) -> Result<(), Error> {
    let options = HandlerOptions::new()
        .with_lock_target(LockTarget::LogFile)
        .with_acquire(AcquireMode::Blocking)
        .with_lock_failure(LockFailurePolicy::Fail);
    let handler = FlockFileHandler::open(&config.path, options)?;
    let shared = FlockRLock::open(&config.path)?;

    let handler = &handler;
    let shared = &shared;
    thread::scope(|scope| {
        let handles: Vec<_> = (0..config.threads)
            .map(|thread_index| {
                scope.spawn(move || run_thread(handler, shared, config, thread_index))
            })
            .collect();
        for handle in handles {
            handle.join().map_err(|_| {
                Error::new(ErrorKind::Internal).with_message("stress thread panicked")
            })??;
        }
        Ok(())
    })
}

fn run_thread(
    handler: &FlockFileHandler,
    shared: &FlockRLock,
    config: &WorkerConfig,
    thread_index: u32,
) -> Result<(), Error> {
    let prefix = format!("proc:{} thread:{thread_index}", config.proc_index);
    for rec in 0..config.records {
        handler.log(&format!("{prefix} rec:{rec}"))?;
    }

    let own = FlockRLock::open(&config.path)?;
    let locks = [(PER_THREAD, &own), (THREAD_SHARED, shared)];
    let mut coins = CoinFlips::default();
    for _ in 0..config.lock_tests {
        let order = if coins.flip()? { [1, 0] } else { [0, 1] };
        for index in order {
            let (descr, lock) = locks[index];
            let mode = if coins.flip()? {
                AcquireMode::Blocking
            } else {
                AcquireMode::NonBlocking
            };
            if lock.acquire(mode)? {
                let line = format!("{DIRECT_MARKER} {prefix} rec:{descr} {lock} acquired\n");
                let written = write_direct(lock, &line);
                lock.release()?;
                written?;
                // Logged after release; the handler would wait on this very lock otherwise.
                handler.log(&format!("{prefix} rec:{descr} {lock} released"))?;
            } else {
                handler.log(&format!("{prefix} rec:{descr} {lock} not acquired"))?;
                handler.log(&format!("{prefix} rec:{FILLER}"))?;
            }
        }
    }
    Ok(())
}

fn write_direct(lock: &FlockRLock, line: &str) -> Result<(), Error> {
    let mut file = lock.file();
    file.write_all(line.as_bytes()).map_err(|err| {
        let mut error = Error::new(ErrorKind::Io).with_source(err);
        if let Some(path) = lock.path() {
            error = error.with_path(path);
        }
        error
    })
}

#[derive(Default)]
struct CoinFlips {
    bits: u64,
    left: u32,
}

impl CoinFlips {
    fn flip(&mut self) -> Result<bool, Error> {
        if self.left == 0 {
            let mut bytes = [0u8; 8];
            getrandom::fill(&mut bytes).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message(format!("failed to draw random bits: {err}"))
            })?;
            self.bits = u64::from_le_bytes(bytes);
            self.left = 64;
        }
        let bit = self.bits & 1 == 1;
        self.bits >>= 1;
        self.left -= 1;
        Ok(bit)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        CoinFlips, DIRECT_MARKER, WorkerConfig, expected_lines, run_worker, stress_regex,
    };
    use crate::verify::verify_log;

    #[test]
    fn expected_lines_counts_four_per_lock_round() {
        assert_eq!(expected_lines(3, 3, 5000, 500), 3 * 3 * (5000 + 2000));
        assert_eq!(expected_lines(2, 1, 0, 0), 0);
    }

    #[test]
    fn stress_regex_accepts_every_line_shape() {
        let ok = [
            "2026-02-01 00:00:00,001 proc:0 thread:1 rec:42".to_string(),
            format!(
                "{DIRECT_MARKER} proc:2 thread:0 rec:per-thread <FlockRLock owner=ThreadId(7) count=1> acquired"
            ),
            "2026-02-01 00:00:00,001 proc:2 thread:0 rec:thread-shared <FlockRLock owner=None count=0> released"
                .to_string(),
            "2026-02-01 00:00:00,001 proc:2 thread:0 rec:per-thread <FlockRLock owner=ThreadId(3) count=2> not acquired"
                .to_string(),
            "2026-02-01 00:00:00,001 proc:2 thread:0 rec:so nothing to release :)".to_string(),
        ];
        for line in &ok {
            assert!(stress_regex().is_match(line.as_bytes()), "{line}");
        }
        let bad = [
            "proc:0 thread:1 rec:42",
            "2026-02-01 00:00:00,001 proc:0 thread:1 rec:42 2026-02-01",
            "----- proc:0 thread:1 rec:per-thread <FlockRLock owner=None count=0> acquired",
            "2026-02-01 00:00:00,001 proc:2 thread:0 rec:per-thread acquired",
        ];
        for line in bad {
            assert!(!stress_regex().is_match(line.as_bytes()), "{line}");
        }
    }

    #[test]
    fn coin_flips_refill() {
        let mut coins = CoinFlips::default();
        for _ in 0..130 {
            coins.flip().expect("flip");
        }
        assert!(coins.left < 64);
    }

    #[test]
    fn single_worker_writes_expected_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stress.log");
        let config = WorkerConfig {
            path: path.clone(),
            proc_index: 0,
            threads: 4,
            records: 50,
            lock_tests: 20,
        };
        run_worker(&config).expect("worker");

        let expected = expected_lines(1, 4, 50, 20);
        let report = verify_log(&path, stress_regex(), Some(expected)).expect("verify");
        assert!(report.is_ok(), "{report:?}");
        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.contains("count=1> acquired"));
    }

    #[test]
    fn worker_command_round_trips_flags() {
        let config = WorkerConfig {
            path: "/tmp/x.log".into(),
            proc_index: 3,
            threads: 2,
            records: 10,
            lock_tests: 1,
        };
        let command = config.command(std::path::Path::new("/bin/flocklog"));
        let args: Vec<_> = command
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            [
                "stress-worker",
                "--proc",
                "3",
                "--threads",
                "2",
                "--records",
                "10",
                "--lock-tests",
                "1",
                "/tmp/x.log"
            ]
        );
    }
}
