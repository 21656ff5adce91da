//! Purpose: Sample how `flock(LOCK_EX|LOCK_NB)` behaves across handles, threads and forks.
//! Exports: `ProbeMode`, `Role`, `LockAttempt`, `probe`.
//! Role: Diagnostic behind `flocklog probe`; shows which contenders an OS lock actually excludes.
//! Invariants: The holder keeps its handle open and locked until every contender reported.
//! Invariants: A contender that wins unlocks immediately (on a shared handle this also frees the holder).
//! Notes: Fork modes must be called from a single-threaded process.
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::thread;

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};
use crate::core::lock::{lock_error_kind, open_error_kind};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeMode {
    SameHandle,
    SeparateHandles,
    SameHandleThread,
    SeparateHandlesThread,
    SameHandleFork,
    SeparateHandlesFork,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Context {
    Inline,
    Thread,
    Fork,
}

impl ProbeMode {
    pub const ALL: [ProbeMode; 6] = [
        ProbeMode::SameHandle,
        ProbeMode::SeparateHandles,
        ProbeMode::SameHandleThread,
        ProbeMode::SeparateHandlesThread,
        ProbeMode::SameHandleFork,
        ProbeMode::SeparateHandlesFork,
    ];

    /// Single-letter shorthand: lowercase shares the holder's handle, uppercase opens its own.
    pub fn letter(self) -> char {
        match self {
            ProbeMode::SameHandle => 'n',
            ProbeMode::SeparateHandles => 'N',
            ProbeMode::SameHandleThread => 't',
            ProbeMode::SeparateHandlesThread => 'T',
            ProbeMode::SameHandleFork => 'f',
            ProbeMode::SeparateHandlesFork => 'F',
        }
    }

    pub fn from_letter(letter: char) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| mode.letter() == letter)
    }

    pub fn describe(self) -> &'static str {
        match self {
            ProbeMode::SameHandle => "one file handle, no concurrency",
            ProbeMode::SeparateHandles => "separate file handles, no concurrency",
            ProbeMode::SameHandleThread => "one file handle, contender in a thread",
            ProbeMode::SeparateHandlesThread => "separate file handles, contender in a thread",
            ProbeMode::SameHandleFork => "one file handle, contender in a forked child",
            ProbeMode::SeparateHandlesFork => "separate file handles, contender in a forked child",
        }
    }

    fn shares_handle(self) -> bool {
        self.letter().is_ascii_lowercase()
    }

    fn context(self) -> Context {
        match self {
            ProbeMode::SameHandle | ProbeMode::SeparateHandles => Context::Inline,
            ProbeMode::SameHandleThread | ProbeMode::SeparateHandlesThread => Context::Thread,
            ProbeMode::SameHandleFork | ProbeMode::SeparateHandlesFork => Context::Fork,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Holder,
    Contender,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LockAttempt {
    pub pid: u32,
    pub thread: String,
    pub fd: i32,
    pub role: Role,
    pub locked: bool,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ChildReport {
    Attempt(LockAttempt),
    Error(String),
}

/// Lock `path` as holder, then let one contender try according to `mode`.
pub fn probe(mode: ProbeMode, path: &Path) -> Result<Vec<LockAttempt>, Error> {
    let holder = open_append(path)?;
    let held = attempt(&holder, Role::Holder)?;
    if !held.locked {
        return Err(Error::new(ErrorKind::Busy)
            .with_message("probe file is already locked")
            .with_path(path)
            .with_hint("Another process holds the lock; pick a different path."));
    }
    tracing::debug!(mode = %mode.letter(), fd = held.fd, "holder locked");
    let mut attempts = vec![held];

    let contender = match (mode.context(), mode.shares_handle()) {
        (Context::Inline, true) => contend(&holder)?,
        (Context::Inline, false) => contend_separately(path)?,
        (Context::Thread, shared) => thread::scope(|scope| {
            let handle = thread::Builder::new()
                .name("contender".to_string())
                .spawn_scoped(scope, || {
                    if shared {
                        contend(&holder)
                    } else {
                        contend_separately(path)
                    }
                })
                .map_err(|err| io_error(err, "failed to spawn contender thread"))?;
            handle.join().map_err(|_| {
                Error::new(ErrorKind::Internal).with_message("contender thread panicked")
            })?
        })?,
        (Context::Fork, shared) => fork_contender(|| {
            if shared {
                contend(&holder)
            } else {
                contend_separately(path)
            }
        })?,
    };
    attempts.push(contender);
    drop(holder);
    Ok(attempts)
}

fn open_append(path: &Path) -> Result<File, Error> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| {
            Error::new(open_error_kind(&err))
                .with_message("failed to open probe file")
                .with_path(path)
                .with_source(err)
        })
}

fn attempt(file: &File, role: Role) -> Result<LockAttempt, Error> {
    let locked = match file.try_lock_exclusive() {
        Ok(()) => true,
        Err(err) if lock_error_kind(&err) == ErrorKind::Busy => false,
        Err(err) => return Err(Error::new(lock_error_kind(&err)).with_source(err)),
    };
    Ok(LockAttempt {
        pid: std::process::id(),
        thread: thread_label(),
        fd: file.as_raw_fd(),
        role,
        locked,
    })
}

fn contend(file: &File) -> Result<LockAttempt, Error> {
    let result = attempt(file, Role::Contender)?;
    if result.locked {
        FileExt::unlock(file).map_err(|err| Error::new(lock_error_kind(&err)).with_source(err))?;
    }
    Ok(result)
}

fn contend_separately(path: &Path) -> Result<LockAttempt, Error> {
    let file = open_append(path)?;
    contend(&file)
}

fn thread_label() -> String {
    let current = thread::current();
    match current.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", current.id()),
    }
}

fn fork_contender<F>(contend: F) -> Result<LockAttempt, Error>
where
    F: FnOnce() -> Result<LockAttempt, Error>,
{
    let (mut reader, writer) = io::pipe().map_err(|err| io_error(err, "failed to create pipe"))?;

    // SAFETY: the caller is single-threaded; the child only runs `contend`,
    // writes one report line and leaves through `_exit`.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(io_error(io::Error::last_os_error(), "fork failed"));
    }
    if pid == 0 {
        drop(reader);
        let code = report_from_child(contend, writer);
        unsafe { libc::_exit(code) }
    }

    drop(writer);
    let mut output = String::new();
    let read = reader.read_to_string(&mut output);
    wait_for_child(pid)?;
    read.map_err(|err| io_error(err, "failed to read child report"))?;

    let line = output.lines().next().unwrap_or_default();
    let report: ChildReport = serde_json::from_str(line).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("child sent an unreadable report")
            .with_source(err)
    })?;
    match report {
        ChildReport::Attempt(attempt) => Ok(attempt),
        ChildReport::Error(message) => Err(Error::new(ErrorKind::Io)
            .with_message(format!("contender in child failed: {message}"))),
    }
}

fn report_from_child<F>(contend: F, mut writer: io::PipeWriter) -> i32
where
    F: FnOnce() -> Result<LockAttempt, Error>,
{
    let report = match contend() {
        Ok(attempt) => ChildReport::Attempt(attempt),
        Err(err) => ChildReport::Error(err.to_string()),
    };
    let written = serde_json::to_writer(&mut writer, &report)
        .map_err(io::Error::from)
        .and_then(|()| writer.write_all(b"\n"));
    if written.is_ok() { 0 } else { 1 }
}

fn wait_for_child(pid: libc::pid_t) -> Result<(), Error> {
    let mut status: libc::c_int = 0;
    loop {
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(io_error(err, "waitpid failed"));
        }
    }
    if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0 {
        Ok(())
    } else {
        Err(Error::new(ErrorKind::Internal).with_message("probe child exited abnormally"))
    }
}

fn io_error(err: io::Error, message: &str) -> Error {
    Error::new(ErrorKind::Io)
        .with_message(message)
        .with_source(err)
}
