//! Purpose: Append log records to a shared file under a multiprocess lock.
//! Exports: `MultiprocessHandler`, `LockedFileHandler`, `FlockFileHandler`, `HandlerOptions`,
//! `LockFailurePolicy`, `Durability`, `EmitOutcome`.
//! Role: The write path used by the CLI, the tracing writer and the stress workers.
//! Invariants: Each record is written with one `write_all` on an `O_APPEND` handle.
//! Invariants: The lock is released after every emit, including when the write fails.
//! Invariants: Lock failures either surface as errors or degrade to unlocked writes, per options.
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::core::error::{Error, ErrorKind};
use crate::core::lock::{AcquireMode, FlockRLock, MultiprocessLock, open_error_kind};
use crate::core::lock_path::{LockTarget, resolve_lock_path};
use crate::core::record::Record;

/// What to do when the lock cannot be obtained.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockFailurePolicy {
    /// Return the failure to the caller; nothing is written.
    Fail,
    /// Write the record without the lock.
    WriteUnlocked,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Durability {
    Fast,
    Flush,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EmitOutcome {
    Locked,
    Unlocked,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HandlerOptions {
    pub lock_target: LockTarget,
    pub acquire: AcquireMode,
    pub on_lock_failure: LockFailurePolicy,
    pub durability: Durability,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            lock_target: LockTarget::default(),
            acquire: AcquireMode::Blocking,
            on_lock_failure: LockFailurePolicy::WriteUnlocked,
            durability: Durability::Fast,
        }
    }
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_target(mut self, lock_target: LockTarget) -> Self {
        self.lock_target = lock_target;
        self
    }

    pub fn with_acquire(mut self, acquire: AcquireMode) -> Self {
        self.acquire = acquire;
        self
    }

    pub fn with_lock_failure(mut self, policy: LockFailurePolicy) -> Self {
        self.on_lock_failure = policy;
        self
    }

    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }
}

/// A sink that serializes whole records against other threads and processes.
pub trait MultiprocessHandler: Send + Sync {
    /// Append `bytes` as one record. The caller provides the line terminator.
    fn emit_bytes(&self, bytes: &[u8]) -> Result<EmitOutcome, Error>;

    fn emit(&self, record: &Record) -> Result<EmitOutcome, Error> {
        self.emit_bytes(record.format_line().as_bytes())
    }

    fn log(&self, message: &str) -> Result<EmitOutcome, Error> {
        self.emit(&Record::now(message))
    }
}

pub struct LockedFileHandler<L: MultiprocessLock> {
    path: PathBuf,
    file: File,
    lock: L,
    options: HandlerOptions,
}

pub type FlockFileHandler = LockedFileHandler<FlockRLock>;

impl FlockFileHandler {
    /// Open `path` for appending, guarded by a flock on the path `options.lock_target` names.
    pub fn open(path: impl AsRef<Path>, options: HandlerOptions) -> Result<Self, Error> {
        let path = path.as_ref();
        let lock_path = resolve_lock_path(path, &options.lock_target)?;
        let lock = FlockRLock::open(&lock_path)?;
        Self::with_lock(path, lock, options)
    }
}

impl<L: MultiprocessLock> LockedFileHandler<L> {
    pub fn with_lock(path: impl AsRef<Path>, lock: L, options: HandlerOptions) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| {
                Error::new(open_error_kind(&err))
                    .with_message("failed to open log file")
                    .with_path(&path)
                    .with_source(err)
            })?;
        Ok(Self {
            path,
            file,
            lock,
            options,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock(&self) -> &L {
        &self.lock
    }

    pub fn options(&self) -> &HandlerOptions {
        &self.options
    }

    fn write_record(&self, bytes: &[u8]) -> Result<(), Error> {
        let mut file = &self.file;
        file.write_all(bytes)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&self.path).with_source(err))?;
        if self.options.durability == Durability::Flush {
            self.file
                .sync_data()
                .map_err(|err| Error::new(ErrorKind::Io).with_path(&self.path).with_source(err))?;
        }
        Ok(())
    }
}

impl<L: MultiprocessLock> MultiprocessHandler for LockedFileHandler<L> {
    fn emit_bytes(&self, bytes: &[u8]) -> Result<EmitOutcome, Error> {
        if bytes.is_empty() {
            return Ok(EmitOutcome::Locked);
        }
        let policy = self.options.on_lock_failure;
        let guard = match self.lock.guard(self.options.acquire) {
            Ok(Some(guard)) => Some(guard),
            Ok(None) if policy == LockFailurePolicy::Fail => {
                return Err(Error::new(ErrorKind::Busy)
                    .with_message("log lock not acquired")
                    .with_path(&self.path));
            }
            Ok(None) => {
                warn!(path = %self.path.display(), "log lock not acquired; writing unlocked");
                None
            }
            Err(err) if policy == LockFailurePolicy::Fail => return Err(err),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "log lock failed; writing unlocked");
                None
            }
        };
        let outcome = if guard.is_some() {
            EmitOutcome::Locked
        } else {
            EmitOutcome::Unlocked
        };
        // `guard` lives until return, so the write error path still unlocks.
        self.write_record(bytes)?;
        drop(guard);
        Ok(outcome)
    }
}
