// Reentrant multiprocess lock: in-process owner tracking plus an exclusive flock.
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use fs2::FileExt;
use libc::{EACCES, EPERM};

use crate::core::error::{Error, ErrorKind};

pub const DEFAULT_POLL: Duration = Duration::from_millis(5);
const MIN_POLL: Duration = Duration::from_millis(1);

/// How long an acquisition is willing to wait for the lock.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AcquireMode {
    Blocking,
    NonBlocking,
    /// Busy-retry a non-blocking attempt every `poll` until `timeout` elapses.
    Timeout { timeout: Duration, poll: Duration },
}

impl AcquireMode {
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout {
            timeout,
            poll: DEFAULT_POLL,
        }
    }

    fn deadline(self) -> Option<Instant> {
        match self {
            AcquireMode::Timeout { timeout, .. } => Instant::now().checked_add(timeout),
            _ => None,
        }
    }
}

/// A lock that excludes both other threads of this process and other processes.
///
/// Implementations are reentrant for the owning thread. `acquire` returns
/// `Ok(false)` when a non-blocking or timed attempt loses; errors are reserved
/// for OS failures.
pub trait MultiprocessLock: Send + Sync {
    fn acquire(&self, mode: AcquireMode) -> Result<bool, Error>;

    fn release(&self) -> Result<(), Error>;

    fn is_owned_by_current_thread(&self) -> bool;

    fn guard(&self, mode: AcquireMode) -> Result<Option<LockGuard<'_, Self>>, Error> {
        if self.acquire(mode)? {
            Ok(Some(LockGuard { lock: self }))
        } else {
            Ok(None)
        }
    }
}

/// Releases one level of ownership on drop.
pub struct LockGuard<'a, L: MultiprocessLock + ?Sized> {
    lock: &'a L,
}

impl<L: MultiprocessLock + ?Sized> Drop for LockGuard<'_, L> {
    fn drop(&mut self) {
        let _ = self.lock.release();
    }
}

#[derive(Debug, Default)]
struct OwnerState {
    owner: Option<ThreadId>,
    count: usize,
}

/// Reentrant lock backed by `flock(LOCK_EX)` on a file handle.
///
/// `flock` is tied to the open file description, so threads sharing one handle
/// would all "succeed" at the OS level. Threads are therefore serialized by the
/// owner state first; only the 0 -> 1 and 1 -> 0 transitions touch the OS lock.
#[derive(Debug)]
pub struct FlockRLock {
    file: File,
    path: Option<PathBuf>,
    state: Mutex<OwnerState>,
    released: Condvar,
}

impl FlockRLock {
    /// Open (creating if needed) `path` in append mode and wrap the new handle.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| {
                Error::new(open_error_kind(&err))
                    .with_message("failed to open lock file")
                    .with_path(&path)
                    .with_source(err)
            })?;
        let mut lock = Self::from_file(file);
        lock.path = Some(path);
        Ok(lock)
    }

    pub fn from_file(file: File) -> Self {
        Self {
            file,
            path: None,
            state: Mutex::default(),
            released: Condvar::new(),
        }
    }

    /// The underlying handle; writes through it are only safe while the lock is held.
    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current recursion depth of whichever thread owns the lock.
    pub fn count(&self) -> usize {
        self.state().count
    }

    fn state(&self) -> MutexGuard<'_, OwnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_os(&self, mode: AcquireMode, deadline: Option<Instant>) -> Result<bool, Error> {
        match mode {
            AcquireMode::Blocking => loop {
                match self.file.lock_exclusive() {
                    Ok(()) => return Ok(true),
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(self.lock_error(err)),
                }
            },
            AcquireMode::NonBlocking => self.try_lock_os(),
            AcquireMode::Timeout { poll, .. } => {
                let poll = poll.max(MIN_POLL);
                loop {
                    if self.try_lock_os()? {
                        return Ok(true);
                    }
                    let wait = match deadline {
                        Some(deadline) => {
                            let remaining = deadline.saturating_duration_since(Instant::now());
                            if remaining.is_zero() {
                                return Ok(false);
                            }
                            poll.min(remaining)
                        }
                        None => poll,
                    };
                    thread::sleep(wait);
                }
            }
        }
    }

    fn try_lock_os(&self) -> Result<bool, Error> {
        match self.file.try_lock_exclusive() {
            Ok(()) => Ok(true),
            Err(err) if lock_error_kind(&err) == ErrorKind::Busy => Ok(false),
            Err(err) => Err(self.lock_error(err)),
        }
    }

    // Roll back an in-process claim whose OS lock was not obtained.
    fn abandon(&self) {
        let mut state = self.state();
        state.owner = None;
        state.count = 0;
        drop(state);
        self.released.notify_one();
    }

    fn lock_error(&self, err: io::Error) -> Error {
        let mut error = Error::new(lock_error_kind(&err));
        if let Some(path) = &self.path {
            error = error.with_path(path);
        }
        error.with_source(err)
    }
}

impl MultiprocessLock for FlockRLock {
    fn acquire(&self, mode: AcquireMode) -> Result<bool, Error> {
        let me = thread::current().id();
        let deadline = mode.deadline();
        {
            let mut state = self.state();
            if state.owner == Some(me) {
                state.count += 1;
                return Ok(true);
            }
            while state.owner.is_some() {
                state = match (mode, deadline) {
                    (AcquireMode::NonBlocking, _) => return Ok(false),
                    (AcquireMode::Timeout { .. }, Some(deadline)) => {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            return Ok(false);
                        }
                        self.released
                            .wait_timeout(state, remaining)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0
                    }
                    _ => self
                        .released
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner),
                };
            }
            state.owner = Some(me);
            state.count = 1;
        }

        match self.lock_os(mode, deadline) {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.abandon();
                Ok(false)
            }
            Err(err) => {
                self.abandon();
                Err(err)
            }
        }
    }

    fn release(&self) -> Result<(), Error> {
        let me = thread::current().id();
        let mut state = self.state();
        if state.owner != Some(me) {
            let mut err = Error::new(ErrorKind::Usage).with_message("cannot release un-acquired lock");
            if let Some(path) = &self.path {
                err = err.with_path(path);
            }
            return Err(err);
        }
        state.count -= 1;
        if state.count > 0 {
            return Ok(());
        }
        // Unlock before clearing the owner so no sibling thread can re-lock the
        // shared description in between.
        let unlocked = FileExt::unlock(&self.file);
        state.owner = None;
        drop(state);
        self.released.notify_one();
        unlocked.map_err(|err| self.lock_error(err))
    }

    fn is_owned_by_current_thread(&self) -> bool {
        self.state().owner == Some(thread::current().id())
    }
}

impl fmt::Display for FlockRLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        match state.owner {
            Some(owner) => write!(f, "<FlockRLock owner={owner:?} count={}>", state.count),
            None => write!(f, "<FlockRLock owner=None count={}>", state.count),
        }
    }
}

pub(crate) fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

pub(crate) fn open_error_kind(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}
