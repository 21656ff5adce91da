//! Purpose: Decide which filesystem path carries the advisory lock for a log file.
//! Exports: `LockTarget`, `resolve_lock_path`, `DEFAULT_LOCK_SUFFIX`.
//! Invariants: Resolution is purely lexical; nothing is created or canonicalized here.
//! Invariants: Every cooperating writer must resolve the same path for the lock to exclude.
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::core::error::{Error, ErrorKind};

pub const DEFAULT_LOCK_SUFFIX: &str = ".lock";

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LockTarget {
    /// Lock the log file itself.
    LogFile,
    /// Lock a sibling file named `<log file name><suffix>`.
    Sidecar { suffix: String },
    /// Lock an explicit path shared by all writers.
    Path(PathBuf),
}

impl Default for LockTarget {
    fn default() -> Self {
        LockTarget::Sidecar {
            suffix: DEFAULT_LOCK_SUFFIX.to_string(),
        }
    }
}

pub fn resolve_lock_path(log_path: &Path, target: &LockTarget) -> Result<PathBuf, Error> {
    match target {
        LockTarget::LogFile => Ok(log_path.to_path_buf()),
        LockTarget::Path(path) => {
            if path.as_os_str().is_empty() {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("lock path is empty")
                    .with_hint("Pass a file path shared by every writer."));
            }
            Ok(path.clone())
        }
        LockTarget::Sidecar { suffix } => {
            if suffix.is_empty() {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("lock suffix is empty")
                    .with_hint("Use a suffix like .lock, or lock the log file itself."));
            }
            if suffix.contains('/') {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("lock suffix must not contain path separators"));
            }
            let Some(name) = log_path.file_name() else {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("log path has no file name")
                    .with_path(log_path));
            };
            let mut lock_name = OsString::from(name);
            lock_name.push(suffix);
            Ok(log_path.with_file_name(lock_name))
        }
    }
}
