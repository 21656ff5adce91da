//! Purpose: Library crate behind the `flocklog` CLI and its tests.
//! Exports: `core` (locks, handler, records, errors), `subscriber`, `probe`, `verify`, `stress`.
//! Role: Multiprocess-safe log appends over advisory `flock` locks.
//! Invariants: Locks are advisory; only cooperating writers are excluded.
//! Invariants: Unix only (`flock`, `fork`).
pub mod core;
pub mod probe;
pub mod stress;
pub mod subscriber;
pub mod verify;

pub use crate::core::error::{Error, ErrorKind, to_exit_code};
pub use crate::core::handler::{
    Durability, EmitOutcome, FlockFileHandler, HandlerOptions, LockFailurePolicy,
    LockedFileHandler, MultiprocessHandler,
};
pub use crate::core::lock::{AcquireMode, FlockRLock, LockGuard, MultiprocessLock};
pub use crate::core::lock_path::{LockTarget, resolve_lock_path};
pub use crate::core::record::Record;
