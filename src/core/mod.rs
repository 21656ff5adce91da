// Core modules implementing locking, record formatting, the write path and errors.
pub mod error;
pub mod handler;
pub mod lock;
pub mod lock_path;
pub mod record;
