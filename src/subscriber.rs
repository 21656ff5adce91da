//! Purpose: Route `tracing` output through a flock-guarded log file.
//! Exports: `FlockMakeWriter`, `RecordWriter`, `init_file_logging`.
//! Role: Lets several processes share one diagnostics file without torn lines.
//! Invariants: One formatted event becomes exactly one handler emit and one line.
//! Invariants: Emit failures are swallowed; logging never aborts the caller.
use std::io;
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;

use crate::core::error::{Error, ErrorKind};
use crate::core::handler::{FlockFileHandler, HandlerOptions, MultiprocessHandler};

/// `MakeWriter` handing out one buffering writer per event.
pub struct FlockMakeWriter<H: MultiprocessHandler = FlockFileHandler> {
    handler: Arc<H>,
}

impl<H: MultiprocessHandler> FlockMakeWriter<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self { handler }
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }
}

impl<H: MultiprocessHandler> Clone for FlockMakeWriter<H> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<'a, H: MultiprocessHandler + 'static> MakeWriter<'a> for FlockMakeWriter<H> {
    type Writer = RecordWriter<H>;

    fn make_writer(&'a self) -> Self::Writer {
        RecordWriter {
            handler: Arc::clone(&self.handler),
            buf: Vec::new(),
        }
    }
}

/// Collects one formatted event and appends it as a single record on drop.
pub struct RecordWriter<H: MultiprocessHandler> {
    handler: Arc<H>,
    buf: Vec<u8>,
}

impl<H: MultiprocessHandler> io::Write for RecordWriter<H> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<H: MultiprocessHandler> Drop for RecordWriter<H> {
    fn drop(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let body = self.buf.strip_suffix(b"\n").unwrap_or(&self.buf);
        let mut line = Vec::with_capacity(body.len() + 1);
        for &byte in body {
            match byte {
                b'\n' => line.extend_from_slice(b"\\n"),
                b'\r' => line.extend_from_slice(b"\\r"),
                _ => line.push(byte),
            }
        }
        line.push(b'\n');
        let _ = self.handler.emit_bytes(&line);
    }
}

/// Install a global subscriber writing to `path`.
///
/// The filter comes from `RUST_LOG` when set, else `default_filter`.
pub fn init_file_logging(
    path: impl AsRef<Path>,
    options: HandlerOptions,
    default_filter: &str,
) -> Result<(), Error> {
    let handler = Arc::new(FlockFileHandler::open(path, options)?);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(FlockMakeWriter::new(handler))
                .with_ansi(false)
                .with_thread_ids(true),
        )
        .try_init()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to install log subscriber")
                .with_source(err)
        })
}

#[cfg(test)]
mod tests {
    use super::FlockMakeWriter;
    use crate::core::handler::{FlockFileHandler, HandlerOptions};
    use std::sync::Arc;

    #[test]
    fn each_event_becomes_one_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("diag.log");
        let handler = Arc::new(FlockFileHandler::open(&path, HandlerOptions::default()).expect("open"));
        let writer = FlockMakeWriter::new(handler);
        assert_eq!(writer.handler().path(), path.as_path());

        let subscriber = tracing_subscriber::fmt()
            .with_writer(writer)
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(worker = 1, "first event");
            tracing::warn!("second event");
            tracing::error!("third\nevent");
        });

        let text = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("INFO"));
        assert!(lines[0].contains("first event"));
        assert!(lines[0].contains("worker=1"));
        assert!(lines[1].contains("WARN"));
        assert!(lines[1].contains("second event"));
        assert!(lines[2].contains("third\\nevent"));
    }
}
