//! Output sinks.
//!
//! Backup workers write stream files through the [OutputSink] trait, so
//! the engine does not care whether the target is a directory of real
//! files or a single zip archive streamed to stdout. Directories support
//! seeking (raw passthrough) and concurrent workers; the zip archive is
//! strictly single-writer and the orchestrator forces the worker count
//! to one.

mod directory;
mod zip;

pub use directory::DirectorySink;
pub use zip::{ZipSink, ZipWriter};

use std::io::Write;
use std::path::PathBuf;

use thiserror::Error;

/// Sink level failures, fatal for the disk being written.
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("output {0} already exists")]
    Exists(PathBuf),

    #[error("seeking is not supported by this output")]
    SeekUnsupported,

    #[error("another stream is still open in the archive")]
    Busy,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One stream being written into a sink.
///
/// Dropping a writer without [finish](SinkWriter::finish) leaves the
/// partial marker in place (directory sinks) so the next run can detect
/// the interrupted backup.
pub trait SinkWriter: Write + Send {
    /// Reposition for raw passthrough writes. Fails with
    /// [OutputError::SeekUnsupported] on archive sinks.
    fn seek_to(&mut self, offset: u64) -> Result<(), OutputError>;

    /// Pre-size the output for raw passthrough. Fails on archive sinks.
    fn set_size(&mut self, size: u64) -> Result<(), OutputError>;

    /// Commit the stream: flush, then atomically give it its final name.
    fn finish(&mut self) -> Result<(), OutputError>;
}

/// A place backup files end up in.
pub trait OutputSink: Send + Sync {
    /// Open a named stream for writing.
    fn create(&self, name: &str) -> Result<Box<dyn SinkWriter + '_>, OutputError>;

    /// Store a complete small file (sidecars, domain config).
    fn put(&self, name: &str, data: &[u8]) -> Result<(), OutputError>;

    /// True when the sink supports only one concurrent writer.
    fn single_writer(&self) -> bool;

    /// Write any closing records. Called once after all workers are done.
    fn finish(&self) -> Result<(), OutputError>;
}
