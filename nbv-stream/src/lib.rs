//! Sparse stream container format.
//!
//! A stream file records only the allocated (or dirty) regions of one disk
//! in one backup run. It starts with a single META frame holding the
//! [StreamMetadata] as JSON, followed by any number of DATA and ZERO
//! frames, and ends with a STOP frame. When the stream is compressed, a
//! JSON trailer after the STOP frame records the compressed size of every
//! DATA payload so a reader can undo the per-chunk lz4 framing.
//!
//! Frame headers are a fixed 36-byte ASCII encoding and every DATA/META
//! payload is followed by a two byte terminator. The byte layout is a
//! compatibility contract: files produced by older releases must stay
//! readable, so the constants in [format] may not change.

pub mod compress;
pub mod format;
pub mod metadata;
pub mod trailer;

pub use format::{Frame, FrameKind, FRAME_LEN, TERM};
pub use metadata::{StreamMetadata, STREAM_VERSION};
pub use trailer::FrameSizes;

use thiserror::Error;

/// Errors raised while encoding or decoding a sparse stream.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("short frame header (got {0} of {FRAME_LEN} bytes)")]
    ShortHeader(usize),

    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),

    #[error("malformed frame header")]
    MalformedHeader,

    #[error("missing frame terminator")]
    MissingTerm,

    #[error("truncated stream, no stop frame found")]
    Truncated,

    #[error("missing compression trailer")]
    MissingTrailer,

    #[error("malformed compression trailer: {0}")]
    MalformedTrailer(String),

    #[error("stream metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("lz4: {0}")]
    Lz4(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
