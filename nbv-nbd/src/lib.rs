//! NBD client transport.
//!
//! Implements the fixed-newstyle handshake with structured replies and
//! metadata contexts, which is what QEMU's `qemu-nbd` and the libvirt
//! backup job endpoints speak. The client is strictly synchronous; one
//! connection belongs to one disk worker.
//!
//! [server] additionally wraps a `qemu-nbd` child process for the offline
//! backup and restore paths, where no hypervisor-managed endpoint exists.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{ConnectOptions, Endpoint, NbdClient, StatusDescriptor};
pub use server::{NbdServer, ServerConfig};

use thiserror::Error;

/// Transport level failures.
///
/// Every variant is fatal for the disk the connection belongs to; other
/// disk workers are unaffected.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connect to {0} failed: {1}")]
    Connect(String, std::io::Error),

    #[error("unexpected end of stream")]
    Eof,

    #[error("nbd protocol error: {0}")]
    Protocol(String),

    #[error("server rejected {cmd}: errno {errno}")]
    ServerError { cmd: &'static str, errno: u32 },

    #[error("request of {0} bytes exceeds maximum request size {1}")]
    Oversized(usize, u32),

    #[error("no metadata context negotiated, dirty queries unavailable")]
    NoMetaContext,

    #[error("tls handshake failed: {0}")]
    Tls(String),

    #[error("nbd server process: {0}")]
    Server(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Synchronous random access block transport.
///
/// Implemented by [NbdClient] and by in-memory fakes in tests. Transfers
/// larger than [max_request_size](BlockIo::max_request_size) are rejected;
/// callers split.
pub trait BlockIo {
    /// Size of the export in bytes.
    fn size(&self) -> u64;

    /// Largest read or write the peer accepts.
    fn max_request_size(&self) -> u32;

    /// Fill `buf` from `offset`.
    fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<(), TransportError>;

    /// Write `buf` at `offset`.
    fn pwrite(&mut self, buf: &[u8], offset: u64) -> Result<(), TransportError>;
}
