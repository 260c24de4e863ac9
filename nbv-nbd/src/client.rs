//! Synchronous NBD client.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use log::{debug, warn};
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};

use crate::protocol::*;
use crate::{BlockIo, TransportError};

/// Where an NBD server listens.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp {
        host: String,
        port: u16,
        tls: bool,
    },
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "nbd+unix://{}", path.display()),
            Endpoint::Tcp { host, port, tls } => {
                let scheme = if *tls { "nbds" } else { "nbd" };
                write!(f, "{}://{}:{}", scheme, host, port)
            }
        }
    }
}

/// Negotiation parameters.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Export to open; qemu backup jobs export under the disk target name,
    /// `qemu-nbd` under the empty default name.
    pub export: String,
    /// Metadata context to negotiate, e.g. `base:allocation` or a
    /// `qemu:dirty-bitmap:` name. Refusal is tolerated; block status
    /// queries then fail with [TransportError::NoMetaContext].
    pub meta_context: Option<String>,
}

trait NbdStream: Read + Write + Send {}
impl<T: Read + Write + Send> NbdStream for T {}

/// One negotiated NBD connection in the transmission phase.
pub struct NbdClient {
    stream: Box<dyn NbdStream>,
    endpoint: Endpoint,
    size: u64,
    transmission_flags: u16,
    max_request: u32,
    meta_context_id: Option<u32>,
    handle: u64,
    connected: bool,
}

/// One `(length, flags)` descriptor of a block status reply, relative to
/// the end of the previous descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusDescriptor {
    pub length: u64,
    pub flags: u32,
}

impl NbdClient {
    /// Connect and negotiate over a Unix socket.
    pub fn connect_unix(path: &std::path::Path, opts: &ConnectOptions) -> Result<Self, TransportError> {
        let endpoint = Endpoint::Unix(path.to_path_buf());
        let stream = UnixStream::connect(path)
            .map_err(|err| TransportError::Connect(endpoint.to_string(), err))?;
        Self::negotiate(Box::new(stream), endpoint, opts, false)
    }

    /// Connect and negotiate over TCP, optionally upgrading to TLS.
    pub fn connect_tcp(host: &str, port: u16, tls: bool, opts: &ConnectOptions) -> Result<Self, TransportError> {
        let endpoint = Endpoint::Tcp {
            host: host.to_string(),
            port,
            tls,
        };
        let stream = TcpStream::connect((host, port))
            .map_err(|err| TransportError::Connect(endpoint.to_string(), err))?;
        Self::negotiate(Box::new(stream), endpoint, opts, tls)
    }

    /// Connect to either endpoint flavor.
    pub fn connect(endpoint: &Endpoint, opts: &ConnectOptions) -> Result<Self, TransportError> {
        match endpoint {
            Endpoint::Unix(path) => Self::connect_unix(path, opts),
            Endpoint::Tcp { host, port, tls } => Self::connect_tcp(host, *port, *tls, opts),
        }
    }

    fn negotiate(
        stream: Box<dyn NbdStream>,
        endpoint: Endpoint,
        opts: &ConnectOptions,
        tls: bool,
    ) -> Result<Self, TransportError> {
        let mut client = NbdClient {
            stream,
            endpoint,
            size: 0,
            transmission_flags: 0,
            max_request: DEFAULT_MAX_REQUEST_SIZE,
            meta_context_id: None,
            handle: 0,
            connected: false,
        };

        if client.read_u64()? != NBDMAGIC {
            return Err(TransportError::Protocol("bad initial magic".into()));
        }
        if client.read_u64()? != IHAVEOPT {
            return Err(TransportError::Protocol(
                "server does not speak the newstyle handshake".into(),
            ));
        }
        let handshake_flags = client.read_u16()?;
        if handshake_flags & FLAG_FIXED_NEWSTYLE == 0 {
            return Err(TransportError::Protocol(
                "server does not support the fixed newstyle handshake".into(),
            ));
        }
        let mut client_flags = FLAG_C_FIXED_NEWSTYLE;
        if handshake_flags & FLAG_NO_ZEROES != 0 {
            client_flags |= FLAG_C_NO_ZEROES;
        }
        client.write_all(&client_flags.to_be_bytes())?;

        if tls {
            client.starttls()?;
        }

        // required before BLOCK_STATUS can be used; plain reads and
        // writes work without it, so refusal only disables dirty queries
        client.send_option(OPT_STRUCTURED_REPLY, &[])?;
        let structured = match client.read_single_reply(OPT_STRUCTURED_REPLY)? {
            (REP_ACK, _) => true,
            (reply, _) if reply & REP_FLAG_ERROR != 0 => {
                debug!("server refused structured replies");
                false
            }
            (reply, _) => {
                return Err(TransportError::Protocol(format!(
                    "unexpected reply {:#x} to structured reply request",
                    reply
                )));
            }
        };

        if let Some(context) = &opts.meta_context {
            if !structured {
                warn!(
                    "metadata context '{}' unavailable without structured replies",
                    context
                );
            } else if let Err(err) = client.set_meta_context(&opts.export, context) {
                warn!("metadata context '{}' not negotiated: {}", context, err);
            }
        }

        client.go(&opts.export)?;
        client.connected = true;

        debug!(
            "connected to {} (size {}, max request {})",
            client.endpoint, client.size, client.max_request
        );
        Ok(client)
    }

    fn starttls(&mut self) -> Result<(), TransportError> {
        self.send_option(OPT_STARTTLS, &[])?;
        match self.read_single_reply(OPT_STARTTLS)? {
            (REP_ACK, _) => {}
            _ => return Err(TransportError::Tls("server refused STARTTLS".into())),
        }

        let host = match &self.endpoint {
            Endpoint::Tcp { host, .. } => host.clone(),
            Endpoint::Unix(_) => return Err(TransportError::Tls("tls over unix socket".into())),
        };

        let mut builder = SslConnector::builder(SslMethod::tls())
            .map_err(|err| TransportError::Tls(err.to_string()))?;
        // qemu-nbd deployments commonly use self-signed certificates
        builder.set_verify(SslVerifyMode::NONE);
        let connector = builder.build();

        let plain = std::mem::replace(
            &mut self.stream,
            Box::new(std::io::Cursor::new(Vec::new())),
        );
        let tls_stream = connector
            .connect(&host, ReadWrite(plain))
            .map_err(|err| TransportError::Tls(err.to_string()))?;
        self.stream = Box::new(tls_stream);
        Ok(())
    }

    fn set_meta_context(&mut self, export: &str, context: &str) -> Result<(), TransportError> {
        let mut data = Vec::new();
        data.extend_from_slice(&(export.len() as u32).to_be_bytes());
        data.extend_from_slice(export.as_bytes());
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(&(context.len() as u32).to_be_bytes());
        data.extend_from_slice(context.as_bytes());
        self.send_option(OPT_SET_META_CONTEXT, &data)?;

        loop {
            let (reply, payload) = self.read_single_reply(OPT_SET_META_CONTEXT)?;
            match reply {
                REP_META_CONTEXT => {
                    if payload.len() < 4 {
                        return Err(TransportError::Protocol(
                            "short meta context reply".into(),
                        ));
                    }
                    let id = u32::from_be_bytes(payload[..4].try_into().unwrap());
                    let name = String::from_utf8_lossy(&payload[4..]).to_string();
                    debug!("negotiated metadata context '{}' (id {})", name, id);
                    self.meta_context_id = Some(id);
                }
                REP_ACK => {
                    if self.meta_context_id.is_none() {
                        return Err(TransportError::Protocol(format!(
                            "server does not know context '{}'",
                            context
                        )));
                    }
                    return Ok(());
                }
                reply if reply & REP_FLAG_ERROR != 0 => {
                    return Err(TransportError::Protocol(format!(
                        "meta context rejected ({:#x}): {}",
                        reply,
                        String::from_utf8_lossy(&payload)
                    )));
                }
                reply => {
                    return Err(TransportError::Protocol(format!(
                        "unexpected reply {:#x} to meta context request",
                        reply
                    )));
                }
            }
        }
    }

    fn go(&mut self, export: &str) -> Result<(), TransportError> {
        let mut data = Vec::new();
        data.extend_from_slice(&(export.len() as u32).to_be_bytes());
        data.extend_from_slice(export.as_bytes());
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&INFO_BLOCK_SIZE.to_be_bytes());
        self.send_option(OPT_GO, &data)?;

        let mut got_export_info = false;
        loop {
            let (reply, payload) = self.read_single_reply(OPT_GO)?;
            match reply {
                REP_INFO => {
                    if payload.len() < 2 {
                        return Err(TransportError::Protocol("short info reply".into()));
                    }
                    let info_type = u16::from_be_bytes(payload[..2].try_into().unwrap());
                    match info_type {
                        INFO_EXPORT if payload.len() >= 12 => {
                            self.size =
                                u64::from_be_bytes(payload[2..10].try_into().unwrap());
                            self.transmission_flags =
                                u16::from_be_bytes(payload[10..12].try_into().unwrap());
                            got_export_info = true;
                        }
                        INFO_BLOCK_SIZE if payload.len() >= 14 => {
                            let max =
                                u32::from_be_bytes(payload[10..14].try_into().unwrap());
                            if max > 0 {
                                self.max_request = max;
                            }
                        }
                        _ => {}
                    }
                }
                REP_ACK => {
                    if !got_export_info {
                        return Err(TransportError::Protocol(
                            "export info missing from GO reply".into(),
                        ));
                    }
                    return Ok(());
                }
                reply if reply & REP_FLAG_ERROR != 0 => {
                    return Err(TransportError::Protocol(format!(
                        "export '{}' rejected ({:#x}): {}",
                        export,
                        reply,
                        String::from_utf8_lossy(&payload)
                    )));
                }
                reply => {
                    return Err(TransportError::Protocol(format!(
                        "unexpected reply {:#x} to GO",
                        reply
                    )));
                }
            }
        }
    }

    /// Transmission flags announced by the export.
    pub fn transmission_flags(&self) -> u16 {
        self.transmission_flags
    }

    /// True once a metadata context is usable for [block_status](Self::block_status).
    pub fn has_meta_context(&self) -> bool {
        self.meta_context_id.is_some()
    }

    /// Query block status descriptors for `[offset, offset + length)`.
    ///
    /// Descriptors are returned in disk order. The server may describe
    /// less than the requested range (callers loop) and the final
    /// descriptor may reach beyond it (callers clamp).
    pub fn block_status(
        &mut self,
        offset: u64,
        length: u64,
    ) -> Result<Vec<StatusDescriptor>, TransportError> {
        let context_id = self.meta_context_id.ok_or(TransportError::NoMetaContext)?;

        let handle = self.send_request(CMD_BLOCK_STATUS, offset, length as u32, &[])?;

        let mut descriptors = Vec::new();
        loop {
            let (chunk, done) = self.read_reply_chunk(handle, "block status", &mut [], 0)?;
            match chunk {
                ReplyChunk::BlockStatus { context, pairs } => {
                    if context == context_id {
                        descriptors.extend(pairs);
                    }
                    // replies for foreign contexts are skipped
                }
                ReplyChunk::None => {}
                ReplyChunk::Data | ReplyChunk::Hole => {
                    return Err(TransportError::Protocol(
                        "data chunk in block status reply".into(),
                    ));
                }
            }
            if done {
                break;
            }
        }
        Ok(descriptors)
    }

    /// Send NBD_CMD_DISC and shut the connection down.
    pub fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        let handle = self.handle.wrapping_add(1);
        let mut req = Vec::with_capacity(28);
        req.extend_from_slice(&REQUEST_MAGIC.to_be_bytes());
        req.extend_from_slice(&0u16.to_be_bytes());
        req.extend_from_slice(&CMD_DISC.to_be_bytes());
        req.extend_from_slice(&handle.to_be_bytes());
        req.extend_from_slice(&0u64.to_be_bytes());
        req.extend_from_slice(&0u32.to_be_bytes());
        if let Err(err) = self.stream.write_all(&req).and_then(|_| self.stream.flush()) {
            debug!("disconnect from {}: {}", self.endpoint, err);
        }
    }

    fn send_request(
        &mut self,
        cmd: u16,
        offset: u64,
        length: u32,
        payload: &[u8],
    ) -> Result<u64, TransportError> {
        self.handle = self.handle.wrapping_add(1);
        let mut req = Vec::with_capacity(28 + payload.len());
        req.extend_from_slice(&REQUEST_MAGIC.to_be_bytes());
        req.extend_from_slice(&0u16.to_be_bytes());
        req.extend_from_slice(&cmd.to_be_bytes());
        req.extend_from_slice(&self.handle.to_be_bytes());
        req.extend_from_slice(&offset.to_be_bytes());
        req.extend_from_slice(&length.to_be_bytes());
        req.extend_from_slice(payload);
        self.stream.write_all(&req)?;
        self.stream.flush()?;
        Ok(self.handle)
    }

    /// Read one reply, simple or structured, and whether it ends the
    /// request. Data and hole chunks carry absolute disk offsets; their
    /// payload lands in `read_buf`, which covers the request range
    /// starting at `base`.
    fn read_reply_chunk(
        &mut self,
        handle: u64,
        cmd: &'static str,
        read_buf: &mut [u8],
        base: u64,
    ) -> Result<(ReplyChunk, bool), TransportError> {
        let magic = self.read_u32()?;
        if magic == SIMPLE_REPLY_MAGIC {
            let errno = self.read_u32()?;
            let reply_handle = self.read_u64()?;
            if reply_handle != handle {
                return Err(TransportError::Protocol("reply handle mismatch".into()));
            }
            if errno != 0 {
                return Err(TransportError::ServerError { cmd, errno });
            }
            if !read_buf.is_empty() {
                self.stream.read_exact(read_buf).map_err(map_eof)?;
            }
            return Ok((ReplyChunk::None, true));
        }
        if magic != STRUCTURED_REPLY_MAGIC {
            return Err(TransportError::Protocol(format!(
                "bad reply magic {:#010x}",
                magic
            )));
        }

        let flags = self.read_u16()?;
        let chunk_type = self.read_u16()?;
        let reply_handle = self.read_u64()?;
        let length = self.read_u32()? as usize;
        if reply_handle != handle {
            return Err(TransportError::Protocol("reply handle mismatch".into()));
        }
        let done = flags & REPLY_FLAG_DONE != 0;

        let chunk = match chunk_type {
            REPLY_TYPE_NONE => {
                if length != 0 {
                    return Err(TransportError::Protocol("NONE chunk with payload".into()));
                }
                ReplyChunk::None
            }
            REPLY_TYPE_OFFSET_DATA => {
                if length < 8 {
                    return Err(TransportError::Protocol("short data chunk".into()));
                }
                let chunk_offset = self.read_u64()?;
                let data_len = length - 8;
                let start = chunk_offset
                    .checked_sub(base)
                    .ok_or_else(|| TransportError::Protocol("data chunk before request".into()))?
                    as usize;
                let slice = read_buf
                    .get_mut(start..start + data_len)
                    .ok_or_else(|| TransportError::Protocol("data chunk out of range".into()))?;
                self.stream.read_exact(slice).map_err(map_eof)?;
                ReplyChunk::Data
            }
            REPLY_TYPE_OFFSET_HOLE => {
                if length != 12 {
                    return Err(TransportError::Protocol("bad hole chunk".into()));
                }
                let chunk_offset = self.read_u64()?;
                let hole_len = self.read_u32()? as usize;
                let start = chunk_offset
                    .checked_sub(base)
                    .ok_or_else(|| TransportError::Protocol("hole chunk before request".into()))?
                    as usize;
                let slice = read_buf
                    .get_mut(start..start + hole_len)
                    .ok_or_else(|| TransportError::Protocol("hole chunk out of range".into()))?;
                slice.fill(0);
                ReplyChunk::Hole
            }
            REPLY_TYPE_BLOCK_STATUS => {
                if length < 4 || (length - 4) % 8 != 0 {
                    return Err(TransportError::Protocol("bad block status chunk".into()));
                }
                let context = self.read_u32()?;
                let mut pairs = Vec::with_capacity((length - 4) / 8);
                for _ in 0..(length - 4) / 8 {
                    let desc_len = self.read_u32()? as u64;
                    let desc_flags = self.read_u32()?;
                    pairs.push(StatusDescriptor {
                        length: desc_len,
                        flags: desc_flags,
                    });
                }
                ReplyChunk::BlockStatus { context, pairs }
            }
            err_type if err_type & REPLY_TYPE_ERROR_BIT != 0 => {
                if length < 6 {
                    return Err(TransportError::Protocol("short error chunk".into()));
                }
                let errno = self.read_u32()?;
                let msg_len = self.read_u16()? as usize;
                let mut remaining = vec![0u8; length - 6];
                self.stream.read_exact(&mut remaining).map_err(map_eof)?;
                let msg = String::from_utf8_lossy(&remaining[..msg_len.min(remaining.len())]);
                if msg.is_empty() {
                    return Err(TransportError::ServerError { cmd, errno });
                }
                return Err(TransportError::Protocol(format!(
                    "{} failed (errno {}): {}",
                    cmd, errno, msg
                )));
            }
            other => {
                return Err(TransportError::Protocol(format!(
                    "unknown reply chunk type {:#06x}",
                    other
                )));
            }
        };

        Ok((chunk, done))
    }

    fn send_option(&mut self, option: u32, data: &[u8]) -> Result<(), TransportError> {
        let mut buf = Vec::with_capacity(16 + data.len());
        buf.extend_from_slice(&IHAVEOPT.to_be_bytes());
        buf.extend_from_slice(&option.to_be_bytes());
        buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
        buf.extend_from_slice(data);
        self.stream.write_all(&buf)?;
        self.stream.flush()?;
        Ok(())
    }

    fn read_single_reply(&mut self, option: u32) -> Result<(u32, Vec<u8>), TransportError> {
        if self.read_u64()? != REP_MAGIC {
            return Err(TransportError::Protocol("bad option reply magic".into()));
        }
        let reply_option = self.read_u32()?;
        if reply_option != option {
            return Err(TransportError::Protocol(format!(
                "reply for option {} while waiting for {}",
                reply_option, option
            )));
        }
        let reply_type = self.read_u32()?;
        let length = self.read_u32()? as usize;
        if length > 64 * 1024 {
            return Err(TransportError::Protocol("oversized option reply".into()));
        }
        let mut payload = vec![0u8; length];
        self.stream.read_exact(&mut payload).map_err(map_eof)?;
        Ok((reply_type, payload))
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(data)?;
        Ok(())
    }

    fn read_u16(&mut self) -> Result<u16, TransportError> {
        let mut buf = [0u8; 2];
        self.stream.read_exact(&mut buf).map_err(map_eof)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn read_u32(&mut self) -> Result<u32, TransportError> {
        let mut buf = [0u8; 4];
        self.stream.read_exact(&mut buf).map_err(map_eof)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_u64(&mut self) -> Result<u64, TransportError> {
        let mut buf = [0u8; 8];
        self.stream.read_exact(&mut buf).map_err(map_eof)?;
        Ok(u64::from_be_bytes(buf))
    }
}

impl BlockIo for NbdClient {
    fn size(&self) -> u64 {
        self.size
    }

    fn max_request_size(&self) -> u32 {
        self.max_request
    }

    fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<(), TransportError> {
        if buf.len() > self.max_request as usize {
            return Err(TransportError::Oversized(buf.len(), self.max_request));
        }
        let handle = self.send_request(CMD_READ, offset, buf.len() as u32, &[])?;

        loop {
            let (chunk, done) = self.read_reply_chunk(handle, "read", buf, offset)?;
            if matches!(chunk, ReplyChunk::BlockStatus { .. }) {
                return Err(TransportError::Protocol(
                    "block status chunk in read reply".into(),
                ));
            }
            if done {
                return Ok(());
            }
        }
    }

    fn pwrite(&mut self, buf: &[u8], offset: u64) -> Result<(), TransportError> {
        if buf.len() > self.max_request as usize {
            return Err(TransportError::Oversized(buf.len(), self.max_request));
        }
        let handle = self.send_request(CMD_WRITE, offset, buf.len() as u32, buf)?;
        loop {
            let (chunk, done) = self.read_reply_chunk(handle, "write", &mut [], 0)?;
            if !matches!(chunk, ReplyChunk::None) {
                return Err(TransportError::Protocol(
                    "unexpected chunk in write reply".into(),
                ));
            }
            if done {
                return Ok(());
            }
        }
    }
}

impl Drop for NbdClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

enum ReplyChunk {
    Data,
    Hole,
    BlockStatus {
        context: u32,
        pairs: Vec<StatusDescriptor>,
    },
    /// Simple reply or a structured NONE chunk, no content.
    None,
}

fn map_eof(err: std::io::Error) -> TransportError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::Eof
    } else {
        TransportError::Io(err)
    }
}

struct ReadWrite(Box<dyn NbdStream>);

impl std::fmt::Debug for ReadWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadWrite").finish()
    }
}

impl Read for ReadWrite {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for ReadWrite {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}
