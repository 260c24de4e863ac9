//! The per-disk backup pipeline.
//!
//! One call to [backup_disk] handles one disk: bring up the NBD source,
//! enumerate extents, stream them into the output sink, tear everything
//! down again. Workers run this concurrently, one disk each; nothing in
//! here touches the checkpoint chain or the hypervisor.

use std::io::Write;
use std::path::Path;

use chrono::{Local, Utc};
use log::{debug, info, warn};
use thiserror::Error;

use nbv_nbd::client::ConnectOptions;
use nbv_nbd::protocol::{dirty_bitmap_context, BASE_ALLOCATION};
use nbv_nbd::server::ServerConfig;
use nbv_nbd::{BlockIo, NbdClient, NbdServer, TransportError};
use nbv_stream::format::{write_frame, write_term, FrameKind};
use nbv_stream::trailer::write_compression_trailer;
use nbv_stream::{compress, FormatError, FrameSizes, StreamMetadata, STREAM_VERSION};

use crate::chain::CheckpointPlan;
use crate::extents::{data_size, Extent, ExtentSource, NbdExtentSource, StatusContext};
use crate::hypervisor::{Domain, DomainDisk};
use crate::image;
use crate::naming;
use crate::remote::{nbd_server_command, RemoteProcess, RemoteShell};
use crate::sink::{OutputError, OutputSink, SinkWriter};
use crate::BackupMode;

/// Failures of one disk's backup. Other disks continue.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// How the disk is written to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    /// Sparse stream container.
    Stream,
    /// Byte-for-byte copy with holes, only for raw disks on request.
    Raw,
}

/// User options relevant to the pipeline.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// lz4 level when compression is on. The level is recorded in the
    /// stream metadata; the encoder itself is level-agnostic.
    pub compress: Option<i32>,
    /// Allow raw passthrough for raw disks.
    pub raw: bool,
}

/// Where the worker finds its NBD source.
pub enum SourceEndpoint<'a> {
    /// The hypervisor's backup job exports every disk on one socket.
    Job { socket: &'a Path },
    /// Offline backup; the worker starts its own local server.
    OfflineLocal { socket_dir: &'a Path },
    /// Offline backup of a remote hypervisor; the server runs there.
    OfflineRemote {
        shell: &'a dyn RemoteShell,
        host: &'a str,
        base_port: u16,
        tls: bool,
    },
}

/// Everything one worker needs for one disk.
pub struct DiskContext<'a> {
    pub domain: &'a Domain,
    pub disk: &'a DomainDisk,
    pub worker_index: usize,
    pub mode: BackupMode,
    pub plan: &'a CheckpointPlan,
    pub options: &'a BackupOptions,
    pub sink: &'a dyn OutputSink,
    pub endpoint: SourceEndpoint<'a>,
}

/// Result counters of one disk backup.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskBackupStats {
    /// Sum of all data extent lengths.
    pub thin_size: u64,
    /// Bytes written to the sink, after compression.
    pub written: u64,
    /// Non-fatal problems, counted for strict mode.
    pub warnings: u64,
}

/// Raw passthrough only when the user asked for it and nothing would be
/// lost: a qcow2 disk always goes through the stream container.
pub fn stream_type(disk: &DomainDisk, raw_requested: bool) -> StreamType {
    if raw_requested && disk.format == "raw" {
        StreamType::Raw
    } else {
        StreamType::Stream
    }
}

/// Metadata context for the extent query.
///
/// Delta backups read the dirty bitmap: the backup job exposes it as
/// `backup-<target>`, an offline `qemu-nbd` under the parent checkpoint
/// name. Everything else uses plain allocation data.
pub fn meta_context(mode: BackupMode, online: bool, disk: &DomainDisk, plan: &CheckpointPlan) -> String {
    if mode.is_incremental() {
        if online {
            dirty_bitmap_context(&format!("backup-{}", disk.target))
        } else {
            dirty_bitmap_context(&plan.parent)
        }
    } else {
        BASE_ALLOCATION.to_string()
    }
}

/// Stream file name for this run.
pub fn stream_file_name(mode: BackupMode, disk: &DomainDisk, plan: &CheckpointPlan) -> String {
    let ident = match mode {
        BackupMode::Inc => plan.name.clone(),
        BackupMode::Diff => Utc::now().timestamp().to_string(),
        _ => String::new(),
    };
    naming::data_file(&disk.target, mode, &ident)
}

fn build_metadata(
    disk: &DomainDisk,
    virtual_size: u64,
    thin_size: u64,
    mode: BackupMode,
    plan: &CheckpointPlan,
    compress_level: Option<i32>,
) -> StreamMetadata {
    StreamMetadata {
        virtual_size,
        data_size: thin_size,
        date: Local::now().to_rfc3339(),
        disk_name: disk.target.clone(),
        disk_format: disk.format.clone(),
        checkpoint_name: plan.name.clone(),
        parent_checkpoint: plan.parent.clone(),
        incremental: mode.is_incremental(),
        stream_version: STREAM_VERSION,
        compressed: compress_level.is_some(),
        compression_method: compress_level.map(|_| compress::METHOD.to_string()),
        compression_level: compress_level,
    }
}

/// Write one sparse stream: META frame, DATA/ZERO frames in extent
/// order, STOP frame and, for compressed streams, the trailer.
///
/// ZERO frames are only emitted for full and copy streams; a delta
/// leaves untouched regions implicit.
pub fn write_stream(
    source: &mut dyn BlockIo,
    extents: &[Extent],
    meta: &StreamMetadata,
    mut writer: &mut dyn SinkWriter,
) -> Result<u64, BackupError> {
    let meta_bytes = meta.to_bytes()?;
    write_frame(&mut writer, FrameKind::Meta, 0, meta_bytes.len() as u64)?;
    writer.write_all(&meta_bytes).map_err(FormatError::Io)?;
    write_term(&mut writer)?;

    let max_request = source.max_request_size() as u64;
    let mut read_buf = vec![0u8; (max_request as usize).min(64 * 1024 * 1024)];
    let mut written = 0u64;
    let mut frame_sizes: Vec<FrameSizes> = Vec::new();

    for extent in extents {
        if !extent.data {
            if !meta.incremental {
                write_frame(&mut writer, FrameKind::Zero, extent.offset, extent.length)?;
            }
            continue;
        }

        if meta.compressed {
            // the frame header needs the compressed length, so the whole
            // extent is compressed before anything is written
            let mut chunks: Vec<Vec<u8>> = Vec::new();
            let mut offset = extent.offset;
            let mut remaining = extent.length;
            while remaining > 0 {
                let chunk_len = remaining.min(max_request) as usize;
                source.pread(&mut read_buf[..chunk_len], offset)?;
                chunks.push(compress::compress(&read_buf[..chunk_len])?);
                offset += chunk_len as u64;
                remaining -= chunk_len as u64;
            }
            let total: u64 = chunks.iter().map(|chunk| chunk.len() as u64).sum();
            write_frame(&mut writer, FrameKind::Data, extent.offset, total)?;
            for chunk in &chunks {
                writer.write_all(chunk).map_err(FormatError::Io)?;
            }
            write_term(&mut writer)?;
            written += total;

            frame_sizes.push(if chunks.len() == 1 {
                FrameSizes::Single(chunks[0].len() as u64)
            } else {
                FrameSizes::Split {
                    uncompressed: extent.length,
                    chunks: chunks.iter().map(|chunk| chunk.len() as u64).collect(),
                }
            });
        } else {
            write_frame(&mut writer, FrameKind::Data, extent.offset, extent.length)?;
            let mut offset = extent.offset;
            let mut remaining = extent.length;
            while remaining > 0 {
                let chunk_len = remaining.min(max_request) as usize;
                source.pread(&mut read_buf[..chunk_len], offset)?;
                writer
                    .write_all(&read_buf[..chunk_len])
                    .map_err(FormatError::Io)?;
                offset += chunk_len as u64;
                remaining -= chunk_len as u64;
            }
            write_term(&mut writer)?;
            written += extent.length;
        }
    }

    write_frame(&mut writer, FrameKind::Stop, 0, 0)?;
    if meta.compressed {
        write_compression_trailer(&mut writer, &frame_sizes)?;
    }
    Ok(written)
}

/// Raw passthrough: pre-size the target, copy data extents at their
/// offsets and leave holes for the rest.
pub fn write_raw(
    source: &mut dyn BlockIo,
    extents: &[Extent],
    writer: &mut dyn SinkWriter,
) -> Result<u64, BackupError> {
    writer.set_size(source.size())?;

    let max_request = source.max_request_size() as u64;
    let mut read_buf = vec![0u8; (max_request as usize).min(64 * 1024 * 1024)];
    let mut written = 0u64;

    for extent in extents.iter().filter(|extent| extent.data) {
        writer.seek_to(extent.offset)?;
        let mut offset = extent.offset;
        let mut remaining = extent.length;
        while remaining > 0 {
            let chunk_len = remaining.min(max_request) as usize;
            source.pread(&mut read_buf[..chunk_len], offset)?;
            writer
                .write_all(&read_buf[..chunk_len])
                .map_err(OutputError::Io)?;
            offset += chunk_len as u64;
            remaining -= chunk_len as u64;
        }
        written += extent.length;
    }
    Ok(written)
}

// keeps remotely started servers alive exactly as long as the worker
struct SourceGuard {
    _server: Option<NbdServer>,
    remote: Option<Box<dyn RemoteProcess>>,
}

impl Drop for SourceGuard {
    fn drop(&mut self) {
        if let Some(process) = self.remote.as_mut() {
            if let Err(err) = process.kill() {
                warn!("stopping remote nbd server failed: {}", err);
            }
        }
    }
}

fn connect_source(ctx: &DiskContext) -> Result<(NbdClient, SourceGuard), BackupError> {
    let context = meta_context(ctx.mode, !ctx.domain.offline, ctx.disk, ctx.plan);

    match &ctx.endpoint {
        SourceEndpoint::Job { socket } => {
            let opts = ConnectOptions {
                export: ctx.disk.target.clone(),
                meta_context: Some(context),
            };
            let client = NbdClient::connect_unix(socket, &opts)?;
            Ok((
                client,
                SourceGuard {
                    _server: None,
                    remote: None,
                },
            ))
        }
        SourceEndpoint::OfflineLocal { socket_dir } => {
            let socket = naming::socket_file(socket_dir, &ctx.disk.target);
            let bitmap = ctx
                .mode
                .is_incremental()
                .then(|| ctx.plan.parent.clone());
            let server = NbdServer::start_unix(
                &ServerConfig {
                    image: ctx.disk.path.clone(),
                    format: ctx.disk.format.clone(),
                    read_only: true,
                    bitmap,
                },
                &socket,
            )?;
            let opts = ConnectOptions {
                export: String::new(),
                meta_context: Some(context),
            };
            let client = NbdClient::connect_unix(&socket, &opts)?;
            Ok((
                client,
                SourceGuard {
                    _server: Some(server),
                    remote: None,
                },
            ))
        }
        SourceEndpoint::OfflineRemote {
            shell,
            host,
            base_port,
            tls,
        } => {
            // ports must be disjoint across workers, see the orchestrator
            let port = base_port + ctx.worker_index as u16;
            let bitmap = ctx
                .mode
                .is_incremental()
                .then(|| ctx.plan.parent.clone());
            let command = nbd_server_command(
                &ctx.disk.path.to_string_lossy(),
                &ctx.disk.format,
                port,
                bitmap.as_deref(),
            );
            let process = shell.spawn(&command)?;
            let opts = ConnectOptions {
                export: String::new(),
                meta_context: Some(context),
            };
            let client = NbdClient::connect_tcp(host, port, *tls, &opts)?;
            Ok((
                client,
                SourceGuard {
                    _server: None,
                    remote: Some(process),
                },
            ))
        }
    }
}

fn query_extents(
    client: &mut NbdClient,
    mode: BackupMode,
) -> Result<Option<Vec<Extent>>, BackupError> {
    let context = if mode.is_incremental() {
        StatusContext::DirtyBitmap
    } else {
        StatusContext::Allocation
    };
    Ok(NbdExtentSource::new(client, context).query_extents()?)
}

/// Back up one disk.
pub fn backup_disk(ctx: &DiskContext) -> Result<DiskBackupStats, BackupError> {
    let stream_type = stream_type(ctx.disk, ctx.options.raw);
    let (mut client, _guard) = connect_source(ctx)?;
    let virtual_size = client.size();

    let extents = match query_extents(&mut client, ctx.mode)? {
        Some(extents) => extents,
        None => {
            warn!(
                "disk {}: no extent information, writing an empty stream",
                ctx.disk.target
            );
            Vec::new()
        }
    };
    let thin_size = data_size(&extents);
    info!(
        "disk {}: {} bytes of {} to save",
        ctx.disk.target, thin_size, virtual_size
    );

    let mut stats = DiskBackupStats {
        thin_size,
        ..Default::default()
    };
    // extent sources that cannot tell are a warning, not an error
    if extents.is_empty() {
        stats.warnings += 1;
    }

    let file_name = stream_file_name(ctx.mode, ctx.disk, ctx.plan);
    let mut writer = ctx.sink.create(&file_name)?;

    match stream_type {
        StreamType::Raw => {
            stats.written = write_raw(&mut client, &extents, writer.as_mut())?;
        }
        StreamType::Stream => {
            let meta = build_metadata(
                ctx.disk,
                virtual_size,
                thin_size,
                ctx.mode,
                ctx.plan,
                ctx.options.compress,
            );
            stats.written = write_stream(&mut client, &extents, &meta, writer.as_mut())?;
        }
    }

    writer.finish()?;
    client.disconnect();
    debug!(
        "disk {}: backup complete, {} bytes written",
        ctx.disk.target, stats.written
    );
    Ok(stats)
}

/// Thin backup size of one disk without writing anything, for
/// `--print-estimate-only`.
pub fn estimate_disk(ctx: &DiskContext) -> Result<u64, BackupError> {
    let (mut client, _guard) = connect_source(ctx)?;
    let extents = query_extents(&mut client, ctx.mode)?.unwrap_or_default();
    let size = data_size(&extents);
    client.disconnect();
    Ok(size)
}

/// Capture the verbatim image info sidecar for one qcow2 disk. Failure
/// is a warning; restore then falls back to tool defaults.
pub fn capture_qcow_sidecar(
    sink: &dyn OutputSink,
    disk: &DomainDisk,
    ident: &str,
) -> Result<(), BackupError> {
    let info = image::image_info_text(&disk.path)?;
    let name = naming::qcow_sidecar(&disk.target, ident);
    sink.put(&name, info.as_bytes())?;
    Ok(())
}

/// In-memory disk used by the engine tests and the restore tests.
pub struct MemDisk {
    pub data: Vec<u8>,
    pub max_request: u32,
}

impl MemDisk {
    pub fn new(size: usize, max_request: u32) -> Self {
        MemDisk {
            data: vec![0u8; size],
            max_request,
        }
    }
}

impl BlockIo for MemDisk {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn max_request_size(&self) -> u32 {
        self.max_request
    }

    fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<(), TransportError> {
        if buf.len() > self.max_request as usize {
            return Err(TransportError::Oversized(buf.len(), self.max_request));
        }
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(TransportError::Protocol("read beyond end".into()));
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn pwrite(&mut self, buf: &[u8], offset: u64) -> Result<(), TransportError> {
        if buf.len() > self.max_request as usize {
            return Err(TransportError::Oversized(buf.len(), self.max_request));
        }
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(TransportError::Protocol("write beyond end".into()));
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }
}
