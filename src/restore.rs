//! The restore engine.
//!
//! Replays a chain of stream files against a freshly allocated image
//! served by a restore-side `qemu-nbd`. Disks are restored one after the
//! other; within a disk the chain order (base, then deltas by
//! checkpoint) is mandatory, later streams overwrite earlier regions.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::{info, warn};
use thiserror::Error;

use nbv_nbd::client::ConnectOptions;
use nbv_nbd::server::ServerConfig;
use nbv_nbd::{BlockIo, NbdClient, NbdServer, TransportError};
use nbv_stream::format::{read_frame, read_term, FrameKind};
use nbv_stream::trailer::read_compression_trailer;
use nbv_stream::{compress, FormatError, FrameSizes, StreamMetadata};

use crate::hypervisor::Hypervisor;
use crate::image::{ImageCreator, QcowOptions};
use crate::naming::{self, DataFile, DataFileKind};

/// Failures of one disk's restore.
#[derive(Error, Debug)]
pub enum RestoreError {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("restore target {0} already exists, refusing to overwrite")]
    TargetExists(PathBuf),

    #[error("stream ends after {written} restored bytes, metadata promises {expected}")]
    SizeMismatch { written: u64, expected: u64 },

    #[error("no full or copy base stream found for disk {0}")]
    NoBaseStream(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Signal of [replay_stream]: whether the chain continues after this
/// file. Reaching the `until` checkpoint is a clean halt, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Continue,
    UntilReached,
}

/// Options of one restore run.
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Stop the chain after the stream carrying this checkpoint.
    pub until: Option<String>,
    /// Restore only these disk targets; empty means all.
    pub disk_filter: Vec<String>,
    /// Rewrite disk paths in the domain config and drop excluded disks.
    pub adjust_config: bool,
    /// Ask the hypervisor to define the restored domain.
    pub define: bool,
    /// Explicit ordered stream files instead of directory lookup.
    pub sequence: Vec<PathBuf>,
}

/// Counters of a finished restore run.
#[derive(Debug, Default)]
pub struct RestoreReport {
    pub disks: usize,
    pub warnings: u64,
}

/// Read the leading META frame of a stream file.
pub fn read_metadata<R: Read>(reader: &mut R) -> Result<StreamMetadata, RestoreError> {
    let frame = read_frame(reader)?;
    if frame.kind != FrameKind::Meta {
        return Err(FormatError::MalformedHeader.into());
    }
    let mut payload = vec![0u8; frame.length as usize];
    reader.read_exact(&mut payload).map_err(FormatError::Io)?;
    read_term(reader)?;
    Ok(StreamMetadata::from_bytes(&payload)?)
}

/// Metadata of a stream file on disk.
pub fn file_metadata(path: &Path) -> Result<StreamMetadata, RestoreError> {
    let mut file = std::fs::File::open(path)?;
    read_metadata(&mut file)
}

fn write_chunked(
    target: &mut dyn BlockIo,
    data: &[u8],
    offset: u64,
) -> Result<(), TransportError> {
    let max_request = target.max_request_size() as usize;
    let mut written = 0;
    while written < data.len() {
        let chunk = (data.len() - written).min(max_request);
        target.pwrite(&data[written..written + chunk], offset + written as u64)?;
        written += chunk;
    }
    Ok(())
}

/// Replay one stream file into the target.
///
/// Returns [PlaybackOutcome::UntilReached] when the stream's checkpoint
/// equals `until`; the caller then stops the chain. The cumulative
/// number of restored bytes must match the metadata's data size,
/// anything else means the stream is truncated or corrupt.
pub fn replay_stream<R: Read + Seek>(
    reader: &mut R,
    target: &mut dyn BlockIo,
    until: Option<&str>,
) -> Result<PlaybackOutcome, RestoreError> {
    let meta = read_metadata(reader)?;

    let mut trailer = if meta.compressed {
        let sizes = read_compression_trailer(reader)?;
        reader.seek(SeekFrom::Start(0))?;
        read_metadata(reader)?; // back to the first payload frame
        sizes.into_iter()
    } else {
        Vec::new().into_iter()
    };

    let mut restored = 0u64;
    loop {
        let frame = read_frame(reader)?;
        match frame.kind {
            FrameKind::Stop => break,
            FrameKind::Zero => {
                // the target is freshly allocated, zero regions are
                // already zero
                continue;
            }
            FrameKind::Meta => {
                return Err(FormatError::MalformedHeader.into());
            }
            FrameKind::Data => {}
        }

        if meta.compressed {
            let sizes = trailer
                .next()
                .ok_or_else(|| FormatError::MalformedTrailer("fewer entries than DATA frames".to_string()))?;
            if sizes.compressed_len() != frame.length {
                return Err(FormatError::MalformedTrailer(format!(
                    "trailer promises {} compressed bytes, frame has {}",
                    sizes.compressed_len(),
                    frame.length
                ))
                .into());
            }
            let mut write_offset = frame.start;
            for chunk_len in sizes.chunk_lengths() {
                let mut compressed = vec![0u8; chunk_len as usize];
                reader.read_exact(&mut compressed).map_err(FormatError::Io)?;
                let data = compress::decompress(&compressed)?;
                write_chunked(target, &data, write_offset)?;
                write_offset += data.len() as u64;
                restored += data.len() as u64;
            }
        } else {
            let max_request = target.max_request_size() as u64;
            let mut remaining = frame.length;
            let mut write_offset = frame.start;
            while remaining > 0 {
                let chunk_len = remaining.min(max_request) as usize;
                let mut data = vec![0u8; chunk_len];
                reader.read_exact(&mut data).map_err(FormatError::Io)?;
                target.pwrite(&data, write_offset)?;
                write_offset += chunk_len as u64;
                remaining -= chunk_len as u64;
            }
            restored += frame.length;
        }
        read_term(reader)?;
    }

    if restored != meta.data_size {
        return Err(RestoreError::SizeMismatch {
            written: restored,
            expected: meta.data_size,
        });
    }

    if let Some(until) = until {
        if meta.checkpoint_name == until {
            info!("checkpoint {} reached, stopping the chain", until);
            return Ok(PlaybackOutcome::UntilReached);
        }
    }
    Ok(PlaybackOutcome::Continue)
}

/// Replay a chain of stream files in order against one target.
pub fn restore_files(
    files: &[PathBuf],
    target: &mut dyn BlockIo,
    until: Option<&str>,
) -> Result<(), RestoreError> {
    for path in files {
        info!("replaying {}", path.display());
        let mut reader = std::fs::File::open(path)?;
        match replay_stream(&mut reader, target, until)? {
            PlaybackOutcome::Continue => {}
            PlaybackOutcome::UntilReached => break,
        }
    }
    Ok(())
}

/// Locate the chain files of one disk; the base must be a full or copy
/// stream.
fn chain_for_disk(input: &Path, target: &str) -> Result<Vec<DataFile>, RestoreError> {
    let files = naming::disk_chain_files(input, target)?;
    match files.first() {
        Some(DataFile {
            kind: DataFileKind::Base { .. },
            ..
        }) => Ok(files),
        _ => Err(RestoreError::NoBaseStream(target.to_string())),
    }
}

/// Restore every disk of a backup directory.
pub fn run_restore(
    options: &RestoreOptions,
    hypervisor: &dyn Hypervisor,
    creator: &dyn ImageCreator,
) -> Result<RestoreReport, RestoreError> {
    std::fs::create_dir_all(&options.output)?;
    let mut report = RestoreReport::default();

    let mut targets = if options.sequence.is_empty() {
        naming::disk_targets(&options.input)?
    } else {
        // an explicit sequence restores exactly one disk
        let first = options
            .sequence
            .first()
            .and_then(|path| naming::parse_data_file(path))
            .ok_or_else(|| {
                RestoreError::Other(anyhow::format_err!(
                    "sequence files do not follow the stream naming scheme"
                ))
            })?;
        vec![first.target]
    };
    if !options.disk_filter.is_empty() {
        targets.retain(|target| options.disk_filter.contains(target));
    }

    let mut restored_paths: Vec<(String, PathBuf)> = Vec::new();
    for target in &targets {
        let files: Vec<PathBuf> = if options.sequence.is_empty() {
            chain_for_disk(&options.input, target)?
                .into_iter()
                .map(|file| file.path)
                .collect()
        } else {
            options.sequence.clone()
        };

        let base_meta = file_metadata(&files[0])?;
        let image_path = options.output.join(target);
        if image_path.exists() {
            return Err(RestoreError::TargetExists(image_path));
        }

        let qcow_options = match naming::latest_qcow_sidecar(&options.input, target)? {
            Some(sidecar) => {
                let data = std::fs::read(&sidecar)?;
                match serde_json::from_slice(&data) {
                    Ok(info) => QcowOptions::from_sidecar(&info),
                    Err(err) => {
                        warn!(
                            "ignoring unreadable sidecar {}: {}",
                            sidecar.display(),
                            err
                        );
                        report.warnings += 1;
                        QcowOptions::default()
                    }
                }
            }
            None => {
                warn!("no qcow sidecar for disk {}, using tool defaults", target);
                report.warnings += 1;
                QcowOptions::default()
            }
        };

        creator
            .create(
                &image_path,
                &base_meta.disk_format,
                base_meta.virtual_size,
                &qcow_options,
            )
            .context("allocating the restore target")?;

        let socket = naming::socket_file(&options.output, target);
        let server = NbdServer::start_unix(
            &ServerConfig {
                image: image_path.clone(),
                format: base_meta.disk_format.clone(),
                read_only: false,
                bitmap: None,
            },
            &socket,
        )?;
        let mut client = NbdClient::connect_unix(
            &socket,
            &ConnectOptions {
                export: String::new(),
                meta_context: None,
            },
        )?;

        let result = restore_files(&files, &mut client, options.until.as_deref());
        client.disconnect();
        drop(server);
        result?;

        info!("disk {} restored to {}", target, image_path.display());
        restored_paths.push((target.clone(), image_path));
        report.disks += 1;
    }

    restore_domain_config(options, hypervisor, &restored_paths, &mut report)?;
    Ok(report)
}

/// Persist the domain configuration, adjusted or verbatim, and define
/// the domain when asked to.
fn restore_domain_config(
    options: &RestoreOptions,
    hypervisor: &dyn Hypervisor,
    restored: &[(String, PathBuf)],
    report: &mut RestoreReport,
) -> Result<(), RestoreError> {
    let config_path = match naming::latest_vmconfig(&options.input)? {
        Some(path) => path,
        None => {
            warn!("no domain configuration found in the input");
            report.warnings += 1;
            return Ok(());
        }
    };

    let mut xml = std::fs::read_to_string(&config_path)?;
    if options.adjust_config {
        let all_targets = naming::disk_targets(&options.input)?;
        for target in &all_targets {
            match restored.iter().find(|(name, _)| name == target) {
                Some((_, path)) => {
                    xml = hypervisor.adjust_domain_config(&xml, target, path)?;
                }
                None => {
                    xml = hypervisor.adjust_domain_config_remove_disk(&xml, target)?;
                }
            }
        }
    }

    let file_name = config_path
        .file_name()
        .expect("vmconfig paths carry file names");
    std::fs::write(options.output.join(file_name), &xml)?;

    if options.define {
        hypervisor.define_domain(&xml)?;
        hypervisor.refresh_pool(&options.output)?;
    }
    Ok(())
}

/// Dump mode: stream metadata of every data file, newest first, without
/// writing anything.
pub fn dump_metadata(
    input: &Path,
    disk_filter: &[String],
) -> Result<Vec<StreamMetadata>, RestoreError> {
    let mut targets = naming::disk_targets(input)?;
    if !disk_filter.is_empty() {
        targets.retain(|target| disk_filter.contains(target));
    }

    let mut result = Vec::new();
    for target in &targets {
        let mut files = naming::disk_chain_files(input, target)?;
        files.reverse();
        for file in files {
            result.push(file_metadata(&file.path)?);
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::MemDisk;
    use std::io::Cursor;

    use nbv_stream::format::{write_frame, write_term};
    use nbv_stream::STREAM_VERSION;

    fn meta(data_size: u64) -> StreamMetadata {
        StreamMetadata {
            virtual_size: 1024 * 1024,
            data_size,
            date: "2024-03-01T10:00:00+00:00".to_string(),
            disk_name: "vda".to_string(),
            disk_format: "qcow2".to_string(),
            checkpoint_name: "nbdvault.0".to_string(),
            parent_checkpoint: String::new(),
            incremental: false,
            stream_version: STREAM_VERSION,
            compressed: false,
            compression_method: None,
            compression_level: None,
        }
    }

    fn stream_with(meta: &StreamMetadata, frames: &[(u64, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        let meta_bytes = meta.to_bytes().unwrap();
        write_frame(&mut buf, FrameKind::Meta, 0, meta_bytes.len() as u64).unwrap();
        buf.extend_from_slice(&meta_bytes);
        write_term(&mut buf).unwrap();
        for (start, payload) in frames {
            write_frame(&mut buf, FrameKind::Data, *start, payload.len() as u64).unwrap();
            buf.extend_from_slice(payload);
            write_term(&mut buf).unwrap();
        }
        write_frame(&mut buf, FrameKind::Stop, 0, 0).unwrap();
        buf
    }

    #[test]
    fn replays_data_frames() -> Result<(), RestoreError> {
        let payload = vec![0x5au8; 4096];
        let stream = stream_with(&meta(4096), &[(8192, &payload)]);

        let mut target = MemDisk::new(1024 * 1024, 1 << 20);
        let outcome = replay_stream(&mut Cursor::new(stream), &mut target, None)?;
        assert_eq!(outcome, PlaybackOutcome::Continue);
        assert_eq!(&target.data[8192..8192 + 4096], &payload[..]);
        assert!(target.data[..8192].iter().all(|&byte| byte == 0));
        Ok(())
    }

    #[test]
    fn size_mismatch_is_fatal() {
        let payload = vec![1u8; 100];
        let stream = stream_with(&meta(4096), &[(0, &payload)]);

        let mut target = MemDisk::new(1024 * 1024, 1 << 20);
        match replay_stream(&mut Cursor::new(stream), &mut target, None) {
            Err(RestoreError::SizeMismatch {
                written: 100,
                expected: 4096,
            }) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn until_checkpoint_stops_cleanly() -> Result<(), RestoreError> {
        let payload = vec![2u8; 64];
        let stream = stream_with(&meta(64), &[(0, &payload)]);

        let mut target = MemDisk::new(1024 * 1024, 1 << 20);
        let outcome =
            replay_stream(&mut Cursor::new(stream), &mut target, Some("nbdvault.0"))?;
        assert_eq!(outcome, PlaybackOutcome::UntilReached);
        Ok(())
    }

    #[test]
    fn truncated_stream_is_detected() {
        let payload = vec![3u8; 64];
        let mut stream = stream_with(&meta(64), &[(0, &payload)]);
        // drop the STOP frame
        stream.truncate(stream.len() - nbv_stream::FRAME_LEN);

        let mut target = MemDisk::new(1024 * 1024, 1 << 20);
        match replay_stream(&mut Cursor::new(stream), &mut target, None) {
            Err(RestoreError::Format(FormatError::Truncated)) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn missing_term_is_detected() {
        let meta = meta(64);
        let mut buf = Vec::new();
        let meta_bytes = meta.to_bytes().unwrap();
        write_frame(&mut buf, FrameKind::Meta, 0, meta_bytes.len() as u64).unwrap();
        buf.extend_from_slice(&meta_bytes);
        // no TERM after the payload

        let mut target = MemDisk::new(1024, 1024);
        match replay_stream(&mut Cursor::new(buf), &mut target, None) {
            Err(RestoreError::Format(FormatError::MissingTerm)) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}
