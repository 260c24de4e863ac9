use std::io::{Cursor, Seek, SeekFrom, Write};

use anyhow::{bail, Error};
use lazy_static::lazy_static;

use nbdvault::backup::{write_stream, MemDisk};
use nbdvault::extents::Extent;
use nbdvault::restore::{replay_stream, PlaybackOutcome};
use nbdvault::sink::{OutputError, SinkWriter};
use nbv_stream::format::{read_frame, FrameKind};
use nbv_stream::trailer::read_compression_trailer;
use nbv_stream::{FrameSizes, StreamMetadata, STREAM_VERSION};

const MIB: u64 = 1024 * 1024;

lazy_static! {
    static ref PATTERN: Vec<u8> = {
        let mut data = Vec::new();
        for i in 0..(4 * MIB as usize) {
            data.push((i % 251) as u8);
        }
        data
    };
}

/// In-memory stand-in for a directory sink writer.
struct MemWriter {
    cursor: Cursor<Vec<u8>>,
}

impl MemWriter {
    fn new() -> Self {
        MemWriter {
            cursor: Cursor::new(Vec::new()),
        }
    }

    fn into_inner(self) -> Vec<u8> {
        self.cursor.into_inner()
    }
}

impl Write for MemWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.cursor.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SinkWriter for MemWriter {
    fn seek_to(&mut self, offset: u64) -> Result<(), OutputError> {
        self.cursor.seek(SeekFrom::Start(offset))?;
        Ok(())
    }
    fn set_size(&mut self, size: u64) -> Result<(), OutputError> {
        self.cursor.get_mut().resize(size as usize, 0);
        Ok(())
    }
    fn finish(&mut self) -> Result<(), OutputError> {
        Ok(())
    }
}

fn metadata(virtual_size: u64, data_size: u64, compressed: bool, incremental: bool) -> StreamMetadata {
    StreamMetadata {
        virtual_size,
        data_size,
        date: "2024-03-01T10:00:00+00:00".to_string(),
        disk_name: "vda".to_string(),
        disk_format: "qcow2".to_string(),
        checkpoint_name: "nbdvault.0".to_string(),
        parent_checkpoint: String::new(),
        incremental,
        stream_version: STREAM_VERSION,
        compressed,
        compression_method: compressed.then(|| "lz4".to_string()),
        compression_level: compressed.then_some(2),
    }
}

/// A 1 MiB disk with three 4 KiB data regions at 0, 256 KiB and 768 KiB.
fn scenario_disk(max_request: u32) -> (MemDisk, Vec<Extent>) {
    let mut disk = MemDisk::new(MIB as usize, max_request);
    let regions = [0u64, 256 * 1024, 768 * 1024];
    for &offset in &regions {
        let src = &PATTERN[offset as usize..offset as usize + 4096];
        disk.data[offset as usize..offset as usize + 4096].copy_from_slice(src);
    }

    let mut extents = Vec::new();
    let mut cursor = 0;
    for &offset in &regions {
        if offset > cursor {
            extents.push(Extent {
                offset: cursor,
                length: offset - cursor,
                data: false,
            });
        }
        extents.push(Extent {
            offset,
            length: 4096,
            data: true,
        });
        cursor = offset + 4096;
    }
    extents.push(Extent {
        offset: cursor,
        length: MIB - cursor,
        data: false,
    });
    (disk, extents)
}

#[test]
fn full_backup_restores_identically() -> Result<(), Error> {
    let (mut source, extents) = scenario_disk(1 << 20);
    let meta = metadata(MIB, 3 * 4096, false, false);

    let mut writer = MemWriter::new();
    let written = write_stream(&mut source, &extents, &meta, &mut writer)?;
    if written != 3 * 4096 {
        bail!("expected 12288 bytes written, got {}", written);
    }

    let stream = writer.into_inner();
    let mut target = MemDisk::new(MIB as usize, 1 << 20);
    let outcome = replay_stream(&mut Cursor::new(stream), &mut target, None)?;
    assert_eq!(outcome, PlaybackOutcome::Continue);
    assert_eq!(source.data, target.data);
    Ok(())
}

#[test]
fn compressed_backup_restores_identically() -> Result<(), Error> {
    let (mut source, extents) = scenario_disk(1 << 20);
    let meta = metadata(MIB, 3 * 4096, true, false);

    let mut writer = MemWriter::new();
    write_stream(&mut source, &extents, &meta, &mut writer)?;

    let stream = writer.into_inner();
    let mut target = MemDisk::new(MIB as usize, 1 << 20);
    replay_stream(&mut Cursor::new(stream), &mut target, None)?;
    assert_eq!(source.data, target.data);
    Ok(())
}

#[test]
fn clean_incremental_is_meta_and_stop_only() -> Result<(), Error> {
    // an inc backup with no dirty blocks still records the checkpoint
    let mut source = MemDisk::new(MIB as usize, 1 << 20);
    let extents = vec![Extent {
        offset: 0,
        length: MIB,
        data: false,
    }];
    let meta = metadata(MIB, 0, false, true);

    let mut writer = MemWriter::new();
    let written = write_stream(&mut source, &extents, &meta, &mut writer)?;
    assert_eq!(written, 0);

    let stream = writer.into_inner();
    let mut cursor = Cursor::new(&stream);
    let head = read_frame(&mut cursor)?;
    assert_eq!(head.kind, FrameKind::Meta);
    cursor.seek(SeekFrom::Current(head.length as i64 + 2))?;
    let stop = read_frame(&mut cursor)?;
    assert_eq!(stop.kind, FrameKind::Stop);
    assert_eq!(cursor.position(), stream.len() as u64);
    Ok(())
}

#[test]
fn chunked_extent_uses_one_frame_and_records_all_chunks() -> Result<(), Error> {
    // one extent four times the maximum request size: one DATA frame,
    // four compressed chunks in the trailer
    let max_request = 1 << 20;
    let extent_len = 4 * max_request;
    let mut source = MemDisk::new(extent_len as usize, max_request as u32);
    for (i, byte) in source.data.iter_mut().enumerate() {
        *byte = PATTERN[i % PATTERN.len()];
    }
    let extents = vec![Extent {
        offset: 0,
        length: extent_len,
        data: true,
    }];
    let meta = metadata(extent_len, extent_len, true, false);

    let mut writer = MemWriter::new();
    write_stream(&mut source, &extents, &meta, &mut writer)?;
    let stream = writer.into_inner();

    // exactly one DATA frame
    let mut cursor = Cursor::new(&stream);
    let head = read_frame(&mut cursor)?;
    cursor.seek(SeekFrom::Current(head.length as i64 + 2))?;
    let data = read_frame(&mut cursor)?;
    assert_eq!(data.kind, FrameKind::Data);

    let trailer = read_compression_trailer(&mut Cursor::new(&stream))?;
    assert_eq!(trailer.len(), 1);
    match &trailer[0] {
        FrameSizes::Split {
            uncompressed,
            chunks,
        } => {
            assert_eq!(*uncompressed, extent_len);
            assert_eq!(chunks.len(), 4);
            // trailer sizes must cover the DATA payload exactly
            assert_eq!(chunks.iter().sum::<u64>(), data.length);
        }
        other => bail!("expected a split entry, got {:?}", other),
    }

    let mut target = MemDisk::new(extent_len as usize, max_request as u32);
    replay_stream(&mut Cursor::new(stream), &mut target, None)?;
    assert_eq!(source.data, target.data);
    Ok(())
}

#[test]
fn raw_passthrough_leaves_holes() -> Result<(), Error> {
    let (mut source, extents) = scenario_disk(1 << 20);

    let mut writer = MemWriter::new();
    let written = nbdvault::backup::write_raw(&mut source, &extents, &mut writer)?;
    assert_eq!(written, 3 * 4096);

    let raw = writer.into_inner();
    assert_eq!(raw.len() as u64, MIB);
    assert_eq!(raw, source.data);
    Ok(())
}
