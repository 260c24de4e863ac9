use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::{bail, Error};

use nbdvault::backup::{write_stream, MemDisk};
use nbdvault::extents::Extent;
use nbdvault::restore::{dump_metadata, restore_files};
use nbdvault::sink::{DirectorySink, OutputSink};
use nbv_stream::{StreamMetadata, STREAM_VERSION};

const MIB: u64 = 1024 * 1024;

fn tempdir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "nbdvault-test-{}-{}-{}",
        tag,
        std::process::id(),
        std::thread::current().name().unwrap_or("t").replace("::", "-")
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn metadata(
    disk_name: &str,
    data_size: u64,
    checkpoint: &str,
    parent: &str,
    incremental: bool,
) -> StreamMetadata {
    StreamMetadata {
        virtual_size: MIB,
        data_size,
        date: "2024-03-01T10:00:00+00:00".to_string(),
        disk_name: disk_name.to_string(),
        disk_format: "qcow2".to_string(),
        checkpoint_name: checkpoint.to_string(),
        parent_checkpoint: parent.to_string(),
        incremental,
        stream_version: STREAM_VERSION,
        compressed: false,
        compression_method: None,
        compression_level: None,
    }
}

/// Write one stream file through the directory sink.
fn write_stream_file(
    dir: &Path,
    file_name: &str,
    source: &mut MemDisk,
    extents: &[Extent],
    meta: &StreamMetadata,
) -> Result<(), Error> {
    let sink = DirectorySink::new(dir);
    let mut writer = sink.create(file_name)?;
    write_stream(source, extents, meta, writer.as_mut())?;
    writer.finish()?;
    Ok(())
}

fn fill(disk: &mut MemDisk, offset: u64, length: u64, value: u8) {
    disk.data[offset as usize..(offset + length) as usize].fill(value);
}

fn data_extent(offset: u64, length: u64) -> Vec<Extent> {
    let mut extents = Vec::new();
    if offset > 0 {
        extents.push(Extent {
            offset: 0,
            length: offset,
            data: false,
        });
    }
    extents.push(Extent {
        offset,
        length,
        data: true,
    });
    if offset + length < MIB {
        extents.push(Extent {
            offset: offset + length,
            length: MIB - offset - length,
            data: false,
        });
    }
    extents
}

/// Build the chain [full=C0, inc=C1, inc=C2] for disk vda:
/// C0 writes 0x11 at 0, C1 writes 0x22 at 256 KiB, C2 overwrites the
/// first region with 0x33.
fn build_chain(dir: &Path) -> Result<(), Error> {
    let mut state = MemDisk::new(MIB as usize, 1 << 20);
    fill(&mut state, 0, 4096, 0x11);
    write_stream_file(
        dir,
        "vda.full.data",
        &mut state,
        &data_extent(0, 4096),
        &metadata("vda", 4096, "nbdvault.0", "", false),
    )?;

    fill(&mut state, 256 * 1024, 4096, 0x22);
    write_stream_file(
        dir,
        "vda.inc.nbdvault.1.data",
        &mut state,
        &data_extent(256 * 1024, 4096),
        &metadata("vda", 4096, "nbdvault.1", "nbdvault.0", true),
    )?;

    fill(&mut state, 0, 4096, 0x33);
    write_stream_file(
        dir,
        "vda.inc.nbdvault.2.data",
        &mut state,
        &data_extent(0, 4096),
        &metadata("vda", 4096, "nbdvault.2", "nbdvault.1", true),
    )?;
    Ok(())
}

fn chain_paths(dir: &Path) -> Vec<PathBuf> {
    vec![
        dir.join("vda.full.data"),
        dir.join("vda.inc.nbdvault.1.data"),
        dir.join("vda.inc.nbdvault.2.data"),
    ]
}

#[test]
fn chain_replay_reaches_the_latest_state() -> Result<(), Error> {
    let dir = tempdir("chain-full");
    build_chain(&dir)?;

    let mut target = MemDisk::new(MIB as usize, 1 << 20);
    restore_files(&chain_paths(&dir), &mut target, None)?;

    assert!(target.data[..4096].iter().all(|&byte| byte == 0x33));
    assert!(target.data[256 * 1024..256 * 1024 + 4096]
        .iter()
        .all(|&byte| byte == 0x22));
    assert!(target.data[4096..256 * 1024].iter().all(|&byte| byte == 0));

    std::fs::remove_dir_all(&dir).unwrap();
    Ok(())
}

#[test]
fn until_stops_after_the_requested_checkpoint() -> Result<(), Error> {
    let dir = tempdir("chain-until");
    build_chain(&dir)?;

    let mut target = MemDisk::new(MIB as usize, 1 << 20);
    restore_files(&chain_paths(&dir), &mut target, Some("nbdvault.1"))?;

    // C2's overwrite of the first region must not be applied
    assert!(target.data[..4096].iter().all(|&byte| byte == 0x11));
    assert!(target.data[256 * 1024..256 * 1024 + 4096]
        .iter()
        .all(|&byte| byte == 0x22));

    std::fs::remove_dir_all(&dir).unwrap();
    Ok(())
}

#[test]
fn atomic_output_leaves_no_partials_on_success() -> Result<(), Error> {
    let dir = tempdir("atomic");
    build_chain(&dir)?;

    for entry in std::fs::read_dir(&dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".partial") {
            bail!("partial file {} left after successful backup", name);
        }
    }

    std::fs::remove_dir_all(&dir).unwrap();
    Ok(())
}

#[test]
fn failed_stream_write_keeps_the_partial_name() -> Result<(), Error> {
    let dir = tempdir("failed-write");
    let sink = DirectorySink::new(&dir);

    // a source that fails after the first read
    struct FailingDisk {
        reads: usize,
    }
    impl nbv_nbd::BlockIo for FailingDisk {
        fn size(&self) -> u64 {
            MIB
        }
        fn max_request_size(&self) -> u32 {
            1 << 20
        }
        fn pread(&mut self, buf: &mut [u8], _offset: u64) -> Result<(), nbv_nbd::TransportError> {
            self.reads += 1;
            if self.reads > 1 {
                return Err(nbv_nbd::TransportError::Eof);
            }
            buf.fill(0xab);
            Ok(())
        }
        fn pwrite(&mut self, _buf: &[u8], _offset: u64) -> Result<(), nbv_nbd::TransportError> {
            unreachable!("backup never writes to the source")
        }
    }

    let extents = vec![
        Extent {
            offset: 0,
            length: 4096,
            data: true,
        },
        Extent {
            offset: 4096,
            length: MIB - 4096,
            data: true,
        },
    ];
    let meta = metadata("vda", MIB, "nbdvault.0", "", false);

    let mut source = FailingDisk { reads: 0 };
    let mut writer = sink.create("vda.full.data")?;
    let result = write_stream(&mut source, &extents, &meta, writer.as_mut());
    assert!(result.is_err());
    drop(writer); // no finish on the error path

    assert!(dir.join("vda.full.data.partial").exists());
    assert!(!dir.join("vda.full.data").exists());

    std::fs::remove_dir_all(&dir).unwrap();
    Ok(())
}

#[test]
fn dump_lists_metadata_latest_first_and_filters() -> Result<(), Error> {
    let dir = tempdir("dump");
    build_chain(&dir)?;

    // a second disk that must be filtered out
    let mut other = MemDisk::new(MIB as usize, 1 << 20);
    fill(&mut other, 0, 4096, 0x44);
    write_stream_file(
        &dir,
        "vdb.full.data",
        &mut other,
        &data_extent(0, 4096),
        &metadata("vdb", 4096, "nbdvault.0", "", false),
    )?;

    let all = dump_metadata(&dir, &[])?;
    assert_eq!(all.len(), 4);

    let filtered = dump_metadata(&dir, &["vda".to_string()])?;
    assert_eq!(filtered.len(), 3);
    let checkpoints: Vec<&str> = filtered
        .iter()
        .map(|meta| meta.checkpoint_name.as_str())
        .collect();
    assert_eq!(checkpoints, ["nbdvault.2", "nbdvault.1", "nbdvault.0"]);
    assert!(filtered.iter().all(|meta| meta.disk_name == "vda"));

    std::fs::remove_dir_all(&dir).unwrap();
    Ok(())
}

#[test]
fn sequence_replay_accepts_explicit_order() -> Result<(), Error> {
    let dir = tempdir("sequence");
    build_chain(&dir)?;

    // replaying only the base gives the state at C0
    let mut target = MemDisk::new(MIB as usize, 1 << 20);
    restore_files(&[dir.join("vda.full.data")], &mut target, None)?;
    assert!(target.data[..4096].iter().all(|&byte| byte == 0x11));
    assert!(target.data[256 * 1024..256 * 1024 + 4096]
        .iter()
        .all(|&byte| byte == 0));

    std::fs::remove_dir_all(&dir).unwrap();
    Ok(())
}

#[test]
fn replay_validates_the_promised_data_size() -> Result<(), Error> {
    let dir = tempdir("datasize");
    let mut state = MemDisk::new(MIB as usize, 1 << 20);
    fill(&mut state, 0, 4096, 0x11);
    // metadata lies about the data size
    write_stream_file(
        &dir,
        "vda.full.data",
        &mut state,
        &data_extent(0, 4096),
        &metadata("vda", 8192, "nbdvault.0", "", false),
    )?;

    let stream = std::fs::read(dir.join("vda.full.data"))?;
    let mut target = MemDisk::new(MIB as usize, 1 << 20);
    match nbdvault::restore::replay_stream(&mut Cursor::new(stream), &mut target, None) {
        Err(nbdvault::restore::RestoreError::SizeMismatch { written, expected }) => {
            assert_eq!(written, 4096);
            assert_eq!(expected, 8192);
        }
        other => bail!("unexpected replay result: {:?}", other.map(|_| ())),
    }

    std::fs::remove_dir_all(&dir).unwrap();
    Ok(())
}
