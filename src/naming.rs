//! File name grammar of a backup target directory.
//!
//! Data streams: `<target>.full.data`, `<target>.copy.data`,
//! `<target>.inc.<checkpoint>.data`, `<target>.diff.<epoch>.data`.
//! Sidecars: `<target>.<ident>.qcow.json` and `vmconfig.<ident>.xml`.
//! In-flight files carry the `.partial` suffix until the atomic rename.

use std::path::{Path, PathBuf};

use crate::chain;
use crate::BackupMode;

/// Suffix of files still being written.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Extension of the per-domain checkpoint chain file.
pub const CHAIN_EXT: &str = "cpt";

/// Stream file name for one disk and mode.
///
/// `ident` is the checkpoint name for inc and the epoch timestamp for
/// diff; full and copy carry no identifier.
pub fn data_file(target: &str, mode: BackupMode, ident: &str) -> String {
    match mode {
        BackupMode::Full | BackupMode::Copy => format!("{}.{}.data", target, mode),
        BackupMode::Inc => format!("{}.inc.{}.data", target, ident),
        BackupMode::Diff => format!("{}.diff.{}.data", target, ident),
        BackupMode::Auto => unreachable!("auto is resolved before file naming"),
    }
}

/// Sidecar holding the verbatim `qemu-img info` JSON for one disk.
pub fn qcow_sidecar(target: &str, ident: &str) -> String {
    format!("{}.{}.qcow.json", target, ident)
}

/// Verbatim domain XML captured during one run.
pub fn vmconfig_file(ident: &str) -> String {
    format!("vmconfig.{}.xml", ident)
}

/// Per-domain chain file below the target directory.
pub fn chain_file(output: &Path, domain: &str) -> PathBuf {
    output.join(format!("{}.{}", domain, CHAIN_EXT))
}

/// Socket path for the offline per-disk NBD server.
pub fn socket_file(output: &Path, target: &str) -> PathBuf {
    output.join(format!("socketfile.{}", target))
}

/// Kind of stream file found in an input directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataFileKind {
    Base { mode: BackupMode },
    Inc { checkpoint: String },
    Diff { epoch: u64 },
}

/// A parsed `*.data` file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFile {
    pub target: String,
    pub kind: DataFileKind,
    pub path: PathBuf,
}

impl DataFile {
    /// Ordering key inside one disk's chain: base first, then deltas by
    /// checkpoint index respectively epoch.
    pub fn chain_order(&self) -> (u8, u64) {
        match &self.kind {
            DataFileKind::Base { .. } => (0, 0),
            DataFileKind::Inc { checkpoint } => {
                (1, chain::checkpoint_index(checkpoint).unwrap_or(u64::MAX))
            }
            DataFileKind::Diff { epoch } => (1, *epoch),
        }
    }
}

/// Parse a file name from the target directory; `None` for files that
/// are no data streams (sidecars, chain file, partials).
pub fn parse_data_file(path: &Path) -> Option<DataFile> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".data")?;

    let (target, rest) = stem.split_once('.')?;
    let kind = if rest == "full" {
        DataFileKind::Base {
            mode: BackupMode::Full,
        }
    } else if rest == "copy" {
        DataFileKind::Base {
            mode: BackupMode::Copy,
        }
    } else if let Some(checkpoint) = rest.strip_prefix("inc.") {
        DataFileKind::Inc {
            checkpoint: checkpoint.to_string(),
        }
    } else if let Some(epoch) = rest.strip_prefix("diff.") {
        DataFileKind::Diff {
            epoch: epoch.parse().ok()?,
        }
    } else {
        return None;
    };

    Some(DataFile {
        target: target.to_string(),
        kind,
        path: path.to_path_buf(),
    })
}

/// All stream files of one disk, base first, deltas in chain order.
pub fn disk_chain_files(dir: &Path, target: &str) -> std::io::Result<Vec<DataFile>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(parsed) = parse_data_file(&entry.path()) {
            if parsed.target == target {
                files.push(parsed);
            }
        }
    }
    files.sort_by_key(|file| file.chain_order());
    Ok(files)
}

/// Disk targets that have at least one stream file in `dir`.
pub fn disk_targets(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut targets = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(parsed) = parse_data_file(&entry.path()) {
            if !targets.contains(&parsed.target) {
                targets.push(parsed.target);
            }
        }
    }
    targets.sort();
    Ok(targets)
}

/// True if `dir` contains leftovers of an interrupted run.
pub fn has_partial_files(dir: &Path) -> std::io::Result<bool> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if name.ends_with(PARTIAL_SUFFIX) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Newest `vmconfig.*.xml` in `dir`, by modification time.
pub fn latest_vmconfig(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut best: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(name) => name,
            None => continue,
        };
        if !name.starts_with("vmconfig.") || !name.ends_with(".xml") {
            continue;
        }
        let mtime = entry.metadata()?.modified()?;
        if best.as_ref().map(|(time, _)| mtime > *time).unwrap_or(true) {
            best = Some((mtime, entry.path()));
        }
    }
    Ok(best.map(|(_, path)| path))
}

/// Newest qcow sidecar for one disk, if any.
pub fn latest_qcow_sidecar(dir: &Path, target: &str) -> std::io::Result<Option<PathBuf>> {
    let prefix = format!("{}.", target);
    let mut best: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(name) => name,
            None => continue,
        };
        if !name.starts_with(&prefix) || !name.ends_with(".qcow.json") {
            continue;
        }
        let mtime = entry.metadata()?.modified()?;
        if best.as_ref().map(|(time, _)| mtime > *time).unwrap_or(true) {
            best = Some((mtime, entry.path()));
        }
    }
    Ok(best.map(|(_, path)| path))
}
