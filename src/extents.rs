//! Extent enumeration.
//!
//! Extents partition a disk into regions that carry data and regions
//! that read as zeroes (or, for delta backups, regions that changed
//! since the parent checkpoint and regions that did not). The preferred
//! source is an NBD `block_status` query against a negotiated metadata
//! context; `qemu-img map` serves as fallback when no NBD endpoint with
//! metadata support is available.

use anyhow::{bail, format_err, Error};
use log::debug;

use nbv_nbd::protocol::{STATE_DIRTY, STATE_HOLE};
use nbv_nbd::NbdClient;

use crate::tools::run_command;

// qemu caps block status replies well below this; one query per gigabyte
// keeps the reply sizes harmless
const STATUS_QUERY_SPAN: u64 = 1 << 30;

/// One contiguous disk region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
    /// True when the region must be read and backed up; false for
    /// holes/zero respectively clean regions.
    pub data: bool,
}

impl Extent {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Interpretation of the block status flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusContext {
    /// `base:allocation`: holes are skipped, allocated regions (zero
    /// written or not) are kept.
    Allocation,
    /// `qemu:dirty-bitmap:*`: only dirty regions are kept.
    DirtyBitmap,
}

impl StatusContext {
    fn is_data(self, flags: u32) -> bool {
        match self {
            StatusContext::Allocation => flags & STATE_HOLE == 0,
            StatusContext::DirtyBitmap => flags & STATE_DIRTY != 0,
        }
    }
}

/// A source of extent information for one disk.
///
/// `Ok(None)` means the source cannot tell; the caller treats the backup
/// as empty and logs a warning.
pub trait ExtentSource {
    fn query_extents(&mut self) -> Result<Option<Vec<Extent>>, Error>;
}

/// Extents via NBD `block_status` on an established connection.
pub struct NbdExtentSource<'a> {
    client: &'a mut NbdClient,
    context: StatusContext,
}

impl<'a> NbdExtentSource<'a> {
    pub fn new(client: &'a mut NbdClient, context: StatusContext) -> Self {
        NbdExtentSource { client, context }
    }
}

impl ExtentSource for NbdExtentSource<'_> {
    fn query_extents(&mut self) -> Result<Option<Vec<Extent>>, Error> {
        use nbv_nbd::BlockIo;

        if !self.client.has_meta_context() {
            return Ok(None);
        }

        let size = self.client.size();
        let mut raw = Vec::new();
        let mut offset = 0;
        while offset < size {
            let span = STATUS_QUERY_SPAN.min(size - offset);
            let descriptors = self.client.block_status(offset, span)?;
            if descriptors.is_empty() {
                bail!("server returned no block status for offset {}", offset);
            }
            for descriptor in descriptors {
                if descriptor.length == 0 {
                    bail!("server returned an empty block status descriptor");
                }
                // the last descriptor may reach beyond the export
                let length = descriptor.length.min(size - offset);
                raw.push(Extent {
                    offset,
                    length,
                    data: self.context.is_data(descriptor.flags),
                });
                offset += length;
                if offset >= size {
                    break;
                }
            }
        }

        Ok(Some(normalize(raw, size)?))
    }
}

/// Extents via `qemu-img map` on the image file, used where no metadata
/// context can be negotiated.
pub struct QemuImgExtentSource {
    image: std::path::PathBuf,
}

impl QemuImgExtentSource {
    pub fn new(image: impl Into<std::path::PathBuf>) -> Self {
        QemuImgExtentSource {
            image: image.into(),
        }
    }
}

impl ExtentSource for QemuImgExtentSource {
    fn query_extents(&mut self) -> Result<Option<Vec<Extent>>, Error> {
        let mut command = std::process::Command::new("qemu-img");
        command
            .arg("map")
            .arg("--output=json")
            .arg(&self.image);
        let output = run_command(command)?;

        let entries: Vec<serde_json::Value> = serde_json::from_str(&output)
            .map_err(|err| format_err!("unable to parse qemu-img map output: {}", err))?;

        let mut raw = Vec::new();
        let mut size = 0;
        for entry in entries {
            let start = entry["start"]
                .as_u64()
                .ok_or_else(|| format_err!("qemu-img map entry without start"))?;
            let length = entry["length"]
                .as_u64()
                .ok_or_else(|| format_err!("qemu-img map entry without length"))?;
            let data = entry["data"].as_bool().unwrap_or(false)
                && !entry["zero"].as_bool().unwrap_or(false);
            raw.push(Extent {
                offset: start,
                length,
                data,
            });
            size = size.max(start + length);
        }
        if raw.is_empty() {
            return Ok(None);
        }
        Ok(Some(normalize(raw, size)?))
    }
}

/// Merge adjacent extents with equal data flags and verify the sequence
/// covers `[0, size)` without gaps or overlaps.
pub fn normalize(mut raw: Vec<Extent>, size: u64) -> Result<Vec<Extent>, Error> {
    raw.sort_by_key(|extent| extent.offset);

    let mut merged: Vec<Extent> = Vec::with_capacity(raw.len());
    let mut expected = 0;
    for extent in raw {
        if extent.offset != expected {
            bail!(
                "extent list has a gap or overlap at offset {} (expected {})",
                extent.offset,
                expected
            );
        }
        expected = extent.end();
        match merged.last_mut() {
            Some(last) if last.data == extent.data => last.length += extent.length,
            _ => merged.push(extent),
        }
    }
    if expected != size {
        bail!(
            "extent list covers {} bytes of a {} byte disk",
            expected,
            size
        );
    }

    debug!(
        "normalized to {} extents, {} bytes of data",
        merged.len(),
        data_size(&merged)
    );
    Ok(merged)
}

/// Sum of the data region lengths, the thin backup size of one disk.
pub fn data_size(extents: &[Extent]) -> u64 {
    extents
        .iter()
        .filter(|extent| extent.data)
        .map(|extent| extent.length)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext(offset: u64, length: u64, data: bool) -> Extent {
        Extent {
            offset,
            length,
            data,
        }
    }

    #[test]
    fn merges_adjacent_equal_flags() -> Result<(), Error> {
        let raw = vec![
            ext(0, 100, true),
            ext(100, 50, true),
            ext(150, 50, false),
            ext(200, 100, false),
            ext(300, 12, true),
        ];
        let merged = normalize(raw, 312)?;
        assert_eq!(
            merged,
            vec![ext(0, 150, true), ext(150, 150, false), ext(300, 12, true)]
        );
        Ok(())
    }

    #[test]
    fn rejects_gaps() {
        let raw = vec![ext(0, 100, true), ext(150, 50, false)];
        assert!(normalize(raw, 200).is_err());
    }

    #[test]
    fn rejects_short_coverage() {
        let raw = vec![ext(0, 100, true)];
        assert!(normalize(raw, 200).is_err());
    }

    #[test]
    fn thin_size_counts_only_data() {
        let extents = vec![ext(0, 4096, true), ext(4096, 8192, false), ext(12288, 4096, true)];
        assert_eq!(data_size(&extents), 8192);
    }

    #[test]
    fn allocation_context_flags() {
        let ctx = StatusContext::Allocation;
        assert!(ctx.is_data(0)); // allocated data
        assert!(!ctx.is_data(STATE_HOLE));
        assert!(ctx.is_data(nbv_nbd::protocol::STATE_ZERO)); // allocated, reads zero
        assert!(!ctx.is_data(STATE_HOLE | nbv_nbd::protocol::STATE_ZERO));
    }

    #[test]
    fn dirty_context_flags() {
        let ctx = StatusContext::DirtyBitmap;
        assert!(!ctx.is_data(0));
        assert!(ctx.is_data(STATE_DIRTY));
    }
}
