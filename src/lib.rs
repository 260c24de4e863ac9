//! This crate implements incremental backup and restore of VM disk
//! images over NBD.
//!
//! # Backup
//!
//! A backup run asks the hypervisor to start a backup job, which exposes
//! every disk of the domain as an NBD export together with a dirty-bitmap
//! metadata context. Each disk is handled by one worker: it queries the
//! allocated (full/copy) or dirty (inc/diff) extents, reads them through
//! the NBD client and writes them as a sparse stream file (see the
//! `nbv-stream` crate for the container format). Checkpoints are named
//! `nbdvault.<n>` and recorded in a per-domain chain file, which makes
//! every incremental stream a well defined delta against its parent.
//!
//! # Restore
//!
//! Restore walks the chain in order: the target image is allocated with
//! the size and format recorded in the base stream, a `qemu-nbd` server
//! is started against it, and every stream file is replayed through the
//! NBD client. An `--until` checkpoint stops the replay mid-chain for
//! point-in-time recovery.
//!
//! The hypervisor itself, the image creation tool and remote transports
//! are reached through the [hypervisor::Hypervisor], [image::ImageCreator]
//! and [remote::RemoteShell] traits; nothing in the engines depends on
//! libvirt directly.

pub mod backup;
pub mod chain;
pub mod extents;
pub mod hypervisor;
pub mod image;
pub mod job;
pub mod naming;
pub mod remote;
pub mod restore;
pub mod sink;
pub mod tools;
pub mod virsh;

pub use chain::{CheckpointChain, CheckpointPlan};
pub use extents::Extent;
pub use hypervisor::{Domain, DomainDisk, Hypervisor};

/// Backup mode requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
    /// Full backup of all allocated regions without touching the chain.
    Copy,
    /// Full backup, starts a new chain.
    Full,
    /// Delta against the last checkpoint, extends the chain.
    Inc,
    /// Delta against the last checkpoint, chain stays as it is.
    Diff,
    /// Full on an empty target directory, inc otherwise.
    Auto,
}

impl BackupMode {
    /// Short name used in file names and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            BackupMode::Copy => "copy",
            BackupMode::Full => "full",
            BackupMode::Inc => "inc",
            BackupMode::Diff => "diff",
            BackupMode::Auto => "auto",
        }
    }

    /// True for the delta modes which need a dirty bitmap.
    pub fn is_incremental(self) -> bool {
        matches!(self, BackupMode::Inc | BackupMode::Diff)
    }
}

impl std::str::FromStr for BackupMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "copy" => Ok(BackupMode::Copy),
            "full" => Ok(BackupMode::Full),
            "inc" => Ok(BackupMode::Inc),
            "diff" => Ok(BackupMode::Diff),
            "auto" => Ok(BackupMode::Auto),
            other => Err(format!("unknown backup mode '{}'", other)),
        }
    }
}

impl std::fmt::Display for BackupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
