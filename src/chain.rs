//! Checkpoint chain management.
//!
//! Checkpoints are named `nbdvault.<n>` with a strictly increasing
//! suffix. The chain file `<domain>.cpt` in the target directory records
//! the ordered names as a JSON array; the last entry is the parent of the
//! next incremental backup. Checkpoints carrying any other name were not
//! created by this tool and abort the run.

use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use thiserror::Error;

use crate::naming;
use crate::BackupMode;

/// Name prefix of checkpoints owned by this tool.
pub const CHECKPOINT_PREFIX: &str = "nbdvault";

lazy_static! {
    static ref CHECKPOINT_RE: Regex =
        Regex::new(&format!(r"^{}\.(\d+)$", CHECKPOINT_PREFIX)).unwrap();
}

/// Chain level failures, all fatal for the whole run.
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("no checkpoints found, an inc/diff backup needs an existing chain")]
    NoCheckpointsFound,

    #[error("checkpoint '{0}' was not created by this tool, refusing to continue")]
    Foreign(String),

    #[error("unable to read checkpoint chain {path}: {reason}")]
    ReadCheckpoints { path: PathBuf, reason: String },

    #[error("unable to save checkpoint chain {path}: {source}")]
    SaveCheckpoint {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("redefining checkpoints with the hypervisor failed: {0}")]
    RedefineCheckpoint(String),

    #[error("removing checkpoints from the hypervisor failed: {0}")]
    RemoveCheckpoint(String),
}

/// Numeric suffix of a well formed checkpoint name.
pub fn checkpoint_index(name: &str) -> Option<u64> {
    CHECKPOINT_RE
        .captures(name)
        .and_then(|caps| caps[1].parse().ok())
}

/// True for checkpoint names not following our naming scheme.
pub fn is_foreign(name: &str) -> bool {
    checkpoint_index(name).is_none()
}

/// Checkpoint assignment for one backup run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPlan {
    /// Checkpoint created by this run, empty for copy mode.
    pub name: String,
    /// Parent the run is a delta against, empty for full/copy.
    pub parent: String,
}

/// The persisted chain of one domain.
#[derive(Debug)]
pub struct CheckpointChain {
    path: PathBuf,
    names: Vec<String>,
}

impl CheckpointChain {
    /// Load the chain file, treating a missing file as an empty chain.
    pub fn load(output: &Path, domain: &str) -> Result<Self, ChainError> {
        let path = naming::chain_file(output, domain);
        let names = match std::fs::read(&path) {
            Ok(data) => {
                serde_json::from_slice(&data).map_err(|err| ChainError::ReadCheckpoints {
                    path: path.clone(),
                    reason: err.to_string(),
                })?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(ChainError::ReadCheckpoints {
                    path,
                    reason: err.to_string(),
                })
            }
        };
        Ok(CheckpointChain { path, names })
    }

    /// An unsaved empty chain, for runs against a fresh directory.
    pub fn empty(output: &Path, domain: &str) -> Self {
        CheckpointChain {
            path: naming::chain_file(output, domain),
            names: Vec::new(),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn last(&self) -> Option<&str> {
        self.names.last().map(String::as_str)
    }

    /// Suffix for the next checkpoint: one above the highest recorded.
    pub fn next_index(&self) -> u64 {
        self.names
            .iter()
            .filter_map(|name| checkpoint_index(name))
            .max()
            .map(|max| max + 1)
            .unwrap_or(0)
    }

    /// Append a checkpoint and persist the chain file.
    pub fn append(&mut self, name: &str) -> Result<(), ChainError> {
        self.names.push(name.to_string());
        self.save()
    }

    fn save(&self) -> Result<(), ChainError> {
        let data = serde_json::to_vec(&self.names).expect("string lists serialize");
        std::fs::write(&self.path, data).map_err(|source| ChainError::SaveCheckpoint {
            path: self.path.clone(),
            source,
        })?;
        debug!("saved checkpoint chain {}", self.path.display());
        Ok(())
    }

    /// Drop all recorded checkpoints and remove the chain file. A
    /// missing file is fine, the chain was empty then.
    pub fn clear(&mut self) -> Result<(), ChainError> {
        self.names.clear();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ChainError::SaveCheckpoint {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// Work out name and parent for a backup run.
///
/// Pure chain logic; the hypervisor side effects of full mode (removing
/// existing checkpoints, deleting the chain file) are the orchestrator's
/// job. `auto` must be resolved by the caller beforehand.
pub fn plan(mode: BackupMode, chain: &CheckpointChain) -> Result<CheckpointPlan, ChainError> {
    match mode {
        BackupMode::Copy => Ok(CheckpointPlan {
            name: String::new(),
            parent: String::new(),
        }),
        BackupMode::Full => Ok(CheckpointPlan {
            name: format!("{}.0", CHECKPOINT_PREFIX),
            parent: String::new(),
        }),
        BackupMode::Inc => {
            let parent = chain.last().ok_or(ChainError::NoCheckpointsFound)?;
            Ok(CheckpointPlan {
                name: format!("{}.{}", CHECKPOINT_PREFIX, chain.next_index()),
                parent: parent.to_string(),
            })
        }
        BackupMode::Diff => {
            let parent = chain.last().ok_or(ChainError::NoCheckpointsFound)?;
            Ok(CheckpointPlan {
                name: parent.to_string(),
                parent: parent.to_string(),
            })
        }
        BackupMode::Auto => unreachable!("auto is resolved before checkpoint planning"),
    }
}

/// First foreign name in a hypervisor checkpoint listing.
pub fn find_foreign(names: &[String]) -> Option<&str> {
    names
        .iter()
        .map(String::as_str)
        .find(|name| is_foreign(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_with(names: &[&str]) -> CheckpointChain {
        CheckpointChain {
            path: PathBuf::from("/nonexistent/test.cpt"),
            names: names.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn name_pattern() {
        assert_eq!(checkpoint_index("nbdvault.0"), Some(0));
        assert_eq!(checkpoint_index("nbdvault.17"), Some(17));
        assert!(is_foreign("user-snap"));
        assert!(is_foreign("nbdvault.x"));
        assert!(is_foreign("nbdvault.1.extra"));
    }

    #[test]
    fn plan_copy_never_touches_the_chain() {
        let plan0 = plan(BackupMode::Copy, &chain_with(&[])).unwrap();
        assert_eq!(plan0.name, "");
        let plan1 = plan(BackupMode::Copy, &chain_with(&["nbdvault.0"])).unwrap();
        assert_eq!(plan1.name, "");
        assert_eq!(plan1.parent, "");
    }

    #[test]
    fn plan_full_restarts_numbering() {
        let plan = plan(BackupMode::Full, &chain_with(&["nbdvault.0", "nbdvault.1"])).unwrap();
        assert_eq!(plan.name, "nbdvault.0");
        assert_eq!(plan.parent, "");
    }

    #[test]
    fn plan_inc_extends() {
        let chain = chain_with(&["nbdvault.0", "nbdvault.1"]);
        let plan = plan(BackupMode::Inc, &chain).unwrap();
        assert_eq!(plan.name, "nbdvault.2");
        assert_eq!(plan.parent, "nbdvault.1");
    }

    #[test]
    fn plan_inc_requires_a_chain() {
        match plan(BackupMode::Inc, &chain_with(&[])) {
            Err(ChainError::NoCheckpointsFound) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        match plan(BackupMode::Diff, &chain_with(&[])) {
            Err(ChainError::NoCheckpointsFound) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn plan_diff_does_not_advance() {
        let chain = chain_with(&["nbdvault.0", "nbdvault.1"]);
        let plan = plan(BackupMode::Diff, &chain).unwrap();
        assert_eq!(plan.name, "nbdvault.1");
        assert_eq!(plan.parent, "nbdvault.1");
    }

    #[test]
    fn next_index_is_strictly_monotonic() {
        // holes in the chain may exist after manual cleanup; the next
        // index must still be above every recorded one
        let chain = chain_with(&["nbdvault.0", "nbdvault.5", "nbdvault.2"]);
        assert_eq!(chain.next_index(), 6);
    }

    #[test]
    fn foreign_detection() {
        let names = vec!["nbdvault.0".to_string(), "user-snap".to_string()];
        assert_eq!(find_foreign(&names), Some("user-snap"));
        let clean = vec!["nbdvault.0".to_string(), "nbdvault.1".to_string()];
        assert_eq!(find_foreign(&clean), None);
    }

    #[test]
    fn chain_file_roundtrip() -> Result<(), ChainError> {
        let dir = std::env::temp_dir().join(format!("nbv-chain-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let mut chain = CheckpointChain::load(&dir, "vm1")?;
        assert!(chain.is_empty());

        chain.append("nbdvault.0")?;
        chain.append("nbdvault.1")?;

        let reloaded = CheckpointChain::load(&dir, "vm1")?;
        assert_eq!(reloaded.names(), &["nbdvault.0", "nbdvault.1"]);
        assert_eq!(reloaded.last(), Some("nbdvault.1"));

        let mut reloaded = reloaded;
        reloaded.clear()?;
        // clearing twice must not fail on the missing file
        reloaded.clear()?;
        assert!(CheckpointChain::load(&dir, "vm1")?.is_empty());

        std::fs::remove_dir_all(&dir).unwrap();
        Ok(())
    }

    #[test]
    fn invalid_chain_file_is_fatal() {
        let dir = std::env::temp_dir().join(format!("nbv-chain-bad-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(naming::chain_file(&dir, "vm1"), b"not json").unwrap();

        match CheckpointChain::load(&dir, "vm1") {
            Err(ChainError::ReadCheckpoints { .. }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
