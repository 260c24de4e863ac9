//! The hypervisor capability interface.
//!
//! Everything the backup and restore engines need from libvirt is
//! captured here; the concrete client (domain lookup, XML handling,
//! checkpoint redefinition, backup job control) lives outside this
//! crate. Tests run against [FakeHypervisor].

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::chain::CheckpointPlan;

/// A resolved domain handle.
#[derive(Debug, Clone)]
pub struct Domain {
    pub name: String,
    /// True when the domain is shut off; backups then go through a
    /// locally started NBD server instead of a backup job.
    pub offline: bool,
}

/// One virtual disk of a domain.
#[derive(Debug, Clone)]
pub struct DomainDisk {
    /// Target device name, e.g. `vda`. Also the NBD export name of the
    /// online backup job.
    pub target: String,
    /// Backing image file.
    pub path: PathBuf,
    /// Image format, e.g. `qcow2` or `raw`.
    pub format: String,
}

/// Parameters for starting one backup job.
#[derive(Debug, Clone)]
pub struct BackupJobSpec {
    /// Unix socket the job's NBD server listens on.
    pub socket: PathBuf,
    /// Checkpoint to create with the job, `None` for copy mode.
    pub checkpoint: Option<CheckpointPlan>,
    /// Disk targets included in the job.
    pub disks: Vec<String>,
}

/// Capability set of the hypervisor client.
pub trait Hypervisor {
    /// Look up a domain by name.
    fn get_domain(&self, name: &str) -> Result<Domain>;

    /// The verbatim domain XML.
    fn get_domain_config(&self, domain: &Domain) -> Result<String>;

    /// Disks eligible for backup, in stable order.
    fn get_domain_disks(&self, domain: &Domain) -> Result<Vec<DomainDisk>>;

    /// Loader, NVRAM, kernel and initrd paths referenced by the domain.
    fn boot_aux_files(&self, domain: &Domain) -> Result<Vec<PathBuf>>;

    /// Start the backup job; on success the NBD endpoint is live and the
    /// checkpoint of the plan exists.
    fn start_backup(&self, domain: &Domain, job: &BackupJobSpec) -> Result<()>;

    /// Stop a running backup job. Used on normal completion and from the
    /// interrupt path; must be safe to call when no job runs.
    fn stop_backup(&self, domain: &Domain) -> Result<()>;

    /// Create a checkpoint for an offline delta backup, where no job
    /// carries it.
    fn backup_checkpoint(&self, domain: &Domain, plan: &CheckpointPlan) -> Result<()>;

    /// All checkpoint names currently known to the hypervisor.
    fn list_checkpoints(&self, domain: &Domain) -> Result<Vec<String>>;

    /// Remove every checkpoint of the domain, ours or not.
    fn remove_all_checkpoints(&self, domain: &Domain) -> Result<()>;

    /// Re-declare the recorded chain to the hypervisor; it does not
    /// persist checkpoint metadata across libvirt restarts.
    fn redefine_checkpoints(&self, domain: &Domain, names: &[String]) -> Result<()>;

    /// Define a domain from XML (restore with `--define`).
    fn define_domain(&self, xml: &str) -> Result<()>;

    /// Rewrite one disk's source path in the XML.
    fn adjust_domain_config(&self, xml: &str, target: &str, new_path: &Path) -> Result<String>;

    /// Remove one disk from the XML entirely.
    fn adjust_domain_config_remove_disk(&self, xml: &str, target: &str) -> Result<String>;

    /// Ask the hypervisor to rescan a storage pool after restore.
    fn refresh_pool(&self, path: &Path) -> Result<()>;
}

/// In-memory hypervisor for tests and dry runs.
#[derive(Debug, Default)]
pub struct FakeHypervisor {
    pub domain: String,
    pub offline: bool,
    pub disks: Vec<DomainDisk>,
    pub config_xml: String,
    pub boot_files: Vec<PathBuf>,
    pub checkpoints: std::sync::Mutex<Vec<String>>,
    pub backup_running: std::sync::Mutex<bool>,
    /// When set, start_backup fails with this message.
    pub refuse_backup: Option<String>,
}

impl Hypervisor for FakeHypervisor {
    fn get_domain(&self, name: &str) -> Result<Domain> {
        if name != self.domain {
            anyhow::bail!("domain '{}' not found", name);
        }
        Ok(Domain {
            name: name.to_string(),
            offline: self.offline,
        })
    }

    fn get_domain_config(&self, _domain: &Domain) -> Result<String> {
        Ok(self.config_xml.clone())
    }

    fn get_domain_disks(&self, _domain: &Domain) -> Result<Vec<DomainDisk>> {
        Ok(self.disks.clone())
    }

    fn boot_aux_files(&self, _domain: &Domain) -> Result<Vec<PathBuf>> {
        Ok(self.boot_files.clone())
    }

    fn start_backup(&self, _domain: &Domain, job: &BackupJobSpec) -> Result<()> {
        if let Some(reason) = &self.refuse_backup {
            anyhow::bail!("{}", reason);
        }
        *self.backup_running.lock().unwrap() = true;
        if let Some(plan) = &job.checkpoint {
            self.checkpoints.lock().unwrap().push(plan.name.clone());
        }
        Ok(())
    }

    fn stop_backup(&self, _domain: &Domain) -> Result<()> {
        *self.backup_running.lock().unwrap() = false;
        Ok(())
    }

    fn backup_checkpoint(&self, _domain: &Domain, plan: &CheckpointPlan) -> Result<()> {
        self.checkpoints.lock().unwrap().push(plan.name.clone());
        Ok(())
    }

    fn list_checkpoints(&self, _domain: &Domain) -> Result<Vec<String>> {
        Ok(self.checkpoints.lock().unwrap().clone())
    }

    fn remove_all_checkpoints(&self, _domain: &Domain) -> Result<()> {
        self.checkpoints.lock().unwrap().clear();
        Ok(())
    }

    fn redefine_checkpoints(&self, _domain: &Domain, names: &[String]) -> Result<()> {
        let mut checkpoints = self.checkpoints.lock().unwrap();
        for name in names {
            if !checkpoints.contains(name) {
                checkpoints.push(name.clone());
            }
        }
        Ok(())
    }

    fn define_domain(&self, _xml: &str) -> Result<()> {
        Ok(())
    }

    fn adjust_domain_config(&self, xml: &str, target: &str, new_path: &Path) -> Result<String> {
        // the real client rewrites the <source> element of the disk;
        // good enough for tests
        Ok(xml.replace(
            &format!("source:{}", target),
            &format!("source:{}={}", target, new_path.display()),
        ))
    }

    fn adjust_domain_config_remove_disk(&self, xml: &str, target: &str) -> Result<String> {
        Ok(xml.replace(&format!("disk:{}", target), ""))
    }

    fn refresh_pool(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}
