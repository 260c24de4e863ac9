//! `virsh` backed implementation of the [Hypervisor] trait.
//!
//! This is a deliberately thin wrapper: every capability maps to one
//! `virsh` (or, for offline bitmap handling, `qemu-img`) invocation and
//! all XML handling stays inside this module. Deployments talking to
//! libvirt directly can swap in their own [Hypervisor] implementation
//! without touching the engines.

use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Context, Result};
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;

use crate::chain::CheckpointPlan;
use crate::hypervisor::{BackupJobSpec, Domain, DomainDisk, Hypervisor};
use crate::image;
use crate::tools::run_command;

lazy_static! {
    static ref DISK_BLOCK_RE: Regex =
        Regex::new(r"(?s)<disk[^>]*device=.disk[^>]*>.*?</disk>").unwrap();
    static ref DRIVER_TYPE_RE: Regex = Regex::new(r#"<driver[^>]*type=["']([^"']+)["']"#).unwrap();
    static ref SOURCE_FILE_RE: Regex = Regex::new(r#"<source[^>]*file=["']([^"']+)["']"#).unwrap();
    static ref TARGET_DEV_RE: Regex = Regex::new(r#"<target[^>]*dev=["']([^"']+)["']"#).unwrap();
    static ref LOADER_RE: Regex = Regex::new(r"<loader[^>]*>([^<]+)</loader>").unwrap();
    static ref NVRAM_RE: Regex = Regex::new(r"<nvram[^>]*>([^<]+)</nvram>").unwrap();
    static ref KERNEL_RE: Regex = Regex::new(r"<kernel>([^<]+)</kernel>").unwrap();
    static ref INITRD_RE: Regex = Regex::new(r"<initrd>([^<]+)</initrd>").unwrap();
}

/// Hypervisor access through the `virsh` command line client.
pub struct VirshHypervisor {
    /// Checkpoint XML dumps for later redefinition end up here.
    checkpoint_dir: Option<PathBuf>,
}

impl VirshHypervisor {
    pub fn new(checkpoint_dir: Option<PathBuf>) -> Self {
        VirshHypervisor { checkpoint_dir }
    }

    fn virsh(&self, args: &[&str]) -> Result<String> {
        let mut command = std::process::Command::new("virsh");
        command.args(args);
        run_command(command)
    }

    fn checkpoint_xml_path(&self, name: &str) -> Option<PathBuf> {
        self.checkpoint_dir
            .as_ref()
            .map(|dir| dir.join("checkpoints").join(format!("{}.xml", name)))
    }

    /// Dump a checkpoint's XML so a later run can redefine it after a
    /// libvirt restart.
    fn save_checkpoint_xml(&self, domain: &Domain, name: &str) {
        let path = match self.checkpoint_xml_path(name) {
            Some(path) => path,
            None => return,
        };
        let result = self
            .virsh(&["checkpoint-dumpxml", &domain.name, name, "--no-domain"])
            .and_then(|xml| {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, xml)?;
                Ok(())
            });
        if let Err(err) = result {
            warn!("unable to save checkpoint xml for {}: {}", name, err);
        }
    }

    fn domain_xml(&self, domain: &Domain) -> Result<String> {
        self.virsh(&["dumpxml", &domain.name])
    }
}

fn write_temp_xml(tag: &str, content: &str) -> Result<PathBuf> {
    let path = std::env::temp_dir().join(format!("nbdvault-{}-{}.xml", tag, std::process::id()));
    std::fs::write(&path, content)?;
    Ok(path)
}

fn backup_job_xml(job: &BackupJobSpec) -> String {
    let mut xml = String::from("<domainbackup mode='pull'>\n");
    xml.push_str(&format!(
        "  <server transport='unix' socket='{}'/>\n  <disks>\n",
        job.socket.display()
    ));
    for disk in &job.disks {
        xml.push_str(&format!("    <disk name='{}' backup='yes'/>\n", disk));
    }
    xml.push_str("  </disks>\n</domainbackup>\n");
    xml
}

fn checkpoint_xml(plan: &CheckpointPlan, disks: &[String]) -> String {
    let mut xml = String::from("<domaincheckpoint>\n");
    xml.push_str(&format!("  <name>{}</name>\n  <disks>\n", plan.name));
    for disk in disks {
        xml.push_str(&format!("    <disk name='{}' checkpoint='bitmap'/>\n", disk));
    }
    xml.push_str("  </disks>\n</domaincheckpoint>\n");
    xml
}

/// Pull the disk list out of a domain XML.
pub fn parse_disks(xml: &str) -> Vec<DomainDisk> {
    let mut disks = Vec::new();
    for block in DISK_BLOCK_RE.find_iter(xml) {
        let block = block.as_str();
        let target = match TARGET_DEV_RE.captures(block) {
            Some(caps) => caps[1].to_string(),
            None => continue,
        };
        let path = match SOURCE_FILE_RE.captures(block) {
            Some(caps) => PathBuf::from(&caps[1]),
            // network and volume backed disks are not supported
            None => continue,
        };
        let format = DRIVER_TYPE_RE
            .captures(block)
            .map(|caps| caps[1].to_string())
            .unwrap_or_else(|| "raw".to_string());
        disks.push(DomainDisk {
            target,
            path,
            format,
        });
    }
    disks
}

fn parse_boot_files(xml: &str) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for regex in [&*LOADER_RE, &*NVRAM_RE, &*KERNEL_RE, &*INITRD_RE] {
        if let Some(caps) = regex.captures(xml) {
            files.push(PathBuf::from(caps[1].trim()));
        }
    }
    files
}

impl Hypervisor for VirshHypervisor {
    fn get_domain(&self, name: &str) -> Result<Domain> {
        let info = self
            .virsh(&["dominfo", name])
            .with_context(|| format_err!("domain '{}' not found", name))?;
        let offline = info
            .lines()
            .find(|line| line.starts_with("State:"))
            .map(|line| line.contains("shut off"))
            .unwrap_or(false);
        Ok(Domain {
            name: name.to_string(),
            offline,
        })
    }

    fn get_domain_config(&self, domain: &Domain) -> Result<String> {
        self.domain_xml(domain)
    }

    fn get_domain_disks(&self, domain: &Domain) -> Result<Vec<DomainDisk>> {
        let xml = self.domain_xml(domain)?;
        let disks = parse_disks(&xml);
        if disks.is_empty() {
            bail!("domain '{}' has no file backed disks", domain.name);
        }
        Ok(disks)
    }

    fn boot_aux_files(&self, domain: &Domain) -> Result<Vec<PathBuf>> {
        Ok(parse_boot_files(&self.domain_xml(domain)?))
    }

    fn start_backup(&self, domain: &Domain, job: &BackupJobSpec) -> Result<()> {
        let backup_path = write_temp_xml("backup", &backup_job_xml(job))?;
        let mut args = vec![
            "backup-begin".to_string(),
            domain.name.clone(),
            backup_path.display().to_string(),
        ];
        let mut checkpoint_path = None;
        if let Some(plan) = &job.checkpoint {
            let path = write_temp_xml("checkpoint", &checkpoint_xml(plan, &job.disks))?;
            args.push(path.display().to_string());
            checkpoint_path = Some((path, plan.name.clone()));
        }

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let result = self.virsh(&args);
        let _ = std::fs::remove_file(&backup_path);
        if let Some((path, name)) = checkpoint_path {
            let _ = std::fs::remove_file(path);
            if result.is_ok() {
                self.save_checkpoint_xml(domain, &name);
            }
        }
        result.map(|_| ())
    }

    fn stop_backup(&self, domain: &Domain) -> Result<()> {
        self.virsh(&["domjobabort", &domain.name]).map(|_| ())
    }

    fn backup_checkpoint(&self, domain: &Domain, plan: &CheckpointPlan) -> Result<()> {
        // the domain is shut off, checkpoints become persistent bitmaps
        // in the qcow2 images
        for disk in self.get_domain_disks(domain)? {
            if disk.format != "qcow2" {
                continue;
            }
            let mut command = std::process::Command::new("qemu-img");
            command
                .arg("bitmap")
                .arg("--add")
                .arg(&disk.path)
                .arg(&plan.name);
            run_command(command)
                .with_context(|| format_err!("adding bitmap to {}", disk.path.display()))?;
        }
        Ok(())
    }

    fn list_checkpoints(&self, domain: &Domain) -> Result<Vec<String>> {
        if domain.offline {
            // persistent bitmaps take the role of checkpoints
            let disks = self.get_domain_disks(domain)?;
            let mut names = Vec::new();
            for disk in disks.iter().filter(|disk| disk.format == "qcow2") {
                let info = image::image_info(&disk.path)?;
                if let Some(bitmaps) = info["format-specific"]["data"]["bitmaps"].as_array() {
                    for bitmap in bitmaps {
                        if let Some(name) = bitmap["name"].as_str() {
                            if !names.iter().any(|existing| existing == name) {
                                names.push(name.to_string());
                            }
                        }
                    }
                }
            }
            return Ok(names);
        }

        let output = self.virsh(&["checkpoint-list", &domain.name, "--name"])?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    fn remove_all_checkpoints(&self, domain: &Domain) -> Result<()> {
        if domain.offline {
            for disk in self.get_domain_disks(domain)? {
                if disk.format != "qcow2" {
                    continue;
                }
                let info = image::image_info(&disk.path)?;
                let bitmaps: Vec<String> = info["format-specific"]["data"]["bitmaps"]
                    .as_array()
                    .map(|bitmaps| {
                        bitmaps
                            .iter()
                            .filter_map(|bitmap| bitmap["name"].as_str().map(String::from))
                            .collect()
                    })
                    .unwrap_or_default();
                for bitmap in bitmaps {
                    let mut command = std::process::Command::new("qemu-img");
                    command
                        .arg("bitmap")
                        .arg("--remove")
                        .arg(&disk.path)
                        .arg(&bitmap);
                    run_command(command)?;
                }
            }
            return Ok(());
        }

        for name in self.list_checkpoints(domain)? {
            self.virsh(&[
                "checkpoint-delete",
                &domain.name,
                &name,
                "--metadata",
            ])?;
        }
        Ok(())
    }

    fn redefine_checkpoints(&self, domain: &Domain, names: &[String]) -> Result<()> {
        let known = self.list_checkpoints(domain)?;
        for name in names {
            if known.contains(name) {
                continue;
            }
            let path = self
                .checkpoint_xml_path(name)
                .filter(|path| path.exists())
                .ok_or_else(|| {
                    format_err!("no saved checkpoint xml for '{}', cannot redefine", name)
                })?;
            self.virsh(&[
                "checkpoint-create",
                &domain.name,
                &path.display().to_string(),
                "--redefine",
            ])?;
            debug!("redefined checkpoint {}", name);
        }
        Ok(())
    }

    fn define_domain(&self, xml: &str) -> Result<()> {
        let path = write_temp_xml("define", xml)?;
        let result = self.virsh(&["define", &path.display().to_string()]);
        let _ = std::fs::remove_file(path);
        result.map(|_| ())
    }

    fn adjust_domain_config(&self, xml: &str, target: &str, new_path: &Path) -> Result<String> {
        let mut adjusted = String::with_capacity(xml.len());
        let mut last_end = 0;
        for block in DISK_BLOCK_RE.find_iter(xml) {
            adjusted.push_str(&xml[last_end..block.start()]);
            let block_str = block.as_str();
            let is_target = TARGET_DEV_RE
                .captures(block_str)
                .map(|caps| &caps[1] == target)
                .unwrap_or(false);
            if is_target {
                adjusted.push_str(&SOURCE_FILE_RE.replace(block_str, |caps: &regex::Captures| {
                    // keep everything around the file attribute value
                    caps[0].replace(&caps[1], &new_path.display().to_string())
                }));
            } else {
                adjusted.push_str(block_str);
            }
            last_end = block.end();
        }
        adjusted.push_str(&xml[last_end..]);
        Ok(adjusted)
    }

    fn adjust_domain_config_remove_disk(&self, xml: &str, target: &str) -> Result<String> {
        let mut adjusted = String::with_capacity(xml.len());
        let mut last_end = 0;
        for block in DISK_BLOCK_RE.find_iter(xml) {
            adjusted.push_str(&xml[last_end..block.start()]);
            let is_target = TARGET_DEV_RE
                .captures(block.as_str())
                .map(|caps| &caps[1] == target)
                .unwrap_or(false);
            if !is_target {
                adjusted.push_str(block.as_str());
            }
            last_end = block.end();
        }
        adjusted.push_str(&xml[last_end..]);
        Ok(adjusted)
    }

    fn refresh_pool(&self, path: &Path) -> Result<()> {
        // best effort: find the pool whose target contains the restored
        // files and ask libvirt to rescan it
        let pools = self.virsh(&["pool-list", "--name"])?;
        for pool in pools.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let pool_xml = match self.virsh(&["pool-dumpxml", pool]) {
                Ok(xml) => xml,
                Err(_) => continue,
            };
            if pool_xml.contains(&path.display().to_string()) {
                self.virsh(&["pool-refresh", pool])?;
                return Ok(());
            }
        }
        debug!("no storage pool covers {}, skipping refresh", path.display());
        Ok(())
    }
}
