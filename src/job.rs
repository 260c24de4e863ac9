//! Top level backup orchestration.
//!
//! Owns everything the disk workers must not touch: mode resolution,
//! foreign checkpoint detection, the chain file, the hypervisor job and
//! the worker pool itself. Workers only see their immutable
//! [DiskContext](crate::backup::DiskContext).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Context, Error, Result};
use log::{error, info, warn};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::backup::{
    backup_disk, capture_qcow_sidecar, estimate_disk, BackupOptions, DiskContext, SourceEndpoint,
};
use crate::chain::{self, ChainError, CheckpointChain, CheckpointPlan};
use crate::hypervisor::{BackupJobSpec, Domain, DomainDisk, Hypervisor};
use crate::naming;
use crate::remote::RemoteShell;
use crate::sink::OutputSink;
use crate::tools::pool::run_jobs;
use crate::BackupMode;

/// Immutable configuration of one backup run.
#[derive(Debug, Clone)]
pub struct BackupRunConfig {
    pub domain: String,
    pub mode: BackupMode,
    /// Target directory; `None` when streaming a zip archive, which
    /// disables the chain file and restricts the mode to full/copy.
    pub target_dir: Option<PathBuf>,
    pub include_disks: Vec<String>,
    pub exclude_disks: Vec<String>,
    pub workers: Option<usize>,
    pub compress: Option<i32>,
    pub raw: bool,
    pub strict: bool,
    /// Remote libvirt host for offline backups over TCP.
    pub remote_host: Option<String>,
    pub base_port: u16,
    /// Upgrade remote NBD connections to TLS.
    pub tls: bool,
    pub start_only: bool,
    pub kill_only: bool,
    pub estimate_only: bool,
}

/// Aggregated result of a run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub failed_disks: usize,
    pub warnings: u64,
    pub interrupted: bool,
}

impl RunReport {
    /// 0 success, 1 failure, 2 warnings under strict mode.
    pub fn exit_code(&self, strict: bool) -> i32 {
        if self.failed_disks > 0 || self.interrupted {
            1
        } else if strict && self.warnings > 0 {
            2
        } else {
            0
        }
    }
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_interrupt(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install the SIGINT/SIGTERM handler. The returned token flips once on
/// the first signal; the orchestrator observes it at worker join points
/// and runs the hypervisor cleanup exactly once.
pub fn install_interrupt_handler() -> Result<&'static AtomicBool> {
    let action = SigAction::new(
        SigHandler::Handler(handle_interrupt),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action).context("installing SIGINT handler")?;
        sigaction(Signal::SIGTERM, &action).context("installing SIGTERM handler")?;
    }
    Ok(&INTERRUPTED)
}

/// Pick the NBD source location for one worker.
fn endpoint_for<'a>(
    online: bool,
    job_socket: &'a std::path::Path,
    socket_dir: &'a std::path::Path,
    remote: Option<&'a dyn RemoteShell>,
    config: &'a BackupRunConfig,
) -> SourceEndpoint<'a> {
    if online {
        SourceEndpoint::Job { socket: job_socket }
    } else if let (Some(shell), Some(host)) = (remote, config.remote_host.as_deref()) {
        SourceEndpoint::OfflineRemote {
            shell,
            host,
            base_port: config.base_port,
            tls: config.tls,
        }
    } else {
        SourceEndpoint::OfflineLocal { socket_dir }
    }
}

/// Resolve `auto` against the target directory: full for a fresh
/// directory, inc once a base exists.
fn resolve_mode(config: &BackupRunConfig) -> Result<BackupMode> {
    if config.mode != BackupMode::Auto {
        return Ok(config.mode);
    }
    let dir = match &config.target_dir {
        Some(dir) => dir,
        None => return Ok(BackupMode::Full),
    };
    let targets = match naming::disk_targets(dir) {
        Ok(targets) => targets,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(err.into()),
    };
    if targets.is_empty() {
        info!("auto: target directory is empty, running a full backup");
        return Ok(BackupMode::Full);
    }
    for target in &targets {
        let files = naming::disk_chain_files(dir, target)?;
        let has_base = files
            .iter()
            .any(|file| matches!(file.kind, naming::DataFileKind::Base { .. }));
        if !has_base {
            bail!(
                "auto: disk {} has streams but no full or copy base, not a usable chain",
                target
            );
        }
    }
    info!("auto: continuing the existing chain incrementally");
    Ok(BackupMode::Inc)
}

fn filter_disks(config: &BackupRunConfig, mut disks: Vec<DomainDisk>) -> Vec<DomainDisk> {
    if !config.include_disks.is_empty() {
        disks.retain(|disk| config.include_disks.contains(&disk.target));
    }
    if !config.exclude_disks.is_empty() {
        disks.retain(|disk| !config.exclude_disks.contains(&disk.target));
    }
    disks
}

/// Identifier tying this run's auxiliary files together.
fn run_ident(mode: BackupMode, plan: &CheckpointPlan) -> String {
    match mode {
        BackupMode::Full | BackupMode::Inc => plan.name.clone(),
        BackupMode::Diff => format!("diff.{}", chrono::Utc::now().timestamp()),
        BackupMode::Copy => format!("copy.{}", chrono::Utc::now().timestamp()),
        BackupMode::Auto => unreachable!("auto is resolved before aux capture"),
    }
}

fn capture_aux_files(
    config: &BackupRunConfig,
    hypervisor: &dyn Hypervisor,
    domain: &Domain,
    disks: &[DomainDisk],
    sink: &dyn OutputSink,
    mode: BackupMode,
    ident: &str,
) -> u64 {
    let mut warnings = 0;

    match hypervisor.get_domain_config(domain) {
        Ok(xml) => {
            if let Err(err) = sink.put(&naming::vmconfig_file(ident), xml.as_bytes()) {
                warn!("unable to store the domain configuration: {}", err);
                warnings += 1;
            }
        }
        Err(err) => {
            warn!("unable to read the domain configuration: {}", err);
            warnings += 1;
        }
    }

    match hypervisor.boot_aux_files(domain) {
        Ok(paths) => {
            for path in paths {
                let name = match path.file_name().and_then(|name| name.to_str()) {
                    Some(name) if mode == BackupMode::Copy => name.to_string(),
                    Some(name) => format!("{}.{}", name, ident),
                    None => continue,
                };
                match std::fs::read(&path) {
                    Ok(data) => {
                        if let Err(err) = sink.put(&name, &data) {
                            warn!("unable to store {}: {}", path.display(), err);
                            warnings += 1;
                        }
                    }
                    Err(err) => {
                        warn!("unable to read {}: {}", path.display(), err);
                        warnings += 1;
                    }
                }
            }
        }
        Err(err) => {
            warn!("unable to enumerate boot files: {}", err);
            warnings += 1;
        }
    }

    // local qcow2 disks also record their creation options
    if config.remote_host.is_none() {
        for disk in disks {
            if disk.format == "qcow2" && disk.path.exists() {
                if let Err(err) = capture_qcow_sidecar(sink, disk, ident) {
                    warn!("unable to capture image info of {}: {}", disk.target, err);
                    warnings += 1;
                }
            }
        }
    }

    warnings
}

/// Run one backup.
///
/// Chain and job-start problems abort before any worker runs; a failing
/// disk worker only counts into the report while its siblings continue.
pub fn run_backup(
    config: &BackupRunConfig,
    hypervisor: &dyn Hypervisor,
    sink: &dyn OutputSink,
    remote: Option<&dyn RemoteShell>,
    cancel: &AtomicBool,
) -> Result<RunReport> {
    let domain = hypervisor.get_domain(&config.domain)?;
    let online = !domain.offline;

    if config.kill_only {
        hypervisor
            .stop_backup(&domain)
            .context("stopping the backup job")?;
        info!("backup job stopped");
        return Ok(RunReport::default());
    }

    let disks = filter_disks(config, hypervisor.get_domain_disks(&domain)?);
    if disks.is_empty() {
        bail!("no disks left to back up after filtering");
    }

    let mode = resolve_mode(config)?;
    if config.target_dir.is_none() && mode.is_incremental() {
        bail!("incremental and differential backups need a target directory");
    }

    if let Some(dir) = &config.target_dir {
        std::fs::create_dir_all(dir)?;
        if mode.is_incremental() && naming::has_partial_files(dir)? {
            bail!(
                "target directory {} holds .partial files from a failed run; \
                 clean up manually before the next incremental backup",
                dir.display()
            );
        }
    }

    let mut checkpoint_chain = match &config.target_dir {
        Some(dir) => CheckpointChain::load(dir, &domain.name)?,
        None => CheckpointChain::empty(std::path::Path::new("."), &domain.name),
    };

    // refuse to touch anything when somebody else's checkpoints exist
    if mode != BackupMode::Copy {
        let existing = hypervisor.list_checkpoints(&domain)?;
        if let Some(foreign) = chain::find_foreign(&existing) {
            return Err(ChainError::Foreign(foreign.to_string()).into());
        }
    }

    if mode == BackupMode::Full {
        hypervisor
            .remove_all_checkpoints(&domain)
            .map_err(|err| ChainError::RemoveCheckpoint(err.to_string()))?;
        checkpoint_chain.clear()?;
    }

    if online && mode.is_incremental() {
        hypervisor
            .redefine_checkpoints(&domain, checkpoint_chain.names())
            .map_err(|err| ChainError::RedefineCheckpoint(err.to_string()))?;
    }

    let plan = chain::plan(mode, &checkpoint_chain)?;

    let socket_dir = std::env::temp_dir().join(format!("nbdvault-{}", std::process::id()));
    std::fs::create_dir_all(&socket_dir)?;
    let job_socket = socket_dir.join("backup.sock");

    // only full and inc create a checkpoint; diff rides on the parent's
    // bitmap and copy tracks nothing
    let creates_checkpoint = matches!(mode, BackupMode::Full | BackupMode::Inc);
    if online {
        let job = BackupJobSpec {
            socket: job_socket.clone(),
            checkpoint: creates_checkpoint.then(|| plan.clone()),
            disks: disks.iter().map(|disk| disk.target.clone()).collect(),
        };
        hypervisor
            .start_backup(&domain, &job)
            .context("hypervisor refused to start the backup job")?;
    } else if creates_checkpoint {
        hypervisor
            .backup_checkpoint(&domain, &plan)
            .context("creating the offline checkpoint")?;
    }

    if config.start_only {
        info!("backup job started, leaving it running as requested");
        return Ok(RunReport::default());
    }

    // the chain file is only extended once the hypervisor confirmed the
    // job; diff and copy never extend it
    if creates_checkpoint && config.target_dir.is_some() {
        checkpoint_chain.append(&plan.name)?;
    }

    let options = BackupOptions {
        compress: config.compress,
        raw: config.raw,
    };

    if config.remote_host.is_some() && !online {
        if remote.is_none() {
            bail!("a remote host was given but no remote shell is available");
        }
        // one port per disk, all of them must fit
        let highest = config.base_port as u64 + disks.len() as u64 - 1;
        if highest > u16::MAX as u64 {
            bail!(
                "base port {} leaves no room for {} disks",
                config.base_port,
                disks.len()
            );
        }
    }

    let ident = run_ident(mode, &plan);

    if config.estimate_only {
        let mut total = 0;
        for (index, disk) in disks.iter().enumerate() {
            let ctx = DiskContext {
                domain: &domain,
                disk,
                worker_index: index,
                mode,
                plan: &plan,
                options: &options,
                sink,
                endpoint: endpoint_for(online, &job_socket, &socket_dir, remote, config),
            };
            let size = estimate_disk(&ctx)?;
            info!("disk {}: estimated {} bytes", disk.target, size);
            total += size;
        }
        println!("{}", total);
        if online {
            hypervisor.stop_backup(&domain).ok();
        }
        return Ok(RunReport::default());
    }

    let mut report = RunReport::default();
    report.warnings += capture_aux_files(config, hypervisor, &domain, &disks, sink, mode, &ident);

    let worker_count = if sink.single_writer() {
        1
    } else {
        config.workers.unwrap_or(disks.len()).max(1)
    };
    info!(
        "backing up {} disks with {} workers ({} mode)",
        disks.len(),
        worker_count.min(disks.len()),
        mode
    );

    let warning_tally = Mutex::new(0u64);
    let results = run_jobs(
        "disk worker",
        worker_count,
        disks.clone(),
        cancel,
        |index, disk| -> Result<(), Error> {
            let ctx = DiskContext {
                domain: &domain,
                disk: &disk,
                worker_index: index,
                mode,
                plan: &plan,
                options: &options,
                sink,
                endpoint: endpoint_for(online, &job_socket, &socket_dir, remote, config),
            };
            let stats = backup_disk(&ctx)
                .map_err(|err| anyhow::format_err!("backup of disk {} failed: {}", disk.target, err))?;
            *warning_tally.lock().unwrap() += stats.warnings;
            info!(
                "disk {}: {} bytes written (thin size {})",
                disk.target, stats.written, stats.thin_size
            );
            Ok(())
        },
    );
    report.warnings += *warning_tally.lock().unwrap();

    for (index, result) in &results {
        if let Err(err) = result {
            error!("worker for disk {}: {}", disks[*index].target, err);
            report.failed_disks += 1;
        }
    }

    if online {
        if let Err(err) = hypervisor.stop_backup(&domain) {
            warn!("stopping the backup job failed: {}", err);
            report.warnings += 1;
        }
    }

    sink.finish()?;
    let _ = std::fs::remove_dir_all(&socket_dir);

    if cancel.load(Ordering::SeqCst) {
        report.interrupted = true;
        warn!("run was interrupted, partial files were left in place");
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        let ok = RunReport::default();
        assert_eq!(ok.exit_code(false), 0);
        assert_eq!(ok.exit_code(true), 0);

        let warned = RunReport {
            warnings: 2,
            ..Default::default()
        };
        assert_eq!(warned.exit_code(false), 0);
        assert_eq!(warned.exit_code(true), 2);

        let failed = RunReport {
            failed_disks: 1,
            warnings: 2,
            ..Default::default()
        };
        assert_eq!(failed.exit_code(false), 1);
        assert_eq!(failed.exit_code(true), 1);
    }

    #[test]
    fn run_ident_by_mode() {
        let plan = CheckpointPlan {
            name: "nbdvault.4".to_string(),
            parent: "nbdvault.3".to_string(),
        };
        assert_eq!(run_ident(BackupMode::Inc, &plan), "nbdvault.4");
        assert_eq!(run_ident(BackupMode::Full, &plan), "nbdvault.4");
        assert!(run_ident(BackupMode::Diff, &plan).starts_with("diff."));
        assert!(run_ident(BackupMode::Copy, &plan).starts_with("copy."));
    }
}
