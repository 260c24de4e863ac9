use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::error;

use nbdvault::job::{self, BackupRunConfig};
use nbdvault::remote::{RemoteShell, SshShell};
use nbdvault::sink::{DirectorySink, OutputSink, ZipSink};
use nbdvault::BackupMode;

/// Block level backup of libvirt domains via NBD.
#[derive(Parser)]
#[command(name = "nbdvault-backup", version, about)]
struct Args {
    /// Domain to back up
    #[arg(short = 'd', long)]
    domain: String,

    /// Backup mode: copy, full, inc, diff or auto
    #[arg(short = 'l', long, default_value = "auto")]
    level: String,

    /// Target directory, or '-' to stream a zip archive to stdout
    #[arg(short = 'o', long)]
    output: String,

    /// Back up only these disk targets
    #[arg(short = 'i', long = "include")]
    include: Vec<String>,

    /// Skip these disk targets
    #[arg(short = 'x', long = "exclude")]
    exclude: Vec<String>,

    /// Concurrent disk workers, default one per disk
    #[arg(short = 'w', long)]
    worker: Option<usize>,

    /// lz4 compress the stream data, optionally with a level
    #[arg(short = 'c', long, num_args = 0..=1, default_missing_value = "2")]
    compress: Option<i32>,

    /// Copy raw disks byte for byte instead of as sparse streams
    #[arg(long)]
    raw: bool,

    /// Warnings fail the run with exit code 2
    #[arg(long)]
    strict: bool,

    /// Offline backup of a remote hypervisor (ssh destination)
    #[arg(long)]
    remote_host: Option<String>,

    /// First TCP port for remote offline NBD servers
    #[arg(long, default_value_t = 10809)]
    nbd_port: u16,

    /// Upgrade remote NBD connections to TLS
    #[arg(long)]
    tls: bool,

    /// Start the backup job and exit, for debugging
    #[arg(long)]
    start_only: bool,

    /// Stop a left-over backup job and exit
    #[arg(long)]
    kill_only: bool,

    /// Print the estimated thin backup size and exit
    #[arg(long)]
    print_estimate_only: bool,

    /// Verbose logging
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .format_timestamp_secs()
        .init();

    match run(args) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!("{:#}", err);
            std::process::exit(1);
        }
    }
}

fn run(args: Args) -> Result<i32> {
    let mode: BackupMode = args
        .level
        .parse()
        .map_err(|msg: String| anyhow::format_err!("{}", msg))?;

    let (sink, target_dir): (Box<dyn OutputSink>, Option<PathBuf>) = if args.output == "-" {
        (
            Box::new(ZipSink::new(Box::new(std::io::stdout()))),
            None,
        )
    } else {
        let dir = PathBuf::from(&args.output);
        std::fs::create_dir_all(&dir)?;
        (Box::new(DirectorySink::new(&dir)), Some(dir))
    };

    let hypervisor = nbdvault::virsh::VirshHypervisor::new(target_dir.clone());
    let shell = args.remote_host.as_deref().map(SshShell::new);
    let cancel = job::install_interrupt_handler()?;

    let config = BackupRunConfig {
        domain: args.domain,
        mode,
        target_dir,
        include_disks: args.include,
        exclude_disks: args.exclude,
        workers: args.worker,
        compress: args.compress,
        raw: args.raw,
        strict: args.strict,
        remote_host: args.remote_host.clone(),
        base_port: args.nbd_port,
        tls: args.tls,
        start_only: args.start_only,
        kill_only: args.kill_only,
        estimate_only: args.print_estimate_only,
    };

    let report = job::run_backup(
        &config,
        &hypervisor,
        sink.as_ref(),
        shell.as_ref().map(|shell| shell as &dyn RemoteShell),
        cancel,
    )?;
    Ok(report.exit_code(config.strict))
}
