use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use log::error;

use nbdvault::image::QemuImageCreator;
use nbdvault::restore::{self, RestoreOptions};
use nbdvault::virsh::VirshHypervisor;

/// Restore libvirt domain disks from nbdvault backups.
#[derive(Parser)]
#[command(name = "nbdvault-restore", version, about)]
struct Args {
    /// Directory holding the backup
    #[arg(short = 'i', long)]
    input: PathBuf,

    /// Directory the restored images are written to
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Stop the chain after this checkpoint
    #[arg(long)]
    until: Option<String>,

    /// Restore only these disk targets
    #[arg(short = 'd', long = "disk")]
    disks: Vec<String>,

    /// Explicit ordered stream files instead of directory lookup
    #[arg(long, value_delimiter = ',')]
    sequence: Vec<PathBuf>,

    /// Rewrite disk paths in the restored domain configuration
    #[arg(long)]
    adjust_config: bool,

    /// Define the restored domain with the hypervisor
    #[arg(long)]
    define: bool,

    /// Print the stream metadata of the input and exit
    #[arg(long)]
    dump: bool,

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
    if args.dump {
        let records = restore::dump_metadata(&args.input, &args.disks)?;
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(0);
    }

    let output = match args.output {
        Some(output) => output,
        None => bail!("--output is required unless --dump is given"),
    };

    let options = RestoreOptions {
        input: args.input,
        output,
        until: args.until,
        disk_filter: args.disks,
        adjust_config: args.adjust_config,
        define: args.define,
        sequence: args.sequence,
    };

    let hypervisor = VirshHypervisor::new(None);
    let report = restore::run_restore(&options, &hypervisor, &QemuImageCreator)?;
    log::info!(
        "restored {} disks ({} warnings)",
        report.disks,
        report.warnings
    );
    Ok(0)
}
