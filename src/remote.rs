//! Remote host access for offline backups of non-local hypervisors.
//!
//! The concrete SSH transport is provided by the caller; the backup
//! engine only needs to run commands and to hold a handle on a remotely
//! started `qemu-nbd` long enough to back up the disk behind it.

use anyhow::Result;

/// A process started on the remote host.
pub trait RemoteProcess: Send {
    /// Terminate the remote process. Called on every worker exit path.
    fn kill(&mut self) -> Result<()>;
}

/// Minimal remote shell capability.
pub trait RemoteShell: Send + Sync {
    /// Run a command to completion, returning stdout.
    fn run(&self, command: &str) -> Result<String>;

    /// Start a long-running command, e.g. a `qemu-nbd` server bound to a
    /// TCP port.
    fn spawn(&self, command: &str) -> Result<Box<dyn RemoteProcess>>;
}

/// [RemoteShell] over the system `ssh` client.
///
/// Long-running commands are detached on the remote side and addressed
/// by their remote pid, so killing them does not depend on the local ssh
/// process staying alive.
pub struct SshShell {
    destination: String,
}

impl SshShell {
    /// `destination` as `ssh` understands it, e.g. `root@hv1`.
    pub fn new(destination: impl Into<String>) -> Self {
        SshShell {
            destination: destination.into(),
        }
    }
}

impl RemoteShell for SshShell {
    fn run(&self, command: &str) -> Result<String> {
        let mut ssh = std::process::Command::new("ssh");
        ssh.arg("-o")
            .arg("BatchMode=yes")
            .arg(&self.destination)
            .arg(command);
        crate::tools::run_command(ssh)
    }

    fn spawn(&self, command: &str) -> Result<Box<dyn RemoteProcess>> {
        let output = self.run(&format!(
            "nohup {} >/dev/null 2>&1 & echo $!",
            command
        ))?;
        let pid: u32 = output
            .trim()
            .parse()
            .map_err(|_| anyhow::format_err!("unexpected pid output: {}", output.trim()))?;
        Ok(Box::new(SshProcess {
            destination: self.destination.clone(),
            pid,
            killed: false,
        }))
    }
}

struct SshProcess {
    destination: String,
    pid: u32,
    killed: bool,
}

impl RemoteProcess for SshProcess {
    fn kill(&mut self) -> Result<()> {
        if self.killed {
            return Ok(());
        }
        self.killed = true;
        let mut ssh = std::process::Command::new("ssh");
        ssh.arg("-o")
            .arg("BatchMode=yes")
            .arg(&self.destination)
            .arg(format!("kill {}", self.pid));
        crate::tools::run_command(ssh)?;
        Ok(())
    }
}

/// Command line for a remote `qemu-nbd` serving one disk on one port.
pub fn nbd_server_command(image: &str, format: &str, port: u16, bitmap: Option<&str>) -> String {
    let mut cmd = format!(
        "qemu-nbd --persistent --read-only --format={} --bind=0.0.0.0 --port={}",
        format, port
    );
    if let Some(bitmap) = bitmap {
        cmd.push_str(&format!(" --bitmap={}", bitmap));
    }
    cmd.push(' ');
    cmd.push_str(image);
    cmd
}
