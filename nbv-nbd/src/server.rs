//! Managed `qemu-nbd` child processes.
//!
//! Offline backup and every restore need an NBD endpoint that no
//! hypervisor provides, so one is started against the image file and torn
//! down when the disk worker finishes. The handle kills the child on drop
//! so a failing worker does not leak server processes.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::client::Endpoint;
use crate::TransportError;

const QEMU_NBD: &str = "qemu-nbd";
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const STARTUP_POLL: Duration = Duration::from_millis(100);

/// Spawn parameters for one server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Image file to export.
    pub image: PathBuf,
    /// Image format passed to `--format`.
    pub format: String,
    /// Export read-only (backup sources) or writable (restore targets).
    pub read_only: bool,
    /// Dirty bitmap to expose as a metadata context.
    pub bitmap: Option<String>,
}

/// A running `qemu-nbd` child.
pub struct NbdServer {
    child: Child,
    endpoint: Endpoint,
}

impl NbdServer {
    /// Start a server listening on a Unix socket.
    pub fn start_unix(config: &ServerConfig, socket: &Path) -> Result<Self, TransportError> {
        let mut cmd = Command::new(QEMU_NBD);
        cmd.arg(format!("--socket={}", socket.display()));
        Self::start(cmd, config, Endpoint::Unix(socket.to_path_buf()))
    }

    /// Start a server listening on a TCP port.
    pub fn start_tcp(config: &ServerConfig, port: u16) -> Result<Self, TransportError> {
        let mut cmd = Command::new(QEMU_NBD);
        cmd.arg("--bind=0.0.0.0").arg(format!("--port={}", port));
        Self::start(
            cmd,
            config,
            Endpoint::Tcp {
                host: "127.0.0.1".to_string(),
                port,
                tls: false,
            },
        )
    }

    fn start(
        mut cmd: Command,
        config: &ServerConfig,
        endpoint: Endpoint,
    ) -> Result<Self, TransportError> {
        cmd.arg("--persistent")
            .arg(format!("--format={}", config.format));
        if config.read_only {
            cmd.arg("--read-only");
        }
        if let Some(bitmap) = &config.bitmap {
            cmd.arg(format!("--bitmap={}", bitmap));
        }
        cmd.arg(&config.image);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        debug!("starting {:?}", cmd);
        let child = cmd.spawn().map_err(|err| {
            TransportError::Server(format!("failed to start {}: {}", QEMU_NBD, err))
        })?;

        let mut server = NbdServer { child, endpoint };
        server.wait_ready()?;
        Ok(server)
    }

    /// Endpoint clients should connect to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Poll until the listening socket accepts connections.
    fn wait_ready(&mut self) -> Result<(), TransportError> {
        let deadline = Instant::now() + STARTUP_TIMEOUT;
        loop {
            if let Some(status) = self
                .child
                .try_wait()
                .map_err(|err| TransportError::Server(err.to_string()))?
            {
                let stderr = self
                    .child
                    .stderr
                    .take()
                    .and_then(|mut pipe| {
                        use std::io::Read;
                        let mut msg = String::new();
                        pipe.read_to_string(&mut msg).ok().map(|_| msg)
                    })
                    .unwrap_or_default();
                return Err(TransportError::Server(format!(
                    "{} exited during startup ({}): {}",
                    QEMU_NBD,
                    status,
                    stderr.trim()
                )));
            }

            let reachable = match &self.endpoint {
                Endpoint::Unix(path) => std::os::unix::net::UnixStream::connect(path).is_ok(),
                Endpoint::Tcp { host, port, .. } => {
                    std::net::TcpStream::connect((host.as_str(), *port)).is_ok()
                }
            };
            if reachable {
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.stop();
                return Err(TransportError::Server(format!(
                    "{} did not accept connections within {:?}",
                    QEMU_NBD, STARTUP_TIMEOUT
                )));
            }
            std::thread::sleep(STARTUP_POLL);
        }
    }

    /// Terminate the child. Idempotent.
    pub fn stop(&mut self) {
        match self.child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(err) => {
                warn!("cannot query {} state: {}", QEMU_NBD, err);
            }
        }
        if let Err(err) = self.child.kill() {
            warn!("cannot stop {}: {}", QEMU_NBD, err);
        }
        let _ = self.child.wait();
        if let Endpoint::Unix(path) = &self.endpoint {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for NbdServer {
    fn drop(&mut self) {
        self.stop();
    }
}
