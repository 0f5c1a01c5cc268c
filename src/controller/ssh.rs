//! OpenSSH-backed [`RemoteSession`].
//!
//! `connect` starts a multiplexing master connection; every `execute` then
//! runs as a short-lived client over that master, so authentication and host
//! key verification happen exactly once per session.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{ControllerEndpoint, RemoteCommand, RemoteSession, SessionFactory};
use crate::error::{OrchestratorError, Result};

/// Exit status OpenSSH uses for its own (transport/auth) failures.
const SSH_TRANSPORT_FAILURE: i32 = 255;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct SshOptions {
    pub connect_timeout: Duration,
    pub binary_dir: Option<String>,
    pub control_dir: PathBuf,
}

pub struct SshSessionFactory {
    options: SshOptions,
}

impl SshSessionFactory {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }
}

impl SessionFactory for SshSessionFactory {
    fn open(&self, endpoint: &ControllerEndpoint) -> Box<dyn RemoteSession> {
        Box::new(SshSession::new(endpoint.clone(), self.options.clone()))
    }
}

pub struct SshSession {
    endpoint: ControllerEndpoint,
    options: SshOptions,
    control_path: PathBuf,
    connected: bool,
}

impl SshSession {
    pub fn new(endpoint: ControllerEndpoint, options: SshOptions) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let control_path = options
            .control_dir
            .join(format!("atlas-{}-{}.sock", std::process::id(), id));
        Self {
            endpoint,
            options,
            control_path,
            connected: false,
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.endpoint.user, self.endpoint.host)
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-p")
            .arg(self.endpoint.port.to_string())
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        if let Err(e) = tokio::fs::create_dir_all(&self.options.control_dir).await {
            return Err(OrchestratorError::Connection(format!(
                "cannot create control socket directory {}: {e}",
                self.options.control_dir.display()
            )));
        }

        let mut cmd = self.base_command();
        cmd.arg("-i")
            .arg(&self.endpoint.key_path)
            .arg("-o")
            .arg("StrictHostKeyChecking=yes")
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.options.connect_timeout.as_secs().max(1)
            ))
            .arg("-o")
            .arg("ServerAliveInterval=30")
            .arg("-o")
            .arg("ControlMaster=yes")
            .arg("-o")
            .arg("ControlPersist=yes");
        if let Some(known_hosts) = &self.endpoint.known_hosts_path {
            cmd.arg("-o")
                .arg(format!("UserKnownHostsFile={}", known_hosts.display()));
        }
        cmd.arg("-f")
            .arg("-N")
            .arg(self.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let output = match tokio::time::timeout(self.options.connect_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(OrchestratorError::Connection(format!(
                    "failed to spawn ssh for {}: {e}",
                    self.endpoint
                )))
            }
            Err(_) => {
                return Err(OrchestratorError::Connection(format!(
                    "timed out after {}s connecting to {}",
                    self.options.connect_timeout.as_secs(),
                    self.endpoint
                )))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(endpoint = %self.endpoint, stderr = %stderr, "SSH master connection failed.");
            return Err(OrchestratorError::Connection(format!(
                "{}: {}",
                self.endpoint,
                if stderr.is_empty() { "authentication or host key verification failed" } else { &stderr }
            )));
        }

        self.connected = true;
        info!(endpoint = %self.endpoint, control_path = ?self.control_path, "Controller session established.");
        Ok(())
    }

    async fn execute(&mut self, command: &RemoteCommand) -> Result<String> {
        if !self.connected {
            return Err(OrchestratorError::Connection(format!(
                "session to {} is not connected",
                self.endpoint
            )));
        }

        let line = command.to_shell_line(self.options.binary_dir.as_deref());
        debug!(endpoint = %self.endpoint, command = %line, "Executing remote command.");

        let mut cmd = self.base_command();
        cmd.arg(self.destination())
            .arg("--")
            .arg(&line)
            .stdin(if command.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = cmd.spawn().map_err(|e| {
            OrchestratorError::Connection(format!("failed to spawn ssh for {}: {e}", self.endpoint))
        })?;

        let (output, fed) = feed_and_wait(child, command.stdin.as_deref())
            .await
            .map_err(|e| {
                OrchestratorError::Connection(format!("lost ssh client process for {}: {e}", self.endpoint))
            })?;
        if let Err(e) = fed {
            if output.status.success() {
                return Err(OrchestratorError::Connection(format!(
                    "failed to stream stdin to {}: {e}",
                    self.endpoint
                )));
            }
            debug!(endpoint = %self.endpoint, error = %e, "Remote command exited before reading all input.");
        }
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        match output.status.code() {
            Some(0) => Ok(stdout),
            Some(SSH_TRANSPORT_FAILURE) | None => {
                self.connected = false;
                Err(OrchestratorError::Connection(format!(
                    "session to {} dropped: {}",
                    self.endpoint, stderr
                )))
            }
            Some(code) => Err(OrchestratorError::Execution {
                command: line,
                exit_status: code,
                stderr,
            }),
        }
    }

    async fn close(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;

        let mut cmd = self.base_command();
        cmd.arg("-O")
            .arg("exit")
            .arg(self.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        match tokio::time::timeout(Duration::from_secs(5), cmd.status()).await {
            Ok(Ok(status)) if status.success() => {
                debug!(endpoint = %self.endpoint, "Controller session closed.");
            }
            Ok(Ok(status)) => {
                warn!(endpoint = %self.endpoint, ?status, "SSH master did not exit cleanly.");
            }
            Ok(Err(e)) => warn!(endpoint = %self.endpoint, error = %e, "Failed to stop SSH master."),
            Err(_) => warn!(endpoint = %self.endpoint, "Timed out stopping SSH master."),
        }
        let _ = tokio::fs::remove_file(&self.control_path).await;
    }
}

/// Writes `input` to the child's stdin while its stdout and stderr are being
/// drained. Remote commands that echo their input (`tee`) would otherwise
/// fill the pipe and stall both sides. The second value is the outcome of
/// the write.
async fn feed_and_wait(
    mut child: Child,
    input: Option<&str>,
) -> std::io::Result<(Output, std::io::Result<()>)> {
    let pipe = child.stdin.take();
    let feed = async move {
        match (pipe, input) {
            // The pipe is dropped at the end of the block, which sends EOF.
            (Some(mut pipe), Some(input)) => pipe.write_all(input.as_bytes()).await,
            _ => Ok(()),
        }
    };
    let (fed, output) = tokio::join!(feed, child.wait_with_output());
    Ok((output?, fed))
}
