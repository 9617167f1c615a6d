//! Command execution capability
//!
//! [`CommandExecutor`] runs one shell command on a target and captures its
//! exit code and output. Non-zero exits are ordinary results; only a broken
//! transport is an error. [`FileTransfer`] copies files to and from the
//! same target.
//!
//! Two implementations are provided:
//! - [`SshExecutor`] drives the system `ssh` and `scp` binaries
//! - [`LocalExecutor`] runs commands through `sh -c` on this machine

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};
use trellis_core::domain::host::HostTarget;

use crate::error::{ClientError, Result};

/// Exit status `ssh` reserves for its own failures
const SSH_TRANSPORT_EXIT: i32 = 255;

/// Captured result of a command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn from_process(output: Output) -> Self {
        Self {
            // Killed by a signal
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

/// Runs shell commands against a single target
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Human-readable name of the target, used in logs and errors
    fn target(&self) -> &str;

    /// Runs `command` and captures its output
    ///
    /// Returns `Err` only when the command could not be delivered.
    async fn exec(&self, command: &str) -> Result<ExecOutput>;
}

/// Copies files to and from a target
#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// Copies a local file to `remote`
    async fn upload(&self, local: &Path, remote: &str) -> Result<()>;

    /// Copies `remote` to a local file, creating parent directories
    async fn download(&self, remote: &str, local: &Path) -> Result<()>;
}

/// Checks that the `ssh` client is installed
pub async fn check_ssh_available() -> Result<()> {
    let output = Command::new("ssh")
        .arg("-V")
        .output()
        .await
        .map_err(|e| ClientError::transport("localhost", format!("cannot run ssh: {}", e)))?;

    if !output.status.success() {
        return Err(ClientError::transport(
            "localhost",
            "ssh client is not working correctly",
        ));
    }

    // OpenSSH prints its version on stderr
    let version = String::from_utf8_lossy(&output.stderr);
    info!("ssh is available: {}", version.trim());
    Ok(())
}

/// Executes commands on a remote host through the system `ssh` client
///
/// Authentication is non-interactive (`BatchMode=yes`): the key must be
/// usable without a passphrase prompt or be held by an agent.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    target: HostTarget,
    label: String,
    identity: Option<PathBuf>,
    connect_timeout: Duration,
}

impl SshExecutor {
    /// Create an executor for `target` with default options
    pub fn new(target: HostTarget) -> Self {
        Self {
            label: target.to_string(),
            target,
            identity: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Authenticate with the given private key
    pub fn with_identity(mut self, identity: impl Into<PathBuf>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Set the ssh connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn host_target(&self) -> &HostTarget {
        &self.target
    }

    fn common_options(&self, command: &mut Command) {
        command
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs()));

        if let Some(identity) = &self.identity {
            command.arg("-i").arg(identity);
        }
    }

    fn ssh_command(&self, remote_command: &str) -> Command {
        let mut command = Command::new("ssh");
        self.common_options(&mut command);
        if let Some(port) = self.target.port {
            command.arg("-p").arg(port.to_string());
        }
        command
            .arg(self.target.destination())
            .arg("--")
            .arg(remote_command);
        command
    }

    fn scp_command(&self) -> Command {
        let mut command = Command::new("scp");
        self.common_options(&mut command);
        if let Some(port) = self.target.port {
            command.arg("-P").arg(port.to_string());
        }
        command
    }

    fn remote_path(&self, path: &str) -> String {
        self.target.remote_path(path)
    }

    async fn run_scp(&self, mut command: Command, path: &str) -> Result<()> {
        let output = command.output().await.map_err(|e| {
            ClientError::transport(&self.label, format!("failed to spawn scp: {}", e))
        })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such file or directory") {
            return Err(ClientError::NotFound(path.to_string()));
        }
        Err(ClientError::TransferFailed {
            path: path.to_string(),
            message: stderr.trim().to_string(),
        })
    }
}

#[async_trait]
impl CommandExecutor for SshExecutor {
    fn target(&self) -> &str {
        &self.label
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        debug!("Command to be executed on {}: {}", self.label, command);

        let output = self
            .ssh_command(command)
            .output()
            .await
            .map_err(|e| {
                ClientError::transport(&self.label, format!("failed to spawn ssh: {}", e))
            })?;

        let output = ExecOutput::from_process(output);
        if output.exit_code == SSH_TRANSPORT_EXIT {
            return Err(ClientError::transport(&self.label, output.stderr.trim()));
        }

        debug!(
            "Command on {} finished: exit_code={} stdout_len={} stderr_len={}",
            self.label,
            output.exit_code,
            output.stdout.len(),
            output.stderr.len()
        );
        Ok(output)
    }
}

#[async_trait]
impl FileTransfer for SshExecutor {
    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        if !local.exists() {
            return Err(ClientError::NotFound(local.display().to_string()));
        }

        let mut command = self.scp_command();
        command.arg(local).arg(self.remote_path(remote));
        self.run_scp(command, remote).await?;

        info!("Copied {} to {}:{}", local.display(), self.label, remote);
        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut command = self.scp_command();
        command.arg(self.remote_path(remote)).arg(local);
        self.run_scp(command, remote).await?;

        info!("Copied {}:{} to {}", self.label, remote, local.display());
        Ok(())
    }
}

/// Executes commands on this machine through `sh -c`
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor {
    working_dir: Option<PathBuf>,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run commands (and resolve relative paths) inside `dir`
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn resolve(&self, path: &str) -> PathBuf {
        match &self.working_dir {
            Some(dir) => dir.join(path),
            None => PathBuf::from(path),
        }
    }
}

#[async_trait]
impl CommandExecutor for LocalExecutor {
    fn target(&self) -> &str {
        "localhost"
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        debug!("Command to be executed locally: {}", command);

        let mut process = Command::new("sh");
        process.arg("-c").arg(command);
        if let Some(dir) = &self.working_dir {
            process.current_dir(dir);
        }

        let output = process
            .output()
            .await
            .map_err(|e| {
                ClientError::transport("localhost", format!("failed to spawn sh: {}", e))
            })?;

        Ok(ExecOutput::from_process(output))
    }
}

#[async_trait]
impl FileTransfer for LocalExecutor {
    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        copy_file(local, &self.resolve(remote)).await
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        copy_file(&self.resolve(remote), local).await
    }
}

async fn copy_file(from: &Path, to: &Path) -> Result<()> {
    if !tokio::fs::try_exists(from).await? {
        return Err(ClientError::NotFound(from.display().to_string()));
    }
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(from, to).await?;
    Ok(())
}
