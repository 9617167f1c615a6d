//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod host;
mod job;

pub use host::HostCommands;
pub use job::JobCommands;

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use trellis_client::{ClusterClient, CommandExecutor, FileTransfer, LocalExecutor, SshExecutor};
use trellis_core::domain::job::JobState;

use crate::config::{Config, Connection};

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Slurm job management
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Host inspection
    Host {
        #[command(subcommand)]
        command: HostCommands,
    },
}

/// Handle a CLI command
///
/// Connects to the configured host and routes the command to the
/// appropriate handler module.
///
/// # Arguments
/// * `command` - The command to execute
/// * `config` - The CLI configuration
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match &config.connection {
        Connection::Local => dispatch(command, &ClusterClient::new(LocalExecutor::new())).await,
        Connection::Ssh { target, identity } => {
            trellis_client::exec::check_ssh_available().await?;

            let mut executor = SshExecutor::new(target.clone());
            if let Some(key) = identity {
                executor = executor.with_identity(key);
            }
            dispatch(command, &ClusterClient::new(executor)).await
        }
    }
}

async fn dispatch<E: CommandExecutor + FileTransfer>(
    command: Commands,
    client: &ClusterClient<E>,
) -> Result<()> {
    match command {
        Commands::Job { command } => job::handle_job_command(command, client).await,
        Commands::Host { command } => host::handle_host_command(command, client).await,
    }
}

/// Colorize a Slurm job state for display
pub(crate) fn colorize_state(state: &JobState) -> ColoredString {
    let text = state.as_str();
    match state {
        JobState::Pending => text.yellow(),
        JobState::Running => text.cyan(),
        JobState::Completed => text.green(),
        JobState::Failed | JobState::Timeout | JobState::OutOfMemory => text.red(),
        JobState::Cancelled => text.dimmed(),
        JobState::Other(_) => text.normal(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;
    use trellis_client::{CommandExecutor, ExecOutput, FileTransfer};

    /// Host answering scripted commands; uploads are recorded as commands
    #[derive(Default)]
    pub struct FakeSlurm {
        responses: HashMap<String, ExecOutput>,
        executed: Mutex<Vec<String>>,
    }

    impl FakeSlurm {
        pub fn respond(mut self, command: &str, exit_code: i32, stdout: &str) -> Self {
            self.responses.insert(
                command.to_string(),
                ExecOutput {
                    exit_code,
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                },
            );
            self
        }

        pub fn executed(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandExecutor for FakeSlurm {
        fn target(&self) -> &str {
            "fake"
        }

        async fn exec(&self, command: &str) -> trellis_client::Result<ExecOutput> {
            self.executed.lock().unwrap().push(command.to_string());
            Ok(self.responses.get(command).cloned().unwrap_or_default())
        }
    }

    #[async_trait]
    impl FileTransfer for FakeSlurm {
        async fn upload(&self, local: &Path, remote: &str) -> trellis_client::Result<()> {
            self.executed
                .lock()
                .unwrap()
                .push(format!("upload {} {}", local.display(), remote));
            Ok(())
        }

        async fn download(&self, remote: &str, _local: &Path) -> trellis_client::Result<()> {
            Err(trellis_client::ClientError::NotFound(remote.to_string()))
        }
    }
}
