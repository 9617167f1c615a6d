//! Trellis Cluster Client
//!
//! A typed interface over one cluster host, built on a pluggable command
//! execution capability.
//!
//! This crate provides a unified interface for both the runner and the CLI
//! to query Slurm, inspect GPUs and move files, so that both read tool
//! output the same way.
//!
//! # Example
//!
//! ```no_run
//! use trellis_client::{ClusterClient, SshExecutor};
//! use trellis_core::domain::job::SbatchRequest;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let head = ClusterClient::new(SshExecutor::new("amd@gpu-head".parse()?));
//!
//!     let job = head.submit_batch(&SbatchRequest {
//!         script: "pytorch_gpu_util_sbatch.sh".to_string(),
//!         nodelist: "gpu-node-1".to_string(),
//!         gpus: 8,
//!     }).await?;
//!
//!     let outcome = head.wait_for_job(&job).await?;
//!     println!("job {} finished: {}", outcome.job_id, outcome.final_state);
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod exec;
mod files;
mod hosts;
mod jobs;
pub mod poller;

// Re-export commonly used types
pub use error::{ClientError, PollError, Result};
pub use exec::{CommandExecutor, ExecOutput, FileTransfer, LocalExecutor, SshExecutor};
pub use poller::{JobCompletionPoller, RetryPolicy};

use tracing::debug;

/// Client for a single cluster host
///
/// Operations are grouped by concern:
/// - Job submission and status (`sbatch`, `sacct`)
/// - Host inspection (hostname, OS, ROCm, GPUs)
/// - File staging and cleanup
#[derive(Debug, Clone)]
pub struct ClusterClient<E> {
    executor: E,
    retry_policy: RetryPolicy,
}

impl<E: CommandExecutor> ClusterClient<E> {
    /// Create a client with the default job polling policy
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Use a different policy when waiting for jobs
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// The underlying execution capability
    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Name of the host this client talks to
    pub fn target(&self) -> &str {
        self.executor.target()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    /// Run a command and return its captured output, whatever the exit code
    pub async fn run(&self, command: &str) -> Result<ExecOutput> {
        self.executor.exec(command).await
    }

    /// Run a command that must succeed and return its stdout
    pub async fn run_checked(&self, command: &str) -> Result<String> {
        let output = self.executor.exec(command).await?;

        if !output.success() {
            debug!(
                "Command failed on {}: {} (exit {}): {}",
                self.target(),
                command,
                output.exit_code,
                output.stderr.trim()
            );
            return Err(ClientError::command_failed(
                command,
                output.exit_code,
                &output.stderr,
            ));
        }

        Ok(output.stdout)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeHost;
    use super::*;

    #[tokio::test]
    async fn test_run_checked_returns_stdout() {
        let client = ClusterClient::new(FakeHost::default().respond("whoami", 0, "amd\n", ""));
        assert_eq!(client.run_checked("whoami").await.unwrap(), "amd\n");
    }

    #[tokio::test]
    async fn test_run_checked_rejects_failure() {
        let client = ClusterClient::new(FakeHost::default().respond(
            "sinfo",
            1,
            "",
            "slurm_load_partitions: Unable to contact slurm controller\n",
        ));

        let err = client.run_checked("sinfo").await.unwrap_err();
        match err {
            ClientError::CommandFailed {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 1);
                assert!(stderr.contains("Unable to contact"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_passes_non_zero_through() {
        let client = ClusterClient::new(FakeHost::default());
        let output = client.run("missing-tool").await.unwrap();
        assert_eq!(output.exit_code, 127);
    }

    #[test]
    fn test_default_retry_policy() {
        let client = ClusterClient::new(LocalExecutor::new());
        assert_eq!(client.retry_policy(), RetryPolicy::default());
        assert_eq!(client.target(), "localhost");
    }
}
