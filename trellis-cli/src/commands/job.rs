//! Job command handlers
//!
//! Handles Slurm job commands: submitting a batch script, querying a job
//! once, and waiting for a job to finish.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use std::path::PathBuf;
use std::time::Duration;
use trellis_client::{
    ClusterClient, CommandExecutor, FileTransfer, JobCompletionPoller, RetryPolicy,
};
use trellis_core::domain::job::{JobQuery, PollOutcome, SbatchRequest};

use super::colorize_state;

/// Job subcommands
#[derive(Subcommand)]
pub enum JobCommands {
    /// Submit a batch script pinned to one node
    Submit {
        /// Batch script path on the host
        script: String,

        /// Node the job must run on
        #[arg(long)]
        node: String,

        /// GPUs to request
        #[arg(long, default_value_t = 1)]
        gpus: usize,

        /// Copy this local file to SCRIPT before submitting
        #[arg(long)]
        stage: Option<PathBuf>,

        /// Wait for the job to finish
        #[arg(long)]
        wait: bool,
    },
    /// Show the current state of a job
    Status {
        /// Slurm job ID
        id: String,
    },
    /// Wait for a job to reach a terminal state
    Poll {
        /// Slurm job ID
        id: String,

        /// Seconds between two queries
        #[arg(
            long,
            default_value_t = 20,
            value_parser = clap::value_parser!(u64).range(1..)
        )]
        interval: u64,

        /// Queries before giving up
        #[arg(
            long,
            default_value_t = 60,
            value_parser = clap::value_parser!(u32).range(1..)
        )]
        attempts: u32,
    },
}

/// Handle job commands
///
/// # Arguments
/// * `command` - The job command to execute
/// * `client` - Client for the submitting host
pub async fn handle_job_command<E: CommandExecutor + FileTransfer>(
    command: JobCommands,
    client: &ClusterClient<E>,
) -> Result<()> {
    match command {
        JobCommands::Submit {
            script,
            node,
            gpus,
            stage,
            wait,
        } => {
            let request = SbatchRequest {
                script,
                nodelist: node,
                gpus,
            };
            submit(client, &request, stage, wait).await
        }
        JobCommands::Status { id } => status(client, &JobQuery::new(id)?).await,
        JobCommands::Poll {
            id,
            interval,
            attempts,
        } => {
            let policy = RetryPolicy::new(Duration::from_secs(interval), attempts);
            poll(client, &JobQuery::new(id)?, policy).await
        }
    }
}

/// Submit a batch script, optionally staging it first
async fn submit<E: CommandExecutor + FileTransfer>(
    client: &ClusterClient<E>,
    request: &SbatchRequest,
    stage: Option<PathBuf>,
    wait: bool,
) -> Result<()> {
    if let Some(local) = stage {
        client
            .stage_executable(&local, &request.script)
            .await
            .with_context(|| format!("Could not stage {}", local.display()))?;
    }

    let job = client.submit_batch(request).await?;
    println!(
        "{} Submitted job {} to {}",
        "✓".green(),
        job.job_id().cyan(),
        request.nodelist.bold()
    );

    if wait {
        poll(client, &job, client.retry_policy()).await?;
    }

    Ok(())
}

/// Query a job once
async fn status<E: CommandExecutor>(client: &ClusterClient<E>, job: &JobQuery) -> Result<()> {
    match client.job_status(job).await? {
        Some(record) => {
            println!("{}", "Job Status:".bold());
            println!("  ID:       {}", record.job_id.cyan());
            println!("  State:    {}", colorize_state(&record.state));
            println!(
                "  Terminal: {}",
                if record.state.is_terminal() {
                    "yes".normal()
                } else {
                    "no".dimmed()
                }
            );
        }
        None => println!(
            "{}",
            format!("No accounting record for job {} yet.", job).yellow()
        ),
    }

    Ok(())
}

/// Wait for a job and report how it ended
async fn poll<E: CommandExecutor>(
    client: &ClusterClient<E>,
    job: &JobQuery,
    policy: RetryPolicy,
) -> Result<()> {
    println!(
        "{}",
        format!(
            "Waiting for job {} (every {:?}, up to {} queries)...",
            job, policy.delay, policy.max_attempts
        )
        .dimmed()
    );

    let outcome = JobCompletionPoller::with_policy(client.executor(), policy)
        .poll(job)
        .await?;
    print_outcome(&outcome);

    if !outcome.final_state.is_success() {
        anyhow::bail!("job {} ended in {}", outcome.job_id, outcome.final_state);
    }
    Ok(())
}

fn print_outcome(outcome: &PollOutcome) {
    let mark = if outcome.final_state.is_success() {
        "✓".green()
    } else {
        "✗".red()
    };

    println!(
        "{} Job {} finished: {}",
        mark,
        outcome.job_id.cyan(),
        colorize_state(&outcome.final_state)
    );
    println!("  Queries: {}", outcome.attempts);
    println!("{}", "─".repeat(80).dimmed());
    println!("{}", outcome.raw_report.trim_end());
    println!("{}", "─".repeat(80).dimmed());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::FakeSlurm;

    const STATUS: &str = "sacct -j 42 --format=JobID,State --noheader";

    #[tokio::test]
    async fn test_malformed_job_id_never_reaches_the_host() {
        let client = ClusterClient::new(FakeSlurm::default());

        for command in [
            JobCommands::Status {
                id: "42; touch /tmp/owned; echo".to_string(),
            },
            JobCommands::Poll {
                id: "$(id)".to_string(),
                interval: 1,
                attempts: 1,
            },
        ] {
            let err = handle_job_command(command, &client).await.unwrap_err();
            assert!(err.to_string().contains("invalid job id"));
        }
        assert!(client.executor().executed().is_empty());
    }

    #[tokio::test]
    async fn test_submit_stages_then_submits() {
        let client = ClusterClient::new(
            FakeSlurm::default().respond(
                "sbatch --parsable --nodelist=node-a --gres=gpu:8 run.sh",
                0,
                "42\n",
            ),
        );
        let request = SbatchRequest {
            script: "run.sh".to_string(),
            nodelist: "node-a".to_string(),
            gpus: 8,
        };

        submit(&client, &request, Some(PathBuf::from("local/run.sh")), false)
            .await
            .unwrap();

        assert_eq!(
            client.executor().executed(),
            vec![
                "upload local/run.sh run.sh",
                "chmod +x run.sh",
                "sbatch --parsable --nodelist=node-a --gres=gpu:8 run.sh",
            ]
        );
    }

    #[tokio::test]
    async fn test_status_without_record() {
        let client = ClusterClient::new(FakeSlurm::default().respond(STATUS, 0, ""));
        assert!(status(&client, &JobQuery::new("42").unwrap()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_reports_failed_job() {
        let client = ClusterClient::new(FakeSlurm::default().respond(STATUS, 0, "42 FAILED\n"));
        let policy = RetryPolicy::new(Duration::from_secs(1), 3);

        let err = poll(&client, &JobQuery::new("42").unwrap(), policy)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "job 42 ended in FAILED");
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_timeout_is_an_error() {
        let client = ClusterClient::new(FakeSlurm::default().respond(STATUS, 0, "42 PENDING\n"));
        let policy = RetryPolicy::new(Duration::from_secs(1), 3);

        let err = poll(&client, &JobQuery::new("42").unwrap(), policy)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("after 3 attempt(s)"));
        assert_eq!(client.executor().executed().len(), 3);
    }
}
