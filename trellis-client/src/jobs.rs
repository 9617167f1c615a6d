//! Slurm job operations

use tracing::info;
use trellis_core::domain::job::{
    JobQuery, JobStatusRecord, PollOutcome, SbatchRequest, parse_sbatch_job_id,
    parse_status_report,
};

use crate::ClusterClient;
use crate::error::{PollError, Result};
use crate::exec::CommandExecutor;
use crate::poller::JobCompletionPoller;

impl<E: CommandExecutor> ClusterClient<E> {
    // =============================================================================
    // Submission
    // =============================================================================

    /// Submit a batch script with `sbatch --parsable`
    ///
    /// # Returns
    /// A query for the new job
    pub async fn submit_batch(&self, request: &SbatchRequest) -> Result<JobQuery> {
        let stdout = self.run_checked(&request.command()).await?;
        let job = parse_sbatch_job_id(&stdout)?;

        info!("sbatch job {} submitted on {}", job, self.target());
        Ok(job)
    }

    // =============================================================================
    // Status
    // =============================================================================

    /// Query the current state of a job once
    ///
    /// # Returns
    /// `None` when sacct has no conclusive row for the job yet
    pub async fn job_status(&self, job: &JobQuery) -> Result<Option<JobStatusRecord>> {
        let stdout = self.run_checked(&job.status_command()).await?;
        Ok(parse_status_report(&stdout))
    }

    /// Wait for a job to reach a terminal state using the client's retry policy
    pub async fn wait_for_job(
        &self,
        job: &JobQuery,
    ) -> std::result::Result<PollOutcome, PollError> {
        JobCompletionPoller::with_policy(&self.executor, self.retry_policy)
            .poll(job)
            .await
    }

    /// Cancel a job with `scancel`
    pub async fn cancel_job(&self, job: &JobQuery) -> Result<()> {
        self.run_checked(&format!("scancel {}", job.job_id())).await?;

        info!("Job {} cancelled on {}", job, self.target());
        Ok(())
    }
}
