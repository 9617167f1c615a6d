//! Single-node PyTorch GPU stress test
//!
//! For one compute node:
//! 1. Stage the stress payload on the node and the batch script on the head
//! 2. Submit the batch script pinned to the node with all of its GPUs
//! 3. Wait for the job to reach a terminal state
//! 4. Inspect the job's output and the payload's utilization log
//! 5. Copy logs into the run directory and remove remote artifacts

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{error, info, warn};
use trellis_client::{ClusterClient, CommandExecutor, FileTransfer};
use trellis_core::domain::job::{BatchLogPaths, JobQuery, PollOutcome, SbatchRequest};
use trellis_core::domain::run::CaseResult;

use super::preflight::HostProfile;
use crate::config::Config;
use crate::results::ResultsDir;

pub const CASE_NAME: &str = "single_node_pytorch";

/// Written by the stress payload into the work directory
pub const UTILIZATION_LOG: &str = "gpu_max_utilization.log";

/// Lines of job stdout echoed into the harness log
const OUTPUT_PREVIEW_LINES: usize = 20;

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .with_context(|| format!("{} has no file name", path.display()))
}

/// Runs the stress test against compute nodes, submitting through `head`
pub struct SingleNodeTest<'a, E> {
    head: &'a ClusterClient<E>,
    config: &'a Config,
    results: &'a ResultsDir,
}

impl<'a, E: CommandExecutor + FileTransfer> SingleNodeTest<'a, E> {
    pub fn new(head: &'a ClusterClient<E>, config: &'a Config, results: &'a ResultsDir) -> Self {
        Self {
            head,
            config,
            results,
        }
    }

    fn utilization_log(&self) -> String {
        format!("{}/{}", self.config.work_dir.trim_end_matches('/'), UTILIZATION_LOG)
    }

    /// Runs the test on `host`
    ///
    /// Never fails: problems are reported through the returned case.
    pub async fn run(&self, host: &ClusterClient<E>, profile: &HostProfile) -> CaseResult {
        let mut case = CaseResult::new(CASE_NAME, host.target());

        let batch_script = match file_name(&self.config.batch_script) {
            Ok(name) => name,
            Err(e) => return case.errored(format!("{:#}", e)),
        };

        let job = match self.launch(host, profile, &batch_script).await {
            Ok(job) => job,
            Err(e) => {
                error!("Could not launch {} on {}: {:#}", CASE_NAME, host.target(), e);
                self.remove_staged(host, &batch_script).await;
                return case.errored(format!("{:#}", e));
            }
        };

        case.job_id = Some(job.job_id().to_string());

        let logs = BatchLogPaths::for_job(&job);
        let utilization_log = self.utilization_log();

        case = match self.head.wait_for_job(&job).await {
            Ok(outcome) => {
                info!("Job state of {}: {}", job, outcome.final_state);
                info!("sacct output: {}", outcome.raw_report.trim());
                case.final_state = Some(outcome.final_state.clone());
                self.keep_report(&outcome, &mut case);
                self.validate(host, &outcome, &logs, &utilization_log, case)
                    .await
            }
            Err(e) => {
                error!("{}", e);
                // Stop the job before its files are removed
                if let Err(cancel) = self.head.cancel_job(&job).await {
                    warn!("Could not cancel job {}: {}", job, cancel);
                }
                case.errored(e.to_string())
            }
        };

        let collected = self
            .collect(
                host,
                &[
                    logs.stdout.as_str(),
                    logs.stderr.as_str(),
                    utilization_log.as_str(),
                ],
            )
            .await;
        case.artifacts.extend(collected);

        self.cleanup(host, &logs).await;
        self.remove_staged(host, &batch_script).await;
        case
    }

    /// Stages both scripts and submits the job
    async fn launch(
        &self,
        host: &ClusterClient<E>,
        profile: &HostProfile,
        batch_script: &str,
    ) -> Result<JobQuery> {
        let work_dir = &self.config.work_dir;
        let stress_remote = format!(
            "{}/{}",
            work_dir.trim_end_matches('/'),
            file_name(&self.config.stress_script)?
        );

        host.make_dir(work_dir)
            .await
            .with_context(|| format!("Error creating {}", work_dir))?;
        host.stage_executable(&self.config.stress_script, &stress_remote)
            .await
            .with_context(|| format!("Could not create {}", stress_remote))?;
        self.head
            .stage_executable(&self.config.batch_script, batch_script)
            .await
            .with_context(|| format!("Could not create {}", batch_script))?;

        let request = SbatchRequest {
            script: batch_script.to_string(),
            nodelist: profile.hostname.clone(),
            gpus: profile.gpu_count,
        };
        let job = self
            .head
            .submit_batch(&request)
            .await
            .context("sbatch command could not be launched")?;

        Ok(job)
    }

    /// Keeps the raw sacct report next to the job logs
    fn keep_report(&self, outcome: &PollOutcome, case: &mut CaseResult) {
        let name = format!("sacct-{}.log", outcome.job_id);
        match self.results.write_text(&name, &outcome.raw_report) {
            Ok(_) => case.artifacts.push(name),
            Err(e) => warn!("Could not keep sacct report: {:#}", e),
        }
    }

    async fn validate(
        &self,
        host: &ClusterClient<E>,
        outcome: &PollOutcome,
        logs: &BatchLogPaths,
        utilization_log: &str,
        case: CaseResult,
    ) -> CaseResult {
        if !outcome.final_state.is_success() {
            match host.read_file(&logs.stderr).await {
                Ok(stderr) => error!("ERROR file {}:\n{}", logs.stderr, stderr),
                Err(e) => warn!("Could not print the batch error file {}: {}", logs.stderr, e),
            }
            return case.failed(format!(
                "job {} ended in {}",
                outcome.job_id, outcome.final_state
            ));
        }

        match host.head(&logs.stdout, OUTPUT_PREVIEW_LINES).await {
            Ok(preview) => info!("Output file {}:\n{}", logs.stdout, preview),
            Err(e) => warn!("Could not print the batch output file {}: {}", logs.stdout, e),
        }

        info!("Checking {} ...", utilization_log);
        match host.read_file(utilization_log).await {
            Ok(content) => {
                info!("GPU utilization on {}:\n{}", host.target(), content.trim_end());
                case
            }
            Err(e) => case.failed(format!("Error retrieving {}: {}", utilization_log, e)),
        }
    }

    /// Copies remote files into the run directory, returning what arrived
    async fn collect(&self, host: &ClusterClient<E>, remote_paths: &[&str]) -> Vec<String> {
        info!(
            "Copying results from {} to {}",
            host.target(),
            self.results.root().display()
        );

        let mut collected = Vec::new();
        for remote in remote_paths {
            let local = self.results.path_for(remote);
            match host.download(remote, &local).await {
                Ok(()) => collected.push(local.file_name().map_or_else(
                    || remote.to_string(),
                    |n| n.to_string_lossy().to_string(),
                )),
                Err(e) if e.is_not_found() => warn!("{} not found on {}", remote, host.target()),
                Err(e) => warn!("Error copying {} from {}: {}", remote, host.target(), e),
            }
        }
        collected
    }

    async fn cleanup(&self, host: &ClusterClient<E>, logs: &BatchLogPaths) {
        if let Err(e) = host.remove(&[logs.stdout.as_str(), logs.stderr.as_str()]).await {
            warn!("Error deleting job logs on {}: {}", host.target(), e);
        }
    }

    /// Removes the work directory on `host` and the batch script on the head
    async fn remove_staged(&self, host: &ClusterClient<E>, batch_script: &str) {
        if let Err(e) = host.remove(&[self.config.work_dir.as_str()]).await {
            warn!("Error deleting {} on {}: {}", self.config.work_dir, host.target(), e);
        }
        if let Err(e) = self.head.remove(&[batch_script]).await {
            warn!("Error deleting {} on {}: {}", batch_script, self.head.target(), e);
        }
    }
}
