//! Test suite layer for the runner
//!
//! Runs preflight checks on every host, provisions the Slurm stack, then
//! runs the single-node GPU stress test on each host in turn, submitting
//! every job through the head node (the first configured host).

mod preflight;
mod provision;
mod single_node;

pub use provision::teardown;
use single_node::SingleNodeTest;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use trellis_client::{ClusterClient, CommandExecutor, FileTransfer};
use trellis_core::domain::run::RunSummary;

use crate::config::Config;
use crate::results::ResultsDir;

/// Runs the whole suite
///
/// Preflight and setup failures abort the run with an error; test case
/// failures are recorded in the returned summary. Teardown is left to the
/// caller.
pub async fn run_suite<E: CommandExecutor + FileTransfer>(
    config: &Config,
    hosts: &[ClusterClient<E>],
    results: &ResultsDir,
) -> Result<RunSummary> {
    let head = hosts.first().context("no hosts configured")?;

    let mut profiles = Vec::with_capacity(hosts.len());
    for host in hosts {
        let profile = preflight::check_host(host, config.min_rocm)
            .await
            .with_context(|| format!("Preflight failed on {}", host.target()))?;
        info!(
            "{} is node {} with {} GPU(s), ROCm {}",
            host.target(),
            profile.hostname,
            profile.gpu_count,
            profile.rocm_version
        );
        profiles.push(profile);
    }

    provision::setup(config, hosts, results)
        .await
        .context("Setup failed")?;

    match head.sinfo().await {
        Ok(sinfo) => info!("sinfo on {}:\n{}", head.target(), sinfo.trim_end()),
        Err(e) => warn!("sinfo failed on {}: {}", head.target(), e),
    }

    let test = SingleNodeTest::new(head, config, results);
    let mut summary = RunSummary::new();

    for (host, profile) in hosts.iter().zip(&profiles) {
        info!("Running {} on {}", single_node::CASE_NAME, host.target());
        let case = test.run(host, profile).await;

        if case.passed() {
            info!("{} on {}: passed", case.name, case.host);
        } else {
            error!(
                "{} on {}: {:?} ({})",
                case.name,
                case.host,
                case.status,
                case.message.as_deref().unwrap_or("no details")
            );
        }
        summary.record(case);
    }

    summary.finish();
    Ok(summary)
}
