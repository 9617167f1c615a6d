//! Trellis Runner
//!
//! Validates a Slurm GPU cluster end to end by submitting a PyTorch stress
//! job to every configured node and checking how it finishes.
//!
//! Architecture:
//! - Configuration: Load settings from environment
//! - Client: ssh/scp access to each host (trellis-client)
//! - Suite: Preflight checks, Slurm setup/teardown and the single-node
//!   stress test
//! - Results: Timestamped directory with collected logs and a JSON summary
//!
//! The process exits with an error when any test case did not pass.

mod config;
mod results;
mod suite;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::results::ResultsDir;
use trellis_client::{ClusterClient, SshExecutor};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trellis_runner=info,trellis_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Trellis Runner");

    let config = load_config()?;
    info!(
        "Loaded configuration: head={}, hosts={}, min_rocm={}",
        config.hosts[0],
        config.hosts.len(),
        config.min_rocm
    );
    info!(
        "Poll interval: {:?}, attempts: {}",
        config.poll_interval, config.poll_attempts
    );

    trellis_client::exec::check_ssh_available()
        .await
        .context("ssh client not available")?;

    let hosts = connect(&config);
    let results = ResultsDir::create(&config.results_base)?;

    let summary = suite::run_suite(&config, &hosts, &results).await?;
    results.write_summary(&summary)?;

    suite::teardown(&config, &hosts, &results)
        .await
        .context("Teardown failed")?;

    if !summary.all_passed() {
        error!(
            "{} of {} test case(s) did not pass",
            summary.failed_count(),
            summary.cases.len()
        );
        anyhow::bail!("run {} failed", summary.run_id);
    }

    info!("All {} test case(s) passed", summary.cases.len());
    Ok(())
}

/// Loads and validates configuration, and checks the local payloads exist
fn load_config() -> Result<Config> {
    let config = Config::from_env()?;
    config.validate()?;

    let payloads = [config.batch_script.clone(), config.stress_script.clone()];
    for script in payloads.iter().chain(&config.provision_files()) {
        if !script.is_file() {
            anyhow::bail!("{} not found", script.display());
        }
    }

    Ok(config)
}

/// Builds one ssh client per configured host
fn connect(config: &Config) -> Vec<ClusterClient<SshExecutor>> {
    config
        .hosts
        .iter()
        .map(|target| {
            let mut executor = SshExecutor::new(target.clone());
            if let Some(key) = &config.ssh_key {
                executor = executor.with_identity(key);
            }
            ClusterClient::new(executor).with_retry_policy(config.retry_policy())
        })
        .collect()
}
