//! Host preflight checks
//!
//! Confirms each host runs a supported ROCm release and has GPUs that
//! `rocm-smi` can see, before any job is submitted.

use anyhow::{Context, Result};
use tracing::info;
use trellis_client::{ClusterClient, CommandExecutor};
use trellis_core::domain::gpu::RocmVersion;

/// What the suite needs to know about a host to target it with sbatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostProfile {
    /// Slurm node name (`hostname -s`)
    pub hostname: String,
    /// GPUs reported by `rocm-smi`
    pub gpu_count: usize,
    pub rocm_version: RocmVersion,
}

/// Runs the preflight checks on one host
pub async fn check_host<E: CommandExecutor>(
    host: &ClusterClient<E>,
    min_rocm: RocmVersion,
) -> Result<HostProfile> {
    info!("Getting ROCm version installed on {}", host.target());
    let rocm_version = host
        .rocm_version()
        .await
        .context("ROCm version could not be determined")?;

    if rocm_version < min_rocm {
        anyhow::bail!(
            "ROCm {} on {} is older than the required {}",
            rocm_version,
            host.target(),
            min_rocm
        );
    }
    info!("ROCm version on {} is {}", host.target(), rocm_version);

    let gpus = host.list_gpus().await.context("rocm-smi failed")?;
    if gpus.is_empty() {
        anyhow::bail!("rocm-smi lists no GPUs on {}", host.target());
    }
    host.gpu_unique_ids()
        .await
        .context("rocm-smi --showuniqueid failed")?;

    let hostname = host.hostname().await.context("Failed to get the host name")?;

    Ok(HostProfile {
        hostname,
        gpu_count: gpus.len(),
        rocm_version,
    })
}
