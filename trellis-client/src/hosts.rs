//! Host inspection

use tracing::{debug, info};
use trellis_core::ParseError;
use trellis_core::domain::gpu::{
    GpuInfo, RocmVersion, parse_rocm_smi, parse_rocm_version, verify_gpu_count,
};
use trellis_core::domain::host::{HostType, parse_ssh_connection};
use trellis_core::shell::quote;

use crate::ClusterClient;
use crate::error::Result;
use crate::exec::CommandExecutor;

impl<E: CommandExecutor> ClusterClient<E> {
    /// Short hostname, as Slurm knows the node
    pub async fn hostname(&self) -> Result<String> {
        let stdout = self.run_checked("hostname -s").await?;
        Ok(stdout.trim().to_string())
    }

    /// Name of the login user
    pub async fn whoami(&self) -> Result<String> {
        let stdout = self.run_checked("whoami").await?;
        Ok(stdout.trim().to_string())
    }

    /// Operating system family, from `/etc/os-release`
    pub async fn host_type(&self) -> Result<HostType> {
        let stdout = self.run_checked("cat /etc/os-release").await?;
        let host_type =
            HostType::from_os_release(&stdout).ok_or(ParseError::OsReleaseIncomplete)?;

        info!("Host OS of {} is {}", self.target(), host_type);
        Ok(host_type)
    }

    /// Active ROCm release, from the `rocm` alternative
    pub async fn rocm_version(&self) -> Result<RocmVersion> {
        let stdout = self
            .run_checked("sudo update-alternatives --display rocm")
            .await?;
        Ok(parse_rocm_version(&stdout)?)
    }

    /// Raw `rocm-smi` report
    pub async fn gpu_report(&self) -> Result<String> {
        let stdout = self.run_checked("sudo rocm-smi").await?;
        debug!("rocm-smi on {}:\n{}", self.target(), stdout);
        Ok(stdout)
    }

    /// GPUs listed by `rocm-smi`
    pub async fn list_gpus(&self) -> Result<Vec<GpuInfo>> {
        let gpus = parse_rocm_smi(&self.gpu_report().await?);
        info!("Total number of AMD GPUs on {}: {}", self.target(), gpus.len());
        Ok(gpus)
    }

    /// Whether `rocm-smi` lists exactly `expected` GPUs
    pub async fn has_gpu_count(&self, expected: usize) -> Result<bool> {
        Ok(verify_gpu_count(&self.gpu_report().await?, expected))
    }

    /// Unique ids of the GPUs, as `rocm-smi --showuniqueid` prints them
    pub async fn gpu_unique_ids(&self) -> Result<String> {
        let stdout = self.run_checked("sudo rocm-smi --showuniqueid").await?;
        debug!("GPU unique ids on {}:\n{}", self.target(), stdout);
        Ok(stdout)
    }

    /// Address this session reached the host on
    pub async fn connection_address(&self) -> Result<String> {
        let stdout = self.run_checked("echo \"$SSH_CONNECTION\"").await?;
        Ok(parse_ssh_connection(&stdout)?)
    }

    /// Adds `user` to supplementary `groups`
    pub async fn add_to_groups(&self, user: &str, groups: &[&str]) -> Result<()> {
        self.run_checked(&format!(
            "sudo usermod -aG {} {}",
            groups.join(","),
            quote(user)
        ))
        .await?;
        info!("Added {} to {} on {}", user, groups.join("/"), self.target());
        Ok(())
    }

    /// Restarts a systemd unit and returns its output
    pub async fn restart_service(&self, unit: &str) -> Result<String> {
        self.run_checked(&format!("sudo systemctl restart {}", quote(unit)))
            .await
    }

    /// Partition and node summary from `sinfo`
    pub async fn sinfo(&self) -> Result<String> {
        self.run_checked("sinfo").await
    }
}
