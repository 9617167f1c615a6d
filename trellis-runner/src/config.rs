//! Runner configuration
//!
//! Defines the hosts under test, where local payloads and results live,
//! and how patiently the runner waits for batch jobs.

use std::path::PathBuf;
use std::time::Duration;
use trellis_client::RetryPolicy;
use trellis_core::domain::gpu::RocmVersion;
use trellis_core::domain::host::HostTarget;

pub const INSTALL_SLURM: &str = "install_slurm.sh";
pub const UNINSTALL_SLURM: &str = "uninstall_slurm.sh";
pub const INSTALL_ENROOT: &str = "install_enroot.sh";
pub const INSTALL_PYXIS: &str = "install_pyxis.sh";
pub const SLURMDB_CONFIG: &str = "slurmdb_config.sh";
pub const SLURM_CONF: &str = "slurm.conf";
pub const SLURMDBD_CONF: &str = "slurmdbd.conf";

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Runner configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Hosts under test; the first one is the Slurm head node
    pub hosts: Vec<HostTarget>,

    /// Private key used for ssh and scp
    pub ssh_key: Option<PathBuf>,

    /// Directory receiving one timestamped sub-directory per run
    pub results_base: PathBuf,

    /// Pause between two job status queries
    pub poll_interval: Duration,

    /// Status queries issued before giving up on a job
    pub poll_attempts: u32,

    /// Local sbatch script submitted on the head node
    pub batch_script: PathBuf,

    /// Local GPU stress payload copied to each compute node
    pub stress_script: PathBuf,

    /// Remote directory holding the stress payload and its utilization log
    pub work_dir: String,

    /// Oldest ROCm release the harness accepts
    pub min_rocm: RocmVersion,

    /// Leave the installed Slurm stack alone before the run
    pub skip_install: bool,

    /// Leave the Slurm stack installed after the run
    pub skip_uninstall: bool,

    /// Local directory holding the install scripts and config templates
    pub config_dir: PathBuf,

    /// Passed to `install_slurm.sh`
    pub slurm_version: Option<String>,

    /// Passed to `install_enroot.sh`
    pub enroot_version: Option<String>,

    /// How long to wait for an install or uninstall script to exit
    pub script_wait: RetryPolicy,
}

impl Config {
    /// Creates a configuration for `hosts` with defaults for everything else
    pub fn new(hosts: Vec<HostTarget>) -> Self {
        Self {
            hosts,
            ssh_key: None,
            results_base: PathBuf::from("results"),
            poll_interval: Duration::from_secs(20),
            poll_attempts: 60,
            batch_script: PathBuf::from("batch_scripts/pytorch_gpu_util_sbatch.sh"),
            stress_script: PathBuf::from("helper_scripts/gpu_stress_10s.py"),
            work_dir: "/tmp/test_pytorch".to_string(),
            min_rocm: RocmVersion::new(6, 4),
            skip_install: false,
            skip_uninstall: false,
            config_dir: PathBuf::from("config"),
            slurm_version: None,
            enroot_version: None,
            script_wait: RetryPolicy::new(Duration::from_secs(15), 150),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - TRELLIS_HOSTS (required, comma-separated `[user@]host[:port]`)
    /// - TRELLIS_USER (optional, user for hosts that do not name one)
    /// - TRELLIS_SSH_KEY (optional, default: ~/.ssh/id_rsa when present)
    /// - TRELLIS_RESULTS_DIR (optional, default: results)
    /// - TRELLIS_POLL_INTERVAL (optional, seconds, default: 20)
    /// - TRELLIS_POLL_ATTEMPTS (optional, default: 60)
    /// - TRELLIS_BATCH_SCRIPT (optional)
    /// - TRELLIS_STRESS_SCRIPT (optional)
    /// - TRELLIS_WORK_DIR (optional, default: /tmp/test_pytorch)
    /// - TRELLIS_MIN_ROCM (optional, default: 6.4)
    /// - TRELLIS_SKIP_INSTALL (optional, 1/true/yes)
    /// - TRELLIS_SKIP_UNINSTALL (optional, 1/true/yes)
    /// - TRELLIS_CONFIG_DIR (optional, default: config)
    /// - TRELLIS_SLURM_VERSION (optional)
    /// - TRELLIS_ENROOT_VERSION (optional)
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::from_lookup(|key| std::env::var(key).ok())?;

        if config.ssh_key.is_none() {
            let default_key = std::env::var("HOME")
                .map(|home| PathBuf::from(home).join(".ssh").join("id_rsa"))
                .ok()
                .filter(|path| path.exists());
            config.ssh_key = default_key;
        }

        Ok(config)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let hosts_var = lookup("TRELLIS_HOSTS")
            .ok_or_else(|| anyhow::anyhow!("TRELLIS_HOSTS environment variable not set"))?;
        let default_user = lookup("TRELLIS_USER");

        let hosts = hosts_var
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                entry
                    .parse::<HostTarget>()
                    .map(|target| target.with_default_user(default_user.as_deref()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut config = Self::new(hosts);

        config.ssh_key = lookup("TRELLIS_SSH_KEY").map(PathBuf::from);

        if let Some(dir) = lookup("TRELLIS_RESULTS_DIR") {
            config.results_base = PathBuf::from(dir);
        }

        if let Some(secs) = lookup("TRELLIS_POLL_INTERVAL").and_then(|s| s.parse::<u64>().ok()) {
            config.poll_interval = Duration::from_secs(secs);
        }

        if let Some(attempts) = lookup("TRELLIS_POLL_ATTEMPTS").and_then(|s| s.parse::<u32>().ok())
        {
            config.poll_attempts = attempts;
        }

        if let Some(path) = lookup("TRELLIS_BATCH_SCRIPT") {
            config.batch_script = PathBuf::from(path);
        }

        if let Some(path) = lookup("TRELLIS_STRESS_SCRIPT") {
            config.stress_script = PathBuf::from(path);
        }

        if let Some(dir) = lookup("TRELLIS_WORK_DIR") {
            config.work_dir = dir;
        }

        if let Some(version) = lookup("TRELLIS_MIN_ROCM") {
            config.min_rocm = version.parse()?;
        }

        config.skip_install = lookup("TRELLIS_SKIP_INSTALL").is_some_and(|v| is_truthy(&v));
        config.skip_uninstall = lookup("TRELLIS_SKIP_UNINSTALL").is_some_and(|v| is_truthy(&v));

        if let Some(dir) = lookup("TRELLIS_CONFIG_DIR") {
            config.config_dir = PathBuf::from(dir);
        }

        config.slurm_version = lookup("TRELLIS_SLURM_VERSION").filter(|v| !v.trim().is_empty());
        config.enroot_version = lookup("TRELLIS_ENROOT_VERSION").filter(|v| !v.trim().is_empty());

        Ok(config)
    }

    /// Local files the setup and teardown phases need, in the order they use them
    pub fn provision_files(&self) -> Vec<PathBuf> {
        let mut names = Vec::new();
        if !self.skip_install || !self.skip_uninstall {
            names.push(UNINSTALL_SLURM);
        }
        if !self.skip_install {
            names.extend([
                SLURM_CONF,
                INSTALL_SLURM,
                INSTALL_ENROOT,
                SLURMDBD_CONF,
                SLURMDB_CONFIG,
                INSTALL_PYXIS,
            ]);
        }
        names.iter().map(|name| self.config_dir.join(name)).collect()
    }

    /// Job polling policy derived from the interval and attempt settings
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.poll_interval, self.poll_attempts)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.hosts.is_empty() {
            anyhow::bail!("at least one host is required");
        }

        if self.poll_attempts == 0 {
            anyhow::bail!("poll_attempts must be greater than 0");
        }

        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if !self.work_dir.starts_with('/') || self.work_dir == "/" {
            anyhow::bail!("work_dir must be an absolute path below /");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("TRELLIS_HOSTS", "head,node-b")])).unwrap();

        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.poll_interval, Duration::from_secs(20));
        assert_eq!(config.poll_attempts, 60);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.work_dir, "/tmp/test_pytorch");
        assert_eq!(config.min_rocm, RocmVersion::new(6, 4));
        assert!(!config.skip_install);
        assert!(!config.skip_uninstall);
        assert_eq!(
            config.script_wait,
            RetryPolicy::new(Duration::from_secs(15), 150)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_provisioning_settings() {
        let config = Config::from_lookup(lookup(&[
            ("TRELLIS_HOSTS", "head"),
            ("TRELLIS_SKIP_INSTALL", "true"),
            ("TRELLIS_SKIP_UNINSTALL", "0"),
            ("TRELLIS_CONFIG_DIR", "/opt/trellis/config"),
            ("TRELLIS_SLURM_VERSION", "25.05.1"),
            ("TRELLIS_ENROOT_VERSION", " "),
        ]))
        .unwrap();

        assert!(config.skip_install);
        assert!(!config.skip_uninstall);
        assert_eq!(config.slurm_version.as_deref(), Some("25.05.1"));
        assert_eq!(config.enroot_version, None);

        // Teardown still needs the uninstall script
        assert_eq!(
            config.provision_files(),
            vec![PathBuf::from("/opt/trellis/config/uninstall_slurm.sh")]
        );
    }

    #[test]
    fn test_provision_files() {
        let mut config = Config::new(vec![HostTarget::new("head")]);
        assert_eq!(config.provision_files().len(), 7);
        assert!(config.provision_files().contains(&PathBuf::from("config/slurm.conf")));

        config.skip_install = true;
        config.skip_uninstall = true;
        assert!(config.provision_files().is_empty());
    }

    #[test]
    fn test_hosts_required() {
        assert!(Config::from_lookup(lookup(&[])).is_err());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("TRELLIS_HOSTS", " root@head:2222 , node-b ,"),
            ("TRELLIS_USER", "amd"),
            ("TRELLIS_SSH_KEY", "/keys/cluster"),
            ("TRELLIS_POLL_INTERVAL", "5"),
            ("TRELLIS_POLL_ATTEMPTS", "12"),
            ("TRELLIS_MIN_ROCM", "6.2"),
        ]))
        .unwrap();

        assert_eq!(config.hosts[0].to_string(), "root@head:2222");
        assert_eq!(config.hosts[1].to_string(), "amd@node-b");
        assert_eq!(config.ssh_key, Some(PathBuf::from("/keys/cluster")));
        assert_eq!(
            config.retry_policy(),
            RetryPolicy::new(Duration::from_secs(5), 12)
        );
        assert_eq!(config.min_rocm, RocmVersion::new(6, 2));
    }

    #[test]
    fn test_invalid_host_entry() {
        assert!(Config::from_lookup(lookup(&[("TRELLIS_HOSTS", "node:port")])).is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::new(vec![HostTarget::new("head")]);
        assert!(config.validate().is_ok());

        config.poll_attempts = 0;
        assert!(config.validate().is_err());
        config.poll_attempts = 60;

        config.work_dir = "relative/dir".to_string();
        assert!(config.validate().is_err());
        config.work_dir = "/".to_string();
        assert!(config.validate().is_err());

        config.work_dir = "/tmp/x".to_string();
        config.hosts.clear();
        assert!(config.validate().is_err());
    }
}
