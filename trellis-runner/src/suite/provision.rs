//! Cluster setup and teardown
//!
//! Setup replaces whatever Slurm stack the hosts carry with a fresh one:
//! 1. Uninstall Slurm on every host
//! 2. Stage `slurm.conf`, `gres.conf` and `cgroup.conf`, grant GPU access,
//!    install Slurm and enroot
//! 3. Make every host resolvable from every other one
//! 4. Share one munge key from the head node
//! 5. Bring up accounting on the head node, then install Pyxis
//!
//! Teardown removes Slurm and enroot again. The install scripts are opaque
//! payloads: they are copied over, started in the background and waited
//! for until no process runs them anymore.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, info, warn};
use trellis_client::{ClusterClient, CommandExecutor, FileTransfer};
use trellis_core::domain::host::HostType;
use trellis_core::domain::slurm::{
    CGROUP_CONF, GRES_CONF, HostsEntry, node_definition_command, parse_node_definition,
    render_slurm_conf,
};
use trellis_core::shell::quote;

use crate::config::{
    Config, INSTALL_ENROOT, INSTALL_PYXIS, INSTALL_SLURM, SLURM_CONF, SLURMDB_CONFIG,
    SLURMDBD_CONF, UNINSTALL_SLURM,
};
use crate::results::ResultsDir;

const SLURM_ETC: &str = "/etc/slurm";

const MUNGE_KEY_PATH: &str = "/etc/munge/munge.key";

/// Name of the key copy in the login directory of the other hosts
const MUNGE_KEY: &str = "munge.key";

/// Groups owning the GPU device nodes
const GPU_GROUPS: &[&str] = &["render", "video"];

/// Run on the head node; leaves the key readable for the copy
const CREATE_MUNGE_KEY: &[&str] = &[
    "sudo rm -f /etc/munge/munge.key",
    "sudo -u munge /usr/sbin/mungekey --verbose",
    "sudo chmod 777 -R /etc/munge",
    "sudo chown -R munge: /etc/munge/munge.key",
];

const CONFIGURE_HEAD_NODE: &[&str] = &[
    "sudo chmod 700 -R /etc/munge",
    "sudo chown -R munge: /etc/munge/munge.key",
    "sudo systemctl enable munge",
    "sudo systemctl restart munge",
    "sudo systemctl restart slurmctld",
    "sudo systemctl restart slurmd",
];

const CONFIGURE_COMPUTE_NODE: &[&str] = &[
    "sudo cp munge.key /etc/munge/munge.key",
    "sudo chmod 700 /etc/munge/munge.key",
    "sudo chown -R munge: /etc/munge/munge.key",
    "sudo systemctl enable munge",
    "sudo systemctl restart munge",
    "sudo systemctl restart slurmd",
];

const PURGE_ENROOT: &str = "yes Y | sudo DEBIAN_FRONTEND=noninteractive apt purge enroot";

/// Installs and configures the Slurm stack unless `skip_install` is set
pub async fn setup<E: CommandExecutor + FileTransfer>(
    config: &Config,
    hosts: &[ClusterClient<E>],
    results: &ResultsDir,
) -> Result<()> {
    if config.skip_install {
        info!("Setup installation skipped");
        return Ok(());
    }
    Provisioner::new(config, hosts, results)?.setup().await
}

/// Removes Slurm and enroot unless `skip_uninstall` is set
pub async fn teardown<E: CommandExecutor + FileTransfer>(
    config: &Config,
    hosts: &[ClusterClient<E>],
    results: &ResultsDir,
) -> Result<()> {
    if config.skip_uninstall {
        info!("Setup uninstallation skipped, nothing to tear down");
        return Ok(());
    }
    Provisioner::new(config, hosts, results)?.teardown().await
}

/// Log file an install script writes on `target`
fn script_log_name(script: &str, target: &str) -> String {
    let stem = script.strip_suffix(".sh").unwrap_or(script);
    let host: String = target
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}_{}.log", stem, host)
}

struct Provisioner<'a, E> {
    config: &'a Config,
    hosts: &'a [ClusterClient<E>],
    head: &'a ClusterClient<E>,
    results: &'a ResultsDir,
}

impl<'a, E: CommandExecutor + FileTransfer> Provisioner<'a, E> {
    fn new(
        config: &'a Config,
        hosts: &'a [ClusterClient<E>],
        results: &'a ResultsDir,
    ) -> Result<Self> {
        let head = hosts.first().context("no hosts configured")?;
        Ok(Self {
            config,
            hosts,
            head,
            results,
        })
    }

    async fn setup(&self) -> Result<()> {
        for host in self.hosts {
            info!("Uninstalling slurm on {}", host.target());
            self.run_script(host, UNINSTALL_SLURM, None).await?;
        }

        let head_node = self
            .head
            .hostname()
            .await
            .context("Failed to get the host name of the head node")?;

        let mut node_definitions = Vec::with_capacity(self.hosts.len());
        for host in self.hosts {
            let output = host
                .run_checked(&node_definition_command())
                .await
                .with_context(|| format!("Failed to describe node {}", host.target()))?;
            node_definitions.push(parse_node_definition(&output)?);
        }
        debug!("Node definitions: {:?}", node_definitions);

        let template_path = self.config.config_dir.join(SLURM_CONF);
        let template = std::fs::read_to_string(&template_path)
            .with_context(|| format!("Failed to read {}", template_path.display()))?;
        let slurm_conf = render_slurm_conf(&template, &head_node, &node_definitions);

        for host in self.hosts {
            self.stage_config(host, SLURM_CONF, &slurm_conf).await?;
            self.stage_config(host, "gres.conf", GRES_CONF).await?;
            self.stage_config(host, "cgroup.conf", CGROUP_CONF).await?;

            // Each command opens a new session, so the groups apply right away
            let user = host.whoami().await.context("Failed to get the user name")?;
            host.add_to_groups(&user, GPU_GROUPS)
                .await
                .context("Failed to add the user to the GPU groups")?;

            info!("Installing slurm on {}", host.target());
            self.run_script(host, INSTALL_SLURM, self.config.slurm_version.as_deref())
                .await?;
            info!("Installing enroot on {}", host.target());
            self.run_script(host, INSTALL_ENROOT, self.config.enroot_version.as_deref())
                .await?;
            info!("Setup complete on {}", host.target());
        }

        self.add_hosts_entries().await?;
        self.share_munge_key().await?;
        self.configure_accounting().await?;

        for host in self.hosts {
            info!("Installing pyxis on {}", host.target());
            self.run_script(host, INSTALL_PYXIS, None).await?;
        }

        for host in self.hosts {
            let sinfo = host
                .sinfo()
                .await
                .with_context(|| format!("sinfo failed on {}", host.target()))?;
            info!("sinfo on {}:\n{}", host.target(), sinfo.trim_end());
        }

        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        for host in self.hosts {
            info!("Uninstalling slurm on {}", host.target());
            self.run_script(host, UNINSTALL_SLURM, None).await?;

            info!("Uninstalling enroot on {}", host.target());
            host.run_checked(PURGE_ENROOT)
                .await
                .with_context(|| format!("Error uninstalling enroot on {}", host.target()))?;
        }

        info!("Testbed teardown complete");
        Ok(())
    }

    /// Copies `script` over, starts it detached and waits until it exits
    ///
    /// Its log is copied into the run directory before both are removed.
    async fn run_script(
        &self,
        host: &ClusterClient<E>,
        script: &str,
        argument: Option<&str>,
    ) -> Result<()> {
        let local = self.config.config_dir.join(script);
        let log = script_log_name(script, host.target());

        host.stage_executable(&local, script)
            .await
            .with_context(|| format!("Could not copy {} to {}", script, host.target()))?;

        let argument = argument.map(|a| format!(" {}", quote(a))).unwrap_or_default();
        host.run_checked(&format!(
            "sudo nohup ./{}{} < /dev/null > {} 2>&1 &",
            script,
            argument,
            quote(&log)
        ))
        .await
        .with_context(|| format!("Could not start {} on {}", script, host.target()))?;

        self.wait_for_script(host, script).await?;

        match host.download(&log, &self.results.path_for(&log)).await {
            Ok(()) => info!("Copied {} from {}", log, host.target()),
            Err(e) => warn!("Could not copy {} from {}: {}", log, host.target(), e),
        }

        host.remove(&[log.as_str(), script])
            .await
            .with_context(|| format!("Error deleting {} on {}", log, host.target()))?;
        Ok(())
    }

    /// Checks the process table until nothing runs `script`
    async fn wait_for_script(&self, host: &ClusterClient<E>, script: &str) -> Result<()> {
        let policy = self.config.script_wait;
        let max_attempts = policy.max_attempts.max(1);
        let check = format!("ps -ef | grep -w {} | grep -v grep", quote(script));

        for attempt in 1..=max_attempts {
            let output = host.run(&check).await?;
            if output.stdout.trim().is_empty() {
                info!("{} finished on {}", script, host.target());
                return Ok(());
            }

            debug!(
                "{} is still running on {} (check {}/{})",
                script,
                host.target(),
                attempt,
                max_attempts
            );
            if attempt < max_attempts {
                tokio::time::sleep(policy.delay).await;
            }
        }

        anyhow::bail!(
            "{} still running on {} after {} check(s)",
            script,
            host.target(),
            max_attempts
        )
    }

    /// Writes `content` into the run directory and installs it under /etc/slurm
    async fn stage_config(&self, host: &ClusterClient<E>, name: &str, content: &str) -> Result<()> {
        let local = self.results.write_text(name, content)?;
        self.stage_file(host, &local, name).await
    }

    async fn stage_file(&self, host: &ClusterClient<E>, local: &Path, name: &str) -> Result<()> {
        let staged = format!("/tmp/{}", name);
        let installed = format!("{}/{}", SLURM_ETC, name);
        info!("Creating {} on {}", installed, host.target());

        host.upload(local, &staged)
            .await
            .with_context(|| format!("Could not copy {}", local.display()))?;
        host.run_checked(&format!(
            "sudo mkdir -p {} && sudo cp {} {}",
            SLURM_ETC,
            quote(&staged),
            quote(&installed)
        ))
        .await
        .with_context(|| format!("{} could not be created on {}", installed, host.target()))?;
        Ok(())
    }

    /// Adds every host's address and name to every `/etc/hosts`
    async fn add_hosts_entries(&self) -> Result<()> {
        let mut entries = Vec::with_capacity(self.hosts.len());
        for host in self.hosts {
            let address = host.connection_address().await.with_context(|| {
                format!("Could not retrieve the address of {}", host.target())
            })?;
            let hostname = host.hostname().await.context("Failed to get the host name")?;
            entries.push(HostsEntry::new(address, hostname));
        }

        for host in self.hosts {
            for entry in &entries {
                host.run_checked(&entry.append_command())
                    .await
                    .with_context(|| format!("Failed to update /etc/hosts on {}", host.target()))?;
                info!("Added '{}' to /etc/hosts on {}", entry, host.target());
            }
        }
        Ok(())
    }

    /// Creates a munge key on the head node and installs it everywhere else
    async fn share_munge_key(&self) -> Result<()> {
        ensure_ubuntu(self.head).await?;
        run_all(self.head, CREATE_MUNGE_KEY)
            .await
            .with_context(|| format!("Munge key creation on {} failed", self.head.target()))?;
        info!("Munge key created on {}", self.head.target());

        let local = self.results.path_for(MUNGE_KEY);
        let copied = self.copy_munge_key(&local).await;
        match std::fs::remove_file(&local) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                warn!("Could not delete local copy {}: {}", local.display(), e)
            }
            _ => {}
        }
        copied?;

        run_all(self.head, CONFIGURE_HEAD_NODE).await.with_context(|| {
            format!("Head node configuration on {} failed", self.head.target())
        })?;
        info!("Head node configuration on {} done", self.head.target());

        for host in &self.hosts[1..] {
            ensure_ubuntu(host).await?;
            run_all(host, CONFIGURE_COMPUTE_NODE)
                .await
                .with_context(|| format!("Munge key configuration on {} failed", host.target()))?;
            info!("Munge key configuration on {} done", host.target());
        }
        Ok(())
    }

    async fn copy_munge_key(&self, local: &Path) -> Result<()> {
        self.head
            .download(MUNGE_KEY_PATH, local)
            .await
            .context("Could not fetch the munge key")?;
        for host in &self.hosts[1..] {
            info!("Copying {} to {}", MUNGE_KEY_PATH, host.target());
            host.upload(local, MUNGE_KEY)
                .await
                .with_context(|| format!("Munge key copy to {} failed", host.target()))?;
        }
        Ok(())
    }

    /// Sets up slurmdbd on the head node and checks the cluster is registered
    async fn configure_accounting(&self) -> Result<()> {
        let head = self.head;
        self.stage_file(head, &self.config.config_dir.join(SLURMDBD_CONF), SLURMDBD_CONF)
            .await?;

        info!("Configuring slurmdbd on {}", head.target());
        self.run_script(head, SLURMDB_CONFIG, None).await?;

        for host in self.hosts {
            let output = host
                .restart_service("slurmd")
                .await
                .with_context(|| format!("slurmd restart failed on {}", host.target()))?;
            info!("slurmd restarted on {}\n{}", host.target(), output.trim_end());
        }

        let clusters = head
            .run_checked("sudo sacctmgr list cluster")
            .await
            .with_context(|| format!("Failed to list sacct clusters on {}", head.target()))?;
        info!("sacct cluster:\n{}", clusters.trim_end());

        if let Err(e) = head.restart_service("slurmctld").await {
            warn!("slurmctld restart failed on {}: {}", head.target(), e);
        }
        Ok(())
    }
}

async fn ensure_ubuntu<E: CommandExecutor>(host: &ClusterClient<E>) -> Result<()> {
    match host.host_type().await? {
        HostType::Ubuntu22 | HostType::Ubuntu24 => Ok(()),
        other => anyhow::bail!("munge setup is not supported on {} ({})", other, host.target()),
    }
}

async fn run_all<E: CommandExecutor>(host: &ClusterClient<E>, commands: &[&str]) -> Result<()> {
    for command in commands {
        host.run_checked(command).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::testing::FakeNode;
    use std::time::Duration;
    use trellis_client::RetryPolicy;
    use trellis_core::domain::host::HostTarget;

    const UBUNTU: &str = "PRETTY_NAME=\"Ubuntu 22.04.4 LTS\"\n";
    const SLURM_TEMPLATE: &str = "ClusterName=trellis\nSlurmctldHost=HEAD-NODE\nMULTI-NODE\n";

    fn config(config_dir: &Path) -> Config {
        let mut config = Config::new(vec![HostTarget::new("head"), HostTarget::new("node-b")]);
        config.config_dir = config_dir.to_path_buf();
        config.slurm_version = Some("25.05.1".to_string());
        config.script_wait = RetryPolicy::new(Duration::from_secs(15), 3);
        config
    }

    fn config_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SLURM_CONF), SLURM_TEMPLATE).unwrap();
        std::fs::write(dir.path().join(SLURMDBD_CONF), "DbdHost=localhost\n").unwrap();
        dir
    }

    fn node(hostname: &str, address: &str, cpus: u32) -> FakeNode {
        FakeNode::new(hostname)
            .respond("whoami", "amd\n")
            .respond("cat /etc/os-release", UBUNTU)
            .respond(
                "echo \"$SSH_CONNECTION\"",
                &format!("10.0.0.1 50022 {address} 22\n"),
            )
            .respond(
                &node_definition_command(),
                &format!("NodeName={hostname} CPUs={cpus} Boards=1\n"),
            )
    }

    fn position(executed: &[String], command: &str) -> usize {
        executed
            .iter()
            .position(|c| c == command)
            .unwrap_or_else(|| panic!("{command} was never run"))
    }

    #[tokio::test]
    async fn test_setup_builds_the_cluster() {
        let dir = config_dir();
        let config = config(dir.path());
        let base = tempfile::tempdir().unwrap();
        let results = ResultsDir::create(base.path()).unwrap();

        let hosts = vec![
            ClusterClient::new(
                node("head", "10.0.0.7", 64).file("/etc/munge/munge.key", "secret"),
            ),
            ClusterClient::new(node("node-b", "10.0.0.8", 32)),
        ];

        setup(&config, &hosts, &results).await.unwrap();

        let slurm_conf = std::fs::read_to_string(results.root().join("slurm.conf")).unwrap();
        assert_eq!(
            slurm_conf,
            "ClusterName=trellis\nSlurmctldHost=head\n\
             NodeName=head CPUs=64 Boards=1\nNodeName=node-b CPUs=32 Boards=1\n"
        );
        assert_eq!(
            std::fs::read_to_string(results.root().join("gres.conf")).unwrap(),
            "AutoDetect=rsmi\n"
        );
        // The key only passes through the run directory
        assert!(!results.root().join("munge.key").exists());

        let head = hosts[0].executor().executed();
        let start_uninstall =
            "sudo nohup ./uninstall_slurm.sh < /dev/null > uninstall_slurm_head.log 2>&1 &";
        let start_install =
            "sudo nohup ./install_slurm.sh 25.05.1 < /dev/null > install_slurm_head.log 2>&1 &";
        let start_pyxis =
            "sudo nohup ./install_pyxis.sh < /dev/null > install_pyxis_head.log 2>&1 &";
        let install_slurm_conf =
            "sudo mkdir -p /etc/slurm && sudo cp /tmp/slurm.conf /etc/slurm/slurm.conf";
        assert!(position(&head, start_uninstall) < position(&head, start_install));
        assert!(position(&head, install_slurm_conf) < position(&head, start_install));
        assert!(position(&head, "sudo sacctmgr list cluster") < position(&head, start_pyxis));
        assert!(head.contains(&"sudo usermod -aG render,video amd".to_string()));
        assert!(head.contains(&"sudo -u munge /usr/sbin/mungekey --verbose".to_string()));
        assert!(head.contains(&"sudo rm -rf install_slurm_head.log install_slurm.sh".to_string()));

        // Every host learns about every other one
        for host in &hosts {
            let executed = host.executor().executed();
            for entry in ["'10.0.0.7 head'", "'10.0.0.8 node-b'"] {
                assert!(
                    executed.iter().any(|c| c.starts_with(&format!("grep -qF {entry}"))),
                    "{entry} missing on {}",
                    host.target()
                );
            }
        }

        let node_b = hosts[1].executor().executed();
        assert!(node_b.contains(&"sudo cp munge.key /etc/munge/munge.key".to_string()));
        assert!(!node_b.iter().any(|c| c.contains("mungekey") || c.contains("sacctmgr")));
        assert!(!node_b.iter().any(|c| c.contains("slurmdb_config.sh")));

        let uploaded_to_b = hosts[1].executor().uploaded.lock().unwrap().clone();
        assert!(uploaded_to_b.contains(&"munge.key".to_string()));
        assert!(!uploaded_to_b.contains(&"/tmp/slurmdbd.conf".to_string()));
        let uploaded_to_head = hosts[0].executor().uploaded.lock().unwrap().clone();
        assert!(uploaded_to_head.contains(&"/tmp/slurmdbd.conf".to_string()));
        assert!(!uploaded_to_head.contains(&"munge.key".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_script_still_running_fails_setup() {
        let dir = config_dir();
        let config = config(dir.path());
        let base = tempfile::tempdir().unwrap();
        let results = ResultsDir::create(base.path()).unwrap();

        let check = "ps -ef | grep -w uninstall_slurm.sh | grep -v grep";
        let hosts = vec![ClusterClient::new(node("head", "10.0.0.7", 64).respond(
            check,
            "root  4242  1  0 10:00 ?  00:00:03 /bin/bash ./uninstall_slurm.sh\n",
        ))];

        let started = tokio::time::Instant::now();
        let err = setup(&config, &hosts, &results).await.unwrap_err();

        assert!(
            err.to_string()
                .contains("uninstall_slurm.sh still running on head after 3 check(s)")
        );
        assert_eq!(started.elapsed(), Duration::from_secs(30));
        let executed = hosts[0].executor().executed();
        assert_eq!(executed.iter().filter(|c| *c == check).count(), 3);
        assert!(!executed.iter().any(|c| c.contains("install_slurm.sh 25.05.1")));
    }

    #[tokio::test]
    async fn test_munge_needs_ubuntu() {
        let dir = config_dir();
        let config = config(dir.path());
        let base = tempfile::tempdir().unwrap();
        let results = ResultsDir::create(base.path()).unwrap();

        let hosts = vec![ClusterClient::new(
            node("head", "10.0.0.7", 64)
                .respond("cat /etc/os-release", "PRETTY_NAME=\"Rocky Linux 9.4\"\n"),
        )];

        let err = setup(&config, &hosts, &results).await.unwrap_err();
        assert!(err.to_string().contains("munge setup is not supported on RHEL"));
        assert!(!hosts[0].executor().executed().iter().any(|c| c.contains("mungekey")));
    }

    #[tokio::test]
    async fn test_failed_cluster_registration_fails_setup() {
        let dir = config_dir();
        let config = config(dir.path());
        let base = tempfile::tempdir().unwrap();
        let results = ResultsDir::create(base.path()).unwrap();

        let hosts = vec![ClusterClient::new(
            node("head", "10.0.0.7", 64)
                .file("/etc/munge/munge.key", "secret")
                .exit_with(
                    "sudo sacctmgr list cluster",
                    1,
                    "",
                    "sacctmgr: error: Problem talking to the database\n",
                ),
        )];

        let err = setup(&config, &hosts, &results).await.unwrap_err();
        assert!(format!("{:#}", err).contains("Problem talking to the database"));
        assert!(!hosts[0].executor().executed().iter().any(|c| c.contains("install_pyxis")));
    }

    #[tokio::test]
    async fn test_skipped_phases_touch_nothing() {
        let mut config = config(Path::new("/nonexistent"));
        config.skip_install = true;
        config.skip_uninstall = true;
        let base = tempfile::tempdir().unwrap();
        let results = ResultsDir::create(base.path()).unwrap();

        let hosts = vec![ClusterClient::new(FakeNode::new("head"))];

        setup(&config, &hosts, &results).await.unwrap();
        teardown(&config, &hosts, &results).await.unwrap();
        assert!(hosts[0].executor().executed().is_empty());
        assert!(hosts[0].executor().uploaded.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_removes_slurm_and_enroot() {
        let config = config(Path::new("/opt/trellis/config"));
        let base = tempfile::tempdir().unwrap();
        let results = ResultsDir::create(base.path()).unwrap();

        let hosts = vec![
            ClusterClient::new(
                FakeNode::new("head").file("uninstall_slurm_head.log", "slurm removed\n"),
            ),
            ClusterClient::new(FakeNode::new("node-b")),
        ];

        teardown(&config, &hosts, &results).await.unwrap();

        for host in &hosts {
            let executed = host.executor().executed();
            assert!(
                position(&executed, "ps -ef | grep -w uninstall_slurm.sh | grep -v grep")
                    < position(&executed, PURGE_ENROOT)
            );
            assert_eq!(
                *host.executor().uploaded.lock().unwrap(),
                vec!["uninstall_slurm.sh".to_string()]
            );
        }
        assert_eq!(
            std::fs::read_to_string(results.root().join("uninstall_slurm_head.log")).unwrap(),
            "slurm removed\n"
        );
    }

    #[tokio::test]
    async fn test_failed_purge_fails_teardown() {
        let config = config(Path::new("/opt/trellis/config"));
        let base = tempfile::tempdir().unwrap();
        let results = ResultsDir::create(base.path()).unwrap();

        let hosts = vec![ClusterClient::new(FakeNode::new("head").exit_with(
            PURGE_ENROOT,
            100,
            "",
            "E: Unable to locate package enroot\n",
        ))];

        let err = teardown(&config, &hosts, &results).await.unwrap_err();
        assert!(err.to_string().contains("Error uninstalling enroot on head"));
    }

    #[test]
    fn test_script_log_name() {
        assert_eq!(script_log_name("install_slurm.sh", "head"), "install_slurm_head.log");
        assert_eq!(
            script_log_name("install_pyxis.sh", "root@[fe80::1]:2222"),
            "install_pyxis_root__fe80__1__2222.log"
        );
        assert_eq!(script_log_name("run", "node-b.lan"), "run_node-b.lan.log");
    }
}
