//! Slurm configuration staged on every node during setup

use std::fmt;

use crate::error::ParseError;
use crate::shell::quote;

/// Placeholder in the `slurm.conf` template replaced by the controller host
pub const HEAD_NODE_PLACEHOLDER: &str = "HEAD-NODE";

/// Placeholder replaced by one `NodeName=` line per compute node
pub const NODE_LIST_PLACEHOLDER: &str = "MULTI-NODE";

/// `/etc/slurm/gres.conf`: let slurmd discover AMD GPUs through ROCm SMI
pub const GRES_CONF: &str = "AutoDetect=rsmi\n";

/// `/etc/slurm/cgroup.conf`
pub const CGROUP_CONF: &str = "ConstrainCores=yes\nConstrainDevices=yes\nConstrainRAMSpace=yes\n";

pub const HOSTS_FILE: &str = "/etc/hosts";

/// Prints a `slurmd -C` style node line without needing slurmd installed
///
/// Half a gigabyte of memory is held back for the operating system.
pub const NODE_DEFINITION_SCRIPT: &str = r#"NODENAME=$(hostname -s)
CPUS=$(lscpu | grep '^CPU(s):' | awk '{print $2}')
SOCKETS=$(lscpu | grep '^Socket(s):' | awk '{print $2}')
CORES_PER_SOCKET=$(lscpu | grep '^Core(s) per socket:' | awk '{print $4}')
THREADS_PER_CORE=$(lscpu | grep '^Thread(s) per core:' | awk '{print $4}')
TOTAL_MEM_KB=$(free -k | grep Mem: | awk '{print $2}')
REAL_MEM_MB=$(( (TOTAL_MEM_KB / 1024) - 512 ))
echo "NodeName=${NODENAME} CPUs=${CPUS} Boards=1 SocketsPerBoard=${SOCKETS} CoresPerSocket=${CORES_PER_SOCKET} ThreadsPerCore=${THREADS_PER_CORE} RealMemory=${REAL_MEM_MB}"
"#;

/// Command running [`NODE_DEFINITION_SCRIPT`] on a host
pub fn node_definition_command() -> String {
    format!("sudo sh -c {}", quote(NODE_DEFINITION_SCRIPT))
}

/// Picks the `NodeName=` line out of the node definition script's output
pub fn parse_node_definition(output: &str) -> Result<String, ParseError> {
    output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("NodeName="))
        .map(str::to_string)
        .ok_or_else(|| ParseError::NodeDefinitionNotFound(output.to_string()))
}

/// Fills in the `slurm.conf` template
///
/// Every node definition lands on its own line where the template has
/// [`NODE_LIST_PLACEHOLDER`].
pub fn render_slurm_conf(
    template: &str,
    head_node: &str,
    node_definitions: &[String],
) -> String {
    template
        .replace(HEAD_NODE_PLACEHOLDER, head_node)
        .replace(NODE_LIST_PLACEHOLDER, &node_definitions.join("\n"))
}

/// One `/etc/hosts` line naming a cluster node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostsEntry {
    pub address: String,
    pub hostname: String,
}

impl HostsEntry {
    pub fn new(address: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            hostname: hostname.into(),
        }
    }

    /// Appends the line to `/etc/hosts` unless it is already there
    pub fn append_command(&self) -> String {
        let line = quote(&self.to_string());
        format!(
            "grep -qF {line} {HOSTS_FILE} || echo {line} | sudo tee -a {HOSTS_FILE} > /dev/null"
        )
    }
}

impl fmt::Display for HostsEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.address, self.hostname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_slurm_conf() {
        let template = "SlurmctldHost=HEAD-NODE\nMULTI-NODE\nPartitionName=gpu Nodes=ALL\n";
        let nodes = vec![
            "NodeName=node-a CPUs=64".to_string(),
            "NodeName=node-b CPUs=32".to_string(),
        ];

        assert_eq!(
            render_slurm_conf(template, "node-a", &nodes),
            "SlurmctldHost=node-a\n\
             NodeName=node-a CPUs=64\n\
             NodeName=node-b CPUs=32\n\
             PartitionName=gpu Nodes=ALL\n"
        );
    }

    #[test]
    fn test_render_without_placeholders_is_unchanged() {
        let template = "AccountingStorageType=accounting_storage/slurmdbd\n";
        assert_eq!(render_slurm_conf(template, "head", &[]), template);
    }

    #[test]
    fn test_parse_node_definition() {
        let output = "lscpu: warning\nNodeName=node-a CPUs=64 Boards=1 RealMemory=515000\n";
        assert_eq!(
            parse_node_definition(output).unwrap(),
            "NodeName=node-a CPUs=64 Boards=1 RealMemory=515000"
        );
        assert!(matches!(
            parse_node_definition("sh: lscpu: not found\n"),
            Err(ParseError::NodeDefinitionNotFound(_))
        ));
    }

    #[test]
    fn test_hosts_entry_is_appended_once() {
        let entry = HostsEntry::new("10.0.0.7", "node-a");
        assert_eq!(entry.to_string(), "10.0.0.7 node-a");
        assert_eq!(
            entry.append_command(),
            "grep -qF '10.0.0.7 node-a' /etc/hosts || \
             echo '10.0.0.7 node-a' | sudo tee -a /etc/hosts > /dev/null"
        );
    }

    #[test]
    fn test_node_definition_command_is_quoted() {
        let command = node_definition_command();
        assert!(command.starts_with("sudo sh -c 'NODENAME=$(hostname -s)"));
        assert!(command.ends_with("RealMemory=${REAL_MEM_MB}\"\n'"));
    }
}
