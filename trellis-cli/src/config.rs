//! Configuration module
//!
//! Resolves which host the CLI talks to and how.

use anyhow::Result;
use std::path::PathBuf;
use trellis_core::domain::host::HostTarget;

/// Where commands are executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    /// Run commands on this machine
    Local,
    /// Run commands over ssh
    Ssh {
        target: HostTarget,
        identity: Option<PathBuf>,
    },
}

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub connection: Connection,
}

impl Config {
    /// Builds the configuration from the global arguments
    ///
    /// `--user` and `--port` only fill in what the host string leaves out.
    pub fn resolve(
        host: Option<&str>,
        user: Option<&str>,
        port: Option<u16>,
        key: Option<PathBuf>,
        local: bool,
    ) -> Result<Self> {
        if local {
            return Ok(Self {
                connection: Connection::Local,
            });
        }

        let host = host.ok_or_else(|| anyhow::anyhow!("--host or TRELLIS_HOST is required"))?;
        let mut target = host.parse::<HostTarget>()?.with_default_user(user);
        if target.port.is_none() {
            target.port = port;
        }

        Ok(Self {
            connection: Connection::Ssh {
                target,
                identity: key,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local() {
        let config = Config::resolve(Some("head"), None, None, None, true).unwrap();
        assert_eq!(config.connection, Connection::Local);
    }

    #[test]
    fn test_ssh_defaults_fill_gaps() {
        let config = Config::resolve(Some("head"), Some("amd"), Some(2222), None, false).unwrap();
        let Connection::Ssh { target, .. } = config.connection else {
            panic!("expected ssh connection");
        };
        assert_eq!(target.to_string(), "amd@head:2222");

        let config =
            Config::resolve(Some("root@head:22"), Some("amd"), Some(2222), None, false).unwrap();
        let Connection::Ssh { target, .. } = config.connection else {
            panic!("expected ssh connection");
        };
        assert_eq!(target.to_string(), "root@head:22");
    }

    #[test]
    fn test_host_required() {
        assert!(Config::resolve(None, None, None, None, false).is_err());
    }
}
