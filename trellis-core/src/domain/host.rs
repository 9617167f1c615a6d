//! Cluster host domain types

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::error::ParseError;

#[allow(clippy::expect_used)]
static PRETTY_NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"PRETTY_NAME="(.*)""#).expect("constant regex pattern is valid")
});

/// Operating system family of a cluster host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostType {
    Ubuntu22,
    Ubuntu24,
    Rhel,
    /// Anything else, with its `PRETTY_NAME`
    Unsupported(String),
}

impl HostType {
    /// Classifies a host from the contents of `/etc/os-release`
    ///
    /// Returns `None` when the file has no `PRETTY_NAME` entry.
    pub fn from_os_release(os_release: &str) -> Option<Self> {
        let captures = PRETTY_NAME_PATTERN.captures(os_release)?;
        let pretty_name = &captures[1];

        let host_type = if pretty_name.contains("Ubuntu 22") {
            Self::Ubuntu22
        } else if pretty_name.contains("Ubuntu 24") {
            Self::Ubuntu24
        } else if pretty_name.contains("Rocky Linux") {
            Self::Rhel
        } else {
            Self::Unsupported(pretty_name.to_string())
        };
        Some(host_type)
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unsupported(_))
    }
}

impl fmt::Display for HostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ubuntu22 => f.write_str("Ubuntu22"),
            Self::Ubuntu24 => f.write_str("Ubuntu24"),
            Self::Rhel => f.write_str("RHEL"),
            Self::Unsupported(name) => write!(f, "unsupported ({name})"),
        }
    }
}

/// Address the host was reached on, from `$SSH_CONNECTION`
///
/// The variable reads `client_ip client_port server_ip server_port`.
pub fn parse_ssh_connection(value: &str) -> Result<String, ParseError> {
    value
        .split_whitespace()
        .nth(2)
        .map(str::to_string)
        .ok_or_else(|| ParseError::SshConnectionIncomplete(value.trim().to_string()))
}

/// SSH destination written as `[user@]host[:port]`
///
/// IPv6 addresses are written in brackets (`[fe80::1]:22`) and stored
/// without them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostTarget {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
}

impl HostTarget {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: None,
        }
    }

    /// Sets the user when the target does not name one already
    pub fn with_default_user(mut self, user: Option<&str>) -> Self {
        if self.user.is_none() {
            self.user = user.map(str::to_string);
        }
        self
    }

    /// `user@host`, or just `host`
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    /// Whether the host is an IPv6 literal
    pub fn is_ipv6(&self) -> bool {
        self.host.contains(':')
    }

    /// `host:path` argument for scp, bracketing IPv6 hosts
    pub fn remote_path(&self, path: &str) -> String {
        let host = if self.is_ipv6() {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match &self.user {
            Some(user) => format!("{}@{}:{}", user, host, path),
            None => format!("{}:{}", host, path),
        }
    }
}

impl fmt::Display for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        if self.is_ipv6() {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

impl FromStr for HostTarget {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let target = s.trim();
        let invalid = |reason: &str| ParseError::InvalidHostTarget {
            target: s.to_string(),
            reason: reason.to_string(),
        };

        let (user, rest) = match target.split_once('@') {
            Some(("", _)) => return Err(invalid("empty user")),
            Some((user, rest)) => (Some(user.to_string()), rest),
            None => (None, target),
        };

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unclosed '['"))?;
            let port = match after {
                "" => None,
                _ => {
                    let port = after
                        .strip_prefix(':')
                        .ok_or_else(|| invalid("unexpected text after ']'"))?;
                    Some(port.parse::<u16>().map_err(|_| invalid("invalid port"))?)
                }
            };
            (host, port)
        } else if rest.matches(':').count() > 1 {
            return Err(invalid("IPv6 addresses must be written as [addr]"));
        } else {
            match rest.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
                    (host, Some(port))
                }
                None => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("empty host"));
        }

        Ok(Self {
            host: host.to_string(),
            user,
            port,
        })
    }
}
