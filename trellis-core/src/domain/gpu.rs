//! GPU inventory and ROCm version parsing

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::error::ParseError;

/// Banner printed at the top of every `rocm-smi` report
pub const ROCM_SMI_BANNER: &str = "= ROCm System Management Interface =";

// `update-alternatives --display rocm` line naming the active install
#[allow(clippy::expect_used)]
static ROCM_LINK_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"link currently points to /opt/rocm-(\d+)\.(\d+)")
        .expect("constant regex pattern is valid")
});

/// One GPU row of the `rocm-smi` concise table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub node_id: String,
    pub gpu_id: String,
    pub nps_type: String,
    pub compute_type: String,
    pub partition_id: String,
    pub usage: String,
}

fn is_noise(line: &str) -> bool {
    line.starts_with("Device")
        || line.contains("DID")
        || line.contains("===")
        || line.contains("Ignoring")
        || line.starts_with("WARNING")
        || line.contains("allocated")
        || line.contains("invalid")
}

/// Parses the GPU rows of a `rocm-smi` report
///
/// Banners, headers and driver warnings are skipped, as are rows too short
/// to hold the usage column.
pub fn parse_rocm_smi(output: &str) -> Vec<GpuInfo> {
    output
        .lines()
        .filter(|line| !is_noise(line))
        .filter_map(|line| {
            let columns: Vec<&str> = line.split_whitespace().collect();
            if columns.len() < 16 {
                return None;
            }
            let column = |i: usize| columns[i].trim_end_matches(',').to_string();
            Some(GpuInfo {
                node_id: column(1),
                gpu_id: column(3),
                nps_type: column(6),
                compute_type: column(7),
                partition_id: column(8),
                usage: column(15),
            })
        })
        .collect()
}

/// Checks that a `rocm-smi` report lists exactly `expected` GPUs
///
/// Output without the `rocm-smi` banner never matches.
pub fn verify_gpu_count(output: &str, expected: usize) -> bool {
    output.contains(ROCM_SMI_BANNER) && parse_rocm_smi(output).len() == expected
}

/// Installed ROCm release, `major.minor`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RocmVersion {
    pub major: u32,
    pub minor: u32,
}

impl RocmVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for RocmVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for RocmVersion {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::RocmVersionNotFound(s.to_string());
        let (major, minor) = s.trim().split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

/// Extracts the active ROCm version from `update-alternatives --display rocm`
pub fn parse_rocm_version(output: &str) -> Result<RocmVersion, ParseError> {
    let captures = ROCM_LINK_PATTERN
        .captures(output)
        .ok_or_else(|| ParseError::RocmVersionNotFound(output.to_string()))?;

    let number = |i: usize| {
        captures[i]
            .parse::<u32>()
            .map_err(|_| ParseError::RocmVersionNotFound(output.to_string()))
    };

    Ok(RocmVersion {
        major: number(1)?,
        minor: number(2)?,
    })
}
