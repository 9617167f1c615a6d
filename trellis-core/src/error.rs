//! Parse errors for scraped tool output

use thiserror::Error;

/// Errors raised when tool output cannot be interpreted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// A job identifier was empty
    #[error("job id cannot be empty")]
    EmptyJobId,

    /// A job identifier does not follow Slurm's `<id>[_<task>][+<component>]` form
    #[error("invalid job id: {0:?}")]
    InvalidJobId(String),

    /// `sbatch --parsable` printed something that is not a job id
    #[error("unexpected sbatch output: {0:?}")]
    InvalidSbatchOutput(String),

    /// The ROCm version could not be located in the output
    #[error("ROCm version not found in: {0:?}")]
    RocmVersionNotFound(String),

    /// `/etc/os-release` has no `PRETTY_NAME` entry
    #[error("os-release has no PRETTY_NAME entry")]
    OsReleaseIncomplete,

    /// The node definition script printed no `NodeName=` line
    #[error("no NodeName line in: {0:?}")]
    NodeDefinitionNotFound(String),

    /// `$SSH_CONNECTION` did not name the server address
    #[error("cannot read server address from SSH_CONNECTION {0:?}")]
    SshConnectionIncomplete(String),

    /// A host target string was malformed
    #[error("invalid host target {target:?}: {reason}")]
    InvalidHostTarget {
        /// The offending input
        target: String,
        /// What was wrong with it
        reason: String,
    },
}
