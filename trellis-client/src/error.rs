//! Error types for the Trellis client

use thiserror::Error;
use trellis_core::ParseError;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur when talking to a cluster host
#[derive(Debug, Error)]
pub enum ClientError {
    /// The execution capability itself is broken (connection refused,
    /// dropped session, missing ssh binary)
    #[error("transport to {target} failed: {message}")]
    Transport {
        /// Host the command was meant for
        target: String,
        /// Description of the failure
        message: String,
    },

    /// A command ran but exited non-zero where success was required
    #[error("command `{command}` exited with {exit_code}: {stderr}")]
    CommandFailed {
        /// The command line
        command: String,
        /// Exit status
        exit_code: i32,
        /// Captured stderr
        stderr: String,
    },

    /// A file to copy does not exist
    #[error("file not found: {0}")]
    NotFound(String),

    /// Copying a file to or from the host failed
    #[error("transfer of {path} failed: {message}")]
    TransferFailed {
        /// Path being copied
        path: String,
        /// Description of the failure
        message: String,
    },

    /// Command output could not be interpreted
    #[error("failed to parse output: {0}")]
    Parse(#[from] ParseError),

    /// Local filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Create a transport error
    pub fn transport(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Create a command failure from its captured output
    pub fn command_failed(command: impl Into<String>, exit_code: i32, stderr: &str) -> Self {
        Self::CommandFailed {
            command: command.into(),
            exit_code,
            stderr: stderr.trim().to_string(),
        }
    }

    /// Check if this error means the execution capability is unusable
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Errors surfaced by [`crate::JobCompletionPoller`]
///
/// Terminal job states (including FAILED, CANCELLED, TIMEOUT and
/// OUT_OF_MEMORY) are not errors; they come back as a
/// [`trellis_core::domain::job::PollOutcome`].
#[derive(Debug, Error)]
pub enum PollError {
    /// The attempt budget ran out before a terminal state was observed
    #[error(
        "gave up waiting for job {job_id} after {attempts} attempt(s); last output: {last_output:?}"
    )]
    TimeoutExceeded {
        job_id: String,
        attempts: u32,
        /// Output of the last query (stderr when it exited non-zero)
        last_output: String,
    },

    /// The execution capability failed; retrying would not help
    #[error("transport failure while polling job {job_id} (attempt {attempts})")]
    Transport {
        job_id: String,
        attempts: u32,
        #[source]
        source: ClientError,
    },
}

impl PollError {
    /// Job the poll was for
    pub fn job_id(&self) -> &str {
        match self {
            Self::TimeoutExceeded { job_id, .. } | Self::Transport { job_id, .. } => job_id,
        }
    }

    /// Number of status queries issued before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            Self::TimeoutExceeded { attempts, .. } | Self::Transport { attempts, .. } => *attempts,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimeoutExceeded { .. })
    }
}
