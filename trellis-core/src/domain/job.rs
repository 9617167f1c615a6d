//! Slurm job domain types
//!
//! Covers the two pieces of scheduler output the harness relies on:
//! the job id printed by `sbatch --parsable` and the two-column status
//! report printed by `sacct`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

use crate::error::ParseError;
use crate::shell::quote;

// Plain, array task and heterogeneous component ids
#[allow(clippy::expect_used)]
static JOB_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d+(_\d+)?(\+\d+)?$").expect("constant regex pattern is valid")
});

/// Status query for a single submitted job
///
/// Constructed once per submission and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobQuery {
    job_id: String,
}

impl JobQuery {
    /// Creates a query for `job_id`
    ///
    /// Surrounding whitespace is trimmed. The id ends up in shell command
    /// text, so anything but a Slurm job id is rejected.
    pub fn new(job_id: impl Into<String>) -> Result<Self, ParseError> {
        let job_id = job_id.into().trim().to_string();
        if job_id.is_empty() {
            return Err(ParseError::EmptyJobId);
        }
        if !JOB_ID_PATTERN.is_match(&job_id) {
            return Err(ParseError::InvalidJobId(job_id));
        }
        Ok(Self { job_id })
    }

    /// The job identifier
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Shell command printing `<job id> <state>` rows with no header
    pub fn status_command(&self) -> String {
        format!("sacct -j {} --format=JobID,State --noheader", self.job_id)
    }
}

impl TryFrom<String> for JobQuery {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<JobQuery> for String {
    fn from(value: JobQuery) -> Self {
        value.job_id
    }
}

impl fmt::Display for JobQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.job_id)
    }
}

/// Job state as reported by `sacct`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    OutOfMemory,
    /// Any state the harness does not act on, kept verbatim
    Other(String),
}

impl JobState {
    /// Parses a state token
    ///
    /// Slurm decorates some states (`CANCELLED+`, `CANCELLED:15`); the
    /// decoration is dropped before matching. Unknown tokens become
    /// [`JobState::Other`].
    pub fn parse(token: &str) -> Self {
        let normalized = token
            .split(['+', ':', '('])
            .next()
            .unwrap_or(token)
            .trim();

        match normalized {
            "PENDING" => Self::Pending,
            "RUNNING" => Self::Running,
            "COMPLETED" => Self::Completed,
            "FAILED" => Self::Failed,
            "CANCELLED" => Self::Cancelled,
            "TIMEOUT" => Self::Timeout,
            "OUT_OF_MEMORY" => Self::OutOfMemory,
            _ => Self::Other(token.to_string()),
        }
    }

    /// Whether no further transition can follow this state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout | Self::OutOfMemory
        )
    }

    /// Whether the job finished successfully
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// The state as sacct prints it
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Timeout => "TIMEOUT",
            Self::OutOfMemory => "OUT_OF_MEMORY",
            Self::Other(raw) => raw,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for JobState {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<JobState> for String {
    fn from(value: JobState) -> Self {
        value.as_str().to_string()
    }
}

/// One row of a status report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusRecord {
    pub job_id: String,
    pub state: JobState,
}

/// Parses a `sacct --format=JobID,State --noheader` report
///
/// The first non-empty line is authoritative; step rows such as
/// `42.batch` that follow it are ignored. Returns `None` when the report is
/// inconclusive: no non-empty lines, or a first line without a state column.
pub fn parse_status_report(report: &str) -> Option<JobStatusRecord> {
    let line = report.lines().find(|l| !l.trim().is_empty())?;
    let mut columns = line.split_whitespace();
    let job_id = columns.next()?;
    let state = columns.next()?;

    Some(JobStatusRecord {
        job_id: job_id.to_string(),
        state: JobState::parse(state),
    })
}

/// Final result of waiting on a job
///
/// `raw_report` is the verbatim output of the query that observed the
/// terminal state and is kept for the run's log archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOutcome {
    pub job_id: String,
    pub final_state: JobState,
    pub raw_report: String,
    pub attempts: u32,
}

/// A batch script submission pinned to one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbatchRequest {
    /// Path of the batch script on the submitting host
    pub script: String,
    /// Node the job must run on
    pub nodelist: String,
    /// Number of GPUs to request through `--gres`
    pub gpus: usize,
}

impl SbatchRequest {
    pub fn command(&self) -> String {
        format!(
            "sbatch --parsable --nodelist={} --gres=gpu:{} {}",
            quote(&self.nodelist),
            self.gpus,
            quote(&self.script)
        )
    }
}

/// Extracts the job id from `sbatch --parsable` output
///
/// The output is either `<id>` or `<id>;<cluster>`.
pub fn parse_sbatch_job_id(output: &str) -> Result<JobQuery, ParseError> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| ParseError::InvalidSbatchOutput(output.to_string()))?;

    let id = line.split(';').next().unwrap_or(line).trim();
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit() || c == '_') {
        return Err(ParseError::InvalidSbatchOutput(output.to_string()));
    }

    JobQuery::new(id)
}

/// Paths of the stdout/stderr files written by the GPU stress batch script
///
/// The batch script directs its output to `pytorch_logs/pytorch-util-<id>.{out,err}`
/// relative to the submission directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchLogPaths {
    pub stdout: String,
    pub stderr: String,
}

impl BatchLogPaths {
    pub fn for_job(job: &JobQuery) -> Self {
        Self {
            stdout: format!("pytorch_logs/pytorch-util-{}.out", job.job_id()),
            stderr: format!("pytorch_logs/pytorch-util-{}.err", job.job_id()),
        }
    }
}
