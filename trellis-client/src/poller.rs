//! Job completion poller
//!
//! Queries `sacct` for a submitted job until it reaches a terminal state or
//! the attempt budget runs out. Failed queries, empty reports and reports
//! without a state column are retried; a broken transport is not.
//!
//! A non-zero `sacct` exit is always retried, so a job id the scheduler
//! has never heard of looks the same as a transient failure and ends in
//! [`PollError::TimeoutExceeded`].

use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};
use trellis_core::domain::job::{
    JobQuery, JobState, JobStatusRecord, PollOutcome, parse_status_report,
};

use crate::error::PollError;
use crate::exec::{CommandExecutor, ExecOutput};

/// Fixed-delay retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause between two consecutive attempts
    pub delay: Duration,
    /// Total number of attempts, including the first
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Creates a policy; at least one attempt is always made
    pub const fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts: if max_attempts == 0 { 1 } else { max_attempts },
        }
    }

    /// Total time spent sleeping when every attempt is used
    pub fn budget(&self) -> Duration {
        self.delay * self.max_attempts.saturating_sub(1)
    }
}

impl Default for RetryPolicy {
    /// 60 attempts, 20 seconds apart
    fn default() -> Self {
        Self::new(Duration::from_secs(20), 60)
    }
}

/// Why an attempt did not produce a terminal state
#[derive(Debug, Clone, PartialEq, Eq)]
enum QueryFailure {
    NonZeroExit(i32),
    EmptyReport,
    MissingState,
    NotTerminal(JobState),
}

impl fmt::Display for QueryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonZeroExit(code) => write!(f, "status query exited with {}", code),
            Self::EmptyReport => f.write_str("job state not available yet"),
            Self::MissingState => f.write_str("status report has no state column"),
            Self::NotTerminal(state) => write!(f, "job still running: {}", state),
        }
    }
}

fn interpret(output: &ExecOutput) -> Result<JobStatusRecord, QueryFailure> {
    if !output.success() {
        return Err(QueryFailure::NonZeroExit(output.exit_code));
    }
    if output.stdout.trim().is_empty() {
        return Err(QueryFailure::EmptyReport);
    }

    let record = parse_status_report(&output.stdout).ok_or(QueryFailure::MissingState)?;
    if record.state.is_terminal() {
        Ok(record)
    } else {
        Err(QueryFailure::NotTerminal(record.state))
    }
}

/// Waits for a job to reach a terminal state
///
/// Holds no state between calls: every [`poll`](Self::poll) gets a fresh
/// attempt budget.
pub struct JobCompletionPoller<'a, E: CommandExecutor + ?Sized> {
    executor: &'a E,
    policy: RetryPolicy,
}

impl<'a, E: CommandExecutor + ?Sized> JobCompletionPoller<'a, E> {
    /// Creates a poller with the default retry policy
    pub fn new(executor: &'a E) -> Self {
        Self::with_policy(executor, RetryPolicy::default())
    }

    pub fn with_policy(executor: &'a E, policy: RetryPolicy) -> Self {
        Self { executor, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Polls until `job` reaches a terminal state
    ///
    /// # Returns
    /// The terminal state with the raw report that showed it. A job that
    /// ended FAILED or CANCELLED is still an `Ok` outcome.
    ///
    /// # Errors
    /// - [`PollError::TimeoutExceeded`] when every attempt was inconclusive
    /// - [`PollError::Transport`] as soon as the executor fails
    pub async fn poll(&self, job: &JobQuery) -> Result<PollOutcome, PollError> {
        let command = job.status_command();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_output = String::new();

        info!(
            "Waiting for job {} on {} (up to {} attempts, {:?} apart)",
            job,
            self.executor.target(),
            max_attempts,
            self.policy.delay
        );

        for attempt in 1..=max_attempts {
            let output = self
                .executor
                .exec(&command)
                .await
                .map_err(|source| PollError::Transport {
                    job_id: job.job_id().to_string(),
                    attempts: attempt,
                    source,
                })?;

            match interpret(&output) {
                Ok(record) => {
                    info!("Job {} reached {} after {} attempt(s)", job, record.state, attempt);
                    return Ok(PollOutcome {
                        job_id: job.job_id().to_string(),
                        final_state: record.state,
                        raw_report: output.stdout,
                        attempts: attempt,
                    });
                }
                Err(QueryFailure::NotTerminal(state)) => {
                    info!("Current state of job {}: {}", job, state);
                    last_output = output.stdout;
                }
                Err(failure @ QueryFailure::NonZeroExit(_)) => {
                    debug!(
                        "Attempt {}/{} for job {}: {}: {}",
                        attempt,
                        max_attempts,
                        job,
                        failure,
                        output.stderr.trim()
                    );
                    last_output = output.stderr;
                }
                Err(failure) => {
                    debug!("Attempt {}/{} for job {}: {}", attempt, max_attempts, job, failure);
                    last_output = output.stdout;
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.policy.delay).await;
            }
        }

        warn!(
            "Job {} did not reach a terminal state within {} attempts",
            job, max_attempts
        );
        Err(PollError::TimeoutExceeded {
            job_id: job.job_id().to_string(),
            attempts: max_attempts,
            last_output,
        })
    }
}
