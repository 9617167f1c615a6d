//! Run summary types
//!
//! A run is one invocation of the harness against a set of hosts. Every
//! test case executed during the run is recorded here and the summary is
//! written next to the collected logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::JobState;

/// Outcome of a single test case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    /// Job completed and validation passed
    Passed,
    /// Job reached a terminal state other than COMPLETED, or validation failed
    Failed,
    /// The harness could not finish the case (transport, timeout, setup)
    Error,
}

/// Result of one test case on one host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    pub name: String,
    pub host: String,
    pub status: CaseStatus,
    pub job_id: Option<String>,
    pub final_state: Option<JobState>,
    pub message: Option<String>,
    /// Files copied back into the run directory
    pub artifacts: Vec<String>,
}

impl CaseResult {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            status: CaseStatus::Passed,
            job_id: None,
            final_state: None,
            message: None,
            artifacts: Vec::new(),
        }
    }

    /// Marks the case failed with a message
    pub fn failed(mut self, message: impl Into<String>) -> Self {
        self.status = CaseStatus::Failed;
        self.message = Some(message.into());
        self
    }

    /// Marks the case errored with a message
    pub fn errored(mut self, message: impl Into<String>) -> Self {
        self.status = CaseStatus::Error;
        self.message = Some(message.into());
        self
    }

    pub fn passed(&self) -> bool {
        self.status == CaseStatus::Passed
    }
}

/// Summary of a harness run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cases: Vec<CaseResult>,
}

impl RunSummary {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            cases: Vec::new(),
        }
    }

    pub fn record(&mut self, case: CaseResult) {
        self.cases.push(case);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// True when at least one case ran and none failed
    pub fn all_passed(&self) -> bool {
        !self.cases.is_empty() && self.cases.iter().all(CaseResult::passed)
    }

    pub fn failed_count(&self) -> usize {
        self.cases.iter().filter(|c| !c.passed()).count()
    }
}

impl Default for RunSummary {
    fn default() -> Self {
        Self::new()
    }
}
