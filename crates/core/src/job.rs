//! Job record, lifecycle status and state transitions.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;

/// Arbitrary JSON object supplied by the client at submission.
pub type JobPayload = serde_json::Map<String, JsonValue>;

/// Lifecycle status of a job.
///
/// ```text
/// queued -> processing -> completed
///              |  ^
///              v  |
///            retrying -> failed
/// ```
///
/// `queued` may also go straight to `failed` when the broker rejects the
/// dispatch. `completed` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Retrying,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Retrying,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Retrying => "retrying",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status '{s}'")))
    }
}

/// A validated submission, not yet persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    pub payload: JobPayload,
}

impl NewJob {
    /// The job type is stored as given; it must contain something other than
    /// whitespace.
    pub fn new(job_type: impl Into<String>, payload: JobPayload) -> DomainResult<Self> {
        let job_type = job_type.into();
        if job_type.trim().is_empty() {
            return Err(DomainError::validation("job_type must not be empty"));
        }
        Ok(Self { job_type, payload })
    }
}

/// Persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub payload: JobPayload,
    pub status: JobStatus,
    /// Number of transient failures that were rescheduled.
    pub retries: u32,
    pub result: Option<JsonValue>,
    pub error_message: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Materialize a freshly inserted row.
    pub fn queued(id: JobId, new_job: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            job_type: new_job.job_type,
            payload: new_job.payload,
            status: JobStatus::Queued,
            retries: 0,
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a patch in place, the same way a store does inside one write.
    pub fn apply(&mut self, patch: &JobPatch, now: DateTime<Utc>) {
        self.status = patch.status;
        self.result = patch.result.clone();
        self.error_message = patch.error_message.clone();
        if patch.bump_retries {
            self.retries = self.retries.saturating_add(1);
        }
        self.updated_at = now;
    }

    /// Checks the status/result/error coupling of a record.
    pub fn check_invariants(&self) -> DomainResult<()> {
        match self.status {
            JobStatus::Completed => {
                if self.result.is_none() {
                    return Err(DomainError::invariant("completed job without result"));
                }
                if self.error_message.is_some() {
                    return Err(DomainError::invariant("completed job with error_message"));
                }
            }
            JobStatus::Failed => {
                if self.error_message.is_none() {
                    return Err(DomainError::invariant("failed job without error_message"));
                }
                if self.result.is_some() {
                    return Err(DomainError::invariant("failed job with result"));
                }
            }
            JobStatus::Queued | JobStatus::Processing | JobStatus::Retrying => {
                if self.result.is_some() {
                    return Err(DomainError::invariant(format!(
                        "{} job with result",
                        self.status
                    )));
                }
                if self.error_message.is_some() {
                    return Err(DomainError::invariant(format!(
                        "{} job with error_message",
                        self.status
                    )));
                }
            }
        }
        if self.updated_at < self.created_at {
            return Err(DomainError::invariant("updated_at precedes created_at"));
        }
        Ok(())
    }
}

/// One logical mutation of a job row.
///
/// Patches can only be built through the transition constructors below, so a
/// store applying one can never produce a record where status, result and
/// error disagree.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPatch {
    status: JobStatus,
    result: Option<JsonValue>,
    error_message: Option<JsonValue>,
    bump_retries: bool,
}

impl JobPatch {
    /// A worker picked up the job. The first attempt reports `processing`,
    /// redeliveries report `retrying`.
    pub fn claim(attempt: u32) -> Self {
        let status = if attempt == 0 {
            JobStatus::Processing
        } else {
            JobStatus::Retrying
        };
        Self {
            status,
            result: None,
            error_message: None,
            bump_retries: false,
        }
    }

    /// A transient failure was rescheduled.
    pub fn retry_scheduled() -> Self {
        Self {
            status: JobStatus::Retrying,
            result: None,
            error_message: None,
            bump_retries: true,
        }
    }

    /// A `null` result is stored as an empty object.
    pub fn completed(result: JsonValue) -> Self {
        let result = if result.is_null() { json!({}) } else { result };
        Self {
            status: JobStatus::Completed,
            result: Some(result),
            error_message: None,
            bump_retries: false,
        }
    }

    /// A `null` error is replaced by a generic description.
    pub fn failed(error: JsonValue) -> Self {
        let error = if error.is_null() {
            json!({ "error": "unknown error" })
        } else {
            error
        };
        Self {
            status: JobStatus::Failed,
            result: None,
            error_message: Some(error),
            bump_retries: false,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn result(&self) -> Option<&JsonValue> {
        self.result.as_ref()
    }

    pub fn error_message(&self) -> Option<&JsonValue> {
        self.error_message.as_ref()
    }

    pub fn bumps_retries(&self) -> bool {
        self.bump_retries
    }
}
