//! What a handler reports back after running a job.

use std::time::Duration;

use serde_json::Value as JsonValue;

/// Outcome of one handler invocation.
///
/// Transient failures are retried while the retry budget lasts; permanent
/// failures fail the job on the spot.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    Success(JsonValue),
    TransientFailure {
        error: String,
        /// Overrides the policy delay for this retry.
        retry_after: Option<Duration>,
    },
    PermanentFailure(String),
}

impl HandlerOutcome {
    pub fn success(result: JsonValue) -> Self {
        Self::Success(result)
    }

    pub fn transient(error: impl Into<String>) -> Self {
        Self::TransientFailure {
            error: error.into(),
            retry_after: None,
        }
    }

    pub fn transient_after(error: impl Into<String>, delay: Duration) -> Self {
        Self::TransientFailure {
            error: error.into(),
            retry_after: Some(delay),
        }
    }

    pub fn permanent(error: impl Into<String>) -> Self {
        Self::PermanentFailure(error.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, HandlerOutcome::Success(_))
    }
}
