//! Terminal failure bookkeeping.

use serde_json::{Value as JsonValue, json};
use tracing::{error, info, warn};

use jobq_core::{Job, JobId, JobPatch};

use crate::job_store::{JobStore, JobStoreError};
use crate::task_queue::{FailureCallback, FailureReason, TaskMessage};

pub const EXHAUSTED_DETAILS: &str = "Job failed after all retries.";
pub const PERMANENT_DETAILS: &str = "Job failed permanently.";

/// The `error_message` stored on a failed job.
pub fn failure_details(reason: &FailureReason) -> JsonValue {
    let details = match reason {
        FailureReason::RetriesExhausted { .. } => EXHAUSTED_DETAILS,
        FailureReason::Permanent { .. } => PERMANENT_DETAILS,
    };
    json!({
        "error": reason.error(),
        "details": details,
        "attempts": reason.attempts(),
    })
}

/// Marks jobs `failed` once the worker gives up on them.
///
/// Runs as the worker's failure hook while the job lease is held. It never
/// raises: a missing row is logged, and a failed write is logged as fatal and
/// swallowed.
pub struct FailureFinalizer<S: JobStore> {
    store: S,
}

impl<S: JobStore> FailureFinalizer<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// `Ok(None)` when there is no row to finalize.
    ///
    /// Jobs that already reached a terminal state are returned unchanged.
    pub fn finalize(&self, job_id: JobId, reason: &FailureReason) -> Result<Option<Job>, JobStoreError> {
        let Some(job) = self.store.get(job_id)? else {
            return Ok(None);
        };

        if job.status.is_terminal() {
            warn!(job_id = %job_id, status = %job.status, "job already terminal; not overwriting");
            return Ok(Some(job));
        }

        match self.store.update(job_id, &JobPatch::failed(failure_details(reason))) {
            Ok(job) => Ok(Some(job)),
            Err(JobStoreError::NotFound(_)) => Ok(None),
            Err(JobStoreError::Terminal { status, .. }) => {
                warn!(job_id = %job_id, status = %status, "job finished concurrently; not overwriting");
                self.store.get(job_id)
            }
            Err(e) => Err(e),
        }
    }
}

impl<S: JobStore> FailureCallback for FailureFinalizer<S> {
    fn on_failure(&self, message: &TaskMessage, reason: &FailureReason) {
        match self.finalize(message.job_id, reason) {
            Ok(Some(job)) => info!(
                job_id = %job.id,
                status = %job.status,
                retries = job.retries,
                error = reason.error(),
                "job finalized as failed"
            ),
            Ok(None) => warn!(job_id = %message.job_id, "failure hook found no job row"),
            Err(e) => error!(
                job_id = %message.job_id,
                fatal = true,
                error = %e,
                "could not record job failure"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use jobq_core::{JobPayload, JobStatus, NewJob};

    use crate::job_store::{InMemoryJobStore, JobLock};

    fn exhausted() -> FailureReason {
        FailureReason::RetriesExhausted {
            error: "upstream timeout".to_string(),
            attempts: 4,
        }
    }

    #[test]
    fn marks_job_failed_with_details() {
        let store = InMemoryJobStore::arc();
        let job = store.insert(NewJob::new("data_analysis", JobPayload::new()).unwrap()).unwrap();
        store.update(job.id, &JobPatch::retry_scheduled()).unwrap();

        let finalizer = FailureFinalizer::new(store.clone());
        finalizer.on_failure(&TaskMessage::process_job(job.id), &exhausted());

        let job = store.get(job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retries, 1);
        assert!(job.result.is_none());
        assert_eq!(
            job.error_message,
            Some(json!({
                "error": "upstream timeout",
                "details": "Job failed after all retries.",
                "attempts": 4
            }))
        );
    }

    #[test]
    fn permanent_failures_say_so() {
        let details = failure_details(&FailureReason::Permanent {
            error: "bad".to_string(),
            attempts: 1,
        });
        assert_eq!(details["details"], PERMANENT_DETAILS);
    }

    #[test]
    fn missing_row_is_tolerated() {
        let finalizer = FailureFinalizer::new(InMemoryJobStore::arc());
        assert!(finalizer.finalize(JobId::new(1), &exhausted()).unwrap().is_none());
        finalizer.on_failure(&TaskMessage::process_job(JobId::new(1)), &exhausted());
    }

    #[test]
    fn completed_job_is_not_overwritten() {
        let store = InMemoryJobStore::arc();
        let job = store.insert(NewJob::new("x", JobPayload::new()).unwrap()).unwrap();
        store.update(job.id, &JobPatch::completed(json!({"ok": true}))).unwrap();

        let finalizer = FailureFinalizer::new(store.clone());
        let kept = finalizer.finalize(job.id, &exhausted()).unwrap().unwrap();
        assert_eq!(kept.status, JobStatus::Completed);
    }

    struct BrokenWrites(Arc<InMemoryJobStore>);

    impl JobStore for BrokenWrites {
        fn insert(&self, job: NewJob) -> Result<Job, JobStoreError> {
            self.0.insert(job)
        }
        fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
            self.0.get(job_id)
        }
        fn list_recent(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
            self.0.list_recent(limit)
        }
        fn update(&self, _job_id: JobId, _patch: &JobPatch) -> Result<Job, JobStoreError> {
            Err(JobStoreError::Unavailable("database went away".to_string()))
        }
        fn lock_job(&self, job_id: JobId) -> Result<Option<JobLock>, JobStoreError> {
            self.0.lock_job(job_id)
        }
    }

    /// Completes the job just before the finalizer's write lands.
    struct CompletesFirst(Arc<InMemoryJobStore>);

    impl JobStore for CompletesFirst {
        fn insert(&self, job: NewJob) -> Result<Job, JobStoreError> {
            self.0.insert(job)
        }
        fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
            self.0.get(job_id)
        }
        fn list_recent(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
            self.0.list_recent(limit)
        }
        fn update(&self, job_id: JobId, patch: &JobPatch) -> Result<Job, JobStoreError> {
            let _ = self.0.update(job_id, &JobPatch::completed(json!({"ok": true})));
            self.0.update(job_id, patch)
        }
        fn lock_job(&self, job_id: JobId) -> Result<Option<JobLock>, JobStoreError> {
            self.0.lock_job(job_id)
        }
    }

    #[test]
    fn concurrent_completion_wins_over_late_failure() {
        let inner = InMemoryJobStore::arc();
        let job = inner.insert(NewJob::new("x", JobPayload::new()).unwrap()).unwrap();
        let finalizer = FailureFinalizer::new(CompletesFirst(inner.clone()));

        let kept = finalizer.finalize(job.id, &exhausted()).unwrap().unwrap();
        assert_eq!(kept.status, JobStatus::Completed);
        assert!(kept.error_message.is_none());
        assert_eq!(inner.get(job.id).unwrap().unwrap(), kept);
    }

    #[test]
    fn store_errors_are_swallowed_by_the_hook() {
        let inner = InMemoryJobStore::arc();
        let job = inner.insert(NewJob::new("x", JobPayload::new()).unwrap()).unwrap();
        let finalizer = FailureFinalizer::new(BrokenWrites(inner.clone()));

        assert!(finalizer.finalize(job.id, &exhausted()).is_err());
        finalizer.on_failure(&TaskMessage::process_job(job.id), &exhausted());
        assert_eq!(inner.get(job.id).unwrap().unwrap().status, JobStatus::Queued);
    }
}
