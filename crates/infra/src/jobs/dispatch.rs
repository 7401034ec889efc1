//! Submission path: persist, then enqueue.

use serde_json::json;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use jobq_core::{DomainError, JobId, JobPatch, JobPayload, JobStatus, NewJob};

use crate::job_store::{JobStore, JobStoreError};
use crate::task_queue::{TaskBroker, TaskMessage};

/// Accepted submission as reported back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedJob {
    pub id: JobId,
    pub job_type: String,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Validation(#[from] DomainError),

    /// Nothing was persisted.
    #[error("could not persist job: {0}")]
    Store(#[from] JobStoreError),

    /// The job row exists (now `failed`) but no task was queued.
    #[error("Job saved but failed to queue to worker. Error: {reason}")]
    BrokerUnavailable { job_id: JobId, reason: String },
}

/// Persists new jobs and hands them to the broker.
///
/// The row is always written before the task is queued, so a worker can never
/// receive a task for a job it cannot find.
pub struct DispatchGate<S: JobStore, B: TaskBroker> {
    store: S,
    broker: B,
}

impl<S: JobStore, B: TaskBroker> DispatchGate<S, B> {
    pub fn new(store: S, broker: B) -> Self {
        Self { store, broker }
    }

    #[instrument(skip(self, payload), fields(queue = self.broker.queue_name()), err)]
    pub fn submit(&self, job_type: &str, payload: JobPayload) -> Result<SubmittedJob, DispatchError> {
        let new_job = NewJob::new(job_type, payload)?;
        let job = self.store.insert(new_job)?;

        if let Err(e) = self.broker.enqueue(TaskMessage::process_job(job.id)) {
            let reason = e.to_string();
            warn!(job_id = %job.id, error = %reason, "broker rejected task; failing job");

            let patch = JobPatch::failed(json!({
                "error": "Queue Connection Error",
                "details": reason,
            }));
            if let Err(store_err) = self.store.update(job.id, &patch) {
                error!(job_id = %job.id, error = %store_err, "could not mark undispatched job as failed");
            }

            return Err(DispatchError::BrokerUnavailable {
                job_id: job.id,
                reason,
            });
        }

        info!(job_id = %job.id, job_type = %job.job_type, "job queued");
        Ok(SubmittedJob {
            id: job.id,
            job_type: job.job_type,
            status: JobStatus::Queued,
        })
    }
}
