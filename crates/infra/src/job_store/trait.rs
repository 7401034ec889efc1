use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use jobq_core::{Job, JobId, JobPatch, JobStatus, NewJob};

/// Job store operation error.
///
/// Infrastructure failures only. A missing row on read is `Ok(None)`, not an
/// error; `NotFound` is reserved for writes that target a row which does not
/// exist.
#[derive(Debug, Clone, Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The row already reached `completed` or `failed`; nothing was written.
    #[error("job {job_id} is already {status}")]
    Terminal { job_id: JobId, status: JobStatus },

    /// The backend could not be reached (pool closed, connection refused).
    #[error("job store unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Exclusive processing lease on a single job.
///
/// Held by a worker for the duration of one execution and released when
/// dropped. Two deliveries of the same job can never hold a lease at the same
/// time, which keeps retry bookkeeping from racing.
pub struct JobLock {
    job_id: JobId,
    _lease: Box<dyn Send>,
}

impl JobLock {
    /// Wraps a backend lease; dropping `lease` must release the lock.
    pub fn new(job_id: JobId, lease: impl Send + 'static) -> Self {
        Self {
            job_id,
            _lease: Box::new(lease),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

impl fmt::Debug for JobLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobLock").field("job_id", &self.job_id).finish()
    }
}

/// Durable record of every job.
///
/// Each method is one atomic unit of work against the backend: a failed call
/// leaves no partial write behind, and a successful `update` is visible to
/// every subsequent `get`.
///
/// The trait is synchronous. Backends that talk to async drivers bridge onto
/// their runtime internally; callers on an async executor go through
/// `spawn_blocking`.
pub trait JobStore: Send + Sync {
    /// Persist a new job in `queued` state and assign its id.
    fn insert(&self, job: NewJob) -> Result<Job, JobStoreError>;

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Up to `limit` jobs, highest id first.
    fn list_recent(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Apply one transition and return the record as written.
    ///
    /// Terminal rows are never rewritten: patching a `completed` or `failed`
    /// job fails with `JobStoreError::Terminal`.
    fn update(&self, job_id: JobId, patch: &JobPatch) -> Result<Job, JobStoreError>;

    /// Try to take the processing lease for `job_id` without blocking.
    ///
    /// Returns `Ok(None)` if another holder has it.
    fn lock_job(&self, job_id: JobId) -> Result<Option<JobLock>, JobStoreError>;
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn insert(&self, job: NewJob) -> Result<Job, JobStoreError> {
        (**self).insert(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_recent(limit)
    }

    fn update(&self, job_id: JobId, patch: &JobPatch) -> Result<Job, JobStoreError> {
        (**self).update(job_id, patch)
    }

    fn lock_job(&self, job_id: JobId) -> Result<Option<JobLock>, JobStoreError> {
        (**self).lock_job(job_id)
    }
}
