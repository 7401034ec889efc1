//! Read side: job status lookups and the recent-jobs listing.

use thiserror::Error;

use jobq_core::{Job, JobId};

use crate::job_store::{JobStore, JobStoreError};

/// Largest page the recent-jobs listing returns.
pub const MAX_RECENT_JOBS: usize = 50;

#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error("Job with ID {0} not found.")]
    NotFound(JobId),

    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Read-only view over the job store.
pub struct JobQueries<S: JobStore> {
    store: S,
}

impl<S: JobStore> JobQueries<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn get(&self, job_id: JobId) -> Result<Job, QueryError> {
        self.store.get(job_id)?.ok_or(QueryError::NotFound(job_id))
    }

    /// Most recent jobs first. `limit` is clamped to `1..=MAX_RECENT_JOBS`.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<Job>, QueryError> {
        let limit = limit.clamp(1, MAX_RECENT_JOBS);
        Ok(self.store.list_recent(limit)?)
    }
}
