use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;

use jobq_core::{Job, JobId, JobPatch, NewJob};

use super::r#trait::{JobLock, JobStore, JobStoreError};

/// In-memory job store.
///
/// Intended for tests/dev. Ids start at 1 and are never reused.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<BTreeMap<JobId, Job>>,
    last_id: AtomicI64,
    leases: Arc<Mutex<HashSet<JobId>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> JobStoreError {
    JobStoreError::Storage("in-memory job store lock poisoned".to_string())
}

struct InMemoryLease {
    job_id: JobId,
    leases: Arc<Mutex<HashSet<JobId>>>,
}

impl Drop for InMemoryLease {
    fn drop(&mut self) {
        if let Ok(mut held) = self.leases.lock() {
            held.remove(&self.job_id);
        }
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, job: NewJob) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let id = JobId::new(self.last_id.fetch_add(1, Ordering::SeqCst) + 1);
        let job = Job::queued(id, job, Utc::now());
        jobs.insert(id, job.clone());
        Ok(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs.get(&job_id).cloned())
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs.values().rev().take(limit).cloned().collect())
    }

    fn update(&self, job_id: JobId, patch: &JobPatch) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.status.is_terminal() {
            return Err(JobStoreError::Terminal {
                job_id,
                status: job.status,
            });
        }
        job.apply(patch, Utc::now());
        Ok(job.clone())
    }

    fn lock_job(&self, job_id: JobId) -> Result<Option<JobLock>, JobStoreError> {
        let mut held = self.leases.lock().map_err(|_| poisoned())?;
        if !held.insert(job_id) {
            return Ok(None);
        }
        let lease = InMemoryLease {
            job_id,
            leases: Arc::clone(&self.leases),
        };
        Ok(Some(JobLock::new(job_id, lease)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobq_core::{JobPayload, JobStatus};
    use serde_json::json;

    fn new_job(job_type: &str) -> NewJob {
        NewJob::new(job_type, JobPayload::new()).unwrap()
    }

    #[test]
    fn insert_assigns_increasing_ids_and_queued_state() {
        let store = InMemoryJobStore::new();
        let a = store.insert(new_job("a")).unwrap();
        let b = store.insert(new_job("b")).unwrap();

        assert_eq!(a.id, JobId::new(1));
        assert_eq!(b.id, JobId::new(2));
        assert_eq!(a.status, JobStatus::Queued);
        assert_eq!(a.retries, 0);
        assert!(a.result.is_none() && a.error_message.is_none());
    }

    #[test]
    fn list_recent_is_newest_first_and_limited() {
        let store = InMemoryJobStore::new();
        for i in 0..5 {
            store.insert(new_job(&format!("t{i}"))).unwrap();
        }

        let ids: Vec<i64> = store
            .list_recent(3)
            .unwrap()
            .into_iter()
            .map(|j| j.id.get())
            .collect();
        assert_eq!(ids, vec![5, 4, 3]);
        assert!(store.list_recent(0).unwrap().is_empty());
    }

    #[test]
    fn update_applies_patch_and_reports_missing_rows() {
        let store = InMemoryJobStore::new();
        let job = store.insert(new_job("x")).unwrap();

        let updated = store.update(job.id, &JobPatch::retry_scheduled()).unwrap();
        assert_eq!(updated.status, JobStatus::Retrying);
        assert_eq!(updated.retries, 1);
        assert!(updated.updated_at >= job.updated_at);

        let done = store.update(job.id, &JobPatch::completed(json!({"ok": 1}))).unwrap();
        assert_eq!(store.get(job.id).unwrap(), Some(done));

        let err = store.update(JobId::new(99), &JobPatch::claim(0)).unwrap_err();
        assert!(matches!(err, JobStoreError::NotFound(id) if id.get() == 99));
        assert!(store.get(JobId::new(99)).unwrap().is_none());
    }

    #[test]
    fn terminal_rows_refuse_further_updates() {
        let store = InMemoryJobStore::new();
        let job = store.insert(new_job("x")).unwrap();
        store
            .update(job.id, &JobPatch::failed(json!({"error": "boom"})))
            .unwrap();

        let err = store
            .update(job.id, &JobPatch::completed(json!({"ok": 1})))
            .unwrap_err();
        assert!(matches!(
            err,
            JobStoreError::Terminal { job_id, status: JobStatus::Failed } if job_id == job.id
        ));

        let kept = store.get(job.id).unwrap().unwrap();
        assert_eq!(kept.status, JobStatus::Failed);
        assert!(kept.result.is_none());
        assert_eq!(kept.error_message, Some(json!({"error": "boom"})));
    }

    #[test]
    fn lock_job_is_exclusive_until_dropped() {
        let store = InMemoryJobStore::new();
        let id = JobId::new(1);

        let lock = store.lock_job(id).unwrap().expect("first lease");
        assert_eq!(lock.job_id(), id);
        assert!(store.lock_job(id).unwrap().is_none());
        assert!(store.lock_job(JobId::new(2)).unwrap().is_some());

        drop(lock);
        assert!(store.lock_job(id).unwrap().is_some());
    }
}
