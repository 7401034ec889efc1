use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use jobq_core::{Job, JobId, JobPayload, JobStatus};
use jobq_infra::jobs::SubmittedJob;

pub const SUBMIT_ACCEPTED_MESSAGE: &str = "Job received successfully";
pub const WELCOME_MESSAGE: &str = "Welcome to the Job Queue Service!";

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitJobRequest {
    pub job_type: String,
    pub payload: JobPayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitJobResponse {
    pub message: &'static str,
    pub job_id: JobId,
    pub job_type: String,
    pub status: JobStatus,
}

impl From<SubmittedJob> for SubmitJobResponse {
    fn from(job: SubmittedJob) -> Self {
        Self {
            message: SUBMIT_ACCEPTED_MESSAGE,
            job_id: job.id,
            job_type: job.job_type,
            status: job.status,
        }
    }
}

/// Job record as returned by the status and listing endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct JobResponse {
    pub job_id: JobId,
    pub job_type: String,
    pub status: JobStatus,
    pub retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result: Option<JsonValue>,
    pub error_message: Option<JsonValue>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type,
            status: job.status,
            retries: job.retries,
            created_at: job.created_at,
            updated_at: job.updated_at,
            result: job.result,
            error_message: job.error_message,
        }
    }
}
