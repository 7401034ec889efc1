use axum::{
    routing::{get, post},
    Router,
};

pub mod jobs;
pub mod system;

/// Job endpoints. The listing answers with and without the trailing slash.
pub fn jobs_router() -> Router {
    Router::new()
        .route("/jobs", get(jobs::list_jobs))
        .route("/jobs/", get(jobs::list_jobs))
        .route("/jobs/submit", post(jobs::submit_job))
        .route("/jobs/status/:job_id", get(jobs::job_status))
}
