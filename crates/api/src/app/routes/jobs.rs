use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Extension, Path, Query,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;

use jobq_core::JobId;
use jobq_infra::jobs::MAX_RECENT_JOBS;

use crate::app::dto::{JobResponse, SubmitJobRequest, SubmitJobResponse};
use crate::app::errors;
use crate::app::services::AppServices;

pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<SubmitJobRequest>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };

    let submitted =
        tokio::task::spawn_blocking(move || services.submit(&body.job_type, body.payload)).await;

    match submitted {
        Ok(Ok(job)) => (StatusCode::CREATED, Json(SubmitJobResponse::from(job))).into_response(),
        Ok(Err(e)) => errors::dispatch_error_to_response(e),
        Err(e) => errors::join_error_to_response(e),
    }
}

pub async fn job_status(
    Extension(services): Extension<Arc<AppServices>>,
    path: Result<Path<String>, PathRejection>,
) -> Response {
    let raw = match path {
        Ok(Path(raw)) => raw,
        Err(rejection) => return errors::path_rejection_to_response(rejection),
    };
    let job_id = match JobId::from_str(&raw) {
        Ok(id) => id,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match tokio::task::spawn_blocking(move || services.job(job_id)).await {
        Ok(Ok(job)) => Json(JobResponse::from(job)).into_response(),
        Ok(Err(e)) => errors::query_error_to_response(e),
        Err(e) => errors::join_error_to_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub limit: Option<usize>,
}

/// Most recent jobs first, at most `MAX_RECENT_JOBS`.
pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    query: Result<Query<ListJobsQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return errors::query_rejection_to_response(rejection),
    };
    let limit = query.limit.unwrap_or(MAX_RECENT_JOBS);

    match tokio::task::spawn_blocking(move || services.recent_jobs(limit)).await {
        Ok(Ok(jobs)) => {
            Json(jobs.into_iter().map(JobResponse::from).collect::<Vec<_>>()).into_response()
        }
        Ok(Err(e)) => errors::query_error_to_response(e),
        Err(e) => errors::join_error_to_response(e),
    }
}
