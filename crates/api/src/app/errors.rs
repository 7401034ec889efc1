use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use jobq_core::DomainError;
use jobq_infra::jobs::{DispatchError, QueryError};

/// `{"detail": ...}` with the given status.
pub fn detail_error(status: StatusCode, detail: impl Into<String>) -> Response {
    (status, Json(json!({ "detail": detail.into() }))).into_response()
}

pub fn dispatch_error_to_response(err: DispatchError) -> Response {
    match err {
        DispatchError::Validation(e) => detail_error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
        DispatchError::Store(e) => {
            tracing::error!(error = %e, "job submission failed");
            detail_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        err @ DispatchError::BrokerUnavailable { job_id, .. } => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "detail": err.to_string(),
                "job_id": job_id,
            })),
        )
            .into_response(),
    }
}

pub fn query_error_to_response(err: QueryError) -> Response {
    match err {
        QueryError::NotFound(_) => detail_error(StatusCode::NOT_FOUND, err.to_string()),
        QueryError::Store(e) => {
            tracing::error!(error = %e, "job query failed");
            detail_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Domain errors at the HTTP edge are all input problems.
pub fn domain_error_to_response(err: DomainError) -> Response {
    detail_error(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
}

/// Malformed bodies are 422; a missing JSON content type stays 415.
pub fn json_rejection_to_response(rejection: JsonRejection) -> Response {
    let status = match rejection {
        JsonRejection::MissingJsonContentType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    };
    detail_error(status, rejection.body_text())
}

pub fn path_rejection_to_response(rejection: PathRejection) -> Response {
    detail_error(StatusCode::UNPROCESSABLE_ENTITY, rejection.body_text())
}

pub fn query_rejection_to_response(rejection: QueryRejection) -> Response {
    detail_error(StatusCode::UNPROCESSABLE_ENTITY, rejection.body_text())
}

/// A blocking task panicked or was cancelled.
pub fn join_error_to_response(err: tokio::task::JoinError) -> Response {
    tracing::error!(error = %err, "blocking task failed");
    detail_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}
