use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use palaver_chat::SubmitError;
use palaver_persist::PersistError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Thread not found: {0}")]
    ThreadNotFound(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Please wait for the model to finish its response")]
    AlreadyStreaming,

    #[error("Daily message limit of {limit} reached")]
    QuotaExceeded { limit: u32, reset_at: DateTime<Utc> },

    #[error("Persistence error: {0}")]
    Persist(PersistError),

    #[error("Provider error: {0}")]
    Provider(String),
}

impl From<PersistError> for ApiError {
    fn from(err: PersistError) -> Self {
        match err {
            PersistError::ThreadNotFound(id) => ApiError::ThreadNotFound(id),
            PersistError::ProjectNotFound(id) => ApiError::ProjectNotFound(id),
            other => ApiError::Persist(other),
        }
    }
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::EmptyInput => ApiError::BadRequest(err.to_string()),
            SubmitError::AlreadyStreaming => ApiError::AlreadyStreaming,
            SubmitError::QuotaExceeded { limit, reset_at } => {
                ApiError::QuotaExceeded { limit, reset_at }
            }
            SubmitError::MessageNotFound(id) => ApiError::MessageNotFound(id),
            SubmitError::NotEditable(_) => ApiError::BadRequest(err.to_string()),
            SubmitError::Store(e) => e.into(),
            SubmitError::Provider(msg) => ApiError::Provider(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::ThreadNotFound(_)
            | ApiError::ProjectNotFound(_)
            | ApiError::MessageNotFound(_) => {
                (StatusCode::NOT_FOUND, json!({ "error": self.to_string() }))
            }
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, json!({ "error": self.to_string() })),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, json!({ "error": self.to_string() })),
            ApiError::AlreadyStreaming => (StatusCode::CONFLICT, json!({ "error": self.to_string() })),
            ApiError::QuotaExceeded { limit, reset_at } => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({
                    "error": self.to_string(),
                    "limit": limit,
                    "reset_at": reset_at,
                }),
            ),
            ApiError::Persist(ref e) => {
                tracing::error!("Persistence error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": "Storage error" }))
            }
            ApiError::Provider(ref msg) => {
                tracing::error!("Provider error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": "Model provider error" }))
            }
        };

        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: impl Into<ApiError>) -> StatusCode {
        err.into().into_response().status()
    }

    #[test]
    fn test_submit_errors_map_to_status() {
        assert_eq!(status_of(SubmitError::EmptyInput), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(SubmitError::AlreadyStreaming), StatusCode::CONFLICT);
        assert_eq!(
            status_of(SubmitError::QuotaExceeded {
                limit: 20,
                reset_at: Utc::now()
            }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_of(SubmitError::MessageNotFound("m".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(SubmitError::Provider("boom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_persist_errors_map_to_status() {
        assert_eq!(
            status_of(PersistError::ThreadNotFound("t".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(SubmitError::Store(PersistError::ThreadNotFound("t".into()))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(PersistError::Internal("disk".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(ApiError::Forbidden("t".into())),
            StatusCode::FORBIDDEN
        );
    }
}
