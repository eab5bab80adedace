use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error;
use validator::ValidationErrors;

use crate::dao::storage::StorageError;

/// Failures of the server-side progress operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The installed progress store rejected or failed the operation.
    #[error("progress store failure")]
    Store(#[source] StorageError),
    /// No progress store is installed yet.
    #[error("no progress store installed (degraded mode)")]
    Degraded,
    /// Malformed key or save payload.
    #[error("invalid progress request: {0}")]
    InvalidInput(String),
    /// Nothing was ever saved for this key.
    #[error("no progress saved for `{user_id}` in `{activity_type}`")]
    NotFound {
        /// Owner of the missing record.
        user_id: String,
        /// Activity of the missing record.
        activity_type: String,
    },
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        ServiceError::Store(err)
    }
}

impl From<ValidationErrors> for ServiceError {
    fn from(err: ValidationErrors) -> Self {
        ServiceError::InvalidInput(err.to_string())
    }
}

/// Errors rendered as HTTP responses with a `{ "message": ... }` body.
#[derive(Debug, Error)]
pub enum AppError {
    /// Payload or path failed validation.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Missing bearer token.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Nothing saved for the requested key.
    #[error("not found: {0}")]
    NotFound(String),
    /// Concurrent writers kept racing on the same record; the client may retry.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Store missing or failing.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Store(source @ StorageError::Contended { .. }) => {
                AppError::Conflict(source.to_string())
            }
            ServiceError::Store(source) => AppError::ServiceUnavailable(source.to_string()),
            ServiceError::Degraded => AppError::ServiceUnavailable("degraded mode".into()),
            ServiceError::InvalidInput(message) => AppError::BadRequest(message),
            err @ ServiceError::NotFound { .. } => AppError::NotFound(err.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let payload = Json(ErrorBody {
            message: self.to_string(),
        });

        (status, payload).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("connection reset")]
    struct Reset;

    #[test]
    fn service_errors_map_onto_status_codes() {
        let cases = [
            (
                ServiceError::from(StorageError::unavailable("test", Reset)),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ServiceError::from(StorageError::Contended {
                    key: "ada::quiz".into(),
                    attempts: 5,
                }),
                StatusCode::CONFLICT,
            ),
            (ServiceError::Degraded, StatusCode::SERVICE_UNAVAILABLE),
            (
                ServiceError::InvalidInput("empty".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                ServiceError::NotFound {
                    user_id: "ada".into(),
                    activity_type: "quiz".into(),
                },
                StatusCode::NOT_FOUND,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(AppError::from(err).into_response().status(), expected);
        }
    }

    #[test]
    fn not_found_message_names_the_key() {
        let err = AppError::from(ServiceError::NotFound {
            user_id: "ada".into(),
            activity_type: "quiz".into(),
        });
        assert_eq!(err.to_string(), "not found: no progress saved for `ada` in `quiz`");
    }
}
