use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use wayfare_core::CoreError;

/// Errors of the admin HTTP surface.
#[derive(Debug)]
pub enum AppError {
    ValidationError(String),
    NotFoundError(String),
    ConflictError(String),
    UnavailableError(String),
    InternalServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFoundError(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::ConflictError(msg) => (StatusCode::CONFLICT, msg),
            AppError::UnavailableError(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidTransaction(..) | CoreError::TransactionAborted(..) | CoreError::TransactionTimedOut(_) => {
                AppError::ConflictError(err.to_string())
            }
            CoreError::Unavailable(_) => AppError::UnavailableError(err.to_string()),
            CoreError::Protocol(_) => AppError::ValidationError(err.to_string()),
            CoreError::Journal(_) | CoreError::Internal(_) => AppError::InternalServerError(err.to_string()),
        }
    }
}

impl From<prometheus::Error> for AppError {
    fn from(err: prometheus::Error) -> Self {
        AppError::InternalServerError(err.to_string())
    }
}
