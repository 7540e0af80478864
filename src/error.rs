//! HTTP-facing error type. Service errors convert into it and render as
//! `{"error": "..."}` with a matching status code.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::services::accounts::AccountError;
use crate::services::generator::GenerationError;
use crate::services::manifest::ManifestError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Subscription required")]
    SubscriptionRequired,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl From<AccountError> for AppError {
    fn from(err: AccountError) -> Self {
        match err {
            AccountError::EmailTaken => AppError::Conflict(err.to_string()),
            AccountError::InvalidCredentials | AccountError::InvalidSession => {
                AppError::Unauthorized(err.to_string())
            }
            AccountError::UserNotFound(_) | AccountError::UnknownEmail => {
                AppError::NotFound(err.to_string())
            }
            AccountError::Store(_) => AppError::Internal(err.to_string()),
            AccountError::InvalidEmail
            | AccountError::WeakPassword
            | AccountError::MissingName
            | AccountError::InvalidResetToken => AppError::BadRequest(err.to_string()),
        }
    }
}

impl From<ManifestError> for AppError {
    fn from(err: ManifestError) -> Self {
        match err {
            ManifestError::InvalidId(_) => AppError::BadRequest(err.to_string()),
            ManifestError::NotFound(_) => AppError::NotFound(err.to_string()),
            _ => AppError::Internal(err.to_string()),
        }
    }
}

impl From<GenerationError> for AppError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::InvalidRequest(msg) => AppError::BadRequest(msg),
            GenerationError::Manifest(inner) => inner.into(),
            GenerationError::Planning(_) => AppError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::SubscriptionRequired => StatusCode::PAYMENT_REQUIRED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("{}", self);
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
