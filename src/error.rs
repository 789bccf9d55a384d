use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the HTTP entry point and startup wiring
#[derive(Error, Debug)]
pub enum AppError {
    /// Record store refused a read or write
    #[error("Record store error: {0}")]
    Store(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Request body failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Outgoing message could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Broker unreachable or connection dropped
    #[error("Messaging connection error: {0}")]
    MessagingConnection(String),

    /// Broker refused the message
    #[error("Messaging error: {0}")]
    Messaging(String),
}

impl AppError {
    fn classify(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            AppError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR"),
            AppError::Configuration(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "CONFIGURATION_ERROR")
            }
            AppError::Serialization(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "SERIALIZATION_ERROR")
            }
            AppError::MessagingConnection(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "MESSAGING_UNAVAILABLE")
            }
            AppError::Messaging(_) => (StatusCode::BAD_GATEWAY, "MESSAGING_ERROR"),
        }
    }

    /// HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        self.classify().0
    }

    /// Stable machine-readable code used in the response body
    pub fn error_code(&self) -> &'static str {
        self.classify().1
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.classify();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(error_code = code, status = status.as_u16(), %message, "Request failed");
        } else {
            tracing::debug!(error_code = code, status = status.as_u16(), %message, "Request rejected");
        }

        let body = json!({
            "error": {
                "code": code,
                "message": message,
                "status": status.as_u16(),
            }
        });
        (status, Json(body)).into_response()
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Validation(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
