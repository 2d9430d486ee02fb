use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Why an upload was rejected as bad input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputProblem {
    /// Empty buffer or no filename.
    Missing,
    /// Bytes could not be decoded as an image.
    Corrupt,
}

impl fmt::Display for InputProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputProblem::Missing => f.write_str("no file provided"),
            InputProblem::Corrupt => f.write_str("corrupt or unreadable image"),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ClassificationFailure {
    #[error("invalid input: {0}")]
    InvalidInput(InputProblem),
    #[error("unsupported image format: {extension:?}")]
    UnsupportedFormat { extension: String },
    #[error("model is currently unavailable")]
    ModelUnavailable,
    #[error("internal error: {0}")]
    InternalError(String),
}

/// Error returned from HTTP handlers. Only `message` ever reaches the client.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::warn!("Bad request: {}", message);
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized")
    }

    /// Logs `detail` and answers with a generic 500.
    pub fn internal(detail: impl fmt::Display, public: &str) -> Self {
        tracing::error!("Internal error: {}", detail);
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, public)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<ClassificationFailure> for ApiError {
    fn from(failure: ClassificationFailure) -> Self {
        match failure {
            ClassificationFailure::InvalidInput(InputProblem::Missing) => {
                Self::bad_request("No file uploaded")
            }
            ClassificationFailure::InvalidInput(InputProblem::Corrupt) => {
                tracing::warn!("Rejected undecodable image");
                Self::new(StatusCode::UNSUPPORTED_MEDIA_TYPE, "Invalid image format")
            }
            ClassificationFailure::UnsupportedFormat { extension } => {
                tracing::warn!(%extension, "Rejected file extension");
                Self::new(
                    StatusCode::UNSUPPORTED_MEDIA_TYPE,
                    "Unsupported file type, expected jpg, jpeg or png",
                )
            }
            ClassificationFailure::ModelUnavailable => {
                tracing::error!("Prediction requested while model is not ready");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Model is currently unavailable",
                )
            }
            ClassificationFailure::InternalError(detail) => {
                Self::internal(detail, "An error occurred while processing the image")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}
