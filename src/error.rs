use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::warn;

use crate::engine::EngineError;

pub const NO_URL_MESSAGE: &str = "No URL provided";
pub const DOWNLOAD_FAILED_MESSAGE: &str = "Download failed";

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

/// Failure envelope shared by every API operation.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    pub fn missing_url() -> Self {
        Self::bad_request(NO_URL_MESSAGE)
    }

    /// The engine reported success but nothing carrying the job prefix exists.
    pub fn download_missing() -> Self {
        Self::internal(DOWNLOAD_FAILED_MESSAGE)
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        warn!("Extraction engine failed: {error}");
        Self::internal(error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            success: false,
            error: self.message,
        });
        (self.status, body).into_response()
    }
}
