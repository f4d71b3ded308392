use crate::services::upload_service::UploadError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Map, Value, json};
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
///
/// `details` carries structured fields (counts, digests) merged into the
/// JSON body next to `error` and `status`.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub details: Map<String, Value>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            details: Map::new(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Attach a structured field to the error body.
    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = self.details;
        body.insert("error".into(), json!(self.message));
        body.insert("status".into(), json!(self.status.as_u16()));

        (self.status, Json(Value::Object(body))).into_response()
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let message = err.to_string();
        match err {
            UploadError::SessionNotFound(_) => AppError::not_found(message),
            UploadError::InvalidRequest(_) => AppError::bad_request(message),
            UploadError::IncompleteUpload {
                received,
                total,
                missing,
            } => AppError::bad_request(message)
                .with_detail("chunksReceived", received)
                .with_detail("totalChunks", total)
                .with_detail("missingChunks", missing),
            UploadError::ChecksumMismatch {
                chunk_index,
                expected,
                actual,
            } => {
                let err = AppError::new(StatusCode::UNPROCESSABLE_ENTITY, message)
                    .with_detail("checksumValid", false)
                    .with_detail("expectedSha256", expected)
                    .with_detail("actualSha256", actual);
                match chunk_index {
                    Some(index) => err.with_detail("chunkIndex", index),
                    None => err,
                }
            }
            UploadError::ConflictingOperation(_) => AppError::new(StatusCode::CONFLICT, message),
            UploadError::StorageIo(_) | UploadError::DuplicateUploadId(_) => {
                tracing::error!("upload failed: {}", message);
                AppError::internal(message)
            }
        }
    }
}
