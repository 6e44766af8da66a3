// SPDX-License-Identifier: MIT

use thiserror::Error;

/// Server-level failures: bootstrap, configuration and HTTP framing.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Request headers too large")]
    HeadersTooLarge,
    #[error("Upload directory unavailable: {0}")]
    UploadDirectory(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Internal server error: {0}")]
    InternalServerError(String),
}

impl AppError {
    pub fn bad_request<S: Into<String>>(reason: S) -> Self {
        AppError::BadRequest(reason.into())
    }

    pub fn invalid_configuration<S: Into<String>>(reason: S) -> Self {
        AppError::InvalidConfiguration(reason.into())
    }

    /// HTTP status for errors raised before a handler takes over the request.
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            AppError::BadRequest(_) => (400, "Bad Request"),
            AppError::HeadersTooLarge => (431, "Request Header Fields Too Large"),
            _ => (500, "Internal Server Error"),
        }
    }
}

/// Failures of the upload pipeline. Each variant maps onto exactly one
/// non-success [`UploadOutcome`](crate::outcome::UploadOutcome).
#[derive(Debug, Error)]
pub enum UploadError {
    /// The declared part metadata violates an upload constraint.
    #[error("{0}")]
    ValidationRejected(String),
    /// The file grew past the configured ceiling while streaming.
    #[error("file exceeds the {limit} byte upload limit")]
    SizeExceeded { limit: u64 },
    /// The client went away before the upload completed.
    #[error("client disconnected before the upload completed")]
    Aborted,
    /// Not multipart, no file part, or broken multipart framing.
    #[error("malformed upload request: {0}")]
    MalformedRequest(String),
    #[error("storage failure: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    pub fn rejected<S: Into<String>>(reason: S) -> Self {
        UploadError::ValidationRejected(reason.into())
    }

    pub fn malformed<S: Into<String>>(reason: S) -> Self {
        UploadError::MalformedRequest(reason.into())
    }
}
