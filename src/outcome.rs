//! Classification of a finished upload into a single outcome, and the
//! response each outcome produces.

use crate::error::UploadError;
use crate::http::Response;
use crate::storage::StoredFile;
use log::{error, info, warn};
use serde::Serialize;

pub const SIZE_EXCEEDED_MESSAGE: &str = "File too large";
pub const IO_FAILURE_MESSAGE: &str = "Internal server error";

/// Exactly one per upload request.
#[derive(Debug)]
pub enum UploadOutcome {
    Success(StoredFile),
    ValidationRejected(String),
    SizeExceeded { limit: u64 },
    MalformedRequest(String),
    /// The client is gone; nothing may be written back.
    Aborted,
    /// Local fault. The detail is for logs only.
    IoFailure(String),
}

#[derive(Serialize)]
struct SuccessBody<'a> {
    message: &'static str,
    filename: &'a str,
    size: u64,
}

impl From<UploadError> for UploadOutcome {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::ValidationRejected(reason) => UploadOutcome::ValidationRejected(reason),
            UploadError::SizeExceeded { limit } => UploadOutcome::SizeExceeded { limit },
            UploadError::MalformedRequest(reason) => UploadOutcome::MalformedRequest(reason),
            UploadError::Aborted => UploadOutcome::Aborted,
            UploadError::Io(e) => UploadOutcome::IoFailure(e.to_string()),
        }
    }
}

impl From<Result<StoredFile, UploadError>> for UploadOutcome {
    fn from(result: Result<StoredFile, UploadError>) -> Self {
        match result {
            Ok(stored) => UploadOutcome::Success(stored),
            Err(err) => err.into(),
        }
    }
}

impl UploadOutcome {
    /// Status code sent for this outcome, `None` when nothing is sent.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            UploadOutcome::Success(_) => Some(200),
            UploadOutcome::ValidationRejected(_)
            | UploadOutcome::SizeExceeded { .. }
            | UploadOutcome::MalformedRequest(_) => Some(400),
            UploadOutcome::Aborted => None,
            UploadOutcome::IoFailure(_) => Some(500),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, UploadOutcome::Success(_))
    }

    /// Log the outcome at a level matching its severity.
    pub fn log(&self, log_prefix: &str) {
        match self {
            UploadOutcome::Success(stored) => info!(
                "{log_prefix} Stored '{}' ({})",
                stored.stored_name,
                crate::utils::format_bytes(stored.size)
            ),
            UploadOutcome::ValidationRejected(reason) => {
                info!("{log_prefix} Upload rejected: {reason}")
            }
            UploadOutcome::SizeExceeded { limit } => info!(
                "{log_prefix} Upload rejected: larger than {}",
                crate::utils::format_bytes(*limit)
            ),
            UploadOutcome::MalformedRequest(reason) => {
                info!("{log_prefix} Malformed upload request: {reason}")
            }
            UploadOutcome::Aborted => {
                warn!("{log_prefix} Client disconnected mid-upload, no response sent")
            }
            UploadOutcome::IoFailure(detail) => {
                error!("{log_prefix} Upload failed: {detail}")
            }
        }
    }

    /// The response for this outcome. Never carries filesystem paths.
    pub fn into_response(self) -> Option<Response> {
        let response = match self {
            UploadOutcome::Success(stored) => Response::json(
                200,
                &SuccessBody {
                    message: "success",
                    filename: &stored.stored_name,
                    size: stored.size,
                },
            ),
            UploadOutcome::ValidationRejected(reason) => Response::error(400, &reason),
            UploadOutcome::SizeExceeded { .. } => Response::error(400, SIZE_EXCEEDED_MESSAGE),
            UploadOutcome::MalformedRequest(reason) => Response::error(400, &reason),
            UploadOutcome::Aborted => return None,
            UploadOutcome::IoFailure(_) => Response::error(500, IO_FAILURE_MESSAGE),
        };
        Some(response)
    }
}
