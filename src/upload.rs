//! Upload orchestration.
//!
//! One request is handled front to back without buffering the payload:
//! locate the designated file part in the multipart stream, check its
//! declared content type, then hand the part reader to the
//! [`StreamingWriter`], which enforces the size ceiling and watches the
//! abort signal while it copies. Every failure is folded into an
//! [`UploadOutcome`].
//!
//! # Example Usage
//! ```rust,no_run
//! use zipdrop::config::Config;
//! use zipdrop::http::Request;
//! use zipdrop::upload::UploadHandler;
//!
//! let handler = UploadHandler::new(&Config::default());
//! let mut request = Request::from_parts("POST", "/api/upload", &[], Vec::new());
//! let outcome = handler.handle(&mut request);
//! assert!(!outcome.is_success());
//! ```

use crate::config::Config;
use crate::error::UploadError;
use crate::http::Request;
use crate::lifecycle::AbortSignal;
use crate::multipart::{MultipartConfig, MultipartReader, extract_boundary};
use crate::outcome::UploadOutcome;
use crate::storage::{StoredFile, StreamingWriter};
use crate::validation::ValidationFilter;
use chrono::Utc;
use log::{debug, info};
use std::path::Path;
use std::time::Instant;

/// Room left for boundaries, part headers and small form fields when a
/// declared `Content-Length` is compared against the file ceiling.
const MULTIPART_OVERHEAD_ALLOWANCE: u64 = 1024 * 1024;

pub struct UploadHandler {
    writer: StreamingWriter,
    filter: ValidationFilter,
    field_name: String,
    multipart_config: MultipartConfig,
}

impl UploadHandler {
    /// `config.upload_dir` is used as is; the server resolves and creates it
    /// before building the handler.
    pub fn new(config: &Config) -> Self {
        Self {
            writer: StreamingWriter::new(config.upload_dir.clone(), config.chunk_size),
            filter: ValidationFilter::new(&config.allowed_mime_types, config.max_file_size),
            field_name: config.file_field.clone(),
            multipart_config: MultipartConfig::default(),
        }
    }

    pub fn upload_dir(&self) -> &Path {
        self.writer.directory()
    }

    /// Largest declared body an upload may carry before it is refused
    /// without being read.
    pub fn max_request_body(&self) -> u64 {
        self.filter
            .max_file_size()
            .saturating_add(MULTIPART_OVERHEAD_ALLOWANCE)
    }

    pub fn handle(&self, request: &mut Request<'_>) -> UploadOutcome {
        let log_prefix = request.log_prefix();
        info!(
            "{log_prefix} Upload started ({} bytes declared, user-agent: {})",
            request.body.remaining(),
            request.user_agent().unwrap_or("-")
        );

        let started = Instant::now();
        let outcome = UploadOutcome::from(self.receive(request));
        outcome.log(&log_prefix);
        debug!(
            "{log_prefix} Upload handled in {}ms",
            started.elapsed().as_millis()
        );
        outcome
    }

    fn receive(&self, request: &mut Request<'_>) -> Result<StoredFile, UploadError> {
        let signal = request.body.signal().clone();

        let content_type = request
            .header("content-type")
            .ok_or_else(|| UploadError::malformed("Expected a multipart/form-data body"))?;
        let boundary = extract_boundary(content_type)?;

        // A declared length far past the ceiling cannot hold an acceptable file
        let declared = request.body.remaining();
        if declared > self.max_request_body() {
            return Err(UploadError::SizeExceeded {
                limit: self.filter.max_file_size(),
            });
        }

        let mut parser = MultipartReader::new(
            &mut request.body,
            &boundary,
            self.multipart_config.clone(),
        )?;

        loop {
            let Some(mut part) = parser
                .next_part()
                .map_err(|e| escalate_abort(e, &signal))?
            else {
                return Err(UploadError::malformed(format!(
                    "No file part named '{}'",
                    self.field_name
                )));
            };

            if part.field_name() != self.field_name || !part.is_file() {
                debug!("Skipping form part '{}'", part.field_name());
                continue;
            }

            self.filter.check_content_type(part.content_type())?;

            let declared_name = part.filename().unwrap_or_default().to_string();
            debug!(
                "Receiving '{declared_name}' ({})",
                part.content_type().unwrap_or("-")
            );
            // Only the first matching part is stored
            return self.writer.persist(
                &declared_name,
                Utc::now(),
                &mut part,
                &self.filter,
                &signal,
            );
        }
    }
}

/// A parse failure caused by the connection dropping is an abort, whatever
/// the parser made of the missing bytes.
fn escalate_abort(err: UploadError, signal: &AbortSignal) -> UploadError {
    if signal.is_aborted() {
        UploadError::Aborted
    } else {
        err
    }
}
