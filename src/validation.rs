//! Upload validation: declared content type and running size checks.
//!
//! Both checks are pure. The content-type check runs once, on the
//! client-declared MIME type, before the first byte is persisted; nothing
//! sniffs the actual content, so a mislabeled file passes. The size check
//! runs before every chunk is written.

use crate::error::UploadError;

pub const DEFAULT_ALLOWED_MIME_TYPES: [&str; 2] =
    ["application/zip", "application/x-zip-compressed"];

/// 800 MiB
pub const DEFAULT_MAX_FILE_SIZE: u64 = 800 * 1024 * 1024;

pub const REJECTED_TYPE_MESSAGE: &str = "Only ZIP archives may be uploaded";

#[derive(Debug, Clone)]
pub struct ValidationFilter {
    allowed_mime_types: Vec<String>,
    max_file_size: u64,
}

impl ValidationFilter {
    pub fn new<I, S>(allowed_mime_types: I, max_file_size: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed_mime_types: allowed_mime_types
                .into_iter()
                .map(|m| m.as_ref().trim().to_ascii_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
            max_file_size,
        }
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Accept only part content types in the allow-set. Parameters such as
    /// `; charset=binary` are ignored and the comparison is case-insensitive.
    pub fn check_content_type(&self, declared: Option<&str>) -> Result<(), UploadError> {
        let essence = declared
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_ascii_lowercase())
            .unwrap_or_default();

        if self.allowed_mime_types.iter().any(|m| *m == essence) {
            Ok(())
        } else {
            Err(UploadError::rejected(REJECTED_TYPE_MESSAGE))
        }
    }

    /// Reject once the cumulative byte count passes the ceiling. Callers pass
    /// the total *including* the chunk about to be written.
    pub fn check_size(&self, bytes_so_far: u64) -> Result<(), UploadError> {
        if bytes_so_far > self.max_file_size {
            Err(UploadError::SizeExceeded {
                limit: self.max_file_size,
            })
        } else {
            Ok(())
        }
    }
}

impl Default for ValidationFilter {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_MIME_TYPES, DEFAULT_MAX_FILE_SIZE)
    }
}
