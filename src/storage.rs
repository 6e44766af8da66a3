//! Streaming persistence of an uploaded file into the upload directory.
//!
//! Payload bytes go to a hidden `.part` file first. Once the stream has
//! ended and the data is fsynced, the final name is claimed with a hard link,
//! which fails if the name already exists, so two uploads can never share a
//! destination and the final name only ever shows a complete file. Any
//! failure removes the temporary file: nothing partial is left behind.

use crate::error::{AppError, UploadError};
use crate::lifecycle::AbortSignal;
use crate::naming::resolve_stored_name;
use crate::validation::ValidationFilter;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// 64 KiB
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// A final name that is already taken is retried with the timestamp bumped
/// by one millisecond, at most this many times.
const MAX_NAME_ATTEMPTS: i64 = 64;

const TEMP_SUFFIX: &str = ".part";

/// Distinguishes temp files of uploads that resolve to the same name
static TEMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A completed upload on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub path: PathBuf,
    pub stored_name: String,
    /// Bytes actually written
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Writes one incoming byte stream to the upload directory in bounded
/// chunks.
#[derive(Debug, Clone)]
pub struct StreamingWriter {
    directory: PathBuf,
    chunk_size: usize,
}

impl StreamingWriter {
    pub fn new(directory: PathBuf, chunk_size: usize) -> Self {
        Self {
            directory,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Stream `source` into a new file named after `declared_name` and the
    /// capture time.
    ///
    /// The size ceiling of `filter` is enforced before each chunk is
    /// written and `signal` is polled before each read. The declared
    /// content type is not checked here.
    pub fn persist<R: Read>(
        &self,
        declared_name: &str,
        captured_at: DateTime<Utc>,
        source: &mut R,
        filter: &ValidationFilter,
        signal: &AbortSignal,
    ) -> Result<StoredFile, UploadError> {
        let (temp_path, mut temp_file) = self.create_temp(declared_name, captured_at)?;
        let mut artifacts = PartialArtifacts::new(temp_path.clone());

        let size = self.copy_stream(source, &mut temp_file, filter, signal)?;

        temp_file.sync_all().map_err(|e| {
            error!("Failed to sync temporary file {temp_path:?}: {e}");
            UploadError::Io(e)
        })?;
        drop(temp_file);

        let (stored_name, final_path) = self.publish(&temp_path, declared_name, captured_at)?;
        artifacts.commit();
        if let Err(e) = fs::remove_file(&temp_path) {
            warn!("Failed to remove temporary file {temp_path:?}: {e}");
        }

        debug!("Stored {size} bytes at {final_path:?}");
        Ok(StoredFile {
            path: final_path,
            stored_name,
            size,
            created_at: Utc::now(),
        })
    }

    /// Open a fresh hidden temp file for the payload.
    fn create_temp(
        &self,
        declared_name: &str,
        captured_at: DateTime<Utc>,
    ) -> Result<(PathBuf, File), UploadError> {
        let base = resolve_stored_name(declared_name, captured_at.timestamp_millis());

        loop {
            let sequence = TEMP_SEQUENCE.fetch_add(1, Ordering::Relaxed);
            let path = self
                .directory
                .join(format!(".{base}.{sequence}{TEMP_SUFFIX}"));

            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                // Left over from an earlier process
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    error!("Failed to create temporary file {path:?}: {e}");
                    return Err(UploadError::Io(e));
                }
            }
        }
    }

    /// Claim a free final name by hard-linking the finished temp file to it.
    fn publish(
        &self,
        temp_path: &Path,
        declared_name: &str,
        captured_at: DateTime<Utc>,
    ) -> Result<(String, PathBuf), UploadError> {
        let timestamp = captured_at.timestamp_millis();

        for offset in 0..MAX_NAME_ATTEMPTS {
            let stored_name = resolve_stored_name(declared_name, timestamp + offset);
            let path = self.directory.join(&stored_name);

            match fs::hard_link(temp_path, &path) {
                Ok(()) => {
                    if offset > 0 {
                        info!(
                            "Name collision for '{declared_name}', stored as '{stored_name}' instead"
                        );
                    }
                    return Ok((stored_name, path));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!("Destination {path:?} already taken, retrying");
                    continue;
                }
                Err(e) => {
                    error!("Failed to link {temp_path:?} to {path:?}: {e}");
                    return Err(UploadError::Io(e));
                }
            }
        }

        Err(UploadError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free destination name after {MAX_NAME_ATTEMPTS} attempts"),
        )))
    }

    fn copy_stream<R: Read>(
        &self,
        source: &mut R,
        target: &mut File,
        filter: &ValidationFilter,
        signal: &AbortSignal,
    ) -> Result<u64, UploadError> {
        let mut buffer = vec![0u8; self.chunk_size];
        let mut written: u64 = 0;

        loop {
            if signal.is_aborted() {
                return Err(UploadError::Aborted);
            }

            let n = match source.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(classify_read_error(e, signal)),
            };

            filter.check_size(written + n as u64)?;
            target.write_all(&buffer[..n]).map_err(|e| {
                error!("Failed to write upload chunk: {e}");
                UploadError::Io(e)
            })?;
            written += n as u64;
        }

        Ok(written)
    }
}

/// Map a failed read of the incoming stream onto the upload taxonomy.
///
/// A tripped abort signal always wins. Truncated or undecodable framing is
/// the client's fault. Anything else is a local I/O failure.
pub fn classify_read_error(err: io::Error, signal: &AbortSignal) -> UploadError {
    if signal.is_aborted() {
        return UploadError::Aborted;
    }
    match err.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData => {
            UploadError::malformed(err.to_string())
        }
        _ => UploadError::Io(err),
    }
}

/// The temp file of an upload, removed unless the upload was published.
struct PartialArtifacts {
    path: PathBuf,
    committed: bool,
}

impl PartialArtifacts {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for PartialArtifacts {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed partial upload {:?}", self.path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove partial upload {:?}: {e}", self.path),
        }
    }
}

/// Make the upload directory absolute, create it if missing and check that
/// it accepts new files. Runs once at startup.
pub fn prepare_upload_directory(dir: &Path) -> Result<PathBuf, AppError> {
    if !dir.exists() {
        info!("Creating upload directory: {dir:?}");
        fs::create_dir_all(dir).map_err(|e| {
            error!("Failed to create upload directory {dir:?}: {e}");
            AppError::UploadDirectory(format!("cannot create {}: {e}", dir.display()))
        })?;
    } else if !dir.is_dir() {
        return Err(AppError::UploadDirectory(format!(
            "{} exists but is not a directory",
            dir.display()
        )));
    }

    let absolute = dir.canonicalize()?;

    let probe = absolute.join(".write_test");
    match File::create(&probe) {
        Ok(_) => {
            let _ = fs::remove_file(&probe);
            Ok(absolute)
        }
        Err(e) => {
            error!("Upload directory {absolute:?} is not writable: {e}");
            Err(AppError::UploadDirectory(format!(
                "{} is not writable: {e}",
                absolute.display()
            )))
        }
    }
}
