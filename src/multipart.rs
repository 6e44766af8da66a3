//! Streaming multipart/form-data parser (RFC 7578).
//!
//! The parser pulls from any [`Read`] and hands out one part at a time.
//! Each [`MultipartPart`] is itself a `Read` over the part payload, so a
//! file part can be copied to disk chunk by chunk: the parser never holds
//! more than one read chunk plus one boundary delimiter in memory.
//!
//! Parts are borrowed from the parser. Dropping a part without reading it
//! to the end is fine; the next call to [`MultipartReader::next_part`]
//! skips whatever is left of it.
//!
//! # Example
//! ```rust,no_run
//! use zipdrop::multipart::{MultipartConfig, MultipartReader};
//! use std::io::{Cursor, Read};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let body = b"--xyz\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.zip\"\r\n\r\nPK\r\n--xyz--\r\n";
//! let mut parser = MultipartReader::new(Cursor::new(&body[..]), "xyz", MultipartConfig::default())?;
//! while let Some(mut part) = parser.next_part()? {
//!     let mut data = Vec::new();
//!     part.read_to_end(&mut data)?;
//!     println!("{} -> {} bytes", part.field_name(), data.len());
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::UploadError;
use std::collections::HashMap;
use std::io::{self, Read};

const DEFAULT_MAX_PARTS: usize = 32;
const DEFAULT_MAX_HEADERS_SIZE: usize = 8 * 1024; // 8KB for part headers
const DEFAULT_MAX_FILENAME_LENGTH: usize = 1024;
const DEFAULT_MAX_FIELD_NAME_LENGTH: usize = 100;
const MIN_BOUNDARY_LENGTH: usize = 1;
const MAX_BOUNDARY_LENGTH: usize = 70; // RFC 2046 limit

/// Bytes pulled from the underlying reader per fill.
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Security limits for multipart parsing
#[derive(Debug, Clone)]
pub struct MultipartConfig {
    /// Maximum number of parts accepted in one body
    pub max_parts: usize,
    /// Maximum size of one part's header block
    pub max_headers_size: usize,
    /// Maximum length of a declared filename, before sanitization
    pub max_filename_length: usize,
    /// Maximum field name length
    pub max_field_name_length: usize,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            max_parts: DEFAULT_MAX_PARTS,
            max_headers_size: DEFAULT_MAX_HEADERS_SIZE,
            max_filename_length: DEFAULT_MAX_FILENAME_LENGTH,
            max_field_name_length: DEFAULT_MAX_FIELD_NAME_LENGTH,
        }
    }
}

/// The Content-Disposition header of a part
#[derive(Debug, Clone)]
pub struct ContentDisposition {
    /// Usually "form-data"
    pub disposition_type: String,
    /// Form field name
    pub name: String,
    /// Client-declared filename, unsanitized. `filename*` wins over `filename`.
    pub filename: Option<String>,
    /// Any other parameters, keys lowercased
    pub parameters: HashMap<String, String>,
}

/// Headers of a single part
#[derive(Debug, Clone, Default)]
pub struct PartHeaders {
    pub disposition: Option<ContentDisposition>,
    pub content_type: Option<String>,
    /// All raw headers, names lowercased
    pub headers: HashMap<String, String>,
}

impl PartHeaders {
    /// Parse a part's header block (without the terminating blank line)
    pub fn parse(headers_str: &str, config: &MultipartConfig) -> Result<Self, UploadError> {
        if headers_str.len() > config.max_headers_size {
            return Err(UploadError::malformed(format!(
                "Part headers too large: {} bytes",
                headers_str.len()
            )));
        }

        let mut parsed = PartHeaders::default();

        for line in headers_str.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (name, value) = line.split_once(':').ok_or_else(|| {
                UploadError::malformed(format!("Invalid part header line: {line}"))
            })?;
            let name = name.trim().to_lowercase();
            let value = value.trim().to_string();

            match name.as_str() {
                "content-disposition" => {
                    parsed.disposition = Some(Self::parse_content_disposition(&value, config)?);
                }
                "content-type" => parsed.content_type = Some(value.clone()),
                _ => {}
            }
            parsed.headers.insert(name, value);
        }

        Ok(parsed)
    }

    /// Parse the Content-Disposition header value
    pub fn parse_content_disposition(
        value: &str,
        config: &MultipartConfig,
    ) -> Result<ContentDisposition, UploadError> {
        let mut segments = split_parameters(value).into_iter();
        let disposition_type = segments
            .next()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| UploadError::malformed("Empty Content-Disposition header"))?;

        let mut name = None;
        let mut filename = None;
        let mut extended_filename = None;
        let mut parameters = HashMap::new();

        for segment in segments {
            let Some((key, raw)) = segment.split_once('=') else {
                continue;
            };
            let key = key.trim().to_lowercase();
            let val = unquote(raw.trim());

            match key.as_str() {
                "name" => {
                    if val.len() > config.max_field_name_length {
                        return Err(UploadError::malformed(format!(
                            "Field name too long: {} characters",
                            val.len()
                        )));
                    }
                    name = Some(val);
                }
                "filename" => filename = Some(val),
                "filename*" => extended_filename = decode_ext_value(&val),
                _ => {
                    parameters.insert(key, val);
                }
            }
        }

        let filename = extended_filename.or(filename);
        if let Some(ref f) = filename
            && f.len() > config.max_filename_length
        {
            return Err(UploadError::malformed(format!(
                "Filename too long: {} characters",
                f.len()
            )));
        }

        let name = name.ok_or_else(|| {
            UploadError::malformed("Missing 'name' in Content-Disposition")
        })?;

        Ok(ContentDisposition {
            disposition_type,
            name,
            filename,
            parameters,
        })
    }
}

/// Split a header value on `;`, ignoring separators inside quoted strings.
fn split_parameters(value: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in value.chars() {
        match c {
            _ if escaped => {
                current.push(c);
                escaped = false;
            }
            '\\' if in_quotes => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ';' if !in_quotes => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    segments.push(current);
    segments
}

/// Strip surrounding quotes and resolve backslash escapes.
fn unquote(value: &str) -> String {
    match value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
    {
        Some(inner) => {
            let mut out = String::with_capacity(inner.len());
            let mut chars = inner.chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                } else {
                    out.push(c);
                }
            }
            out
        }
        None => value.to_string(),
    }
}

/// Decode an RFC 5987 ext-value such as `UTF-8''na%C3%AFve.zip`.
/// Only UTF-8 is supported; anything else yields `None`.
fn decode_ext_value(value: &str) -> Option<String> {
    let mut pieces = value.splitn(3, '\'');
    let charset = pieces.next()?;
    let _language = pieces.next()?;
    let encoded = pieces.next()?;
    if !charset.eq_ignore_ascii_case("utf-8") {
        return None;
    }

    let bytes = encoded.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &bytes[i + 1..i + 3];
            if !hex.iter().all(u8::is_ascii_hexdigit) {
                return None;
            }
            let hex = std::str::from_utf8(hex).ok()?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(decoded).ok()
}

/// Validate a boundary against RFC 2046
pub fn validate_boundary(boundary: &str) -> Result<(), UploadError> {
    if boundary.len() < MIN_BOUNDARY_LENGTH {
        return Err(UploadError::malformed("Boundary too short"));
    }

    if boundary.len() > MAX_BOUNDARY_LENGTH {
        return Err(UploadError::malformed("Boundary too long"));
    }

    if !boundary
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "'()+_,-./:=? ".contains(c))
    {
        return Err(UploadError::malformed("Boundary contains invalid characters"));
    }

    if boundary.ends_with(' ') {
        return Err(UploadError::malformed("Boundary ends with a space"));
    }

    Ok(())
}

/// Extract the boundary from a `multipart/form-data` Content-Type header,
/// preserving its case.
pub fn extract_boundary(content_type: &str) -> Result<String, UploadError> {
    let mut segments = split_parameters(content_type).into_iter();
    let essence = segments.next().unwrap_or_default();
    if !essence.trim().eq_ignore_ascii_case("multipart/form-data") {
        return Err(UploadError::malformed("Not multipart/form-data"));
    }

    for segment in segments {
        if let Some((key, value)) = segment.split_once('=')
            && key.trim().eq_ignore_ascii_case("boundary")
        {
            let boundary = unquote(value.trim());
            validate_boundary(&boundary)?;
            return Ok(boundary);
        }
    }

    Err(UploadError::malformed("No boundary found in Content-Type"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Inside a part payload (or the preamble): bytes up to the next delimiter
    Body,
    /// Just past a delimiter: either `--` (end) or a part header block follows
    AfterDelimiter,
    Finished,
}

/// Pull-based multipart parser over any reader.
pub struct MultipartReader<R> {
    reader: R,
    /// `\r\n--boundary`
    delimiter: Vec<u8>,
    buffer: Vec<u8>,
    state: State,
    reader_exhausted: bool,
    parts_seen: usize,
    config: MultipartConfig,
}

impl<R: Read> MultipartReader<R> {
    pub fn new(reader: R, boundary: &str, config: MultipartConfig) -> Result<Self, UploadError> {
        validate_boundary(boundary)?;

        let mut delimiter = Vec::with_capacity(boundary.len() + 4);
        delimiter.extend_from_slice(b"\r\n--");
        delimiter.extend_from_slice(boundary.as_bytes());

        Ok(Self {
            reader,
            delimiter,
            // The first delimiter may open the body with no preceding CRLF
            buffer: b"\r\n".to_vec(),
            state: State::Body,
            reader_exhausted: false,
            parts_seen: 0,
            config,
        })
    }

    /// Advance to the next part. Returns `Ok(None)` after the closing
    /// boundary.
    pub fn next_part(&mut self) -> Result<Option<MultipartPart<'_, R>>, UploadError> {
        if self.state == State::Body {
            self.skip_body()?;
        }
        if self.state == State::Finished {
            return Ok(None);
        }

        // AfterDelimiter: "--" closes the body, otherwise the rest of the
        // delimiter line must be transport padding followed by CRLF
        self.fill_to(2)?;
        if self.buffer.starts_with(b"--") {
            self.state = State::Finished;
            return Ok(None);
        }
        let line_end = self.find_or_fill(b"\n", self.config.max_headers_size)?;
        if !self.buffer[..line_end]
            .iter()
            .all(|b| matches!(b, b' ' | b'\t' | b'\r'))
        {
            return Err(UploadError::malformed("Garbage after boundary delimiter"));
        }
        self.buffer.drain(..=line_end);

        let headers_str = self.read_header_block()?;

        self.parts_seen += 1;
        if self.parts_seen > self.config.max_parts {
            return Err(UploadError::malformed("Too many parts"));
        }

        let headers = PartHeaders::parse(&headers_str, &self.config)?;
        let disposition = headers
            .disposition
            .clone()
            .ok_or_else(|| UploadError::malformed("Part without Content-Disposition"))?;

        self.state = State::Body;
        Ok(Some(MultipartPart {
            field_name: disposition.name,
            filename: disposition.filename,
            content_type: headers.content_type.clone(),
            headers,
            parser: self,
        }))
    }

    fn read_header_block(&mut self) -> Result<String, UploadError> {
        // An empty header block is just the blank line
        let raw = if self.buffer.starts_with(b"\r\n") {
            self.buffer.drain(..2);
            Vec::new()
        } else {
            let end = self.find_or_fill(b"\r\n\r\n", self.config.max_headers_size)?;
            let raw: Vec<u8> = self.buffer.drain(..end + 4).take(end).collect();
            raw
        };

        String::from_utf8(raw).map_err(|_| UploadError::malformed("Part headers are not UTF-8"))
    }

    /// Copy payload bytes of the current part into `out`. Returns `Ok(0)`
    /// once the part's closing delimiter is reached.
    fn read_body(&mut self, out: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.state != State::Body || out.is_empty() {
                return Ok(0);
            }

            if let Some(idx) = find_subsequence(&self.buffer, &self.delimiter) {
                if idx == 0 {
                    self.buffer.drain(..self.delimiter.len());
                    self.state = State::AfterDelimiter;
                    return Ok(0);
                }
                return Ok(self.emit(idx, out));
            }

            // Hold back a tail that could be the start of a split delimiter
            let safe = self
                .buffer
                .len()
                .saturating_sub(self.delimiter.len() - 1);
            if safe > 0 {
                return Ok(self.emit(safe, out));
            }

            if self.reader_exhausted {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "multipart body ended before the closing boundary",
                ));
            }
            self.fill()?;
        }
    }

    fn emit(&mut self, available: usize, out: &mut [u8]) -> usize {
        let n = available.min(out.len());
        out[..n].copy_from_slice(&self.buffer[..n]);
        self.buffer.drain(..n);
        n
    }

    fn skip_body(&mut self) -> Result<(), UploadError> {
        let mut scratch = [0u8; 8192];
        loop {
            match self.read_body(&mut scratch) {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(map_read_error(e)),
            }
        }
    }

    /// Pull one chunk from the underlying reader. Returns bytes added.
    fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match self.reader.read(&mut chunk) {
                Ok(0) => {
                    self.reader_exhausted = true;
                    return Ok(0);
                }
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn fill_to(&mut self, len: usize) -> Result<(), UploadError> {
        while self.buffer.len() < len {
            if self.fill().map_err(map_read_error)? == 0 {
                return Err(UploadError::malformed("Multipart body truncated"));
            }
        }
        Ok(())
    }

    /// Position of `needle` in the buffer, reading more as needed, giving up
    /// once `limit` bytes are buffered without a match.
    fn find_or_fill(&mut self, needle: &[u8], limit: usize) -> Result<usize, UploadError> {
        loop {
            if let Some(idx) = find_subsequence(&self.buffer, needle) {
                return Ok(idx);
            }
            if self.buffer.len() > limit {
                return Err(UploadError::malformed("Part headers too large"));
            }
            if self.fill().map_err(map_read_error)? == 0 {
                return Err(UploadError::malformed("Multipart body truncated"));
            }
        }
    }
}

/// Truncated framing is the client's fault; anything else is passed on as
/// I/O so the caller can tell disconnects from local faults.
fn map_read_error(e: io::Error) -> UploadError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => UploadError::malformed("Multipart body truncated"),
        _ => UploadError::Io(e),
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// One part of a multipart body. Reading it yields the part payload.
pub struct MultipartPart<'a, R> {
    pub headers: PartHeaders,
    field_name: String,
    filename: Option<String>,
    content_type: Option<String>,
    parser: &'a mut MultipartReader<R>,
}

impl<R: Read> MultipartPart<'_, R> {
    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    /// Client-declared filename, unsanitized
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// Client-declared content type, as sent
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn is_file(&self) -> bool {
        self.filename.is_some()
    }
}

impl<R: Read> Read for MultipartPart<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.parser.read_body(buf)
    }
}
