//! HTTP/1.1 request parsing and response writing.
//!
//! Only the request head is buffered. The body stays on the socket and is
//! exposed as a `Content-Length` framed [`MonitoredBody`], so handlers pull
//! it on demand and a client that goes away mid-body trips the connection's
//! abort signal.

use crate::error::AppError;
use crate::lifecycle::{AbortSignal, MonitoredBody};
use crate::utils::percent_decode;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::net::{SocketAddr, TcpStream};

/// Maximum size for the request head (request line plus headers)
pub const MAX_HEADERS_SIZE: usize = 8 * 1024;

pub const SERVER_NAME: &str = concat!("zipdrop/", env!("CARGO_PKG_VERSION"));

pub type RequestBody<'a> = MonitoredBody<Box<dyn Read + 'a>>;

/// A parsed request whose body is still unread.
pub struct Request<'a> {
    pub method: String,
    /// Percent-decoded path without the query string
    pub path: String,
    pub query: Option<String>,
    /// Header names lowercased, repeated headers comma-joined
    pub headers: HashMap<String, String>,
    pub peer_addr: SocketAddr,
    pub body: RequestBody<'a>,
}

impl<'a> Request<'a> {
    /// Parse the request head from a connected socket.
    pub fn from_stream(
        stream: &'a TcpStream,
        peer_addr: SocketAddr,
        signal: AbortSignal,
    ) -> Result<Self, AppError> {
        Self::from_reader(stream, peer_addr, signal)
    }

    /// Parse the request head from any byte source. Bytes read past the head
    /// are replayed in front of the remaining body.
    pub fn from_reader<R: Read + 'a>(
        mut reader: R,
        peer_addr: SocketAddr,
        signal: AbortSignal,
    ) -> Result<Self, AppError> {
        let (head, leftover) = read_head(&mut reader)?;

        let mut lines = head.split("\r\n");
        let request_line = lines
            .next()
            .ok_or_else(|| AppError::bad_request("Empty request"))?;
        let parts: Vec<&str> = request_line.split_whitespace().collect();
        let &[method, target, version] = parts.as_slice() else {
            return Err(AppError::bad_request("Malformed request line"));
        };

        if !version.starts_with("HTTP/1.") {
            return Err(AppError::bad_request(format!(
                "Unsupported protocol version {version}"
            )));
        }

        let (raw_path, query) = match target.split_once('?') {
            Some((p, q)) => (p, Some(q.to_string())),
            None => (target, None),
        };

        let mut headers: HashMap<String, String> = HashMap::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| AppError::bad_request("Malformed header line"))?;
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim();
            headers
                .entry(name)
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }

        let content_length = body_length(&headers)?;
        let body: Box<dyn Read + 'a> = Box::new(Cursor::new(leftover).chain(reader));

        debug!(
            "[{peer_addr}] Parsed request: {method} {target} (headers: {}, content-length: {content_length})",
            headers.len()
        );

        Ok(Request {
            method: method.to_ascii_uppercase(),
            path: percent_decode(raw_path),
            query,
            headers,
            peer_addr,
            body: MonitoredBody::new(body, content_length, signal),
        })
    }

    /// Build a request from already parsed parts with an in-memory body.
    pub fn from_parts(
        method: &str,
        path: &str,
        headers: &[(&str, &str)],
        body: Vec<u8>,
    ) -> Request<'static> {
        let length = body.len() as u64;
        let reader: Box<dyn Read> = Box::new(Cursor::new(body));
        Request {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            query: None,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                .collect(),
            peer_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            body: MonitoredBody::new(reader, length, AbortSignal::new()),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }

    /// Prefix for log lines about this request
    pub fn log_prefix(&self) -> String {
        format!("[{}]", self.peer_addr)
    }
}

/// Read until the blank line ending the head. Returns the head (without the
/// terminator) and whatever body bytes came in the same reads.
fn read_head<R: Read>(reader: &mut R) -> Result<(String, Vec<u8>), AppError> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let mut scanned: usize = 0;

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) if buffer.is_empty() => {
                return Err(AppError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before a request was sent",
                )));
            }
            Ok(0) => return Err(AppError::bad_request("Incomplete request head")),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(AppError::Io(e)),
        };
        buffer.extend_from_slice(&chunk[..n]);

        // Resume the scan a few bytes back in case the terminator was split
        let start = scanned.saturating_sub(3);
        if let Some(pos) = buffer[start..]
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|p| p + start)
        {
            if pos > MAX_HEADERS_SIZE {
                return Err(AppError::HeadersTooLarge);
            }
            let leftover = buffer.split_off(pos + 4);
            buffer.truncate(pos);
            let head = String::from_utf8(buffer)
                .map_err(|_| AppError::bad_request("Request head is not valid UTF-8"))?;
            return Ok((head, leftover));
        }
        scanned = buffer.len();

        if buffer.len() > MAX_HEADERS_SIZE {
            return Err(AppError::HeadersTooLarge);
        }
    }
}

fn body_length(headers: &HashMap<String, String>) -> Result<u64, AppError> {
    if let Some(encoding) = headers.get("transfer-encoding")
        && !encoding.eq_ignore_ascii_case("identity")
    {
        warn!("Rejecting request with Transfer-Encoding: {encoding}");
        return Err(AppError::bad_request(
            "Transfer-Encoding is not supported, send Content-Length",
        ));
    }

    match headers.get("content-length") {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map_err(|_| AppError::bad_request("Invalid Content-Length")),
        None => Ok(0),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Empty,
    Text(String),
}

/// An outgoing response. Always sent with `Connection: close`.
#[derive(Debug, Clone)]
pub struct Response {
    pub status_code: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub body: ResponseBody,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

impl Response {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            status_text: status_text(status_code).to_string(),
            headers: HashMap::new(),
            body: ResponseBody::Empty,
        }
    }

    /// Serialize `value` as the JSON body.
    pub fn json<T: Serialize>(status_code: u16, value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(text) => Self::new(status_code)
                .with_header("Content-Type", "application/json; charset=utf-8")
                .with_body(text),
            Err(e) => {
                error!("Failed to serialize response body: {e}");
                Self::new(500)
                    .with_header("Content-Type", "application/json; charset=utf-8")
                    .with_body(r#"{"error":"Internal server error"}"#.to_string())
            }
        }
    }

    /// `{"error": message}`
    pub fn error(status_code: u16, message: &str) -> Self {
        Self::json(status_code, &ErrorBody { error: message })
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_body(mut self, text: String) -> Self {
        self.body = ResponseBody::Text(text);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> &str {
        match &self.body {
            ResponseBody::Empty => "",
            ResponseBody::Text(text) => text,
        }
    }

    /// Write the full response.
    pub fn send<W: Write>(&self, writer: &mut W, log_prefix: &str) -> io::Result<()> {
        info!("{log_prefix} {} {}", self.status_code, self.status_text);

        let body = self.body_text().as_bytes();
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status_code, self.status_text);
        head.push_str(&format!("Server: {SERVER_NAME}\r\n"));
        head.push_str("Connection: close\r\n");
        for (name, value) in &self.headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));

        writer.write_all(head.as_bytes())?;
        writer.write_all(body)?;
        writer.flush()
    }
}

pub fn status_text(status_code: u16) -> &'static str {
    match status_code {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], 5555))
    }

    fn parse(raw: &[u8]) -> Result<Request<'static>, AppError> {
        Request::from_reader(Cursor::new(raw.to_vec()), peer(), AbortSignal::new())
    }

    #[test]
    fn test_parse_request_head_and_body() {
        let raw = b"POST /api/upload?x=1 HTTP/1.1\r\nHost: localhost\r\nContent-Type: multipart/form-data; boundary=abc\r\nContent-Length: 5\r\nX-Tag: a\r\nx-tag: b\r\n\r\nhelloEXTRA";
        let mut request = parse(raw).unwrap();

        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/api/upload");
        assert_eq!(request.query.as_deref(), Some("x=1"));
        assert_eq!(
            request.header("Content-Type"),
            Some("multipart/form-data; boundary=abc")
        );
        assert_eq!(request.header("x-tag"), Some("a, b"));

        let mut body = String::new();
        request.body.read_to_string(&mut body).unwrap();
        assert_eq!(body, "hello");
    }

    /// Hands out at most `step` bytes per read.
    struct Trickle {
        data: Cursor<Vec<u8>>,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.step);
            self.data.read(&mut buf[..n])
        }
    }

    #[test]
    fn test_head_terminator_split_across_reads() {
        let raw = b"GET /?q=1 HTTP/1.1\r\nHost: localhost\r\nContent-Length: 2\r\n\r\nok".to_vec();
        for step in [1, 2, 3, 5, 1024] {
            let reader = Trickle {
                data: Cursor::new(raw.clone()),
                step,
            };
            let mut request = Request::from_reader(reader, peer(), AbortSignal::new()).unwrap();
            assert_eq!(request.header("host"), Some("localhost"), "step {step}");

            let mut body = String::new();
            request.body.read_to_string(&mut body).unwrap();
            assert_eq!(body, "ok", "step {step}");
        }
    }

    #[test]
    fn test_path_is_percent_decoded() {
        let request = parse(b"GET /a%20b HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(request.path, "/a b");
        assert_eq!(request.body.remaining(), 0);
    }

    #[test]
    fn test_malformed_requests() {
        assert!(matches!(
            parse(b"GARBAGE\r\n\r\n"),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            parse(b"GET / SPDY/3\r\n\r\n"),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            parse(b"POST / HTTP/1.1\r\nContent-Length: lots\r\n\r\n"),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            parse(b"GET / HTTP/1.1\r\nno colon here\r\n\r\n"),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            parse(b"GET / HTTP/1.1\r\nHost: x\r\n"),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn test_chunked_bodies_are_rejected() {
        let raw = b"POST /api/upload HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n";
        assert!(matches!(parse(raw), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn test_oversized_head_is_rejected() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        raw.extend(format!("X-Big: {}\r\n\r\n", "a".repeat(MAX_HEADERS_SIZE)).into_bytes());
        assert!(matches!(parse(&raw), Err(AppError::HeadersTooLarge)));
    }

    #[test]
    fn test_silent_connection_is_an_io_error() {
        match parse(b"") {
            Err(AppError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            _ => panic!("expected an io error"),
        }
    }

    #[test]
    fn test_response_serialization() {
        let response = Response::error(400, "File too large").with_header("X-Test", "1");
        let mut out = Vec::new();
        response.send(&mut out, "[test]").unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("X-Test: 1\r\n"));
        assert!(text.contains("Content-Type: application/json; charset=utf-8\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"error\":\"File too large\"}"));
        assert!(text.contains(&format!(
            "Content-Length: {}\r\n",
            r#"{"error":"File too large"}"#.len()
        )));
    }

    #[test]
    fn test_empty_response() {
        let response = Response::new(204);
        assert_eq!(response.status_text, "No Content");
        assert_eq!(response.body_text(), "");
        let mut out = Vec::new();
        response.send(&mut out, "[test]").unwrap();
        assert!(String::from_utf8(out).unwrap().contains("Content-Length: 0\r\n"));
    }
}
