//! End-to-end upload tests against a running server.
//!
//! Each test starts the server on an ephemeral port with its own temporary
//! upload directory and talks to it over real sockets.

use reqwest::blocking::{Client, multipart};
use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tempfile::{TempDir, tempdir};
use zipdrop::config::Config;
use zipdrop::server::run_server;

struct UploadTestServer {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
    upload_dir: TempDir,
}

impl UploadTestServer {
    fn new() -> Self {
        Self::with_limit(zipdrop::validation::DEFAULT_MAX_FILE_SIZE)
    }

    fn with_limit(max_file_size: u64) -> Self {
        let upload_dir = tempdir().unwrap();
        let config = Config {
            listen: "127.0.0.1".to_string(),
            port: 0,
            threads: 4,
            read_timeout: Some(Duration::from_secs(5)),
            upload_dir: upload_dir.path().to_path_buf(),
            max_file_size,
            chunk_size: 4096,
            ..Config::default()
        };

        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let (addr_tx, addr_rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            if let Err(e) = run_server(config, Some(shutdown_rx), Some(addr_tx)) {
                eprintln!("Server thread failed: {e}");
            }
        });

        let addr = addr_rx.recv().unwrap();

        Self {
            addr,
            shutdown_tx,
            handle: Some(handle),
            upload_dir,
        }
    }

    fn upload_url(&self) -> String {
        format!("http://{}/api/upload", self.addr)
    }

    fn stored_files(&self) -> Vec<PathBuf> {
        list_files(self.upload_dir.path())
    }
}

impl Drop for UploadTestServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.shutdown_tx.send(()).ok();
            handle.join().unwrap();
        }
    }
}

/// Every entry in `dir`, hidden temp files included.
fn list_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    files.sort();
    files
}

/// Bytes that look enough like a ZIP archive for a human reading a hexdump.
fn fake_zip(len: usize) -> Vec<u8> {
    let mut data = b"PK\x03\x04".to_vec();
    data.extend((0..len.saturating_sub(4)).map(|i| (i * 31 % 251) as u8));
    data
}

fn zip_form(field: &str, filename: &str, data: Vec<u8>, mime: &str) -> multipart::Form {
    let part = multipart::Part::bytes(data)
        .file_name(filename.to_string())
        .mime_str(mime)
        .unwrap();
    multipart::Form::new().part(field.to_string(), part)
}

fn post_form(server: &UploadTestServer, form: multipart::Form) -> (u16, serde_json::Value) {
    let response = Client::new()
        .post(server.upload_url())
        .multipart(form)
        .send()
        .unwrap();
    let status = response.status().as_u16();
    let body: serde_json::Value = response.json().unwrap();
    (status, body)
}

/// `stem_<digits>.zip`
fn matches_stored_pattern(name: &str, stem: &str) -> bool {
    let Some(rest) = name.strip_prefix(&format!("{stem}_")) else {
        return false;
    };
    let Some(digits) = rest.strip_suffix(".zip") else {
        return false;
    };
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

#[test]
fn test_upload_success_stores_identical_bytes() {
    let server = UploadTestServer::new();
    let data = fake_zip(200_000);

    let (status, body) = post_form(
        &server,
        zip_form("file", "archive.zip", data.clone(), "application/zip"),
    );

    assert_eq!(status, 200);
    assert_eq!(body["message"], "success");
    assert_eq!(body["size"], data.len() as u64);

    let stored_name = body["filename"].as_str().unwrap();
    assert!(
        matches_stored_pattern(stored_name, "archive"),
        "unexpected stored name {stored_name}"
    );

    let files = server.stored_files();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].file_name().unwrap(), stored_name);
    assert_eq!(fs::read(&files[0]).unwrap(), data);
}

#[test]
fn test_upload_accepts_x_zip_compressed() {
    let server = UploadTestServer::new();

    let (status, body) = post_form(
        &server,
        zip_form(
            "file",
            "legacy.zip",
            fake_zip(512),
            "application/x-zip-compressed",
        ),
    );

    assert_eq!(status, 200);
    assert!(matches_stored_pattern(
        body["filename"].as_str().unwrap(),
        "legacy"
    ));
    assert_eq!(server.stored_files().len(), 1);
}

#[test]
fn test_upload_rejects_wrong_content_type() {
    let server = UploadTestServer::new();

    let (status, body) = post_form(
        &server,
        zip_form("file", "notes.zip", b"plain text".to_vec(), "text/plain"),
    );

    assert_eq!(status, 400);
    assert!(body["error"].is_string());
    assert!(server.stored_files().is_empty());
}

#[test]
fn test_large_rejected_upload_still_gets_its_response() {
    let server = UploadTestServer::new();
    let data = vec![b'x'; 16 * 1024 * 1024];

    // Rejected on the part headers, long before the body has been sent
    let (status, body) = post_form(
        &server,
        zip_form("file", "report.txt", data, "text/plain"),
    );

    assert_eq!(status, 400);
    assert!(body["error"].is_string());
    assert!(server.stored_files().is_empty());
}

#[test]
fn test_upload_rejects_oversized_file() {
    let limit = 1024 * 1024;
    let server = UploadTestServer::with_limit(limit);

    let (status, body) = post_form(
        &server,
        zip_form(
            "file",
            "big.zip",
            fake_zip(limit as usize + 10_000),
            "application/zip",
        ),
    );

    assert_eq!(status, 400);
    assert_eq!(body["error"], "File too large");
    assert!(server.stored_files().is_empty());
}

#[test]
fn test_upload_at_exact_limit_is_accepted() {
    let limit = 64 * 1024;
    let server = UploadTestServer::with_limit(limit);

    let (status, body) = post_form(
        &server,
        zip_form("file", "edge.zip", fake_zip(limit as usize), "application/zip"),
    );

    assert_eq!(status, 200);
    assert_eq!(body["size"], limit);
}

#[test]
fn test_upload_without_file_field_is_rejected() {
    let server = UploadTestServer::new();

    let (status, body) = post_form(
        &server,
        zip_form("attachment", "archive.zip", fake_zip(128), "application/zip"),
    );

    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap().contains("file"));
    assert!(server.stored_files().is_empty());
}

#[test]
fn test_upload_with_text_fields_before_file() {
    let server = UploadTestServer::new();
    let data = fake_zip(4096);
    let form = zip_form("file", "mixed.zip", data.clone(), "application/zip")
        .text("comment", "ignored");

    let (status, _) = post_form(&server, form);
    assert_eq!(status, 200);

    let files = server.stored_files();
    assert_eq!(files.len(), 1);
    assert_eq!(fs::read(&files[0]).unwrap(), data);
}

#[test]
fn test_upload_sanitizes_path_components() {
    let server = UploadTestServer::new();

    let (status, body) = post_form(
        &server,
        zip_form("file", "../../escape.zip", fake_zip(256), "application/zip"),
    );

    assert_eq!(status, 200);
    let stored = body["filename"].as_str().unwrap();
    assert!(!stored.contains('/'));
    assert!(!stored.contains(".."));

    let files = server.stored_files();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].parent().unwrap(), server.upload_dir.path());
}

#[test]
fn test_client_abort_leaves_no_file_behind() {
    let server = UploadTestServer::new();
    let boundary = "----zipdropAbortBoundary";
    let declared_len = 10 * 1024 * 1024;

    {
        let mut stream = TcpStream::connect(server.addr).unwrap();
        let head = format!(
            "POST /api/upload HTTP/1.1\r\n\
             Host: {}\r\n\
             Content-Type: multipart/form-data; boundary={boundary}\r\n\
             Content-Length: {declared_len}\r\n\r\n",
            server.addr
        );
        stream.write_all(head.as_bytes()).unwrap();

        let part_head = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"partial.zip\"\r\n\
             Content-Type: application/zip\r\n\r\n"
        );
        stream.write_all(part_head.as_bytes()).unwrap();
        stream.write_all(&fake_zip(256 * 1024)).unwrap();
        stream.flush().unwrap();
        // Dropping the stream closes the connection mid-body
    }

    // The server notices the EOF and removes the partial file
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if server.stored_files().is_empty() {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "partial upload left behind: {:?}",
            server.stored_files()
        );
        thread::sleep(Duration::from_millis(50));
    }

    // And keeps serving other clients
    let response = reqwest::blocking::get(format!("http://{}/", server.addr)).unwrap();
    assert_eq!(response.status().as_u16(), 200);

    // A later upload still works
    let (status, _) = post_form(
        &server,
        zip_form("file", "after.zip", fake_zip(1024), "application/zip"),
    );
    assert_eq!(status, 200);
    assert_eq!(server.stored_files().len(), 1);
}

#[test]
fn test_truncated_body_gets_no_success() {
    let server = UploadTestServer::new();
    let boundary = "XyZ";
    let body = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"cut.zip\"\r\n\
         Content-Type: application/zip\r\n\r\n\
         PK\x03\x04 no closing delimiter"
    );

    let mut stream = TcpStream::connect(server.addr).unwrap();
    let request = format!(
        "POST /api/upload HTTP/1.1\r\n\
         Host: localhost\r\n\
         Content-Type: multipart/form-data; boundary={boundary}\r\n\
         Content-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    assert!(
        response.starts_with("HTTP/1.1 400"),
        "unexpected response: {response}"
    );
    assert!(server.stored_files().is_empty());
}

#[test]
fn test_concurrent_same_name_uploads_get_distinct_files() {
    let server = UploadTestServer::new();
    let url = server.upload_url();
    let names = Arc::new(Mutex::new(Vec::new()));
    let uploads = 8;

    let pool = threadpool::ThreadPool::new(uploads);
    for i in 0..uploads {
        let url = url.clone();
        let names = Arc::clone(&names);
        pool.execute(move || {
            let data = fake_zip(8192 + i);
            let response = Client::new()
                .post(&url)
                .multipart(zip_form("file", "same.zip", data, "application/zip"))
                .send()
                .unwrap();
            assert_eq!(response.status().as_u16(), 200);
            let body: serde_json::Value = response.json().unwrap();
            names
                .lock()
                .unwrap()
                .push(body["filename"].as_str().unwrap().to_string());
        });
    }
    pool.join();
    assert_eq!(pool.panic_count(), 0);

    let mut names = names.lock().unwrap().clone();
    assert_eq!(names.len(), uploads);
    names.sort();
    names.dedup();
    assert_eq!(names.len(), uploads, "stored names collided");

    let files = server.stored_files();
    assert_eq!(files.len(), uploads);
    for file in &files {
        let name = file.file_name().unwrap().to_string_lossy();
        assert!(matches_stored_pattern(&name, "same"), "bad name {name}");
    }

    // Each upload had a distinct length, so distinct names mean nothing was overwritten
    let mut sizes: Vec<u64> = files
        .iter()
        .map(|f| fs::metadata(f).unwrap().len())
        .collect();
    sizes.sort();
    sizes.dedup();
    assert_eq!(sizes.len(), uploads);
}
