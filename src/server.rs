// SPDX-License-Identifier: MIT

//! Listener loop, worker pool and per-connection handling.

use crate::config::Config;
use crate::error::AppError;
use crate::handlers::{UPLOAD_PATH, register_routes};
use crate::http::{Request, Response};
use crate::lifecycle::{ConnectionMonitor, is_disconnect};
use crate::middleware::CorsMiddleware;
use crate::router::Router;
use crate::storage::prepare_upload_directory;
use crate::upload::UploadHandler;
use log::{debug, error, info, trace, warn};
use std::io::Read;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

/// Unread request body consumed after a response to a request that is not
/// an upload (or whose declared body was refused unread).
const MAX_DRAIN_BYTES: u64 = 1024 * 1024;

/// Pause between accept attempts when no connection is pending
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const OVERFLOW_SHUTDOWN_POLL: Duration = Duration::from_millis(10);

/// Extra threads a pool may start per worker while every worker is busy.
const OVERFLOW_THREADS_PER_WORKER: usize = 16;

/// Pool of worker threads fed through a channel.
///
/// When every worker is busy (long uploads hold one each for the whole
/// transfer), jobs run on short-lived overflow threads instead of waiting in
/// the queue, up to `max_overflow` of them at once. Past that cap jobs queue.
pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
    /// Jobs queued or running on the workers
    busy: Arc<AtomicUsize>,
    /// Jobs running on overflow threads
    overflow: Arc<AtomicUsize>,
    max_overflow: usize,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Decrements a job counter when the job finishes, panicking or not.
struct CountGuard(Arc<AtomicUsize>);

impl Drop for CountGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ThreadPool {
    /// `size` is clamped to at least one worker.
    pub fn new(size: usize) -> ThreadPool {
        let size = size.max(1);
        Self::with_overflow(size, size.saturating_mul(OVERFLOW_THREADS_PER_WORKER))
    }

    pub fn with_overflow(size: usize, max_overflow: usize) -> ThreadPool {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size)
            .map(|id| Worker::new(id, Arc::clone(&receiver)))
            .collect();

        ThreadPool {
            workers,
            sender: Some(sender),
            busy: Arc::new(AtomicUsize::new(0)),
            overflow: Arc::new(AtomicUsize::new(0)),
            max_overflow,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.busy.load(Ordering::Acquire) >= self.workers.len() && self.reserve_overflow() {
            let guard = CountGuard(Arc::clone(&self.overflow));
            let spawned = thread::Builder::new()
                .name("zipdrop-overflow".to_string())
                .spawn(move || {
                    let _guard = guard;
                    f();
                });
            if let Err(e) = spawned {
                error!("Failed to start overflow thread, dropping job: {e}");
            }
            return;
        }

        self.busy.fetch_add(1, Ordering::AcqRel);
        let guard = CountGuard(Arc::clone(&self.busy));
        let job: Job = Box::new(move || {
            let _guard = guard;
            f();
        });
        if let Some(ref sender) = self.sender
            && sender.send(job).is_err()
        {
            warn!("Failed to send job to thread pool");
        }
    }

    fn reserve_overflow(&self) -> bool {
        let reserved = self
            .overflow
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |running| {
                (running < self.max_overflow).then_some(running + 1)
            })
            .is_ok();
        if reserved {
            debug!("All {} workers busy, starting overflow thread", self.workers.len());
        }
        reserved
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());

        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take()
                && thread.join().is_err()
            {
                warn!("Worker thread {} panicked", worker.id);
            }
        }

        // Overflow threads are detached; wait for their jobs like the workers'
        while self.overflow.load(Ordering::Acquire) > 0 {
            thread::sleep(OVERFLOW_SHUTDOWN_POLL);
        }
    }
}

struct Worker {
    id: usize,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn new(id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) -> Worker {
        let thread = thread::spawn(move || {
            loop {
                // The guard is dropped before the job runs
                let message = match receiver.lock() {
                    Ok(rx) => rx.recv(),
                    Err(_) => break,
                };

                match message {
                    Ok(job) => job(),
                    Err(_) => break,
                }
            }
            trace!("Worker {id} exiting");
        });

        Worker {
            id,
            thread: Some(thread),
        }
    }
}

/// Shared, read-only state handed to every connection.
struct ServerContext {
    router: Router,
    read_timeout: Option<Duration>,
    /// Unread body consumed after answering an upload, so a rejected client
    /// still reads its response
    upload_drain_limit: u64,
}

/// Prepare the upload directory, bind, and serve until `shutdown_rx`
/// receives a message (or forever without one). The bound address is sent
/// on `addr_tx` once the listener is up.
pub fn run_server(
    config: Config,
    shutdown_rx: Option<mpsc::Receiver<()>>,
    addr_tx: Option<mpsc::Sender<SocketAddr>>,
) -> Result<(), AppError> {
    config.validate()?;

    let upload_dir = prepare_upload_directory(&config.upload_dir)?;
    debug!("Upload directory resolved to: {upload_dir:?}");
    let config = Config {
        upload_dir,
        ..config
    };

    let listener = TcpListener::bind(config.bind_address())?;
    let local_addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;
    debug!("Server bound successfully to: {local_addr}");

    let mut router = Router::new();
    if config.cors {
        debug!("Adding CORS middleware to router");
        router.add_middleware(Box::new(CorsMiddleware::new()));
    }
    let upload_handler = Arc::new(UploadHandler::new(&config));
    let upload_drain_limit = upload_handler.max_request_body().max(MAX_DRAIN_BYTES);
    register_routes(&mut router, upload_handler);

    let context = Arc::new(ServerContext {
        router,
        read_timeout: config.read_timeout,
        upload_drain_limit,
    });

    if let Some(tx) = addr_tx
        && tx.send(local_addr).is_err()
    {
        return Err(AppError::InternalServerError(
            "Failed to send server address to caller".to_string(),
        ));
    }

    info!(
        "Listening on {local_addr}, storing uploads in '{}' (limit {})",
        config.upload_dir.display(),
        crate::utils::format_bytes(config.max_file_size)
    );

    let pool = ThreadPool::new(config.threads);
    debug!("Thread pool started with {} workers", pool.size());

    loop {
        if let Some(ref rx) = shutdown_rx
            && rx.try_recv().is_ok()
        {
            info!("Shutdown signal received. Shutting down gracefully.");
            break;
        }

        match listener.accept() {
            Ok((stream, peer_addr)) => {
                trace!("Accepted connection from: {peer_addr}");

                if let Err(e) = stream.set_nonblocking(false) {
                    error!("[{peer_addr}] Failed to set stream to blocking mode: {e}");
                    continue;
                }

                let context = Arc::clone(&context);
                pool.execute(move || {
                    let started = Instant::now();
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        handle_client(stream, peer_addr, &context);
                    }));
                    if result.is_err() {
                        error!("[{peer_addr}] Connection handler panicked");
                    }
                    trace!(
                        "[{peer_addr}] Handled in {}ms",
                        started.elapsed().as_millis()
                    );
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                error!("Error accepting connection: {e}");
            }
        }
    }

    drop(pool);
    info!("Server shut down gracefully.");
    Ok(())
}

/// Serve one request on `stream`, then close it.
fn handle_client(stream: TcpStream, peer_addr: SocketAddr, context: &ServerContext) {
    let monitor = ConnectionMonitor::new(peer_addr);
    let log_prefix = format!("[{}]", monitor.peer());

    if let Err(e) = stream.set_read_timeout(context.read_timeout) {
        warn!("{log_prefix} Failed to set read timeout: {e}");
    }

    let mut request = match Request::from_stream(&stream, peer_addr, monitor.signal()) {
        Ok(request) => request,
        Err(AppError::Io(e)) if is_disconnect(&e) => {
            debug!("{log_prefix} Connection closed before a complete request: {e}");
            return;
        }
        Err(e) => {
            warn!("{log_prefix} Failed to parse request: {e}");
            let (status, _) = e.status();
            let message = match e {
                AppError::BadRequest(reason) => reason,
                AppError::HeadersTooLarge => "Request headers too large".to_string(),
                _ => "Internal server error".to_string(),
            };
            if send_and_close(&stream, &Response::error(status, &message), &log_prefix) {
                discard_input(&stream, MAX_DRAIN_BYTES);
            }
            return;
        }
    };

    info!("{log_prefix} {} {}", request.method, request.path);

    let Some(response) = context.router.route(&mut request) else {
        debug!("{log_prefix} No response for {}", request.path);
        return;
    };

    if monitor.is_aborted() {
        warn!("{log_prefix} Client went away, dropping {} response", response.status_code);
        return;
    }

    if !send_and_close(&stream, &response, &log_prefix) {
        return;
    }

    if request.body.remaining() > 0 {
        let limit = if request.path == UPLOAD_PATH {
            context.upload_drain_limit
        } else {
            MAX_DRAIN_BYTES
        };
        let drained = request.body.drain(limit);
        debug!(
            "{log_prefix} Discarded unread request body ({})",
            if drained { "complete" } else { "truncated" }
        );
    }
}

/// Write `response` and half-close the socket. Returns `false` when the
/// write failed.
fn send_and_close(stream: &TcpStream, response: &Response, log_prefix: &str) -> bool {
    let mut writer = stream;
    if let Err(e) = response.send(&mut writer, log_prefix) {
        if is_disconnect(&e) {
            debug!("{log_prefix} Client disconnected before the response was sent: {e}");
        } else {
            error!("{log_prefix} Failed to send response: {e}");
        }
        return false;
    }
    if let Err(e) = stream.shutdown(Shutdown::Write) {
        debug!("{log_prefix} Failed to half-close connection: {e}");
    }
    true
}

/// Read and drop whatever the client is still sending after a request that
/// could not be parsed, until EOF, an error or `limit` bytes.
fn discard_input(stream: &TcpStream, limit: u64) {
    let _ = std::io::copy(&mut stream.take(limit), &mut std::io::sink());
}
