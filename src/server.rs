//! Event-driven message server.
//!
//! One thread runs a readiness loop (a current-thread tokio runtime over the
//! OS poller) that accepts connections and reads from all of them; each
//! connection owns a [`FrameDecoder`]. Decoded messages go onto an
//! [`InterruptibleQueue`] drained by a fixed pool of worker threads, which hand
//! them to a [`MessageHandler`].
//!
//! Shutdown clears the running flag, terminates the queue and then opens a
//! throwaway connection to the server's own address, because the loop may be
//! parked in `accept` with no traffic at all. Workers are joined first, then
//! the loop thread; each join is bounded and a thread that does not stop is
//! reported, not killed.
//!
//! ```rust,no_run
//! use vigil::config::ServerConfig;
//! use vigil::server::{ConnectionId, Server};
//! use vigil::wire::Message;
//! use std::time::Duration;
//!
//! # fn main() -> vigil::Result<()> {
//! let server = Server::start(&ServerConfig::default(), |conn: &ConnectionId, msg: Message| {
//!     println!("{} sent type {}", conn, msg.msg_type());
//! })?;
//! println!("listening on {}", server.local_addr());
//! server.shutdown(Duration::from_secs(2))?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, trace, warn};

use crate::config::ServerConfig;
use crate::queue::InterruptibleQueue;
use crate::thread::ManagedThread;
use crate::wire::{FrameDecoder, Message};
use crate::{Result, VigilError};

/// How long the wake-up connection may take to establish.
const WAKE_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Identity of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    serial: u64,
    peer: SocketAddr,
}

impl ConnectionId {
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}({})", self.serial, self.peer)
    }
}

/// Processes decoded messages on a worker thread.
///
/// Runs on a shared worker, so it must not block indefinitely.
pub trait MessageHandler: Send + Sync + 'static {
    fn process(&self, connection: &ConnectionId, message: Message);
}

impl<F> MessageHandler for F
where
    F: Fn(&ConnectionId, Message) + Send + Sync + 'static,
{
    fn process(&self, connection: &ConnectionId, message: Message) {
        self(connection, message)
    }
}

/// A decoded message waiting for a worker.
#[derive(Debug, Clone)]
pub struct Request {
    pub connection: ConnectionId,
    pub message: Message,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    closed: AtomicU64,
    corrupted: AtomicU64,
    enqueued: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time server counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub accepted: u64,
    pub closed: u64,
    /// Connections torn down because their stream was corrupted.
    pub corrupted: u64,
    pub enqueued: u64,
    /// Messages dropped because the request queue was full.
    pub rejected: u64,
}

struct ServerShared {
    queue: InterruptibleQueue<Request>,
    running: AtomicBool,
    counters: Counters,
}

impl ServerShared {
    fn dispatch(&self, connection: ConnectionId, message: Message) {
        if self.queue.enqueue(Request { connection, message }) {
            self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!("Request queue full, dropping message from {}", connection);
        }
    }
}

/// Running server: readiness loop thread plus worker pool.
pub struct Server {
    local_addr: SocketAddr,
    shared: Arc<ServerShared>,
    loop_thread: Option<ManagedThread>,
    workers: Vec<ManagedThread>,
}

impl Server {
    /// Bind `config.address` and start the loop and worker threads.
    ///
    /// A configuration that could never process a message (no workers, empty
    /// reads) is refused with [`VigilError::Config`].
    pub fn start<H>(config: &ServerConfig, handler: H) -> Result<Self>
    where
        H: MessageHandler,
    {
        config
            .validate()
            .map_err(|details| VigilError::config_error("<server config>", details))?;
        let listener = std::net::TcpListener::bind(config.address)
            .map_err(|e| VigilError::io_error(format!("binding {}", config.address), e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| VigilError::io_error("configuring listener", e))?;
        let local_addr =
            listener.local_addr().map_err(|e| VigilError::io_error("reading local address", e))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(|e| VigilError::io_error("building server runtime", e))?;

        let shared = Arc::new(ServerShared {
            queue: InterruptibleQueue::new(config.queue_capacity),
            running: AtomicBool::new(true),
            counters: Counters::default(),
        });

        let handler: Arc<dyn MessageHandler> = Arc::new(handler);
        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let worker_shared = Arc::clone(&shared);
            let handler = Arc::clone(&handler);
            let spawned = ManagedThread::spawn(format!("server-worker-{}", index), move || {
                worker_loop(&worker_shared, handler.as_ref())
            });
            match spawned {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    shared.queue.signal_termination();
                    return Err(e);
                }
            }
        }

        let loop_shared = Arc::clone(&shared);
        let limits = ConnectionLimits {
            read_chunk: config.read_chunk_bytes,
            max_payload: config.max_payload_bytes,
        };
        let loop_thread = ManagedThread::spawn("server-loop", move || {
            runtime.block_on(serve(listener, loop_shared, limits));
        });
        let loop_thread = match loop_thread {
            Ok(thread) => thread,
            Err(e) => {
                shared.queue.signal_termination();
                return Err(e);
            }
        };

        info!("Server listening on {} with {} workers", local_addr, config.workers);
        Ok(Self { local_addr, shared, loop_thread: Some(loop_thread), workers })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Requests waiting for a worker.
    pub fn queue_depth(&self) -> usize {
        self.shared.queue.size()
    }

    pub fn stats(&self) -> ServerStats {
        let c = &self.shared.counters;
        ServerStats {
            accepted: c.accepted.load(Ordering::Relaxed),
            closed: c.closed.load(Ordering::Relaxed),
            corrupted: c.corrupted.load(Ordering::Relaxed),
            enqueued: c.enqueued.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
        }
    }

    /// Stop the loop and workers without joining them.
    ///
    /// Returns whether the wake-up connection reached the listener. Repeated
    /// calls do nothing and return `true`.
    pub fn signal_termination(&self) -> bool {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return true;
        }
        self.shared.queue.signal_termination();

        let target = wake_address(self.local_addr);
        match std::net::TcpStream::connect_timeout(&target, WAKE_CONNECT_TIMEOUT) {
            Ok(_) => true,
            Err(e) => {
                warn!("Wake-up connection to {} failed: {}", target, e);
                false
            }
        }
    }

    /// Signal termination, then join workers and the loop thread, each bounded by `timeout`.
    ///
    /// Every thread is given its chance to stop; the first one still alive is reported.
    pub fn shutdown(mut self, timeout: Duration) -> Result<()> {
        self.signal_termination();
        let mut outcome = Ok(());

        for worker in self.workers.drain(..) {
            if let Err(e) = worker.join_timeout(timeout) {
                outcome = outcome.and(Err(e));
            }
        }
        if let Some(loop_thread) = self.loop_thread.take()
            && let Err(e) = loop_thread.join_timeout(timeout)
        {
            outcome = outcome.and(Err(e));
        }

        match &outcome {
            Ok(()) => info!("Server on {} stopped", self.local_addr),
            Err(e) => error!("Server on {} did not stop cleanly: {}", self.local_addr, e),
        }
        outcome
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.loop_thread.is_some() {
            debug!("Dropping server without shutdown");
            self.signal_termination();
        }
    }
}

/// Per-connection read settings.
#[derive(Debug, Clone, Copy)]
struct ConnectionLimits {
    read_chunk: usize,
    max_payload: usize,
}

/// Address to dial to reach our own listener.
fn wake_address(local: SocketAddr) -> SocketAddr {
    match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(Ipv4Addr::LOCALHOST.into(), local.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(Ipv6Addr::LOCALHOST.into(), local.port()),
        _ => local,
    }
}

fn worker_loop(shared: &ServerShared, handler: &dyn MessageHandler) {
    while let Some(request) = shared.queue.dequeue() {
        trace!("Worker processing message from {}", request.connection);
        handler.process(&request.connection, request.message);
    }
    debug!("Server worker exiting");
}

async fn serve(listener: std::net::TcpListener, shared: Arc<ServerShared>, limits: ConnectionLimits) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to register listener: {}", e);
            return;
        }
    };

    let mut next_serial = 0u64;
    while shared.running.load(Ordering::SeqCst) {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if !shared.running.load(Ordering::SeqCst) {
                    debug!("Woken by {} during shutdown", peer);
                    break;
                }
                next_serial += 1;
                let connection = ConnectionId { serial: next_serial, peer };
                shared.counters.accepted.fetch_add(1, Ordering::Relaxed);
                debug!("Accepted {}", connection);
                tokio::spawn(service_connection(stream, connection, Arc::clone(&shared), limits));
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    info!("Server loop stopped");
}

async fn service_connection(
    mut stream: TcpStream,
    connection: ConnectionId,
    shared: Arc<ServerShared>,
    limits: ConnectionLimits,
) {
    let mut decoder = FrameDecoder::with_max_payload(limits.max_payload);
    let mut buf = vec![0u8; limits.read_chunk];

    loop {
        match stream.read(&mut buf).await {
            Ok(0) => {
                if !decoder.finish() {
                    debug!("{} closed mid-message", connection);
                }
                break;
            }
            Ok(n) => {
                for message in decoder.feed(&buf[..n]) {
                    shared.dispatch(connection, message);
                }
                if decoder.is_corrupted() {
                    warn!("Closing {} after corrupted stream", connection);
                    shared.counters.corrupted.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            }
            Err(e) => {
                debug!("Read from {} failed: {}", connection, e);
                break;
            }
        }
    }

    shared.counters.closed.fetch_add(1, Ordering::Relaxed);
    debug!("Closed {}", connection);
}
