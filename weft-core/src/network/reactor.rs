//! `Reactor`: the readiness event loop.
//!
//! A reactor owns a small tokio runtime. Every listener gets an accept task
//! and every connection gets a task that owns the socket and waits for the
//! readiness the connection currently needs: readable while open, writable
//! while output is queued. Handler work never runs here; the task only
//! moves bytes between the socket and the connection's buffers and reports
//! events to the [`Dispatcher`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{Interest, Ready};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::config::ReactorConfig;
use crate::error::WeftError;
use crate::network::dispatcher::Dispatcher;
use crate::network::io::flush_socket;
use crate::network::{Connection, Mode};

/// Pause after a failed accept so a persistent failure (e.g. fd
/// exhaustion) does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// How often `stop` rechecks the worker pool while it drains.
const IDLE_POLL: Duration = Duration::from_millis(5);

// ── Shared task state ────────────────────────────────────────────

#[derive(Clone)]
struct Shared {
    cancel: CancellationToken,
    /// Accept loops.
    listeners: TaskTracker,
    /// One task per connection, dialing included.
    connections: TaskTracker,
    linger: Duration,
}

// ── Reactor ──────────────────────────────────────────────────────

pub struct Reactor {
    name: String,
    runtime: Option<Runtime>,
    shared: Shared,
    dispatchers: Mutex<Vec<Arc<Dispatcher>>>,
    grace: Duration,
}

impl Reactor {
    pub fn new(name: &str, config: &ReactorConfig) -> Result<Self, WeftError> {
        config.validate()?;
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.threads)
            .thread_name(format!("weft-{name}"))
            .enable_all()
            .build()?;
        Ok(Self {
            name: name.to_string(),
            runtime: Some(runtime),
            shared: Shared {
                cancel: CancellationToken::new(),
                listeners: TaskTracker::new(),
                connections: TaskTracker::new(),
                linger: config.close_linger(),
            },
            dispatchers: Mutex::new(Vec::new()),
            grace: config.shutdown_grace(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.runtime.is_some() && !self.shared.cancel.is_cancelled()
    }

    /// Connection tasks currently alive.
    pub fn active_connections(&self) -> usize {
        self.shared.connections.len()
    }

    /// Bind `addr` and accept connections into `dispatcher`.
    ///
    /// Returns the bound address (useful with port 0).
    pub fn listen(&self, addr: SocketAddr, dispatcher: Arc<Dispatcher>) -> Result<SocketAddr, WeftError> {
        let runtime = self.runtime()?;
        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let local = std_listener.local_addr()?;
        let listener = {
            let _enter = runtime.enter();
            TcpListener::from_std(std_listener)?
        };
        self.register(&dispatcher);
        self.shared
            .listeners
            .spawn_on(accept_loop(listener, dispatcher, self.shared.clone()), runtime.handle());
        info!(reactor = %self.name, %local, "listening");
        Ok(local)
    }

    /// Start connecting to `addr`. The returned connection is usable
    /// immediately; writes queue until the socket is up. Completion fires
    /// the connect event, failure the error event.
    pub fn connect(&self, addr: SocketAddr, dispatcher: Arc<Dispatcher>) -> Result<Arc<Connection>, WeftError> {
        let runtime = self.runtime()?;
        let conn = Connection::new(addr, Mode::Initiator);
        self.register(&dispatcher);
        self.shared.connections.spawn_on(
            connect_task(conn.clone(), dispatcher, self.shared.clone()),
            runtime.handle(),
        );
        Ok(conn)
    }

    /// Stop accepting, close every connection (each gets its disconnect
    /// event), release dispatchers and shut the runtime down. Idempotent.
    pub fn stop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        self.shared.cancel.cancel();
        self.shared.listeners.close();
        self.shared.connections.close();

        // Blocking waits are not allowed inside an async context.
        let in_async = Handle::try_current().is_ok();
        let dispatchers: Vec<_> = self.dispatchers.lock().drain(..).collect();
        if !in_async {
            let shared = self.shared.clone();
            let drained = runtime.block_on(async {
                tokio::time::timeout(self.grace, async {
                    shared.listeners.wait().await;
                    shared.connections.wait().await;
                    // Disconnect chains scheduled by the last tasks.
                    while dispatchers.iter().any(|d| !d.is_idle()) {
                        tokio::time::sleep(IDLE_POLL).await;
                    }
                })
                .await
            });
            if drained.is_err() {
                warn!(reactor = %self.name, "shutdown grace elapsed with work outstanding");
            }
        }
        for dispatcher in &dispatchers {
            dispatcher.shutdown();
        }
        if in_async {
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(self.grace);
        }
        info!(reactor = %self.name, "stopped");
    }

    fn runtime(&self) -> Result<&Runtime, WeftError> {
        match &self.runtime {
            Some(rt) if !self.shared.cancel.is_cancelled() => Ok(rt),
            _ => Err(WeftError::ChannelClosed),
        }
    }

    fn register(&self, dispatcher: &Arc<Dispatcher>) {
        let mut list = self.dispatchers.lock();
        if !list.iter().any(|d| Arc::ptr_eq(d, dispatcher)) {
            list.push(dispatcher.clone());
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .field("active", &self.active_connections())
            .finish()
    }
}

// ── Tasks ────────────────────────────────────────────────────────

async fn accept_loop(listener: TcpListener, dispatcher: Arc<Dispatcher>, shared: Shared) {
    loop {
        let accepted = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            res = listener.accept() => res,
        };
        match accepted {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(%peer, "set_nodelay failed: {e}");
                }
                let conn = Connection::new(peer, Mode::Acceptor);
                dispatcher.on_accept(&conn);
                shared
                    .connections
                    .spawn(drive(stream, conn, dispatcher.clone(), shared.clone()));
            }
            Err(e) => {
                warn!("accept failed: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    debug!("listener stopped");
}

async fn connect_task(conn: Arc<Connection>, dispatcher: Arc<Dispatcher>, shared: Shared) {
    let res = tokio::select! {
        _ = shared.cancel.cancelled() => {
            dispatcher.on_close_now(&conn);
            return;
        }
        res = TcpStream::connect(conn.peer_addr()) => res,
    };
    match res {
        Ok(stream) => {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(conn = %conn.id(), "set_nodelay failed: {e}");
            }
            dispatcher.on_connect(&conn);
            drive(stream, conn, dispatcher, shared).await;
        }
        Err(e) => {
            warn!(conn = %conn.id(), peer = %conn.peer_addr(), "connect failed: {e}");
            dispatcher.on_connect_failed(&conn, e.into());
        }
    }
}

/// Own `stream` for the lifetime of `conn`.
async fn drive(stream: TcpStream, conn: Arc<Connection>, dispatcher: Arc<Dispatcher>, shared: Shared) {
    let mut scratch = vec![0u8; dispatcher.read_chunk()];
    loop {
        if conn.is_closed() {
            break;
        }
        let interest = match (conn.is_open(), conn.has_pending_writes()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };
        tokio::select! {
            _ = shared.cancel.cancelled() => {
                dispatcher.on_close_now(&conn);
                break;
            }
            _ = conn.woken() => {}
            ready = wait_ready(&stream, interest) => match ready {
                Ok(ready) => {
                    if ready.is_readable() && conn.is_open() {
                        dispatcher.on_read(&stream, &conn, &mut scratch);
                    }
                    if ready.is_writable() && conn.has_pending_writes() {
                        dispatcher.on_write(&stream, &conn);
                    }
                }
                Err(e) => {
                    warn!(conn = %conn.id(), "readiness failed: {e}");
                    dispatcher.on_close_now(&conn);
                    break;
                }
            }
        }
    }

    if conn.has_pending_writes() {
        let flushed = tokio::time::timeout(shared.linger, flush_all(&stream, &conn)).await;
        if !matches!(flushed, Ok(Ok(()))) {
            debug!(conn = %conn.id(), "dropping unsent output on close");
        }
    }
    // Closed by a handler or the application rather than by the engine.
    if !conn.is_disconnected() {
        dispatcher.on_close(&conn);
    }
    trace!(conn = %conn.id(), "socket released");
}

async fn wait_ready(stream: &TcpStream, interest: Option<Interest>) -> io::Result<Ready> {
    match interest {
        Some(interest) => stream.ready(interest).await,
        None => std::future::pending().await,
    }
}

async fn flush_all(stream: &TcpStream, conn: &Connection) -> io::Result<()> {
    while !flush_socket(stream, conn)? {
        stream.writable().await?;
    }
    Ok(())
}
