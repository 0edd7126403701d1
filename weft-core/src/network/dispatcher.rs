//! `Dispatcher`: turns reactor events into pipeline events.
//!
//! Connect events run synchronously on the reactor thread so they always
//! precede the first read. Read delivery, disconnects and error chains run
//! on the worker pool (or inline when no pool is configured).
//!
//! Ordering: the reactor appends socket bytes to the connection's inbound
//! buffer in arrival order, and every delivery task drains that buffer
//! while holding the connection's read lock. Whichever worker wins the lock
//! sees the oldest bytes first, so the pipeline observes the byte stream in
//! order however the pool schedules its threads.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::buffer::ByteCursor;
use crate::config::{ReactorConfig, WorkerPoolConfig};
use crate::error::WeftError;
use crate::network::Connection;
use crate::network::io::{ReadReport, SocketIo, flush_socket, read_socket};
use crate::pipeline::Pipeline;
use crate::task::{WorkerPool, run_guarded};

pub struct Dispatcher {
    pipeline: Pipeline,
    pool: Mutex<Option<Arc<WorkerPool>>>,
    read_retries: usize,
    read_chunk: usize,
    read_limit: usize,
}

impl Dispatcher {
    /// A dispatcher backed by the shared worker pool, or running inline
    /// when `pool.enabled` is false.
    pub fn new(
        pipeline: Pipeline,
        reactor: &ReactorConfig,
        pool: &WorkerPoolConfig,
    ) -> Result<Arc<Self>, WeftError> {
        reactor.validate()?;
        let pool = if pool.enabled {
            Some(WorkerPool::shared(pool)?)
        } else {
            None
        };
        Ok(Arc::new(Self {
            pipeline,
            pool: Mutex::new(pool),
            read_retries: reactor.read_retries,
            read_chunk: reactor.read_chunk,
            read_limit: reactor.read_limit,
        }))
    }

    /// A dispatcher that runs every handler on the calling thread.
    pub fn inline(pipeline: Pipeline) -> Arc<Self> {
        let reactor = ReactorConfig::default();
        Arc::new(Self {
            pipeline,
            pool: Mutex::new(None),
            read_retries: reactor.read_retries,
            read_chunk: reactor.read_chunk,
            read_limit: reactor.read_limit,
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn is_inline(&self) -> bool {
        self.pool.lock().is_none()
    }

    /// No handler work queued or running.
    pub fn is_idle(&self) -> bool {
        self.pool.lock().as_ref().is_none_or(|pool| pool.pending() == 0)
    }

    pub(crate) fn read_chunk(&self) -> usize {
        self.read_chunk
    }

    // ── Application entry points ─────────────────────────────────

    /// Send `msg` through the whole outbound path, starting at the tail.
    pub fn write(&self, conn: &Arc<Connection>, msg: ByteCursor) -> Result<(), WeftError> {
        self.pipeline.write(conn, msg)
    }

    /// Hand `bytes` to the pipeline as if they had been read from the
    /// connection's socket.
    pub fn deliver(self: &Arc<Self>, conn: &Arc<Connection>, bytes: &[u8]) {
        if bytes.is_empty() || !conn.is_open() {
            return;
        }
        conn.push_inbound(bytes);
        self.schedule_read(conn);
    }

    /// Begin closing `conn` from the application side.
    pub fn close(self: &Arc<Self>, conn: &Arc<Connection>) {
        if conn.prepare_close() {
            self.on_close(conn);
        }
    }

    /// Release the worker pool. Later work runs inline.
    pub fn shutdown(&self) {
        if self.pool.lock().take().is_some() {
            debug!("dispatcher released worker pool");
        }
    }

    // ── Reactor events ───────────────────────────────────────────

    /// A server socket accepted `conn`.
    pub fn on_accept(self: &Arc<Self>, conn: &Arc<Connection>) {
        debug!(conn = %conn.id(), peer = %conn.peer_addr(), "accepted");
        self.connected(conn);
    }

    /// An outbound connect for `conn` completed.
    pub fn on_connect(self: &Arc<Self>, conn: &Arc<Connection>) {
        debug!(conn = %conn.id(), peer = %conn.peer_addr(), "connected");
        self.connected(conn);
    }

    /// The socket is readable: pull a bounded amount and schedule delivery.
    pub fn on_read<S: SocketIo + ?Sized>(
        self: &Arc<Self>,
        io: &S,
        conn: &Arc<Connection>,
        scratch: &mut [u8],
    ) -> ReadReport {
        if !conn.is_open() {
            return ReadReport::default();
        }
        let report = match read_socket(io, conn, scratch, self.read_retries, self.read_limit) {
            Ok(report) => report,
            Err(e) => {
                self.on_error(conn, e.into());
                return ReadReport::default();
            }
        };
        trace!(conn = %conn.id(), bytes = report.bytes, eof = report.eof, "read pass");
        if report.bytes > 0 {
            self.schedule_read(conn);
        }
        if report.eof && conn.prepare_close() {
            debug!(conn = %conn.id(), "peer closed");
            self.on_close(conn);
        }
        report
    }

    /// The socket is writable: drain queued output. Returns `true` once
    /// nothing is left to write.
    pub fn on_write<S: SocketIo + ?Sized>(self: &Arc<Self>, io: &S, conn: &Arc<Connection>) -> bool {
        match flush_socket(io, conn) {
            Ok(drained) => drained,
            Err(e) => {
                self.on_error(conn, e.into());
                true
            }
        }
    }

    /// Schedule the disconnect sequence for a connection that has left
    /// the `Open` state.
    pub fn on_close(self: &Arc<Self>, conn: &Arc<Connection>) {
        let this = Arc::clone(self);
        let conn = Arc::clone(conn);
        self.run(move || this.disconnect(&conn));
    }

    /// Run the disconnect sequence on the calling thread.
    pub fn on_close_now(&self, conn: &Arc<Connection>) {
        conn.prepare_close();
        run_guarded(|| self.disconnect(conn));
    }

    /// An outbound connect failed: run the error chain, then the
    /// disconnect sequence.
    pub fn on_connect_failed(self: &Arc<Self>, conn: &Arc<Connection>, err: WeftError) {
        let this = Arc::clone(self);
        let conn = Arc::clone(conn);
        self.run(move || {
            let _guard = conn.read_guard();
            this.raise(&conn, err);
            conn.prepare_close();
            this.teardown(&conn);
        });
    }

    /// Run the error chain for `err` on the worker pool.
    pub fn on_error(self: &Arc<Self>, conn: &Arc<Connection>, err: WeftError) {
        let this = Arc::clone(self);
        let conn = Arc::clone(conn);
        self.run(move || {
            let _guard = conn.read_guard();
            this.raise(&conn, err);
        });
    }

    // ── Internals ────────────────────────────────────────────────

    fn connected(self: &Arc<Self>, conn: &Arc<Connection>) {
        let _guard = conn.read_guard();
        if let Err(err) = self.pipeline.fire_connect(conn) {
            self.raise(conn, err);
        }
    }

    fn schedule_read(self: &Arc<Self>, conn: &Arc<Connection>) {
        let this = Arc::clone(self);
        let conn = Arc::clone(conn);
        self.run(move || {
            let _guard = conn.read_guard();
            this.drain(&conn);
        });
    }

    /// Deliver everything buffered for `conn`. Caller holds the read lock.
    fn drain(&self, conn: &Arc<Connection>) {
        loop {
            if conn.is_closed() {
                return;
            }
            let mut msg = ByteCursor::new();
            if conn.read(&mut msg) == 0 {
                return;
            }
            if let Err(err) = self.pipeline.fire_read(conn, msg) {
                self.raise(conn, err);
            }
        }
    }

    fn disconnect(&self, conn: &Arc<Connection>) {
        let _guard = conn.read_guard();
        self.drain(conn);
        self.teardown(conn);
    }

    /// Fire the disconnect event (once) and close. Caller holds the read lock.
    fn teardown(&self, conn: &Arc<Connection>) {
        if conn.mark_disconnected() {
            if let Err(err) = self.pipeline.fire_disconnect(conn) {
                warn!(conn = %conn.id(), "error during disconnect: {err}");
            }
            conn.attachments().clear();
            debug!(conn = %conn.id(), "disconnected");
        }
        conn.close();
    }

    /// Route `err` through the error chain; apply the unhandled-error
    /// policy if nothing consumed it. Caller holds the read lock.
    fn raise(&self, conn: &Arc<Connection>, err: WeftError) {
        let Err(err) = self.pipeline.fire_error(conn, err) else {
            return;
        };
        if err.is_fatal() {
            warn!(conn = %conn.id(), "unhandled error, closing: {err}");
            conn.prepare_close();
            conn.close();
            self.teardown(conn);
        } else {
            warn!(conn = %conn.id(), "unhandled error: {err}");
        }
    }

    fn run<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let pool = self.pool.lock().clone();
        match pool {
            Some(pool) => pool.execute(job),
            None => run_guarded(job),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pipeline", &self.pipeline)
            .field("inline", &self.is_inline())
            .finish()
    }
}
