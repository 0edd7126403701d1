//! `Connection`: the shared, thread-safe view of one TCP connection.
//!
//! The socket itself is owned by the reactor task driving it. Handlers and
//! application code only see this wrapper: inbound bytes buffered by the
//! reactor, an outbound queue the reactor drains when the socket is
//! writable, the lifecycle state and the attachment table.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use tokio::sync::Notify;
use tracing::trace;

use crate::buffer::ByteCursor;
use crate::error::WeftError;
use crate::pipeline::attachment::Attachments;
use crate::state::ConnectionState;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// We dialed out.
    Initiator,
    /// We accepted it.
    Acceptor,
}

// ── Connection ───────────────────────────────────────────────────

pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    mode: Mode,
    state: Mutex<ConnectionState>,
    inbound: Mutex<ByteCursor>,
    outbound: Mutex<ByteCursor>,
    /// Serializes delivery of inbound data through the pipeline.
    read_lock: ReentrantMutex<()>,
    /// Serializes traversal of the outbound path.
    write_lock: ReentrantMutex<()>,
    disconnected: AtomicBool,
    wakeup: Notify,
    attachments: Attachments,
}

impl Connection {
    /// Create a connection in the `Open` state.
    ///
    /// The reactor calls this for every accepted or dialed socket. Tests
    /// can use it directly to build in-process connection pairs.
    pub fn new(peer: SocketAddr, mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::next(),
            peer,
            mode,
            state: Mutex::new(ConnectionState::default()),
            inbound: Mutex::new(ByteCursor::new()),
            outbound: Mutex::new(ByteCursor::new()),
            read_lock: ReentrantMutex::new(()),
            write_lock: ReentrantMutex::new(()),
            disconnected: AtomicBool::new(false),
            wakeup: Notify::new(),
            attachments: Attachments::default(),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn remote_host(&self) -> String {
        self.peer.ip().to_string()
    }

    pub fn remote_port(&self) -> u16 {
        self.peer.port()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_initiator(&self) -> bool {
        self.mode == Mode::Initiator
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().is_open()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().is_closed()
    }

    // ── Data path ────────────────────────────────────────────────

    /// Move every byte already received into `out`. Never touches the
    /// socket; returns 0 when nothing is buffered.
    pub fn read(&self, out: &mut ByteCursor) -> usize {
        self.inbound.lock().transfer_to(out)
    }

    /// Queue `data` for transmission and ask the reactor to flush it.
    /// Never blocks on the network.
    pub fn write(&self, mut data: ByteCursor) -> Result<(), WeftError> {
        if self.is_closed() {
            return Err(WeftError::ChannelClosed);
        }
        let n = data.transfer_to(&mut self.outbound.lock());
        trace!(conn = %self.id, bytes = n, "queued write");
        self.wakeup.notify_one();
        Ok(())
    }

    /// Take everything queued for transmission. The reactor drains the
    /// queue directly; this is for in-process transports.
    pub fn take_outbound(&self) -> ByteCursor {
        let mut out = ByteCursor::new();
        self.outbound.lock().transfer_to(&mut out);
        out
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.outbound.lock().is_empty()
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Move `Open` → `Closing`. Returns `true` for exactly one caller.
    pub fn prepare_close(&self) -> bool {
        let moved = self.state.lock().begin_close().is_ok();
        if moved {
            self.wakeup.notify_one();
        }
        moved
    }

    /// Mark the connection closed. The reactor flushes what is queued and
    /// releases the socket. Idempotent.
    pub fn close(&self) {
        if self.state.lock().finish_close().is_ok() {
            trace!(conn = %self.id, "closed");
            self.wakeup.notify_one();
        }
    }

    // ── Crate internals ──────────────────────────────────────────

    pub(crate) fn push_inbound(&self, bytes: &[u8]) {
        self.inbound.lock().write(bytes);
    }

    pub(crate) fn outbound(&self) -> parking_lot::MutexGuard<'_, ByteCursor> {
        self.outbound.lock()
    }

    pub(crate) fn read_guard(&self) -> ReentrantMutexGuard<'_, ()> {
        self.read_lock.lock()
    }

    pub(crate) fn write_guard(&self) -> ReentrantMutexGuard<'_, ()> {
        self.write_lock.lock()
    }

    /// Returns `true` the first time it is called.
    pub(crate) fn mark_disconnected(&self) -> bool {
        !self.disconnected.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    pub(crate) async fn woken(&self) {
        self.wakeup.notified().await
    }

    pub(crate) fn attachments(&self) -> &Attachments {
        &self.attachments
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("mode", &self.mode)
            .field("state", &*self.state.lock())
            .finish()
    }
}
