//! `Server`, `Client` and `PeerNode`: reactors plus a dispatcher, wired
//! together.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::buffer::ByteCursor;
use crate::codec::{SecureChannelCodec, TlsCodec};
use crate::config::{EngineConfig, LinkSecurity};
use crate::error::WeftError;
use crate::network::{Connection, Dispatcher, Reactor};
use crate::pipeline::{Handler, Pipeline};

// ── Server ───────────────────────────────────────────────────────

/// Accepts connections on one address and runs them through a pipeline.
#[derive(Debug)]
pub struct Server {
    reactor: Reactor,
    dispatcher: Arc<Dispatcher>,
    local_addr: SocketAddr,
}

impl Server {
    pub fn bind(addr: SocketAddr, pipeline: Pipeline, config: &EngineConfig) -> Result<Self, WeftError> {
        let dispatcher = Dispatcher::new(pipeline, &config.reactor, &config.pool)?;
        let reactor = Reactor::new("server", &config.reactor)?;
        let local_addr = reactor.listen(addr, dispatcher.clone())?;
        Ok(Self {
            reactor,
            dispatcher,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn is_running(&self) -> bool {
        self.reactor.is_running()
    }

    pub fn active_connections(&self) -> usize {
        self.reactor.active_connections()
    }

    pub fn stop(&mut self) {
        self.reactor.stop();
    }
}

// ── Client ───────────────────────────────────────────────────────

/// Dials outbound connections. One reactor serves every connection the
/// client opens.
#[derive(Debug)]
pub struct Client {
    reactor: Reactor,
    dispatcher: Arc<Dispatcher>,
}

impl Client {
    pub fn new(pipeline: Pipeline, config: &EngineConfig) -> Result<Self, WeftError> {
        let dispatcher = Dispatcher::new(pipeline, &config.reactor, &config.pool)?;
        let reactor = Reactor::new("client", &config.reactor)?;
        Ok(Self {
            reactor,
            dispatcher,
        })
    }

    pub fn connect(&self, addr: SocketAddr) -> Result<Arc<Connection>, WeftError> {
        self.reactor.connect(addr, self.dispatcher.clone())
    }

    /// Send `msg` through the pipeline's outbound path.
    pub fn send(&self, conn: &Arc<Connection>, msg: ByteCursor) -> Result<(), WeftError> {
        self.dispatcher.write(conn, msg)
    }

    pub fn close(&self, conn: &Arc<Connection>) {
        self.dispatcher.close(conn);
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn is_running(&self) -> bool {
        self.reactor.is_running()
    }

    pub fn shutdown(&mut self) {
        self.reactor.stop();
    }
}

// ── PeerNode ─────────────────────────────────────────────────────

/// A listening server plus outbound links to known peers.
///
/// Accepted and dialed connections run through the same pipeline and
/// dispatcher, so they share one worker pool. The pipeline's head is the
/// link protocol chosen by `config.peer.security`.
#[derive(Debug)]
pub struct PeerNode {
    reactor: Reactor,
    dispatcher: Arc<Dispatcher>,
    local_addr: SocketAddr,
    links: Mutex<HashMap<SocketAddr, Arc<Connection>>>,
}

impl PeerNode {
    /// Listen on `addr` and dial every address in `peers`.
    ///
    /// A peer that cannot be reached gets its disconnect event like any
    /// failed connect; the node keeps running.
    pub fn start(
        addr: SocketAddr,
        peers: &[SocketAddr],
        handlers: Vec<Arc<dyn Handler>>,
        config: &EngineConfig,
    ) -> Result<Self, WeftError> {
        let link: Arc<dyn Handler> = match config.peer.security {
            LinkSecurity::Secure => Arc::new(SecureChannelCodec::new(&config.secure)?),
            LinkSecurity::Tls => Arc::new(TlsCodec::from_settings(&config.tls)?),
        };
        let pipeline = Pipeline::builder().push(link)?.add(handlers)?.build()?;
        let dispatcher = Dispatcher::new(pipeline, &config.reactor, &config.pool)?;
        let reactor = Reactor::new("peer", &config.reactor)?;
        let local_addr = reactor.listen(addr, dispatcher.clone())?;

        let node = Self {
            reactor,
            dispatcher,
            local_addr,
            links: Mutex::new(HashMap::new()),
        };
        for peer in peers {
            node.add_peer(*peer)?;
        }
        info!(%local_addr, peers = peers.len(), security = ?config.peer.security, "peer node up");
        Ok(node)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Dial `peer`, replacing any existing link to it.
    pub fn add_peer(&self, peer: SocketAddr) -> Result<Arc<Connection>, WeftError> {
        let conn = self.reactor.connect(peer, self.dispatcher.clone())?;
        if let Some(old) = self.links.lock().insert(peer, conn.clone()) {
            self.dispatcher.close(&old);
        }
        debug!(%peer, conn = %conn.id(), "peer link dialed");
        Ok(conn)
    }

    /// Endpoints with a dialed link.
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.links.lock().keys().copied().collect()
    }

    pub fn link(&self, peer: SocketAddr) -> Option<Arc<Connection>> {
        self.links.lock().get(&peer).cloned()
    }

    /// Send `msg` over the link dialed to `peer`.
    pub fn send(&self, peer: SocketAddr, msg: ByteCursor) -> Result<(), WeftError> {
        let Some(conn) = self.link(peer) else {
            warn!(%peer, "no link to peer");
            return Err(WeftError::UnknownPeer(peer));
        };
        self.dispatcher.write(&conn, msg)
    }

    /// Close and forget the link to `peer`. Returns `false` if there was
    /// none.
    pub fn disconnect(&self, peer: SocketAddr) -> bool {
        let Some(conn) = self.links.lock().remove(&peer) else {
            return false;
        };
        self.dispatcher.close(&conn);
        true
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn is_running(&self) -> bool {
        self.reactor.is_running()
    }

    /// Close every link, then stop the listener and the reactor.
    pub fn stop(&mut self) {
        let links: Vec<_> = self.links.lock().drain().map(|(_, conn)| conn).collect();
        for conn in &links {
            self.dispatcher.close(conn);
        }
        self.reactor.stop();
    }
}
