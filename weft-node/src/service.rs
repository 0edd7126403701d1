//! Node roles: the echo server and the one-shot sender.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info};

use weft_core::{
    ByteCursor, Client, Context, FrameCodec, Handler, Pipeline, SecureChannelCodec, Server, TlsCodec,
    WeftError,
};

use crate::config::{CodecKind, NodeConfig};

// ── Handlers ─────────────────────────────────────────────────────

/// Writes every message straight back.
pub struct Echo;

impl Handler for Echo {
    fn on_connect(&self, ctx: &Context<'_>) -> Result<(), WeftError> {
        info!(conn = %ctx.connection().id(), peer = %ctx.connection().peer_addr(), "peer connected");
        Ok(())
    }

    fn on_read(&self, ctx: &Context<'_>, msg: ByteCursor) -> Result<(), WeftError> {
        debug!(conn = %ctx.connection().id(), bytes = msg.available(), "echo");
        ctx.write(msg)
    }

    fn on_disconnect(&self, ctx: &Context<'_>) -> Result<(), WeftError> {
        info!(conn = %ctx.connection().id(), "peer disconnected");
        Ok(())
    }

    fn is_terminal(&self) -> bool {
        true
    }
}

/// Hands the first message received to a waiting caller.
pub struct Reply {
    tx: Mutex<Option<oneshot::Sender<Vec<u8>>>>,
}

impl Reply {
    pub fn channel() -> (Arc<Self>, oneshot::Receiver<Vec<u8>>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }
}

impl Handler for Reply {
    fn on_read(&self, _ctx: &Context<'_>, mut msg: ByteCursor) -> Result<(), WeftError> {
        if let Some(tx) = self.tx.lock().take() {
            // The caller may have timed out and gone.
            let _ = tx.send(msg.read_all());
        }
        Ok(())
    }

    fn on_disconnect(&self, _ctx: &Context<'_>) -> Result<(), WeftError> {
        // Wakes the caller with a disconnect instead of a timeout.
        self.tx.lock().take();
        Ok(())
    }

    fn is_terminal(&self) -> bool {
        true
    }
}

// ── Pipelines ────────────────────────────────────────────────────

/// The codec stack selected by `config.codec`, followed by `app`.
pub fn pipeline(config: &NodeConfig, app: Arc<dyn Handler>) -> Result<Pipeline, WeftError> {
    let engine = &config.engine;
    let codec: Arc<dyn Handler> = match config.codec {
        CodecKind::Frame => Arc::new(FrameCodec::from_config(&engine.frame)?),
        CodecKind::Tls => Arc::new(TlsCodec::from_settings(&engine.tls)?),
        CodecKind::Secure => Arc::new(SecureChannelCodec::new(&engine.secure)?),
    };
    Pipeline::builder().push(codec)?.push(app)?.build()
}

fn parse_addr(addr: &str) -> Result<SocketAddr, WeftError> {
    addr.parse()
        .map_err(|e| WeftError::Config(format!("invalid address {addr:?}: {e}")))
}

// ── Roles ────────────────────────────────────────────────────────

/// Start an echo server on `config.network.listen`.
pub fn serve(config: &NodeConfig) -> Result<Server, WeftError> {
    let addr = parse_addr(&config.network.listen)?;
    let server = Server::bind(addr, pipeline(config, Arc::new(Echo))?, &config.engine)?;
    info!(addr = %server.local_addr(), codec = ?config.codec, "echo server up");
    Ok(server)
}

/// Send `message` to `config.network.peer` and wait for the echo.
pub fn send(config: &NodeConfig, message: &[u8]) -> Result<Vec<u8>, WeftError> {
    let peer = parse_addr(&config.network.peer)?;
    let timeout = Duration::from_millis(config.network.reply_timeout_ms);

    let (reply, rx) = Reply::channel();
    let mut client = Client::new(pipeline(config, reply)?, &config.engine)?;
    let conn = client.connect(peer)?;
    client.send(&conn, ByteCursor::from(message))?;

    // The engine runs its own reactors; this runtime only waits.
    let waiter = tokio::runtime::Builder::new_current_thread().enable_time().build()?;
    let result = match waiter.block_on(tokio::time::timeout(timeout, rx)) {
        Ok(Ok(body)) => Ok(body),
        Ok(Err(_)) => Err(WeftError::ChannelClosed),
        Err(_) => Err(WeftError::Other(format!(
            "no reply from {peer} within {timeout:?}"
        ))),
    };
    client.close(&conn);
    client.shutdown();
    result
}
