//! `TlsCodec`: TLS over the pipeline.
//!
//! Inbound ciphertext is decrypted and forwarded as plaintext; outbound
//! plaintext is encrypted before it continues towards the socket. The
//! connect event is held back until the handshake completes, so later
//! handlers only ever see an established channel.

pub mod config;
mod session;

use std::sync::Arc;

use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};
use tracing::debug;

use crate::buffer::ByteCursor;
use crate::config::TlsSettings;
use crate::error::WeftError;
use crate::network::Mode;
use crate::pipeline::{Context, Handler};

pub use session::{HandshakeStatus, TlsSession};

#[derive(Clone, Default)]
pub struct TlsCodec {
    server: Option<Arc<ServerConfig>>,
    client: Option<(Arc<ClientConfig>, ServerName<'static>)>,
}

impl TlsCodec {
    /// Accepted connections act as TLS servers.
    pub fn server(config: Arc<ServerConfig>) -> Self {
        Self {
            server: Some(config),
            client: None,
        }
    }

    /// Dialed connections act as TLS clients expecting `server_name`.
    pub fn client(config: Arc<ClientConfig>, server_name: &str) -> Result<Self, WeftError> {
        Ok(Self {
            server: None,
            client: Some((config, config::server_name(server_name)?)),
        })
    }

    /// Both roles, for nodes that accept and dial on the same pipeline.
    pub fn with_client(mut self, config: Arc<ClientConfig>, server_name: &str) -> Result<Self, WeftError> {
        self.client = Some((config, config::server_name(server_name)?));
        Ok(self)
    }

    /// Roles enabled by whatever material `settings` provides: server
    /// with a certificate and key, client with roots or `trust_peer`.
    pub fn from_settings(settings: &TlsSettings) -> Result<Self, WeftError> {
        let mut codec = Self::default();
        if settings.cert_path.is_some() && settings.key_path.is_some() {
            codec.server = Some(config::server_config(settings)?);
        }
        if settings.trust_peer || settings.ca_path.is_some() {
            codec = codec.with_client(config::client_config(settings)?, &settings.server_name)?;
        }
        if codec.server.is_none() && codec.client.is_none() {
            return Err(WeftError::Config("tls settings enable neither role".into()));
        }
        Ok(codec)
    }

    fn session(&self, ctx: &Context<'_>) -> Result<Arc<Mutex<TlsSession>>, WeftError> {
        let mode = ctx.connection().mode();
        ctx.attachment_with(|| match (mode, &self.server, &self.client) {
            (Mode::Acceptor, Some(cfg), _) => TlsSession::server(cfg.clone()),
            (Mode::Initiator, _, Some((cfg, name))) => TlsSession::client(cfg.clone(), name.clone()),
            // Fatal: without a session the connection can never be used.
            (Mode::Acceptor, None, _) => Err(WeftError::TlsHandshake(
                "no server config for accepted connection".into(),
            )),
            (Mode::Initiator, _, None) => Err(WeftError::TlsHandshake(
                "no client config for dialed connection".into(),
            )),
        })
    }

    fn send(ctx: &Context<'_>, records: Option<ByteCursor>) -> Result<(), WeftError> {
        match records {
            Some(records) => ctx.write(records),
            None => Ok(()),
        }
    }
}

impl Handler for TlsCodec {
    fn on_connect(&self, ctx: &Context<'_>) -> Result<(), WeftError> {
        let session = self.session(ctx)?;
        let _guard = ctx.connection().write_guard();
        // A client has its hello queued already; a server has nothing yet.
        let records = session.lock().take_records()?;
        Self::send(ctx, records)
    }

    fn on_read(&self, ctx: &Context<'_>, mut msg: ByteCursor) -> Result<(), WeftError> {
        let session = self.session(ctx)?;
        let (status, plaintext, peer_closed) = {
            let _guard = ctx.connection().write_guard();
            let mut s = session.lock();
            let status = s.unwrap(&mut msg);
            let peer_closed = s.peer_closed();
            if peer_closed {
                s.close()?;
            }
            // Send whatever the step produced, alerts included.
            let records = s.take_records()?;
            let plaintext = s.take_plaintext();
            drop(s);
            Self::send(ctx, records)?;
            (status?, plaintext, peer_closed)
        };

        if status == HandshakeStatus::Finished {
            debug!(conn = %ctx.connection().id(), "tls handshake complete");
            ctx.fire_connect()?;
        }
        if let Some(plaintext) = plaintext {
            ctx.fire_read(plaintext)?;
        }
        if peer_closed {
            debug!(conn = %ctx.connection().id(), "tls close_notify received");
            ctx.connection().close();
        }
        Ok(())
    }

    fn on_write(&self, ctx: &Context<'_>, mut msg: ByteCursor) -> Result<(), WeftError> {
        let session = self.session(ctx)?;
        let _guard = ctx.connection().write_guard();
        let records = {
            let mut s = session.lock();
            s.wrap(&mut msg)?;
            s.take_records()?
        };
        Self::send(ctx, records)
    }

    fn on_disconnect(&self, ctx: &Context<'_>) -> Result<(), WeftError> {
        ctx.detach::<TlsSession>();
        ctx.fire_disconnect()
    }
}
