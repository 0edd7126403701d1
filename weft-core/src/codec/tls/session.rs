//! One TLS session: the rustls engine plus its four working buffers.
//!
//! ```text
//!   peer records ─► in_cipher ─► engine ─► in_plain  ─► handlers
//!   handlers     ─► out_plain ─► engine ─► out_cipher ─► socket
//! ```
//!
//! The engine only ever sees complete records; a partial record waits in
//! `in_cipher` for more bytes. Plaintext written before the handshake
//! finishes waits in `out_plain`.

use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};
use tracing::trace;

use crate::buffer::ByteCursor;
use crate::error::WeftError;

/// Record header: type(1) version(2) length(2).
const RECORD_HEADER: usize = 5;
/// Largest record body TLS permits (2^14 plus expansion allowance).
const MAX_RECORD_BODY: usize = 16384 + 2048;
/// Plaintext handed to the engine per write.
const MAX_FRAGMENT: usize = 16384;
const INITIAL_BUFFER: usize = RECORD_HEADER + MAX_RECORD_BODY;

/// Where the handshake stands, as seen from the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Waiting for records from the peer.
    NeedUnwrap,
    /// Records are ready to send to the peer.
    NeedWrap,
    /// Records were fed in but not processed yet.
    NeedTask,
    /// The handshake completed during the last step.
    Finished,
    /// No handshake in progress.
    NotHandshaking,
}

// ── Engine ───────────────────────────────────────────────────────

enum Engine {
    Client(ClientConnection),
    Server(ServerConnection),
}

impl Engine {
    fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
        match self {
            Engine::Client(c) => c.read_tls(rd),
            Engine::Server(c) => c.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
        match self {
            Engine::Client(c) => c.write_tls(wr),
            Engine::Server(c) => c.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            Engine::Client(c) => c.process_new_packets(),
            Engine::Server(c) => c.process_new_packets(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Engine::Client(c) => c.wants_write(),
            Engine::Server(c) => c.wants_write(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            Engine::Client(c) => c.is_handshaking(),
            Engine::Server(c) => c.is_handshaking(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            Engine::Client(c) => c.reader(),
            Engine::Server(c) => c.reader(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            Engine::Client(c) => c.writer(),
            Engine::Server(c) => c.writer(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            Engine::Client(c) => c.send_close_notify(),
            Engine::Server(c) => c.send_close_notify(),
        }
    }
}

// ── Session ──────────────────────────────────────────────────────

pub struct TlsSession {
    engine: Engine,
    in_cipher: ByteCursor,
    in_plain: ByteCursor,
    out_plain: ByteCursor,
    out_cipher: ByteCursor,
    unprocessed: bool,
    established: bool,
    peer_closed: bool,
}

impl TlsSession {
    pub fn client(config: Arc<ClientConfig>, name: ServerName<'static>) -> Result<Self, WeftError> {
        Ok(Self::with_engine(Engine::Client(ClientConnection::new(config, name)?)))
    }

    pub fn server(config: Arc<ServerConfig>) -> Result<Self, WeftError> {
        Ok(Self::with_engine(Engine::Server(ServerConnection::new(config)?)))
    }

    fn with_engine(engine: Engine) -> Self {
        Self {
            engine,
            in_cipher: ByteCursor::with_capacity(INITIAL_BUFFER),
            in_plain: ByteCursor::with_capacity(INITIAL_BUFFER),
            out_plain: ByteCursor::with_capacity(INITIAL_BUFFER),
            out_cipher: ByteCursor::with_capacity(INITIAL_BUFFER),
            unprocessed: false,
            established: false,
            peer_closed: false,
        }
    }

    pub fn status(&self) -> HandshakeStatus {
        if self.engine.wants_write() {
            HandshakeStatus::NeedWrap
        } else if self.unprocessed {
            HandshakeStatus::NeedTask
        } else if self.engine.is_handshaking() {
            HandshakeStatus::NeedUnwrap
        } else {
            HandshakeStatus::NotHandshaking
        }
    }

    pub fn is_established(&self) -> bool {
        self.established
    }

    /// The peer sent close_notify.
    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Feed ciphertext from the peer and advance the session as far as
    /// the available records allow. Returns `Finished` on the step that
    /// completes the handshake.
    pub fn unwrap(&mut self, input: &mut ByteCursor) -> Result<HandshakeStatus, WeftError> {
        input.transfer_to(&mut self.in_cipher);
        let was_established = self.established;
        loop {
            match self.status() {
                HandshakeStatus::NeedWrap => self.drain_records()?,
                HandshakeStatus::NeedTask => self.process()?,
                HandshakeStatus::NeedUnwrap | HandshakeStatus::NotHandshaking => {
                    if !self.feed_record()? {
                        break;
                    }
                }
                HandshakeStatus::Finished => break,
            }
        }
        if !self.engine.is_handshaking() && !self.established {
            self.established = true;
            self.wrap_pending()?;
        }
        if self.established && !was_established {
            return Ok(HandshakeStatus::Finished);
        }
        Ok(self.status())
    }

    /// Queue application plaintext. It is encrypted now if the handshake
    /// is done, otherwise as soon as it completes.
    pub fn wrap(&mut self, msg: &mut ByteCursor) -> Result<(), WeftError> {
        msg.transfer_to(&mut self.out_plain);
        if self.established {
            self.wrap_pending()?;
        }
        Ok(())
    }

    /// Ciphertext ready for the socket, if any.
    pub fn take_records(&mut self) -> Result<Option<ByteCursor>, WeftError> {
        self.drain_records()?;
        if self.out_cipher.is_empty() {
            return Ok(None);
        }
        let mut out = ByteCursor::with_capacity(self.out_cipher.available());
        self.out_cipher.transfer_to(&mut out);
        Ok(Some(out))
    }

    /// Decrypted application data, if any.
    pub fn take_plaintext(&mut self) -> Option<ByteCursor> {
        if self.in_plain.is_empty() {
            return None;
        }
        let mut out = ByteCursor::with_capacity(self.in_plain.available());
        self.in_plain.transfer_to(&mut out);
        Some(out)
    }

    /// Queue our close_notify alert.
    pub fn close(&mut self) -> Result<(), WeftError> {
        self.engine.send_close_notify();
        self.drain_records()
    }

    // ── Steps ────────────────────────────────────────────────────

    /// Hand the next complete record to the engine. `false` on underflow.
    fn feed_record(&mut self) -> Result<bool, WeftError> {
        if self.in_cipher.available() < RECORD_HEADER {
            return Ok(false);
        }
        let body = self.in_cipher.peek_be(3, 2)? as usize;
        if body > MAX_RECORD_BODY {
            return Err(WeftError::TlsRecordTooLarge(body));
        }
        let len = RECORD_HEADER + body;
        if self.in_cipher.available() < len {
            self.in_cipher.enlarge(len);
            return Ok(false);
        }
        let record = self.in_cipher.read(len)?;
        let mut rd = record.as_slice();
        while !rd.is_empty() {
            // 0 once close_notify has been received; the rest is ignored.
            if self.engine.read_tls(&mut rd)? == 0 {
                break;
            }
        }
        self.unprocessed = true;
        trace!(bytes = len, "fed tls record");
        Ok(true)
    }

    fn process(&mut self) -> Result<(), WeftError> {
        self.unprocessed = false;
        match self.engine.process_new_packets() {
            Ok(_) => self.read_plaintext(),
            Err(e) => {
                // Queue the alert so the peer learns why.
                self.drain_records()?;
                if self.established {
                    Err(WeftError::Tls(e))
                } else {
                    Err(WeftError::TlsHandshake(e.to_string()))
                }
            }
        }
    }

    fn read_plaintext(&mut self) -> Result<(), WeftError> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.engine.reader().read(&mut chunk) {
                Ok(0) => {
                    self.peer_closed = true;
                    return Ok(());
                }
                Ok(n) => self.in_plain.write(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn wrap_pending(&mut self) -> Result<(), WeftError> {
        while !self.out_plain.is_empty() {
            let n = self.out_plain.available().min(MAX_FRAGMENT);
            let piece = self.out_plain.read(n)?;
            self.engine.writer().write_all(&piece)?;
            self.drain_records()?;
        }
        Ok(())
    }

    fn drain_records(&mut self) -> Result<(), WeftError> {
        while self.engine.wants_write() {
            self.engine.write_tls(&mut self.out_cipher)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("status", &self.status())
            .field("established", &self.established)
            .field("in_cipher", &self.in_cipher.available())
            .field("out_plain", &self.out_plain.available())
            .finish()
    }
}
