//! `SecureChannelCodec` is a lightweight encrypted link between nodes of
//! one deployment.
//!
//! ```text
//! initiator                               acceptor
//!   0x0B ‖ e ‖ n            ─────────►
//!                           ◄─────────    0x0C ‖ seal(session key)
//!   0x0D ‖ flag ‖ len ‖ body ◄────────►   0x0D ‖ flag ‖ len ‖ body
//! ```
//!
//! The exchange is not authenticated and the stream cipher is a
//! repeating-key XOR. It keeps casual observers out; use [`TlsCodec`]
//! where real confidentiality matters.
//!
//! [`TlsCodec`]: crate::codec::TlsCodec

mod cipher;
mod keys;

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::buffer::ByteCursor;
use crate::config::SecureChannelConfig;
use crate::error::WeftError;
use crate::network::Mode;
use crate::pipeline::{Context, Handler};

pub use cipher::{COMPRESSED, SessionCipher, UNCOMPRESSED};
pub use keys::{KeyPair, PublicKey, generate_session_key};

// ── Wire constants ───────────────────────────────────────────────

pub const CLIENT_PUBLIC: u8 = 0x0B;
pub const SERVER_SESSION_KEY: u8 = 0x0C;
pub const APP_DATA: u8 = 0x0D;

/// type + flag + length
const APP_HEADER: usize = 6;

// ── Per-connection state ─────────────────────────────────────────

/// Handshake progress and reassembly buffer for one connection.
#[derive(Default)]
pub struct SecureSession {
    /// Initiator only, dropped once the session key is recovered.
    keys: Option<KeyPair>,
    cipher: Option<SessionCipher>,
    inbound: ByteCursor,
    /// Application writes issued before the key existed.
    queued: VecDeque<Vec<u8>>,
}

impl SecureSession {
    pub fn is_established(&self) -> bool {
        self.cipher.is_some()
    }

    /// Bytes waiting for the rest of their message.
    pub fn buffered(&self) -> usize {
        self.inbound.available()
    }
}

/// What one pass over the inbound buffer produced.
#[derive(Default)]
struct Step {
    outbound: Vec<ByteCursor>,
    plaintext: Vec<ByteCursor>,
}

// ── Codec ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SecureChannelCodec {
    key_bits: usize,
    threshold: usize,
    level: i32,
    max_frame: usize,
}

impl SecureChannelCodec {
    pub fn new(cfg: &SecureChannelConfig) -> Result<Self, WeftError> {
        cfg.validate()?;
        Ok(Self {
            key_bits: cfg.key_bits,
            threshold: cfg.compression_threshold,
            level: cfg.compression_level,
            max_frame: cfg.max_frame,
        })
    }

    fn key_bytes(&self) -> usize {
        self.key_bits / 8
    }

    fn app_frame(&self, cipher: &SessionCipher, payload: &[u8]) -> Result<ByteCursor, WeftError> {
        let (flag, body) = cipher.seal(payload)?;
        let len = u32::try_from(body.len()).map_err(|_| WeftError::FrameTooLarge {
            size: body.len(),
            max: u32::MAX as usize,
        })?;
        let mut out = ByteCursor::with_capacity(APP_HEADER + body.len());
        out.write_u8(APP_DATA);
        out.write_u8(flag);
        out.write_u32(len);
        out.write(&body);
        Ok(out)
    }

    /// Consume every complete message in `session.inbound`.
    fn process(&self, mode: Mode, session: &mut SecureSession) -> Result<Step, WeftError> {
        let mut step = Step::default();
        let size = self.key_bytes();
        while let Ok(kind) = session.inbound.peek_byte(0) {
            match kind {
                CLIENT_PUBLIC => {
                    if mode == Mode::Initiator || session.is_established() {
                        return Err(WeftError::ProtocolViolation("unexpected client public key"));
                    }
                    if session.inbound.available() < 1 + 2 * size {
                        break;
                    }
                    session.inbound.skip(1)?;
                    let public = PublicKey::from_bytes(&session.inbound.read(2 * size)?, size)?;
                    let key = generate_session_key(size);
                    let sealed = public.seal_session_key(&key)?;

                    let mut reply = ByteCursor::with_capacity(1 + size);
                    reply.write_u8(SERVER_SESSION_KEY);
                    reply.write(&sealed);
                    step.outbound.push(reply);
                    self.establish(session, key, &mut step)?;
                }
                SERVER_SESSION_KEY => {
                    if mode == Mode::Acceptor || session.is_established() {
                        return Err(WeftError::ProtocolViolation("unexpected session key"));
                    }
                    if session.inbound.available() < 1 + size {
                        break;
                    }
                    let Some(pair) = session.keys.take() else {
                        return Err(WeftError::ProtocolViolation("session key before public key"));
                    };
                    session.inbound.skip(1)?;
                    let key = pair.open_session_key(&session.inbound.read(size)?)?;
                    self.establish(session, key, &mut step)?;
                }
                APP_DATA => {
                    if session.inbound.available() < APP_HEADER {
                        break;
                    }
                    let Some(cipher) = &session.cipher else {
                        return Err(WeftError::NoSessionKey);
                    };
                    let flag = session.inbound.peek_byte(1)?;
                    cipher::check_flag(flag)?;
                    let len = session.inbound.peek_be(2, 4)? as usize;
                    if len > self.max_frame {
                        return Err(WeftError::FrameTooLarge {
                            size: len,
                            max: self.max_frame,
                        });
                    }
                    if session.inbound.available() < APP_HEADER + len {
                        session.inbound.enlarge(APP_HEADER + len);
                        break;
                    }
                    session.inbound.skip(APP_HEADER)?;
                    let body = session.inbound.read(len)?;
                    step.plaintext.push(ByteCursor::from_vec(cipher.open(flag, body)?));
                }
                other => return Err(WeftError::UnknownFrameType(other)),
            }
        }
        Ok(step)
    }

    /// Install the session key and release writes held back until now.
    fn establish(&self, session: &mut SecureSession, key: Vec<u8>, step: &mut Step) -> Result<(), WeftError> {
        let cipher = SessionCipher::new(key, self.threshold, self.level)?;
        while let Some(payload) = session.queued.pop_front() {
            step.outbound.push(self.app_frame(&cipher, &payload)?);
        }
        session.cipher = Some(cipher);
        Ok(())
    }
}

impl Default for SecureChannelCodec {
    fn default() -> Self {
        let cfg = SecureChannelConfig::default();
        Self {
            key_bits: cfg.key_bits,
            threshold: cfg.compression_threshold,
            level: cfg.compression_level,
            max_frame: cfg.max_frame,
        }
    }
}

impl Handler for SecureChannelCodec {
    fn on_connect(&self, ctx: &Context<'_>) -> Result<(), WeftError> {
        if ctx.connection().is_initiator() {
            let pair = KeyPair::generate(self.key_bits)?;
            let mut hello = ByteCursor::with_capacity(1 + 2 * self.key_bytes());
            hello.write_u8(CLIENT_PUBLIC);
            hello.write(&pair.public_bytes());

            let _guard = ctx.connection().write_guard();
            ctx.attachment::<SecureSession>().lock().keys = Some(pair);
            ctx.write(hello)?;
            debug!(conn = %ctx.connection().id(), "secure channel public key sent");
        }
        ctx.fire_connect()
    }

    fn on_read(&self, ctx: &Context<'_>, mut msg: ByteCursor) -> Result<(), WeftError> {
        let conn = ctx.connection();
        let state = ctx.attachment::<SecureSession>();
        let step = {
            let _guard = conn.write_guard();
            let step = {
                let mut session = state.lock();
                let was_established = session.is_established();
                msg.transfer_to(&mut session.inbound);
                let step = self.process(conn.mode(), &mut session);
                if step.is_err() {
                    session.inbound.clear();
                }
                if !was_established && session.is_established() {
                    debug!(conn = %conn.id(), "secure channel established");
                }
                step?
            };
            for frame in step.outbound {
                ctx.write(frame)?;
            }
            step.plaintext
        };
        let mut rejected = None;
        for plaintext in step {
            trace!(conn = %conn.id(), bytes = plaintext.available(), "secure channel message");
            if let Err(err) = ctx.fire_read(plaintext) {
                if err.is_fatal() {
                    return Err(err);
                }
                rejected.get_or_insert(err);
            }
        }
        rejected.map_or(Ok(()), Err)
    }

    fn on_write(&self, ctx: &Context<'_>, mut msg: ByteCursor) -> Result<(), WeftError> {
        let state = ctx.attachment::<SecureSession>();
        let _guard = ctx.connection().write_guard();
        let frame = {
            let mut session = state.lock();
            match session.cipher.as_ref() {
                Some(cipher) => self.app_frame(cipher, &msg.read_all())?,
                None => {
                    session.queued.push_back(msg.read_all());
                    return Ok(());
                }
            }
        };
        ctx.write(frame)
    }

    fn on_disconnect(&self, ctx: &Context<'_>) -> Result<(), WeftError> {
        ctx.detach::<SecureSession>();
        ctx.fire_disconnect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use proptest::prelude::*;

    use super::*;
    use crate::network::{Connection, Dispatcher};
    use crate::pipeline::Pipeline;

    const TEST_BITS: usize = 512;

    fn codec() -> SecureChannelCodec {
        SecureChannelCodec::new(&SecureChannelConfig {
            key_bits: TEST_BITS,
            ..Default::default()
        })
        .unwrap()
    }

    /// Terminal handler collecting every message and error.
    #[derive(Default)]
    struct Collect {
        messages: Mutex<Vec<Vec<u8>>>,
        errors: Mutex<Vec<String>>,
        /// Payload answered with a handler error instead of being kept.
        reject: Mutex<Option<Vec<u8>>>,
    }

    impl Handler for Arc<Collect> {
        fn on_read(&self, _ctx: &Context<'_>, mut msg: ByteCursor) -> Result<(), WeftError> {
            let body = msg.read_all();
            if self.reject.lock().as_deref() == Some(body.as_slice()) {
                return Err(WeftError::Handler("rejected".into()));
            }
            self.messages.lock().push(body);
            Ok(())
        }

        fn on_error(&self, ctx: &Context<'_>, err: WeftError) -> Result<(), WeftError> {
            self.errors.lock().push(err.to_string());
            ctx.fire_error(err)
        }

        fn is_terminal(&self) -> bool {
            true
        }
    }

    struct Side {
        dispatcher: Arc<Dispatcher>,
        conn: Arc<Connection>,
        sink: Arc<Collect>,
    }

    fn side(codec: SecureChannelCodec, mode: Mode) -> Side {
        let sink = Arc::new(Collect::default());
        let pipeline = Pipeline::builder()
            .add([
                Arc::new(codec) as Arc<dyn Handler>,
                Arc::new(sink.clone()) as Arc<dyn Handler>,
            ])
            .unwrap()
            .build()
            .unwrap();
        Side {
            dispatcher: Dispatcher::inline(pipeline),
            conn: Connection::new("127.0.0.1:7000".parse().unwrap(), mode),
            sink,
        }
    }

    fn pair() -> (Side, Side) {
        let client = side(codec(), Mode::Initiator);
        let server = side(codec(), Mode::Acceptor);
        server.dispatcher.on_accept(&server.conn);
        client.dispatcher.on_connect(&client.conn);
        (client, server)
    }

    fn pump(a: &Side, b: &Side) {
        for _ in 0..10 {
            let ab = a.conn.take_outbound().read_all();
            let ba = b.conn.take_outbound().read_all();
            if ab.is_empty() && ba.is_empty() {
                return;
            }
            b.dispatcher.deliver(&b.conn, &ab);
            a.dispatcher.deliver(&a.conn, &ba);
        }
    }

    fn session_of(s: &Side) -> Arc<Mutex<SecureSession>> {
        s.conn.attachments().get::<SecureSession>(0).unwrap()
    }

    #[test]
    fn handshake_then_ping() {
        let (client, server) = pair();
        let hello = client.conn.take_outbound();
        assert_eq!(hello.peek_byte(0).unwrap(), CLIENT_PUBLIC);
        assert_eq!(hello.available(), 1 + 2 * TEST_BITS / 8);
        server.dispatcher.deliver(&server.conn, hello.as_slice());
        pump(&client, &server);

        assert!(session_of(&client).lock().is_established());
        assert!(session_of(&server).lock().is_established());

        client
            .dispatcher
            .write(&client.conn, ByteCursor::from(&b"ping"[..]))
            .unwrap();
        let wire = client.conn.take_outbound();
        assert_eq!(wire.peek_byte(0).unwrap(), APP_DATA);
        assert_eq!(wire.peek_byte(1).unwrap(), UNCOMPRESSED);
        server.dispatcher.deliver(&server.conn, wire.as_slice());
        assert_eq!(*server.sink.messages.lock(), vec![b"ping".to_vec()]);
    }

    #[test]
    fn large_payload_is_compressed() {
        let (client, server) = pair();
        pump(&client, &server);

        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 7) as u8).collect();
        server
            .dispatcher
            .write(&server.conn, ByteCursor::from(payload.as_slice()))
            .unwrap();
        let wire = server.conn.take_outbound();
        assert_eq!(wire.peek_byte(1).unwrap(), COMPRESSED);
        client.dispatcher.deliver(&client.conn, wire.as_slice());
        assert_eq!(*client.sink.messages.lock(), vec![payload]);
    }

    #[test]
    fn writes_before_key_are_queued_in_order() {
        let (client, server) = pair();
        let hello = client.conn.take_outbound();
        for msg in [&b"one"[..], b"two", b"three"] {
            client.dispatcher.write(&client.conn, ByteCursor::from(msg)).unwrap();
        }
        assert!(!client.conn.has_pending_writes());
        assert_eq!(session_of(&client).lock().queued.len(), 3);

        server.dispatcher.deliver(&server.conn, hello.as_slice());
        pump(&client, &server);
        assert_eq!(
            *server.sink.messages.lock(),
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );
    }

    #[test]
    fn rejected_message_does_not_drop_the_next() {
        let (client, server) = pair();
        pump(&client, &server);
        *server.sink.reject.lock() = Some(b"bad".to_vec());

        for msg in [&b"bad"[..], b"ok"] {
            client.dispatcher.write(&client.conn, ByteCursor::from(msg)).unwrap();
        }
        let wire = client.conn.take_outbound().read_all();
        server.dispatcher.deliver(&server.conn, &wire);

        assert_eq!(*server.sink.messages.lock(), vec![b"ok".to_vec()]);
        assert_eq!(server.sink.errors.lock().len(), 1);
        assert!(server.conn.is_open());
    }

    #[test]
    fn app_data_without_key_is_fatal() {
        let server = side(codec(), Mode::Acceptor);
        server.dispatcher.on_accept(&server.conn);
        server.dispatcher.deliver(&server.conn, &[APP_DATA, UNCOMPRESSED, 0, 0, 0, 0]);
        assert_eq!(server.sink.errors.lock().len(), 1);
        assert!(server.sink.errors.lock()[0].contains("session key"));
        assert!(server.conn.is_closed());
    }

    #[test]
    fn unknown_type_is_fatal() {
        let server = side(codec(), Mode::Acceptor);
        server.dispatcher.on_accept(&server.conn);
        server.dispatcher.deliver(&server.conn, &[0x42, 1, 2, 3]);
        assert_eq!(server.sink.errors.lock().len(), 1);
        assert!(server.conn.is_closed());
    }

    #[test]
    fn second_public_key_is_a_violation() {
        let (client, server) = pair();
        let hello = client.conn.take_outbound().read_all();
        server.dispatcher.deliver(&server.conn, &hello);
        assert!(session_of(&server).lock().is_established());
        server.dispatcher.deliver(&server.conn, &hello);
        assert_eq!(server.sink.errors.lock().len(), 1);
        assert!(server.conn.is_closed());
    }

    #[test]
    fn stale_session_key_fails_closed() {
        let (old_client, old_server) = pair();
        pump(&old_client, &old_server);

        // Capture a frame under the first session, then redo the handshake.
        old_client
            .dispatcher
            .write(&old_client.conn, ByteCursor::from(&b"replayed"[..]))
            .unwrap();
        let stale = old_client.conn.take_outbound().read_all();

        let (client, server) = pair();
        pump(&client, &server);
        server.dispatcher.deliver(&server.conn, &stale);
        assert!(server.sink.messages.lock().is_empty());
        assert_eq!(server.sink.errors.lock().len(), 1);
        assert!(server.conn.is_closed());
    }

    #[test]
    fn oversized_app_data_rejected() {
        let small = SecureChannelCodec {
            max_frame: 16,
            ..codec()
        };
        let client = side(codec(), Mode::Initiator);
        let server = side(small, Mode::Acceptor);
        server.dispatcher.on_accept(&server.conn);
        client.dispatcher.on_connect(&client.conn);
        pump(&client, &server);

        client
            .dispatcher
            .write(&client.conn, ByteCursor::from(&[1u8; 64][..]))
            .unwrap();
        pump(&client, &server);
        assert!(server.sink.errors.lock()[0].contains("too large"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn any_chunking_round_trips(
            messages in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..2048), 1..4),
            step in 1usize..97,
        ) {
            let (client, server) = pair();
            for m in &messages {
                client.dispatcher.write(&client.conn, ByteCursor::from(m.as_slice())).unwrap();
            }
            let wire = client.conn.take_outbound().read_all();
            for chunk in wire.chunks(step) {
                server.dispatcher.deliver(&server.conn, chunk);
            }
            let reply = server.conn.take_outbound().read_all();
            for chunk in reply.chunks(step) {
                client.dispatcher.deliver(&client.conn, chunk);
            }
            // Queued writes leave once the key arrives.
            let data = client.conn.take_outbound().read_all();
            for chunk in data.chunks(step) {
                server.dispatcher.deliver(&server.conn, chunk);
            }
            prop_assert_eq!(&*server.sink.messages.lock(), &messages);
        }
    }
}
