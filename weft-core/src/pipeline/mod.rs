//! Bidirectional handler pipeline.
//!
//! A pipeline is an ordered, immutable list of handlers. Inbound events
//! (connect, read, disconnect, error) travel from the head towards the
//! tail; outbound writes travel from the tail towards the head and then
//! onto the connection.
//!
//! ```text
//!   socket ─► [0] frame ─► [1] secure ─► [2] app (terminal)
//!   socket ◄─ [0] frame ◄─ [1] secure ◄─ [2] app
//! ```
//!
//! At most one handler may be terminal, and it must be last.

pub mod attachment;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::buffer::ByteCursor;
use crate::error::WeftError;
use crate::network::Connection;

// ── Handler ──────────────────────────────────────────────────────

/// One stage of the pipeline. Every method defaults to forwarding the
/// event unchanged, so a handler overrides only what it transforms.
///
/// Handlers are shared by all connections on a pipeline; per-connection
/// state goes through [`Context::attachment`].
pub trait Handler: Send + Sync + 'static {
    fn on_connect(&self, ctx: &Context<'_>) -> Result<(), WeftError> {
        ctx.fire_connect()
    }

    fn on_read(&self, ctx: &Context<'_>, msg: ByteCursor) -> Result<(), WeftError> {
        ctx.fire_read(msg)
    }

    /// Outbound data heading for the socket.
    fn on_write(&self, ctx: &Context<'_>, msg: ByteCursor) -> Result<(), WeftError> {
        ctx.write(msg)
    }

    fn on_disconnect(&self, ctx: &Context<'_>) -> Result<(), WeftError> {
        ctx.fire_disconnect()
    }

    /// Return `Ok(())` to consume the error. Returning it (the default
    /// forwards it) hands it to later handlers and, past the tail, to the
    /// dispatcher's unhandled-error policy.
    fn on_error(&self, ctx: &Context<'_>, err: WeftError) -> Result<(), WeftError> {
        ctx.fire_error(err)
    }

    /// A terminal handler consumes events instead of forwarding them.
    fn is_terminal(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

// ── Pipeline ─────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct Pipeline {
    handlers: Vec<Arc<dyn Handler>>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub fn fire_connect(&self, conn: &Arc<Connection>) -> Result<(), WeftError> {
        self.context(0, conn).run(|h, ctx| h.on_connect(ctx))
    }

    pub fn fire_read(&self, conn: &Arc<Connection>, msg: ByteCursor) -> Result<(), WeftError> {
        self.context(0, conn).run(|h, ctx| h.on_read(ctx, msg))
    }

    pub fn fire_disconnect(&self, conn: &Arc<Connection>) -> Result<(), WeftError> {
        self.context(0, conn).run(|h, ctx| h.on_disconnect(ctx))
    }

    /// Run the error chain from the head. `Err` means no handler consumed it.
    pub fn fire_error(&self, conn: &Arc<Connection>, err: WeftError) -> Result<(), WeftError> {
        match self.handlers.first() {
            Some(head) => head.on_error(&self.context(0, conn), err),
            None => Err(err),
        }
    }

    /// Send `msg` from the tail of the pipeline towards the socket.
    pub fn write(&self, conn: &Arc<Connection>, msg: ByteCursor) -> Result<(), WeftError> {
        let _guard = conn.write_guard();
        match self.handlers.last() {
            Some(tail) => tail.on_write(&self.context(self.handlers.len() - 1, conn), msg),
            None => conn.write(msg),
        }
    }

    fn context<'a>(&'a self, index: usize, conn: &'a Arc<Connection>) -> Context<'a> {
        Context {
            pipeline: self,
            index,
            conn,
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

// ── Builder ──────────────────────────────────────────────────────

/// Assembles a [`Pipeline`], rejecting any layout that would put a
/// handler behind a terminal one.
#[derive(Default)]
pub struct PipelineBuilder {
    handlers: Vec<Arc<dyn Handler>>,
}

impl PipelineBuilder {
    /// Append several handlers in order.
    pub fn add<I>(mut self, handlers: I) -> Result<Self, WeftError>
    where
        I: IntoIterator<Item = Arc<dyn Handler>>,
    {
        for handler in handlers {
            self = self.push(handler)?;
        }
        Ok(self)
    }

    /// Append one handler at the tail.
    pub fn push(mut self, handler: Arc<dyn Handler>) -> Result<Self, WeftError> {
        if self.handlers.last().is_some_and(|h| h.is_terminal()) {
            return Err(WeftError::Pipeline("cannot add a handler after a terminal handler"));
        }
        self.handlers.push(handler);
        Ok(self)
    }

    /// Insert a handler directly behind the head (or as the head of an
    /// empty pipeline).
    pub fn insert_after_head(mut self, handler: Arc<dyn Handler>) -> Result<Self, WeftError> {
        match self.handlers.first().map(|head| head.is_terminal()) {
            None => self.handlers.push(handler),
            Some(true) => {
                return Err(WeftError::Pipeline(
                    "cannot insert behind a terminal head handler",
                ));
            }
            Some(false) => {
                if handler.is_terminal() && self.handlers.len() > 1 {
                    return Err(WeftError::Pipeline("a terminal handler must be last"));
                }
                self.handlers.insert(1, handler);
            }
        }
        Ok(self)
    }

    pub fn build(self) -> Result<Pipeline, WeftError> {
        let terminals = self.handlers.iter().filter(|h| h.is_terminal()).count();
        if terminals > 1 {
            return Err(WeftError::Pipeline("more than one terminal handler"));
        }
        if terminals == 1 && !self.handlers.last().is_some_and(|h| h.is_terminal()) {
            return Err(WeftError::Pipeline("a terminal handler must be last"));
        }
        Ok(Pipeline {
            handlers: self.handlers,
        })
    }
}

// ── Context ──────────────────────────────────────────────────────

/// A handler's view of its position in the pipeline for one connection.
pub struct Context<'a> {
    pipeline: &'a Pipeline,
    index: usize,
    conn: &'a Arc<Connection>,
}

impl<'a> Context<'a> {
    pub fn connection(&self) -> &'a Arc<Connection> {
        self.conn
    }

    /// Position of the current handler.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn fire_connect(&self) -> Result<(), WeftError> {
        self.next().run(|h, ctx| h.on_connect(ctx))
    }

    pub fn fire_read(&self, msg: ByteCursor) -> Result<(), WeftError> {
        let next = self.next();
        if next.handler().is_none() {
            trace!(conn = %self.conn.id(), bytes = msg.available(), "read reached end of pipeline");
            return Ok(());
        }
        next.run(|h, ctx| h.on_read(ctx, msg))
    }

    pub fn fire_disconnect(&self) -> Result<(), WeftError> {
        self.next().run(|h, ctx| h.on_disconnect(ctx))
    }

    /// Pass an error on; past the tail it comes back as `Err`.
    pub fn fire_error(&self, err: WeftError) -> Result<(), WeftError> {
        let next = self.next();
        match next.handler() {
            Some(h) => h.on_error(&next, err),
            None => Err(err),
        }
    }

    /// Send `msg` towards the socket, through the handlers before this one.
    pub fn write(&self, msg: ByteCursor) -> Result<(), WeftError> {
        let _guard = self.conn.write_guard();
        if self.index == 0 {
            return self.conn.write(msg);
        }
        let prev = self.pipeline.context(self.index - 1, self.conn);
        match prev.handler() {
            Some(h) => h.on_write(&prev, msg),
            None => self.conn.write(msg),
        }
    }

    /// Per-connection state of type `T` for this handler, created with
    /// `T::default()` on first use.
    pub fn attachment<T: Default + Send + 'static>(&self) -> Arc<Mutex<T>> {
        match self.attachment_with(|| Ok(T::default())) {
            Ok(state) => state,
            Err(_) => Arc::new(Mutex::new(T::default())),
        }
    }

    /// Per-connection state of type `T` for this handler, created with
    /// `init` on first use.
    pub fn attachment_with<T, F>(&self, init: F) -> Result<Arc<Mutex<T>>, WeftError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, WeftError>,
    {
        self.conn.attachments().get_or_try_insert(self.index, init)
    }

    /// Existing state of type `T`, if any.
    pub fn existing_attachment<T: Send + 'static>(&self) -> Option<Arc<Mutex<T>>> {
        self.conn.attachments().get(self.index)
    }

    pub fn detach<T: Send + 'static>(&self) -> Option<Arc<Mutex<T>>> {
        self.conn.attachments().remove(self.index)
    }

    fn handler(&self) -> Option<&'a Arc<dyn Handler>> {
        self.pipeline.handlers.get(self.index)
    }

    fn next(&self) -> Context<'a> {
        self.pipeline.context(self.index + 1, self.conn)
    }

    fn run<F>(&self, f: F) -> Result<(), WeftError>
    where
        F: FnOnce(&dyn Handler, &Context<'a>) -> Result<(), WeftError>,
    {
        match self.handler() {
            Some(h) => f(h.as_ref(), self),
            None => Ok(()),
        }
    }
}
