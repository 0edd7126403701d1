//! `FrameCodec`: length-prefixed message reassembly.
//!
//! A frame is a fixed-size header followed by a body. The header carries
//! the body length as an unsigned big-endian integer of `width` bytes
//! starting at `offset`:
//!
//! ```text
//! ┌──────── header_len ────────┐
//! │ .. │ length (width) │ .. │ body (length bytes) │
//!      ^ offset
//! ```
//!
//! Bytes may arrive split anywhere, header included; the codec keeps a
//! per-connection assembly buffer and forwards one message per complete
//! frame.

use crate::buffer::ByteCursor;
use crate::config::FrameConfig;
use crate::error::WeftError;
use crate::pipeline::{Context, Handler};

#[derive(Debug, Clone)]
pub struct FrameCodec {
    offset: usize,
    width: usize,
    header_len: usize,
    max_frame: usize,
    strip_header: bool,
}

impl FrameCodec {
    /// A codec that forwards payloads only and frames outbound writes.
    pub fn new(offset: usize, width: usize, header_len: usize) -> Result<Self, WeftError> {
        if !(1..=3).contains(&width) {
            return Err(WeftError::InvalidLengthWidth(width));
        }
        if header_len < offset + width {
            return Err(WeftError::Config(format!(
                "header_len {header_len} cannot hold a {width}-byte length at offset {offset}"
            )));
        }
        Ok(Self {
            offset,
            width,
            header_len,
            max_frame: FrameConfig::default().max_frame,
            strip_header: true,
        })
    }

    pub fn from_config(cfg: &FrameConfig) -> Result<Self, WeftError> {
        Ok(Self::new(cfg.offset, cfg.width, cfg.header_len)?
            .with_max_frame(cfg.max_frame)
            .strip_header(cfg.strip_header))
    }

    /// Reject frames whose total size would exceed `max`.
    pub fn with_max_frame(mut self, max: usize) -> Self {
        self.max_frame = max;
        self
    }

    /// `false` forwards whole frames, header included, and passes writes
    /// through untouched.
    pub fn strip_header(mut self, strip: bool) -> Self {
        self.strip_header = strip;
        self
    }

    /// Largest body the length field can describe.
    pub fn max_body(&self) -> usize {
        (1usize << (8 * self.width)) - 1
    }

    /// Build a frame around `payload`: zeroed header with the length at
    /// `offset`.
    pub fn encode(&self, payload: &[u8]) -> Result<ByteCursor, WeftError> {
        if payload.len() > self.max_body() {
            return Err(WeftError::FrameTooLarge {
                size: payload.len(),
                max: self.max_body(),
            });
        }
        let mut header = vec![0u8; self.header_len];
        let len = (payload.len() as u32).to_be_bytes();
        header[self.offset..self.offset + self.width].copy_from_slice(&len[4 - self.width..]);
        let mut out = ByteCursor::with_capacity(self.header_len + payload.len());
        out.write(&header);
        out.write(payload);
        Ok(out)
    }

    /// Pull the next complete message out of `input`, carrying partial
    /// state in `asm`. `Ok(None)` means more bytes are needed.
    pub fn decode(&self, asm: &mut FrameAssembly, input: &mut ByteCursor) -> Result<Option<ByteCursor>, WeftError> {
        if asm.target == 0 {
            let need = self.offset + self.width;
            let missing = need.saturating_sub(asm.buf.available());
            if input.available() < missing {
                input.transfer_to(&mut asm.buf);
                return Ok(None);
            }
            input.transfer_n(&mut asm.buf, missing)?;
            let body = asm.buf.peek_be(self.offset, self.width)? as usize;
            let total = body + self.header_len;
            if total > self.max_frame {
                asm.reset();
                return Err(WeftError::FrameTooLarge {
                    size: total,
                    max: self.max_frame,
                });
            }
            asm.target = total;
            asm.buf.enlarge(total);
        }

        let take = (asm.target - asm.buf.available()).min(input.available());
        input.transfer_n(&mut asm.buf, take)?;
        if asm.buf.available() < asm.target {
            return Ok(None);
        }

        let mut frame = std::mem::take(&mut asm.buf);
        asm.reset();
        if self.strip_header {
            frame.skip(self.header_len)?;
        }
        Ok(Some(frame))
    }
}

/// Per-connection reassembly state.
#[derive(Debug, Default)]
pub struct FrameAssembly {
    buf: ByteCursor,
    /// Size of the frame being assembled; 0 while the length is unknown.
    target: usize,
}

impl FrameAssembly {
    /// Bytes held for an unfinished frame.
    pub fn buffered(&self) -> usize {
        self.buf.available()
    }

    fn reset(&mut self) {
        self.buf = ByteCursor::with_capacity(0);
        self.target = 0;
    }
}

impl Handler for FrameCodec {
    fn on_read(&self, ctx: &Context<'_>, mut msg: ByteCursor) -> Result<(), WeftError> {
        let state = ctx.attachment::<FrameAssembly>();
        let mut rejected = None;
        loop {
            // Release the state lock before handing a message on.
            let next = self.decode(&mut state.lock(), &mut msg)?;
            let Some(frame) = next else {
                return rejected.map_or(Ok(()), Err);
            };
            // The rest of `msg` still has to reach the assembly buffer.
            if let Err(err) = ctx.fire_read(frame) {
                if err.is_fatal() {
                    return Err(err);
                }
                rejected.get_or_insert(err);
            }
        }
    }

    fn on_write(&self, ctx: &Context<'_>, mut msg: ByteCursor) -> Result<(), WeftError> {
        if !self.strip_header {
            return ctx.write(msg);
        }
        let payload = msg.read_all();
        ctx.write(self.encode(&payload)?)
    }

    fn on_disconnect(&self, ctx: &Context<'_>) -> Result<(), WeftError> {
        ctx.detach::<FrameAssembly>();
        ctx.fire_disconnect()
    }
}
