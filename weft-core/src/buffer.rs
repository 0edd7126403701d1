//! `ByteCursor` is a growable byte buffer with independent read and write
//! positions.
//!
//! ```text
//!  0        read_pos        write_pos        capacity
//!  |  spent  |    readable    |    writable     |
//! ```
//!
//! Invariant: `read_pos <= write_pos <= capacity`. Reading advances
//! `read_pos`; writing appends at `write_pos`, first compacting the
//! readable region to the front and otherwise growing the backing storage.
//! Once everything written has been read both positions reset to zero.

use std::io;

use crate::error::WeftError;

/// Capacity used by [`ByteCursor::new`].
pub const DEFAULT_CAPACITY: usize = 1024;

/// Growable byte buffer with separate read and write positions.
#[derive(Clone, Default)]
pub struct ByteCursor {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl ByteCursor {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Wrap an owned vector; all of its bytes are readable.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let write_pos = data.len();
        Self {
            data,
            read_pos: 0,
            write_pos,
        }
    }

    // ── Accounting ───────────────────────────────────────────────

    /// Number of bytes written but not yet read.
    pub fn available(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The readable region, without consuming it.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Drop all content and reset both positions.
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    // ── Reading ──────────────────────────────────────────────────

    /// Consume exactly `n` bytes.
    pub fn read(&mut self, n: usize) -> Result<Vec<u8>, WeftError> {
        self.check(n)?;
        let out = self.data[self.read_pos..self.read_pos + n].to_vec();
        self.consume(n);
        Ok(out)
    }

    /// Fill `dst` completely from the readable region.
    pub fn read_exact_into(&mut self, dst: &mut [u8]) -> Result<(), WeftError> {
        self.check(dst.len())?;
        dst.copy_from_slice(&self.data[self.read_pos..self.read_pos + dst.len()]);
        self.consume(dst.len());
        Ok(())
    }

    /// Consume everything that is readable.
    pub fn read_all(&mut self) -> Vec<u8> {
        let out = self.as_slice().to_vec();
        self.consume(out.len());
        out
    }

    /// Discard `n` readable bytes.
    pub fn skip(&mut self, n: usize) -> Result<(), WeftError> {
        self.check(n)?;
        self.consume(n);
        Ok(())
    }

    /// Look at the byte `index` positions past the read position.
    pub fn peek_byte(&self, index: usize) -> Result<u8, WeftError> {
        self.check(index + 1)?;
        Ok(self.data[self.read_pos + index])
    }

    pub fn read_u8(&mut self) -> Result<u8, WeftError> {
        let b = self.peek_byte(0)?;
        self.consume(1);
        Ok(b)
    }

    pub fn read_u16(&mut self) -> Result<u16, WeftError> {
        Ok(self.read_be(2)? as u16)
    }

    pub fn read_u24(&mut self) -> Result<u32, WeftError> {
        Ok(self.read_be(3)? as u32)
    }

    pub fn read_u32(&mut self) -> Result<u32, WeftError> {
        Ok(self.read_be(4)? as u32)
    }

    /// Decode an unsigned big-endian integer of `width` bytes starting
    /// `offset` bytes past the read position, without consuming anything.
    pub fn peek_be(&self, offset: usize, width: usize) -> Result<u64, WeftError> {
        self.check(offset + width)?;
        let start = self.read_pos + offset;
        Ok(self.data[start..start + width]
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    fn read_be(&mut self, width: usize) -> Result<u64, WeftError> {
        let v = self.peek_be(0, width)?;
        self.consume(width);
        Ok(v)
    }

    // ── Writing ──────────────────────────────────────────────────

    /// Append `src`, compacting or growing as needed.
    pub fn write(&mut self, src: &[u8]) {
        if src.is_empty() {
            return;
        }
        self.make_room(src.len());
        self.data[self.write_pos..self.write_pos + src.len()].copy_from_slice(src);
        self.write_pos += src.len();
    }

    pub fn write_u8(&mut self, v: u8) {
        self.write(&[v]);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.write(&v.to_be_bytes());
    }

    /// Write the low 24 bits of `v` big-endian.
    pub fn write_u24(&mut self, v: u32) {
        self.write(&v.to_be_bytes()[1..]);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write(&v.to_be_bytes());
    }

    // ── Transfer ─────────────────────────────────────────────────

    /// Move every readable byte into `dst`. Returns the count moved.
    pub fn transfer_to(&mut self, dst: &mut ByteCursor) -> usize {
        let n = self.available();
        dst.write(self.as_slice());
        self.consume(n);
        n
    }

    /// Move exactly `n` readable bytes into `dst`.
    pub fn transfer_n(&mut self, dst: &mut ByteCursor, n: usize) -> Result<(), WeftError> {
        self.check(n)?;
        dst.write(&self.data[self.read_pos..self.read_pos + n]);
        self.consume(n);
        Ok(())
    }

    /// Copy as many readable bytes as fit into `dst`. Returns the count.
    pub fn copy_out(&mut self, dst: &mut [u8]) -> usize {
        let n = self.available().min(dst.len());
        dst[..n].copy_from_slice(&self.data[self.read_pos..self.read_pos + n]);
        self.consume(n);
        n
    }

    // ── Capacity ─────────────────────────────────────────────────

    /// Grow the backing storage to at least `min` bytes, doubling when
    /// that is larger. Never shrinks.
    pub fn enlarge(&mut self, min: usize) {
        if min <= self.capacity() {
            return;
        }
        let target = min.max(self.capacity() * 2);
        let mut data = vec![0; target];
        let n = self.available();
        data[..n].copy_from_slice(self.as_slice());
        self.data = data;
        self.read_pos = 0;
        self.write_pos = n;
    }

    /// Move the readable region to the front of the storage.
    pub fn compact(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        self.data.copy_within(self.read_pos..self.write_pos, 0);
        self.write_pos -= self.read_pos;
        self.read_pos = 0;
    }

    fn make_room(&mut self, len: usize) {
        if self.capacity() - self.write_pos >= len {
            return;
        }
        let unread = self.available();
        if self.capacity() - unread >= len {
            self.compact();
            return;
        }
        let mut target = self.capacity().max(1);
        while target - unread < len {
            target *= 2;
        }
        self.enlarge(target);
    }

    fn check(&self, requested: usize) -> Result<(), WeftError> {
        if requested > self.available() {
            return Err(WeftError::Underflow {
                requested,
                available: self.available(),
            });
        }
        Ok(())
    }

    fn consume(&mut self, n: usize) {
        self.read_pos += n;
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }
}

impl std::fmt::Debug for ByteCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteCursor")
            .field("read_pos", &self.read_pos)
            .field("write_pos", &self.write_pos)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl From<&[u8]> for ByteCursor {
    fn from(src: &[u8]) -> Self {
        Self::from_vec(src.to_vec())
    }
}

impl From<Vec<u8>> for ByteCursor {
    fn from(src: Vec<u8>) -> Self {
        Self::from_vec(src)
    }
}

// ── std::io / bytes adapters ─────────────────────────────────────

impl io::Read for ByteCursor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.copy_out(buf))
    }
}

impl io::Write for ByteCursor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ByteCursor::write(self, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl bytes::Buf for ByteCursor {
    fn remaining(&self) -> usize {
        self.available()
    }

    fn chunk(&self) -> &[u8] {
        self.as_slice()
    }

    fn advance(&mut self, cnt: usize) {
        assert!(cnt <= self.available(), "advance past end of ByteCursor");
        self.consume(cnt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;
    use proptest::prelude::*;

    #[test]
    fn write_then_read() {
        let mut buf = ByteCursor::with_capacity(4);
        buf.write(b"hello world");
        assert_eq!(buf.available(), 11);
        assert_eq!(buf.read(5).unwrap(), b"hello");
        assert_eq!(buf.read_all(), b" world");
        assert!(buf.is_empty());
    }

    #[test]
    fn underflow_is_an_error() {
        let mut buf = ByteCursor::from(&b"abc"[..]);
        let err = buf.read(4).unwrap_err();
        assert!(matches!(
            err,
            WeftError::Underflow {
                requested: 4,
                available: 3
            }
        ));
        // nothing consumed
        assert_eq!(buf.available(), 3);
    }

    #[test]
    fn compacts_before_growing() {
        let mut buf = ByteCursor::with_capacity(8);
        buf.write(b"abcdef");
        buf.skip(4).unwrap();
        buf.write(b"ghijkl");
        assert_eq!(buf.capacity(), 8);
        assert_eq!(buf.read_all(), b"efghijkl");
    }

    #[test]
    fn grows_by_doubling() {
        let mut buf = ByteCursor::with_capacity(4);
        buf.write(&[7u8; 9]);
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.available(), 9);
    }

    #[test]
    fn zero_capacity_grows() {
        let mut buf = ByteCursor::with_capacity(0);
        buf.write(b"x");
        assert_eq!(buf.read_u8().unwrap(), b'x');
    }

    #[test]
    fn big_endian_helpers() {
        let mut buf = ByteCursor::new();
        buf.write_u8(0x01);
        buf.write_u16(0x0203);
        buf.write_u24(0x040506);
        buf.write_u32(0x0708090a);
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(buf.peek_be(1, 2).unwrap(), 0x0203);
        assert_eq!(buf.read_u8().unwrap(), 0x01);
        assert_eq!(buf.read_u16().unwrap(), 0x0203);
        assert_eq!(buf.read_u24().unwrap(), 0x040506);
        assert_eq!(buf.read_u32().unwrap(), 0x0708090a);
    }

    #[test]
    fn peek_does_not_consume() {
        let buf = ByteCursor::from(&b"\x0b\x0c"[..]);
        assert_eq!(buf.peek_byte(1).unwrap(), 0x0c);
        assert!(buf.peek_byte(2).is_err());
        assert_eq!(buf.available(), 2);
    }

    #[test]
    fn transfer_between_cursors() {
        let mut src = ByteCursor::from(&b"0123456789"[..]);
        let mut dst = ByteCursor::with_capacity(2);
        src.transfer_n(&mut dst, 4).unwrap();
        assert_eq!(dst.as_slice(), b"0123");
        assert_eq!(src.transfer_to(&mut dst), 6);
        assert_eq!(dst.read_all(), b"0123456789");
        assert!(src.transfer_n(&mut dst, 1).is_err());
    }

    #[test]
    fn enlarge_never_shrinks() {
        let mut buf = ByteCursor::with_capacity(64);
        buf.enlarge(10);
        assert_eq!(buf.capacity(), 64);
        buf.write(b"keep");
        buf.enlarge(100);
        assert_eq!(buf.capacity(), 128);
        assert_eq!(buf.as_slice(), b"keep");
    }

    #[test]
    fn io_and_buf_adapters() {
        use std::io::{Read, Write};

        let mut buf = ByteCursor::new();
        buf.write_all(b"\x00\x10rest").unwrap();
        assert_eq!(buf.get_u16(), 16);
        let mut out = [0u8; 8];
        let n = Read::read(&mut buf, &mut out).unwrap();
        assert_eq!(&out[..n], b"rest");
        assert_eq!(buf.remaining(), 0);
    }

    proptest! {
        #[test]
        fn available_tracks_written_minus_read(
            ops in proptest::collection::vec((any::<bool>(), 0usize..300), 1..60)
        ) {
            let mut buf = ByteCursor::with_capacity(16);
            let mut written = 0usize;
            let mut read = 0usize;
            let mut expected = std::collections::VecDeque::new();
            for (is_write, n) in ops {
                if is_write {
                    let chunk: Vec<u8> = (0..n).map(|i| (written + i) as u8).collect();
                    buf.write(&chunk);
                    expected.extend(chunk);
                    written += n;
                } else {
                    let n = n.min(buf.available());
                    let got = buf.read(n).unwrap();
                    let want: Vec<u8> = expected.drain(..n).collect();
                    prop_assert_eq!(got, want);
                    read += n;
                }
                prop_assert_eq!(buf.available(), written - read);
                prop_assert!(buf.available() <= buf.capacity());
            }
        }
    }
}
