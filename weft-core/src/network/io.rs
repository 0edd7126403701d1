//! Non-blocking socket primitives used by the dispatcher.

use std::io;

use tokio::net::TcpStream;

use crate::network::Connection;

/// Non-blocking read/write on a socket that has reported readiness.
///
/// Implementations return `WouldBlock` instead of waiting.
pub trait SocketIo {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;
}

impl SocketIo for TcpStream {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::try_write(self, buf)
    }
}

/// Result of one bounded read pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadReport {
    /// Bytes appended to the connection's inbound buffer.
    pub bytes: usize,
    /// The peer closed its side of the stream.
    pub eof: bool,
}

/// Pull bytes from `io` into the connection's inbound buffer.
///
/// Stops at end of stream, after `limit` bytes, or once `retries`
/// consecutive attempts come back empty. An empty pass is "no data yet",
/// never end of stream.
pub(crate) fn read_socket<S: SocketIo + ?Sized>(
    io: &S,
    conn: &Connection,
    scratch: &mut [u8],
    retries: usize,
    limit: usize,
) -> io::Result<ReadReport> {
    let mut report = ReadReport::default();
    let mut empty = 0;
    while report.bytes < limit {
        let want = scratch.len().min(limit - report.bytes);
        match io.try_read(&mut scratch[..want]) {
            Ok(0) => {
                report.eof = true;
                break;
            }
            Ok(n) => {
                conn.push_inbound(&scratch[..n]);
                report.bytes += n;
                empty = 0;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                empty += 1;
                if empty >= retries {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(report)
}

/// Write queued output until it is gone or the socket would block.
/// Returns `true` once the queue is empty.
pub(crate) fn flush_socket<S: SocketIo + ?Sized>(io: &S, conn: &Connection) -> io::Result<bool> {
    let mut out = conn.outbound();
    while !out.is_empty() {
        match io.try_write(out.as_slice()) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                out.skip(n).map_err(|e| io::Error::other(e.to_string()))?;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}


#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;
    use crate::buffer::ByteCursor;
    use crate::network::Mode;

    fn conn() -> std::sync::Arc<Connection> {
        Connection::new("127.0.0.1:1".parse().unwrap(), Mode::Acceptor)
    }

    #[test]
    fn empty_reads_are_not_eof() {
        let sock = ScriptedSocket::reads(vec![would_block(), would_block(), would_block()]);
        let c = conn();
        let report = read_socket(&sock, &c, &mut [0; 16], 3, 1024).unwrap();
        assert_eq!(report, ReadReport::default());
        assert!(c.is_open());
    }

    #[test]
    fn retries_bridge_short_gaps() {
        let sock = ScriptedSocket::reads(vec![
            Ok(b"ab".to_vec()),
            would_block(),
            Ok(b"cd".to_vec()),
        ]);
        let c = conn();
        let report = read_socket(&sock, &c, &mut [0; 16], 3, 1024).unwrap();
        assert_eq!(report.bytes, 4);
        assert!(!report.eof);
        let mut out = ByteCursor::new();
        c.read(&mut out);
        assert_eq!(out.as_slice(), b"abcd");
    }

    #[test]
    fn end_of_stream_reported_after_data() {
        let sock = ScriptedSocket::reads(vec![Ok(b"bye".to_vec()), Ok(Vec::new())]);
        let c = conn();
        let report = read_socket(&sock, &c, &mut [0; 16], 3, 1024).unwrap();
        assert_eq!(report, ReadReport { bytes: 3, eof: true });
    }

    #[test]
    fn read_limit_caps_one_pass() {
        let steps = (0..10).map(|_| Ok(vec![1u8; 8])).collect();
        let sock = ScriptedSocket::reads(steps);
        let c = conn();
        let report = read_socket(&sock, &c, &mut [0; 8], 3, 20).unwrap();
        assert_eq!(report.bytes, 20);
    }

    #[test]
    fn hard_errors_propagate() {
        let sock = ScriptedSocket::reads(vec![Err(io::ErrorKind::ConnectionReset.into())]);
        let err = read_socket(&sock, &conn(), &mut [0; 8], 3, 64).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn flush_drains_in_pieces() {
        let mut sock = ScriptedSocket::reads(Vec::new());
        sock.write_window = 3;
        let c = conn();
        c.write(ByteCursor::from(&b"hello world"[..])).unwrap();
        assert!(flush_socket(&sock, &c).unwrap());
        assert_eq!(sock.written.lock().as_slice(), b"hello world");
        assert!(!c.has_pending_writes());
    }

    #[test]
    fn flush_keeps_remainder_when_blocked() {
        let mut sock = ScriptedSocket::reads(Vec::new());
        sock.write_window = 0;
        let c = conn();
        c.write(ByteCursor::from(&b"queued"[..])).unwrap();
        assert!(!flush_socket(&sock, &c).unwrap());
        assert!(c.has_pending_writes());
    }
}
