//! Per-connection socket options and I/O deadlines.

use std::io;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::warn;

pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(600);
pub const DEFAULT_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_READ_DEADLINE: Duration = Duration::from_secs(35);
pub const DEFAULT_WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// Socket options applied to every client and backend connection, plus the
/// deadlines used for each read and write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketTuning {
    pub no_delay: bool,
    pub keepalive: Duration,
    pub read_buffer: usize,
    pub write_buffer: usize,
    /// Rolling deadline: restarts before every read.
    pub read_deadline: Duration,
    pub write_deadline: Duration,
}

impl Default for SocketTuning {
    fn default() -> Self {
        Self {
            no_delay: true,
            keepalive: DEFAULT_KEEPALIVE,
            read_buffer: DEFAULT_BUFFER_SIZE,
            write_buffer: DEFAULT_BUFFER_SIZE,
            read_deadline: DEFAULT_READ_DEADLINE,
            write_deadline: DEFAULT_WRITE_DEADLINE,
        }
    }
}

impl SocketTuning {
    /// Apply socket options. Failures are logged and otherwise ignored.
    pub fn apply(&self, stream: &TcpStream) {
        if let Err(e) = stream.set_nodelay(self.no_delay) {
            warn!(error = %e, "Failed to set TCP_NODELAY");
        }

        let sock = SockRef::from(stream);
        if let Err(e) = sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(self.keepalive)) {
            warn!(error = %e, "Failed to set keepalive");
        }
        if let Err(e) = sock.set_recv_buffer_size(self.read_buffer) {
            warn!(error = %e, "Failed to set receive buffer size");
        }
        if let Err(e) = sock.set_send_buffer_size(self.write_buffer) {
            warn!(error = %e, "Failed to set send buffer size");
        }
    }

    /// Size of the relay buffer for one read.
    pub fn relay_buffer_len(&self) -> usize {
        self.read_buffer.max(1)
    }

    /// Read under the read deadline.
    pub async fn read<R>(&self, reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        match timeout(self.read_deadline, reader.read(buf)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read deadline exceeded")),
        }
    }

    /// Write everything under the write deadline.
    pub async fn write_all<W>(&self, writer: &mut W, buf: &[u8]) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match timeout(self.write_deadline, writer.write_all(buf)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write deadline exceeded")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_defaults() {
        let tuning = SocketTuning::default();
        assert!(tuning.no_delay);
        assert_eq!(tuning.keepalive, Duration::from_secs(600));
        assert_eq!(tuning.read_buffer, 4096);
        assert_eq!(tuning.write_buffer, 4096);
        assert_eq!(tuning.read_deadline, Duration::from_secs(35));
        assert_eq!(tuning.write_deadline, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_apply_sets_nodelay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = client.unwrap();
        let (_server, _) = accepted.unwrap();

        SocketTuning::default().apply(&client);
        assert!(client.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_read_deadline() {
        let tuning = SocketTuning {
            read_deadline: Duration::from_millis(20),
            ..SocketTuning::default()
        };
        let (mut near, _far) = tokio::io::duplex(64);
        let mut buf = [0u8; 8];

        let err = tuning.read(&mut near, &mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_read_and_write_within_deadline() {
        let tuning = SocketTuning::default();
        let (mut near, mut far) = tokio::io::duplex(64);

        tuning.write_all(&mut near, b"hello").await.unwrap();
        let mut buf = [0u8; 8];
        let n = tuning.read(&mut far, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }
}
