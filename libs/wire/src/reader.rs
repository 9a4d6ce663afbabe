//! Deadline-bounded frame reader.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::frame::{Header, HEADER_LEN};
use crate::WireError;

/// Initial buffer size used by relays.
pub const DEFAULT_READ_BUFFER: usize = 4 * 1024;

/// Largest body a reader accepts (16 MiB).
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

/// Buffer size needed to hold `total` bytes, rounded up to a whole KiB.
pub fn grown_capacity(total: usize) -> usize {
    total.div_ceil(1024) * 1024
}

/// Reads whole frames from a byte stream, reusing one growable buffer.
#[derive(Debug)]
pub struct FrameReader {
    buf: Vec<u8>,
    max_body_len: usize,
}

impl FrameReader {
    /// Create a reader with the given initial buffer size (at least one header).
    pub fn new(initial: usize) -> Self {
        Self {
            buf: vec![0u8; initial.max(HEADER_LEN)],
            max_body_len: MAX_BODY_LEN,
        }
    }

    /// Override the body length limit.
    pub fn with_max_body_len(mut self, max_body_len: usize) -> Self {
        self.max_body_len = max_body_len;
        self
    }

    /// Current buffer size.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Read exactly one frame and return its header+body span.
    ///
    /// Header and body are each read under `deadline`.
    pub async fn read_frame<R>(
        &mut self,
        reader: &mut R,
        deadline: Duration,
    ) -> Result<&[u8], WireError>
    where
        R: AsyncRead + Unpin,
    {
        read_exact_within(reader, &mut self.buf[..HEADER_LEN], deadline).await?;

        let body_len = Header::body_len_of(&self.buf[..HEADER_LEN]) as usize;
        if body_len == 0 {
            return Ok(&self.buf[..HEADER_LEN]);
        }
        if body_len > self.max_body_len {
            return Err(WireError::BodyTooLarge {
                len: body_len,
                max: self.max_body_len,
            });
        }

        let total = HEADER_LEN + body_len;
        if self.buf.len() < total {
            self.buf.resize(grown_capacity(total), 0);
        }

        read_exact_within(reader, &mut self.buf[HEADER_LEN..total], deadline).await?;
        Ok(&self.buf[..total])
    }
}

async fn read_exact_within<R>(
    reader: &mut R,
    buf: &mut [u8],
    deadline: Duration,
) -> Result<(), WireError>
where
    R: AsyncRead + Unpin,
{
    match timeout(deadline, reader.read_exact(buf)).await {
        Ok(result) => {
            result?;
            Ok(())
        }
        Err(_) => Err(WireError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Frame;
    use rstest::rstest;
    use tokio::io::AsyncWriteExt;

    const DEADLINE: Duration = Duration::from_secs(1);

    #[rstest]
    #[case(16, 1024)]
    #[case(1024, 1024)]
    #[case(1025, 2048)]
    #[case(4096, 4096)]
    #[case(5000, 5120)]
    fn test_grown_capacity(#[case] total: usize, #[case] expected: usize) {
        assert_eq!(grown_capacity(total), expected);
    }

    #[tokio::test]
    async fn test_reads_consecutive_frames() {
        let mut data = Frame::new(1, b"world".to_vec()).encode();
        data.extend(Frame::new(2, Vec::new()).encode());
        let mut stream = data.as_slice();

        let mut reader = FrameReader::new(DEFAULT_READ_BUFFER);
        let first = reader.read_frame(&mut stream, DEADLINE).await.unwrap();
        assert_eq!(first.len(), 21);
        assert_eq!(&first[16..], b"world");

        let second = reader.read_frame(&mut stream, DEADLINE).await.unwrap();
        assert_eq!(second.len(), 16);
    }

    #[rstest]
    #[case::rounds_up(5000, 5120)]
    #[case::exact_multiple(2048 - 16, 2048)]
    #[case::fits_initial(1000, 1024)]
    #[tokio::test]
    async fn test_buffer_grows_in_kib_steps(#[case] body_len: usize, #[case] expected: usize) {
        let body = vec![7u8; body_len];
        let data = Frame::new(1, body.clone()).encode();
        let mut stream = data.as_slice();

        let mut reader = FrameReader::new(1024);
        let span = reader.read_frame(&mut stream, DEADLINE).await.unwrap();
        assert_eq!(&span[16..], body.as_slice());
        assert_eq!(reader.capacity(), expected);
    }

    #[tokio::test]
    async fn test_rejects_oversized_body() {
        let data = Frame::new(1, vec![0u8; 64]).encode();
        let mut stream = data.as_slice();

        let mut reader = FrameReader::new(1024).with_max_body_len(32);
        let err = reader.read_frame(&mut stream, DEADLINE).await.unwrap_err();
        assert!(matches!(err, WireError::BodyTooLarge { len: 64, max: 32 }));
    }

    #[tokio::test]
    async fn test_partial_header_eof() {
        let mut stream: &[u8] = &[1, 0, 0];
        let mut reader = FrameReader::new(1024);
        let err = reader.read_frame(&mut stream, DEADLINE).await.unwrap_err();
        assert!(matches!(err, WireError::Io(_)));
    }

    #[tokio::test]
    async fn test_read_deadline() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[5, 0, 0, 0]).await.unwrap();

        let mut reader = FrameReader::new(1024);
        let err = reader
            .read_frame(&mut server, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::Timeout));
    }
}
