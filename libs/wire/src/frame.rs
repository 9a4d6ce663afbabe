//! Frame header encoding.

use crate::WireError;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 16;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Length of the body that follows the header.
    pub body_len: u32,
    /// Command word (opaque to the relay).
    pub cmd: u32,
    /// Extension word (opaque to the relay).
    pub ext: u64,
}

impl Header {
    /// Encode into the 16-byte wire form.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&self.body_len.to_le_bytes());
        out[4..8].copy_from_slice(&self.cmd.to_le_bytes());
        out[8..].copy_from_slice(&self.ext.to_le_bytes());
        out
    }

    /// Decode from the first 16 bytes of `data`.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < HEADER_LEN {
            return Err(WireError::Truncated {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }

        Ok(Self {
            body_len: Self::body_len_of(data),
            cmd: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            ext: u64::from_le_bytes([
                data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
            ]),
        })
    }

    /// Body length field of a header slice. `data` must hold at least 4 bytes.
    pub(crate) fn body_len_of(data: &[u8]) -> u32 {
        u32::from_le_bytes([data[0], data[1], data[2], data[3]])
    }
}

/// A complete frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub cmd: u32,
    pub ext: u64,
    pub body: Vec<u8>,
}

impl Frame {
    /// Create a frame with a zero extension word.
    pub fn new(cmd: u32, body: impl Into<Vec<u8>>) -> Self {
        Self {
            cmd,
            ext: 0,
            body: body.into(),
        }
    }

    /// Header describing this frame.
    pub fn header(&self) -> Header {
        Header {
            body_len: self.body.len() as u32,
            cmd: self.cmd,
            ext: self.ext,
        }
    }

    /// Encode header and body into one buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.body.len());
        buf.extend_from_slice(&self.header().encode());
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Decode a header+body span. Trailing bytes past the declared body are ignored.
    pub fn decode(span: &[u8]) -> Result<Self, WireError> {
        let header = Header::decode(span)?;
        let total = HEADER_LEN + header.body_len as usize;
        if span.len() < total {
            return Err(WireError::Truncated {
                expected: total,
                actual: span.len(),
            });
        }

        Ok(Self {
            cmd: header.cmd,
            ext: header.ext,
            body: span[HEADER_LEN..total].to_vec(),
        })
    }
}
