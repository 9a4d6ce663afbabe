//! Backend wire framing shared by the gateway and the demo tools.
//!
//! Backends speak a length-prefixed protocol:
//! - 4 bytes little-endian body length
//! - 4 bytes little-endian command
//! - 8 bytes little-endian extension word
//! - `body length` bytes of body
//!
//! The gateway relay only looks at the body length; command and extension
//! belong to the backend RPC layer. The one command the gateway itself emits
//! is the real-IP preamble ([`real_ip_frame`]).

mod frame;
mod reader;
mod real_ip;

use thiserror::Error;

pub use frame::{Frame, Header, HEADER_LEN};
pub use reader::{grown_capacity, FrameReader, DEFAULT_READ_BUFFER, MAX_BODY_LEN};
pub use real_ip::{parse_real_ip, real_ip_frame, CMD_SET_REAL_IP};

/// Wire framing errors.
#[derive(Debug, Error)]
pub enum WireError {
    /// Fewer bytes than a header or the declared body.
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Declared body length exceeds the reader limit.
    #[error("frame body of {len} bytes exceeds limit of {max}")]
    BodyTooLarge { len: usize, max: usize },

    /// Frame is not a real-IP preamble.
    #[error("unexpected command {0:#x}, not a real-IP preamble")]
    NotRealIp(u32),

    /// Preamble body is not an IP address.
    #[error("invalid address in real-IP preamble: {0}")]
    InvalidAddress(String),

    /// A read did not complete within its deadline.
    #[error("read deadline exceeded")]
    Timeout,

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
