//! Real client IP preamble.
//!
//! When a line has redirect enabled, the gateway writes this frame to the
//! backend before any relayed byte so the backend learns the client address.
//! The body is the textual IP, without port.

use std::net::IpAddr;

use crate::frame::Frame;
use crate::WireError;

/// Command word of the real-IP preamble.
pub const CMD_SET_REAL_IP: u32 = 0x00FF_FFFE;

/// Encode the preamble for `ip`.
pub fn real_ip_frame(ip: IpAddr) -> Vec<u8> {
    Frame::new(CMD_SET_REAL_IP, ip.to_string().into_bytes()).encode()
}

/// Parse a preamble span produced by [`real_ip_frame`].
pub fn parse_real_ip(span: &[u8]) -> Result<IpAddr, WireError> {
    let frame = Frame::decode(span)?;
    if frame.cmd != CMD_SET_REAL_IP {
        return Err(WireError::NotRealIp(frame.cmd));
    }

    let text = String::from_utf8_lossy(&frame.body);
    text.parse()
        .map_err(|_| WireError::InvalidAddress(text.into_owned()))
}
