//! Line health, selection and tunnel engines.
//!
//! ## Architecture
//!
//! ```text
//! Client -> TcpTunnel / WsTunnel -> LinePool::select_best -> BackendLine -> Backend
//!                 |                                              |
//!          lazy dial on first read                   probe loop, load, failures
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use linegate_gate::proxy::{SocketTuning, TcpTunnel};
//!
//! let tunnel = TcpTunnel::new("game", "0.0.0.0:10000", SocketTuning::default(), ctx);
//! tunnel.pool().add_line("10.0.0.5:20001", timeout, interval, 5000, true).await;
//! let addr = tunnel.start().await?;
//! ```

mod failures;
mod line;
mod listener;
mod pool;
mod session;
mod socket;
mod tcp;
mod websocket;

pub use failures::{FailureRing, FAILURE_MINUTES};
pub use line::{BackendLine, LoadGuard, DELAY_QUEUE_CAPACITY, REDIRECT_WRITE_TIMEOUT};
pub use listener::{PeerAddr, TlsListener, TunedListener, HANDSHAKE_TIMEOUT};
pub use pool::{LinePool, LineSelector};
pub use session::{SessionBytes, SessionGuard, SessionTracker};
pub use socket::SocketTuning;
pub use tcp::TcpTunnel;
pub use websocket::{WsTunnel, DEFAULT_WSS_PATH, DEFAULT_WS_PATH};
