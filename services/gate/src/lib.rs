//! linegate gateway.
//!
//! Reverse proxy that accepts raw TCP and WebSocket clients, picks the best
//! backend line from a continuously probed pool, and relays traffic both ways
//! while keeping connection and byte counters.

pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod registry;
pub mod stats;
pub mod tls;

pub use config::{GateConfig, ProxyKind};
pub use context::GateContext;
pub use error::GateError;
pub use proxy::{BackendLine, LinePool, LineSelector, SocketTuning, TcpTunnel, WsTunnel};
pub use registry::{ProxyRegistry, Tunnel};
pub use stats::{StatsSnapshot, TrafficStats};
