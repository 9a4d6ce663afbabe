//! Error types for the gateway.

use std::io;

use thiserror::Error;

use crate::tls::TlsError;

/// Gateway errors.
///
/// Everything here except `StopTimeout` is a configuration error: it is
/// reported at startup and the process does not continue.
#[derive(Debug, Error)]
pub enum GateError {
    /// Engine started with an empty line pool.
    #[error("proxy {name}: no lines configured")]
    NoLines { name: String },

    /// TLS listener without any certificate.
    #[error("proxy {name}: tls enabled but no certificate configured")]
    MissingCertificates { name: String },

    /// Certificate or key could not be loaded.
    #[error("proxy {name}: {source}")]
    Tls {
        name: String,
        #[source]
        source: TlsError,
    },

    /// Listen address could not be bound.
    #[error("proxy {name}: cannot listen on {addr}: {source}")]
    Bind {
        name: String,
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Two proxies share a name.
    #[error("duplicate proxy name: {0}")]
    DuplicateProxy(String),

    /// A line points back at the proxy's own listener.
    #[error("proxy {name}: line {addr} points back at the proxy's own listener")]
    RecursiveLine { name: String, addr: String },

    /// Structurally invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// In-flight sessions did not drain within the stop grace period.
    #[error("proxy {name}: {sessions} sessions still active after stop timeout")]
    StopTimeout { name: String, sessions: usize },
}
