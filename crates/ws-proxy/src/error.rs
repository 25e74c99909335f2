use std::path::PathBuf;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors that can occur while accepting, upgrading, or relaying connections.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket transport or handshake error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// TLS configuration error.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// A certificate or key file could not be read or decoded.
    #[error("failed to read {}: {source}", path.display())]
    ReadPem {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no certificates found in {}", path.display())]
    NoCertificates { path: PathBuf },

    #[error("no private key found in {}", path.display())]
    NoPrivateKey { path: PathBuf },

    /// The HTTP request head could not be parsed.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("request head exceeds {0} bytes")]
    RequestTooLarge(usize),

    /// The peer closed the connection before sending a complete request head.
    #[error("connection closed before the request head was complete")]
    IncompleteRequest,

    #[error("invalid backend url '{0}': expected a ws:// or wss:// url with a host")]
    InvalidBackendUrl(String),
}
