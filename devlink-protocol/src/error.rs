//! Error types for the Devlink connectivity core.
//!
//! All fallible operations in this crate return [`Result`], which wraps
//! [`ProtocolError`]. Transport, TLS and serialization failures convert
//! into it via `From`, so call sites can use `?` throughout.

use thiserror::Error;

/// Errors raised by servers, transports and the certificate exchange.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// IO error (socket operations, certificate storage)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS handshake or stream error
    #[error("TLS error: {0}")]
    Tls(#[from] openssl::ssl::Error),

    /// Certificate parsing, generation or signing error
    #[error("certificate error: {0}")]
    Certificate(#[from] openssl::error::ErrorStack),

    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The requested port is already bound by another process.
    ///
    /// The message deliberately carries the `EADDRINUSE` tag so callers
    /// can match on it regardless of platform error wording.
    #[error("EADDRINUSE: port {0} is already in use")]
    PortInUse(u16),

    /// The connection URL or setup payload did not contain a valid client query
    #[error("invalid client query: {0}")]
    InvalidQuery(String),

    /// The `medium` parameter was outside the known range
    #[error("unknown certificate exchange medium: {0}")]
    UnknownMedium(u64),

    /// Certificate signing request could not be honored
    #[error("certificate exchange failed: {0}")]
    CertificateExchange(String),

    /// A frame that parsed as JSON but violated the message contract
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The remote client answered a request with an error payload
    #[error("remote call failed: {0}")]
    ExecFailed(serde_json::Value),

    /// A request was not answered within its deadline
    #[error("timed out: {0}")]
    Timeout(String),

    /// The underlying connection went away while a request was in flight
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// Server was constructed or started with an unusable configuration
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// Maps a bind failure to [`ProtocolError::PortInUse`] when the kernel
    /// reports the address as taken, otherwise wraps the IO error as-is.
    pub fn from_bind_error(error: std::io::Error, port: u16) -> Self {
        if error.kind() == std::io::ErrorKind::AddrInUse {
            ProtocolError::PortInUse(port)
        } else {
            ProtocolError::Io(error)
        }
    }
}
