//! TLS error type.

use thiserror::Error;

/// Errors from TLS configuration or the record engine.
#[derive(Debug, Error)]
pub enum TlsError {
    /// The server name is not a valid DNS name or IP address.
    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    /// A trust root could not be added.
    #[error("invalid root certificate: {0}")]
    InvalidRootCertificate(String),

    /// The rustls layer rejected something.
    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),

    /// IO while moving records in or out of the engine.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection mid-handshake.
    #[error("connection closed during TLS negotiation")]
    ConnectionClosed,
}
