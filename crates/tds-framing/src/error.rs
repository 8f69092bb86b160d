//! Framing error type.

use tds_tls::TlsError;
use tds_wire::ProtocolError;
use thiserror::Error;

/// Errors from the framing layer.
#[derive(Debug, Error)]
pub enum FramingError {
    /// A packet header advertised a length smaller than the header itself.
    #[error("invalid packet header")]
    InvalidHeader,

    /// A packet exceeded the negotiated size.
    #[error("packet of {size} bytes exceeds the {max} byte limit")]
    PacketTooLarge {
        /// Size the header advertised.
        size: usize,
        /// Current limit.
        max: usize,
    },

    /// The wire layer rejected packet contents.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The TLS engine failed.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// IO error surfaced through the codec.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
