//! Protocol error type.

use thiserror::Error;

/// Errors produced while encoding or decoding TDS wire data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A packet header named a type this driver does not know.
    #[error("unknown packet type 0x{0:02X}")]
    UnknownPacketType(u8),

    /// A packet header carried status bits outside the defined set.
    #[error("invalid packet status 0x{0:02X}")]
    InvalidPacketStatus(u8),

    /// A buffer ended before a complete protocol element.
    #[error("truncated input: needed {needed} bytes, had {available}")]
    Truncated {
        /// Bytes required to finish decoding.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// A PRELOGIN option pointed outside the payload.
    #[error("pre-login option data out of bounds")]
    PreloginOutOfBounds,

    /// The token stream contained a token this driver cannot parse.
    #[error("unrecognized token 0x{0:02X} in token stream")]
    UnknownToken(u8),

    /// A token was structurally invalid.
    #[error("malformed {token} token: {detail}")]
    MalformedToken {
        /// Token name.
        token: &'static str,
        /// What was wrong with it.
        detail: &'static str,
    },

    /// Column metadata used a type this driver cannot decode values of.
    #[error("unsupported column type 0x{0:02X}")]
    UnsupportedColumnType(u8),

    /// A ROW token arrived with no preceding COLMETADATA.
    #[error("row data received before column metadata")]
    RowWithoutMetadata,
}
