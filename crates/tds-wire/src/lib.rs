//! # tds-wire
//!
//! Pure implementation of the TDS (Tabular Data Stream) wire protocol:
//! packet headers, the handshake payloads (PRELOGIN, LOGIN7), request
//! payloads (SQL batch, RPC, transaction manager), and the token stream
//! the server answers with.
//!
//! This crate is intentionally IO-agnostic. It contains no networking
//! logic and makes no assumptions about the async runtime; everything
//! operates on [`bytes`] buffers. Higher-level crates add framing and
//! connection management on top.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod batch;
pub mod codec;
pub mod error;
pub mod login7;
pub mod packet;
pub mod prelogin;
pub mod rpc;
pub mod tman;
pub mod token;
pub mod version;

pub use error::ProtocolError;
pub use packet::{DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType};
pub use prelogin::{EncryptionLevel, PreloginMessage};
pub use token::{
    ColumnMetadata, DoneStatus, DoneToken, LoginAck, ReturnValue, Row, ServerMessage, TokenEvent,
    TokenStreamParser, TokenType,
};
pub use version::TdsVersion;
