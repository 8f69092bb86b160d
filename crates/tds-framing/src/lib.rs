//! # tds-framing
//!
//! Packet framing for TDS sessions.
//!
//! The crate has two layers. [`TdsCodec`] is a `tokio-util` codec that
//! turns a byte stream into [`Packet`]s and back. [`MessageIo`] sits on
//! top and speaks in logical messages: it chunks outbound payloads into
//! packets of the negotiated size, reassembles inbound packets into
//! `data`/`message` events, and — during pre-login encryption
//! negotiation — tunnels TLS handshake records through PRELOGIN-typed
//! packets before switching the whole session to ciphertext.
//!
//! `MessageIo` is deliberately sans-io: it consumes received bytes and
//! queues bytes to send, leaving sockets and scheduling to the caller.
//! That keeps the connection state machine the single writer of session
//! state and makes the whole layer testable without a network.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod message_io;
pub mod packet_codec;

pub use error::FramingError;
pub use message_io::{IoEvent, MessageIo};
pub use packet_codec::{Packet, TdsCodec};
