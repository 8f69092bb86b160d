//! # tds-tls
//!
//! TLS support for the pre-login encryption negotiation of TDS 7.x.
//!
//! TDS does not hand the socket to TLS the way most protocols do: while
//! the handshake runs, every TLS record travels *inside* a TDS PRELOGIN
//! packet. A stream-oriented TLS API cannot express that, so this crate
//! exposes a buffer-oriented [`TlsEngine`] — ciphertext in, plaintext
//! out and vice versa — that the framing layer can wrap and unwrap as it
//! pleases. Once the handshake completes the same engine encrypts the
//! whole session.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod engine;
pub mod error;

pub use config::TlsOptions;
pub use engine::TlsEngine;
pub use error::TlsError;
