//! Events the connection surfaces to its owner.

use tds_wire::token::ServerMessage;

use crate::error::ConnectionError;

/// Observable connection events.
///
/// `Connect` and `End` each fire at most once per connection; the rest
/// may fire any number of times.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The connect attempt finished, successfully or not.
    Connect(Option<ConnectionError>),
    /// The connection closed and its resources were released.
    End,
    /// A non-terminal or terminal wire/protocol error.
    Error(ConnectionError),
    /// Diagnostic message.
    Debug(String),
    /// Server informational message.
    InfoMessage(ServerMessage),
    /// Server error message.
    ErrorMessage(ServerMessage),
    /// The session's database changed.
    DatabaseChange(String),
    /// The session's language changed.
    LanguageChange(String),
    /// The session's character set changed.
    CharsetChange(String),
    /// The TLS handshake completed.
    Secure,
    /// The server acknowledged a connection reset.
    ResetConnection,
}
