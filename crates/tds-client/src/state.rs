//! Connection states and the events that drive them.

use bytes::Bytes;

/// The nine states of the connection state machine.
///
/// Exactly one state is current at any time. Each state accepts a fixed
/// set of events; dispatching anything else is a programming error that
/// closes the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Opening the socket; the connect timer is armed.
    Connecting,
    /// PRELOGIN sent, response being buffered.
    SentPrelogin,
    /// TLS handshake records are being exchanged inside PRELOGIN packets.
    SentTlsSslNegotiation,
    /// LOGIN7 sent, awaiting the login token stream.
    SentLogin7WithStandardLogin,
    /// Logged in; the session-option batch is in flight.
    LoggedInSendingInitialSql,
    /// Idle and ready for requests.
    LoggedIn,
    /// A request is in flight.
    SentClientRequest,
    /// An attention signal is in flight; awaiting its acknowledgement.
    SentAttention,
    /// Terminal state; resources released.
    Final,
}

impl State {
    /// The state's name, as used in transition logs and error messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Connecting => "Connecting",
            Self::SentPrelogin => "SentPrelogin",
            Self::SentTlsSslNegotiation => "SentTLSSSLNegotiation",
            Self::SentLogin7WithStandardLogin => "SentLogin7WithStandardLogin",
            Self::LoggedInSendingInitialSql => "LoggedInSendingInitialSql",
            Self::LoggedIn => "LoggedIn",
            Self::SentClientRequest => "SentClientRequest",
            Self::SentAttention => "SentAttention",
            Self::Final => "Final",
        }
    }
}

/// Events consumed by [`Connection::dispatch`](crate::Connection::dispatch).
#[derive(Debug)]
pub enum Event {
    /// The socket connected.
    SocketConnect,
    /// The socket failed.
    SocketError(std::io::Error),
    /// The connect timer fired.
    ConnectTimeout,
    /// One inbound packet's payload.
    Data(Bytes),
    /// The preceding data completed a message.
    Message,
    /// The pre-login response negotiated a cleartext session.
    NoTls,
    /// The pre-login response negotiated an encrypted session.
    Tls,
    /// The TLS engine reported a completed handshake.
    TlsNegotiated,
    /// Login was acknowledged with an acceptable version and interface.
    LoggedIn,
    /// Login did not produce an acceptable acknowledgement.
    LoginFailed,
}

impl Event {
    /// The event's name, as used in unknown-event errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SocketConnect => "socketConnect",
            Self::SocketError(_) => "socketError",
            Self::ConnectTimeout => "connectTimeout",
            Self::Data(_) => "data",
            Self::Message => "message",
            Self::NoTls => "noTls",
            Self::Tls => "tls",
            Self::TlsNegotiated => "tlsNegotiated",
            Self::LoggedIn => "loggedIn",
            Self::LoginFailed => "loginFailed",
        }
    }
}
