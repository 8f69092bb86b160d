//! Connection and request error types.

use std::fmt;

use thiserror::Error;

/// Stable error codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The connect timer fired before login completed.
    Timeout,
    /// The socket failed or closed unexpectedly.
    Socket,
    /// Named-instance port lookup failed.
    InstanceLookup,
    /// The server rejected the login.
    Login,
    /// The server reported an error for the running request.
    Request,
    /// The request was canceled.
    Cancel,
    /// Commit or rollback was issued with no transaction open.
    NoTransactionInProgress,
    /// An operation was attempted in a state that does not allow it.
    InvalidState,
}

impl ErrorCode {
    /// The wire-stable string form of the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "ETIMEOUT",
            Self::Socket => "ESOCKET",
            Self::InstanceLookup => "EINSTLOOKUP",
            Self::Login => "ELOGIN",
            Self::Request => "EREQUEST",
            Self::Cancel => "ECANCEL",
            Self::NoTransactionInProgress => "ENOTRNINPROG",
            Self::InvalidState => "EINVALIDSTATE",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A session-scoped error, surfaced through the `connect` or `error`
/// events.
#[derive(Debug, Clone)]
pub struct ConnectionError {
    /// Human-readable description.
    pub message: String,
    /// Machine-readable code, when one applies.
    pub code: Option<ErrorCode>,
}

impl ConnectionError {
    /// Create an error.
    #[must_use]
    pub fn new(message: impl Into<String>, code: Option<ErrorCode>) -> Self {
        Self {
            message: message.into(),
            code,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{}: {}", code, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// An error scoped to a single request, surfaced through its completion
/// callback.
#[derive(Debug, Clone)]
pub struct RequestError {
    /// Human-readable description.
    pub message: String,
    /// Machine-readable code, when one applies.
    pub code: Option<ErrorCode>,
}

impl RequestError {
    /// Create an error.
    #[must_use]
    pub fn new(message: impl Into<String>, code: Option<ErrorCode>) -> Self {
        Self {
            message: message.into(),
            code,
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{}: {}", code, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for RequestError {}

/// Errors detected while validating configuration at construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Port outside (0, 65536).
    #[error("port must be greater than 0 and less than 65536, got {0}")]
    PortOutOfRange(u32),

    /// Both a port and an instance name were configured.
    #[error("port and instance name are mutually exclusive")]
    PortAndInstanceName,

    /// No server host was configured.
    #[error("a server host name is required")]
    MissingServer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_render_their_wire_names() {
        assert_eq!(ErrorCode::Timeout.as_str(), "ETIMEOUT");
        assert_eq!(ErrorCode::NoTransactionInProgress.as_str(), "ENOTRNINPROG");
    }

    #[test]
    fn display_includes_code_when_present() {
        let err = ConnectionError::new("login failed", Some(ErrorCode::Login));
        assert_eq!(err.to_string(), "ELOGIN: login failed");

        let err = RequestError::new("oops", None);
        assert_eq!(err.to_string(), "oops");
    }
}
