//! Error types for prepared statement execution
//!
//! Errors are split the way the lifecycle needs to see them: server errors
//! carry the numeric code used to decide whether a failed prepare can be
//! absorbed, everything else is propagated to the caller unchanged.

use serde::{Deserialize, Serialize};

/// Server error code reported when the server does not know the prepare message.
pub const ER_UNKNOWN_COM_ERROR: u16 = 1047;

/// Server error code reported when `max_prepared_stmt_count` is exhausted.
pub const ER_MAX_PREPARED_STMT_COUNT_REACHED: u16 = 1461;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// An error reported by the server in response to a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Numeric server error code
    pub code: u16,
    /// Five character SQL state
    pub sql_state: String,
    /// Human readable message
    pub message: String,
}

impl ServerError {
    /// Create a new server error
    pub fn new(code: u16, sql_state: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            sql_state: sql_state.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] ({}) {}", self.code, self.sql_state, self.message)
    }
}

/// Errors produced while executing statements
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The server rejected a request
    #[error("server error {0}")]
    Server(ServerError),
    /// The connection failed underneath a request
    #[error("transport error: {0}")]
    Transport(String),
    /// The server answered with something the client did not expect
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The session owning the statement has been closed
    #[error("session is closed")]
    SessionClosed,
    /// The statement lifecycle reached a state its invariants rule out
    #[error("statement lifecycle defect: {0}")]
    Lifecycle(String),
}

impl Error {
    /// Shorthand for a server error
    pub fn server(code: u16, sql_state: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Server(ServerError::new(code, sql_state, message))
    }

    /// The server error code, if this error came from the server
    pub fn server_code(&self) -> Option<u16> {
        match self {
            Error::Server(e) => Some(e.code),
            _ => None,
        }
    }
}

impl From<ServerError> for Error {
    fn from(e: ServerError) -> Self {
        Error::Server(e)
    }
}

/// How a failed prepare request is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareErrorClass {
    /// The server does not support preparing statements
    Unsupported,
    /// The server has no room for another prepared statement
    Exhausted,
    /// Anything else; propagated to the caller
    Other,
}

impl PrepareErrorClass {
    /// Whether the failure is absorbed by falling back to plain execution
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, PrepareErrorClass::Other)
    }

    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            PrepareErrorClass::Unsupported => "unsupported",
            PrepareErrorClass::Exhausted => "exhausted",
            PrepareErrorClass::Other => "other",
        }
    }
}

impl std::fmt::Display for PrepareErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_display() {
        let error = Error::server(1461, "42000", "Can't create more than 16382 statements");
        assert_eq!(
            error.to_string(),
            "server error [1461] (42000) Can't create more than 16382 statements"
        );
    }

    #[test]
    fn test_server_code() {
        assert_eq!(Error::server(1047, "08S01", "Unknown command").server_code(), Some(1047));
        assert_eq!(Error::Transport("reset by peer".into()).server_code(), None);
        assert_eq!(Error::SessionClosed.server_code(), None);
    }

    #[test]
    fn test_from_server_error() {
        let error: Error = ServerError::new(1213, "40001", "Deadlock found").into();
        assert!(matches!(error, Error::Server(ref e) if e.code == 1213));
    }

    #[test]
    fn test_prepare_error_class_recoverable() {
        assert!(PrepareErrorClass::Unsupported.is_recoverable());
        assert!(PrepareErrorClass::Exhausted.is_recoverable());
        assert!(!PrepareErrorClass::Other.is_recoverable());
        assert_eq!(PrepareErrorClass::Exhausted.to_string(), "exhausted");
    }
}
