//! Error types for the client core.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::codec::CodecError;

/// Client error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Connect or handshake failure. No connection was returned.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Operation on a closed connection or cursor, or on a connection whose
    /// transport has failed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The server rejected a statement.
    #[error("query failed [{code}]: {message}")]
    Query {
        /// SQLSTATE code reported by the server.
        code: String,
        /// Primary human-readable message.
        message: String,
    },

    /// A statement was attempted while the transaction is failed.
    #[error("current transaction is aborted, commands ignored until rollback")]
    TransactionAborted,

    /// Caller protocol violation, such as fetching before any execute.
    #[error("cursor state error: {0}")]
    CursorState(String),

    /// Deadline exceeded; the connection must be discarded.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Malformed or unexpected message from the server.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid connection options.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A connection mutex was poisoned by a panicking thread.
    #[error("mutex poisoned in {0}")]
    LockPoisoned(String),

    /// Transport I/O failure.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns true if this error invalidates the connection it occurred on.
    pub fn is_connection_broken(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed | Error::Timeout(_) | Error::Protocol(_) | Error::Io(_)
        )
    }

    /// SQLSTATE code of a server-reported error.
    pub fn code(&self) -> Option<&str> {
        match self {
            Error::Query { code, .. } => Some(code),
            _ => None,
        }
    }

    pub(crate) fn query(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Query {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        Error::Protocol(err.to_string())
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
