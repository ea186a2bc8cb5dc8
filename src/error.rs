//! Error types and result handling for changerelay.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.

use thiserror::Error;

/// A structured error reported by the Postgres server in an ErrorResponse
/// message. The connection usually remains usable after one of these is
/// drained to ReadyForQuery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// Severity field ('S'), e.g. "ERROR" or "FATAL".
    pub severity: String,
    /// SQLSTATE code field ('C').
    pub code: String,
    /// Human-readable message field ('M').
    pub message: String,
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} (SQLSTATE {})", self.severity, self.message, self.code)
    }
}

/// The main error type for changerelay operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically from an invalid config file or
    /// environment variable.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// I/O error on the database socket or the filesystem. Fatal to the
    /// connection it occurred on.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed message framing (bad declared length, short read). Fatal
    /// to the connection.
    #[error("Protocol framing error: {0}")]
    Framing(String),

    /// A typed read ran past the end of a message payload.
    #[error("Truncated message: {0}")]
    Truncated(String),

    /// The server asked for an authentication method we do not speak.
    /// Only "trust" (auth code 0) is supported.
    #[error("Unsupported authentication method requested by server: code {0}")]
    UnsupportedAuth(i32),

    /// An error reported by the server itself.
    #[error("Server error: {0}")]
    Server(ServerError),

    /// Protocol-level violation that is not a framing problem, e.g. an
    /// unexpected message type in a fixed exchange.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Replication-specific failure (slot handshake, stream setup).
    #[error("Replication error: {0}")]
    Replication(String),

    /// A sequence or LSN string could not be parsed.
    #[error("Invalid sequence: {0}")]
    InvalidSequence(String),

    /// JSON encoding or decoding failure for a change envelope.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The session or tracker was asked to do something after shutdown.
    #[error("Closed: {0}")]
    Closed(String),
}

/// A convenient Result type alias for changerelay operations.
pub type Result<T> = std::result::Result<T, Error>;
