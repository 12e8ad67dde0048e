//! Error types and result handling for rowsync.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! Errors fall into four groups that the pipeline treats differently:
//!
//! | Group | Variants | Handling |
//! |-------|----------|----------|
//! | Capture | `InvalidMessage` | record skipped with an audit log entry |
//! | Transport | `Io`, `Connection`, `Timeout`, `Protocol` | batch status left unchanged, retried next cycle |
//! | Application | `Statement` | batch marked ER with the failing position |
//! | Extraction | `IncompleteBatch` | batch marked ER, never sent partially |
//! | Registration | `Registration` | surfaced to the caller, not retried |
//!
//! # Example
//!
//! ```rust
//! use rowsync::{Error, Result};
//!
//! fn open_session() -> Result<()> {
//!     Err(Error::Connection("connection refused".to_string()))
//! }
//!
//! match open_session() {
//!     Ok(()) => println!("Connected"),
//!     Err(e) if e.is_retryable() => eprintln!("will retry: {}", e),
//!     Err(e) => eprintln!("giving up: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for rowsync operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically from an invalid file or environment variable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client or protocol error.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// JSON serialization error when encoding payloads or acknowledgments.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error on a transport stream or file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer could not be reached or dropped the connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation exceeded its maximum duration.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// Framing violation on the wire, including an unterminated batch.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Malformed or unreadable change record.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// The requesting node is unknown or disabled.
    #[error("Registration error for node {node_id}: {message}")]
    Registration {
        /// Node that was rejected
        node_id: String,
        /// Reason reported by the peer
        message: String,
    },

    /// A statement failed while applying a batch on the target database.
    #[error("Statement failed (state={}, code={}): {message}", sql_state.as_deref().unwrap_or("-"), sql_code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()))]
    Statement {
        /// SQLSTATE reported by the database, if any
        sql_state: Option<String>,
        /// Vendor error code, if any
        sql_code: Option<i32>,
        /// Database error message
        message: String,
    },

    /// A batch status change not allowed by the delivery state machine.
    #[error("Invalid transition for batch {batch_id}: {from} -> {to}")]
    InvalidTransition {
        /// Batch being updated
        batch_id: i64,
        /// Current status code
        from: String,
        /// Requested status code
        to: String,
    },

    /// Some of a batch's member records are no longer in the change log.
    #[error("Batch {batch_id} is incomplete: {found} of {expected} records in the change log")]
    IncompleteBatch {
        /// Batch being extracted
        batch_id: i64,
        /// Routed member count
        expected: usize,
        /// Members still readable
        found: usize,
    },

    /// Graceful shutdown was requested.
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    /// Whether the failed operation can be repeated on the next cycle
    /// without operator intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Io(_)
            | Error::Connection(_)
            | Error::Timeout { .. }
            | Error::Protocol(_) => true,
            Error::Postgres(e) => e.as_db_error().is_none(),
            _ => false,
        }
    }

    /// Builds a statement error from its parts.
    pub fn statement(message: impl Into<String>) -> Self {
        Error::Statement {
            sql_state: None,
            sql_code: None,
            message: message.into(),
        }
    }

    /// Converts a database error into a [`Error::Statement`] when the server
    /// reported one, keeping the SQLSTATE for operator diagnosis.
    pub fn from_statement_failure(err: tokio_postgres::Error) -> Self {
        match err.as_db_error() {
            Some(db) => Error::Statement {
                sql_state: Some(db.code().code().to_string()),
                sql_code: None,
                message: db.message().to_string(),
            },
            None => Error::Postgres(err),
        }
    }
}

/// A convenient Result type alias for rowsync operations.
///
/// This is equivalent to `std::result::Result<T, rowsync::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
