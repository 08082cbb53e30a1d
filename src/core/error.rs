/// DbData Error Module
///
/// This module defines the error types surfaced by the data-access layer.
/// Driver-level failures are kept apart from the domain error so callers can
/// always reach the underlying cause and the command text that triggered it.
use thiserror::Error;

/// Failures raised by the underlying SQLite driver or the session plumbing
/// around it.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Errors reported by SQLite itself
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The command ran longer than its timeout and was interrupted
    #[error("Command timed out after {0} seconds")]
    Timeout(u32),

    /// The command was interrupted through its cancellation token
    #[error("Command was cancelled")]
    Cancelled,

    /// The connection is still held by an open data reader
    #[error("Connection is already in use by an open data reader")]
    ConnectionBusy,

    /// The connection string could not be parsed
    #[error("Connection string error: {0}")]
    ConnectionString(String),

    /// Unknown schema collection or unsupported restrictions
    #[error("Schema error: {0}")]
    Schema(String),

    /// The reader worker thread could not be started
    #[error("Failed to start reader worker: {0}")]
    Worker(std::io::Error),

    /// The reader worker stopped before reporting a result
    #[error("Reader worker terminated unexpectedly")]
    ReaderTerminated,
}

impl DriverError {
    /// Returns true when SQLite aborted the statement through an interrupt.
    pub(crate) fn is_interrupt(&self) -> bool {
        matches!(
            self,
            DriverError::Sqlite(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::OperationInterrupted
        )
    }
}

/// Error type of the data-access layer.
///
/// - `InvalidTimeout` is an argument error raised before any I/O happens
/// - `Command` wraps every driver failure with the command text that caused it
/// - `Config` covers cipher and settings problems
#[derive(Error, Debug)]
pub enum DbDataError {
    /// Command timeout outside of `-1..`
    #[error("Invalid command timeout value: {0}")]
    InvalidTimeout(i32),

    /// A driver failure, tagged with the offending command text
    #[error("{source} (command: {command_text})")]
    Command {
        command_text: String,
        #[source]
        source: DriverError,
    },

    /// Commit, rollback or an in-transaction call without a transaction
    #[error("No active transaction")]
    NoActiveTransaction,

    /// `begin` while another transaction is still active
    #[error("A transaction is already active")]
    TransactionAlreadyActive,

    /// Cipher or settings errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The object has been released
    #[error("The data access object has been released")]
    Disposed,

    /// File system and I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DbDataError {
    /// Command text attached to a wrapped driver failure.
    pub fn command_text(&self) -> Option<&str> {
        match self {
            DbDataError::Command { command_text, .. } => Some(command_text),
            _ => None,
        }
    }

    /// The driver failure behind a wrapped command error.
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            DbDataError::Command { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Type alias for Result to use DbDataError as the error type.
pub type Result<T> = std::result::Result<T, DbDataError>;
