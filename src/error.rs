//! Error types for the points ledger.
//!
//! Business-rule failures (insufficient points, unknown account, ...) are not
//! errors: they come back as [`crate::Outcome::Rejected`]. `LedgerError` is
//! reserved for failures where the caller does not know whether anything
//! happened and should retry later with the same transaction id.

use thiserror::Error;

/// Result type alias for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors that can occur during ledger operation.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// The store could not complete the operation, either outright or after
    /// exhausting commit retries. Safe to retry with the same transaction id.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Failed to open or read the input file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV parsing or writing error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Missing input file argument
    #[error("Missing input file argument. Usage: points-ledger <events.csv>")]
    MissingArgument,
}

/// Errors raised by a store backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Contention or a uniqueness violation detected at commit. The engine
    /// retries the whole operation.
    #[error("storage conflict: {0}")]
    Conflict(String),

    /// The store cannot serve requests.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        LedgerError::StorageUnavailable(err.to_string())
    }
}

// SQLITE_CONSTRAINT_UNIQUE and SQLITE_CONSTRAINT_PRIMARYKEY.
const UNIQUE_VIOLATION_CODES: [i32; 2] = [2067, 1555];

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(error, _)
                if UNIQUE_VIOLATION_CODES.contains(&error.extended_code) =>
            {
                StoreError::Conflict(err.to_string())
            }
            rusqlite::Error::SqliteFailure(error, _)
                if matches!(
                    error.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                StoreError::Conflict(err.to_string())
            }
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}
