use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Failed to initialize database: {0}")]
    DatabaseInitializationError(String),
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    /// The record was admitted for a start it had already received.
    #[error("The monitored command {id} has already started.")]
    AlreadyStarted { id: i64 },
    /// `complete` or `fail` reached a record that is already completed or withdrawn.
    #[error("The monitored command {id} has already been finalized.")]
    AlreadyFinalized { id: i64 },
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
    #[error("Invalid re-entry: {0}")]
    InvalidReentry(String),
}

impl LedgerError {
    /// Invariant violations are bugs in record reuse, not storage trouble.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            LedgerError::AlreadyStarted { .. }
                | LedgerError::AlreadyFinalized { .. }
                | LedgerError::InvalidReentry(_)
        )
    }
}
