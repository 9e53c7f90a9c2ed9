//! Error types for assignment-repair

use thiserror::Error;

use crate::checker::AnomalyKind;
use crate::models::Table;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Transient store error: {0}")]
    Transient(String),

    #[error("Record already exists: {table}/{id}")]
    Duplicate { table: Table, id: String },

    #[error("Patch for {patch} cannot be applied to table {table}")]
    PatchMismatch { table: Table, patch: Table },

    #[error("Corrupt row in {table}: {reason}")]
    Corrupt { table: Table, reason: String },

    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &err {
            rusqlite::Error::SqliteFailure(failure, _)
                if matches!(
                    failure.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) =>
            {
                StoreError::Transient(err.to_string())
            }
            _ => StoreError::Database(err),
        }
    }
}

#[derive(Error, Debug)]
pub enum RepairError {
    #[error("No repair policy registered for anomaly kind {0}")]
    Unrepairable(AnomalyKind),

    #[error("Malformed anomaly: {0}")]
    Malformed(String),

    #[error("Snapshot unavailable after {attempts} attempts: {source}")]
    SnapshotUnavailable {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
