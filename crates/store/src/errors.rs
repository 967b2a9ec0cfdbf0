use std::io;

use deadpool::managed::PoolError;
use folio_domain::{BatchId, RecordKey};
use rusqlite::types::FromSqlError;
use thiserror::Error;

// DATABASE ERRORS
// =================================================================================================

#[derive(Debug, Error)]
pub enum DatabaseError {
    // ERRORS WITH AUTOMATIC CONVERSIONS FROM NESTED ERROR TYPES
    // ---------------------------------------------------------------------------------------------
    #[error("SQLite deserialization error")]
    FromSqlError(#[from] FromSqlError),
    #[error("I/O error")]
    IoError(#[from] io::Error),
    #[error("migration failed")]
    MigrationError(#[from] rusqlite_migration::Error),
    #[error("missing database connection")]
    MissingDbConnection(#[from] PoolError<rusqlite::Error>),
    #[error("SQLite error")]
    SqliteError(#[from] rusqlite::Error),

    // OTHER ERRORS
    // ---------------------------------------------------------------------------------------------
    #[error("batch {0} already exists")]
    BatchAlreadyExists(BatchId),
    #[error("batch {0} is not active")]
    BatchNotActive(BatchId),
    #[error("data corrupted: {0}")]
    DataCorrupted(String),
    #[error("SQLite pool interaction failed: {0}")]
    InteractError(String),
    #[error("record keys already in flight: {0:?}")]
    RecordsAlreadyInflight(Vec<RecordKey>),
    #[error(
        "unsupported database version. There is no migration chain from/to this version. \
        Remove all database files and try again."
    )]
    UnsupportedDatabaseVersion,
}

impl DatabaseError {
    /// Whether the error indicates an unusable database rather than a rejected operation.
    ///
    /// Corruption is fatal to the process (exit code 2); everything else is surfaced to the
    /// caller as a failed operation.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            DatabaseError::UnsupportedDatabaseVersion | DatabaseError::DataCorrupted(_)
        )
    }
}

// SETUP ERRORS
// =================================================================================================

#[derive(Debug, Error)]
pub enum DatabaseSetupError {
    #[error("I/O error")]
    Io(#[from] io::Error),
    #[error("database error")]
    Database(#[from] DatabaseError),
    #[error("pool build error")]
    PoolBuild(#[from] deadpool::managed::BuildError),
    #[error("SQLite migration error")]
    SqliteMigration(#[from] rusqlite_migration::Error),
}
