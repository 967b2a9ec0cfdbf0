use std::{
    collections::{BTreeMap, BTreeSet},
    fs::create_dir_all,
    path::PathBuf,
};

use folio_domain::{BatchId, FailureLogEntry, RecordKey, TerminalStatus};
use tracing::{info, instrument};

use crate::{
    db::{
        migrations::apply_migrations,
        pool_manager::{Pool, SqlitePoolManager},
        sql::utils::now_timestamp,
    },
    errors::{DatabaseError, DatabaseSetupError},
    COMPONENT,
};

mod migrations;
#[macro_use]
mod sql;

mod connection;
mod pool_manager;
mod settings;
mod transaction;

pub type Result<T, E = DatabaseError> = std::result::Result<T, E>;

/// Async facade over the SQLite state store.
///
/// Every method runs as a single SQL transaction on a pooled connection; no transaction spans an
/// await point visible to the caller. This is the only handle through which orchestration state
/// is mutated.
pub struct Db {
    pool: Pool,
}

/// A batch with status `active` as recorded by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveBatch {
    pub batch_id: BatchId,
    pub created_at: u64,
}

/// Operator filter for resetting failure counters. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureFilter {
    pub state: Option<String>,
    pub school: Option<String>,
    pub year: Option<u32>,
}

/// One persisted failure-log row, including the store-assigned id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureLogRow {
    pub id: u64,
    pub created_at: u64,
    pub entry: FailureLogEntry,
}

impl Db {
    /// Open a connection pool to the database file, creating it if missing, and apply any
    /// pending migrations.
    #[instrument(target = COMPONENT, skip_all, err)]
    pub async fn setup(database_filepath: PathBuf) -> Result<Self, DatabaseSetupError> {
        info!(target: COMPONENT, ?database_filepath, "Connecting to the database");

        if let Some(p) = database_filepath.parent() {
            create_dir_all(p).map_err(DatabaseError::IoError)?;
        }

        let sqlite_pool_manager = SqlitePoolManager::new(database_filepath.clone());
        let pool = Pool::builder(sqlite_pool_manager).build()?;

        let conn = pool.get().await.map_err(DatabaseError::MissingDbConnection)?;

        conn.interact(apply_migrations).await.map_err(|err| {
            DatabaseError::InteractError(format!("Migration task failed: {err}"))
        })??;

        info!(
            target: COMPONENT,
            sqlite = %database_filepath.display(),
            "Connected to the database"
        );

        Ok(Db { pool })
    }

    /// Loads all active batches, ordered by ascending batch id.
    #[instrument(target = COMPONENT, skip_all, ret(level = "debug"), err)]
    pub async fn select_active_batches(&self) -> Result<Vec<ActiveBatch>> {
        self.pool
            .get()
            .await?
            .interact(|conn| {
                let transaction = conn.transaction()?;
                sql::select_active_batches(&transaction)
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Select active batches task failed: {err}"))
            })?
    }

    /// Records a newly submitted batch: the active-batch row, one membership row and one
    /// in-flight row per record key. All-or-nothing.
    #[instrument(target = COMPONENT, skip_all, fields(batch_id = %batch_id), err)]
    pub async fn insert_batch(
        &self,
        batch_id: BatchId,
        record_keys: Vec<RecordKey>,
    ) -> Result<()> {
        self.pool
            .get()
            .await?
            .interact(move |conn| -> Result<()> {
                let transaction = conn.transaction()?;
                sql::insert_batch(&transaction, &batch_id, now_timestamp(), &record_keys)?;
                transaction.commit()?;
                Ok(())
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Insert batch task failed: {err}"))
            })?
    }

    /// Moves an active batch into a terminal status, releasing its membership and in-flight
    /// rows in the same transaction.
    #[instrument(target = COMPONENT, skip_all, fields(batch_id = %batch_id, ?status), err)]
    pub async fn finalize_batch(
        &self,
        batch_id: BatchId,
        status: TerminalStatus,
    ) -> Result<()> {
        self.pool
            .get()
            .await?
            .interact(move |conn| -> Result<()> {
                let transaction = conn.transaction()?;
                sql::finalize_batch(&transaction, &batch_id, status)?;
                transaction.commit()?;
                Ok(())
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Finalize batch task failed: {err}"))
            })?
    }

    /// Loads the record keys belonging to a batch; the expected set during result ingestion.
    #[instrument(target = COMPONENT, skip_all, fields(batch_id = %batch_id), err)]
    pub async fn select_batch_members(&self, batch_id: BatchId) -> Result<Vec<RecordKey>> {
        self.pool
            .get()
            .await?
            .interact(move |conn| {
                let transaction = conn.transaction()?;
                sql::select_batch_members(&transaction, &batch_id)
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Select batch members task failed: {err}"))
            })?
    }

    /// Loads the in-flight map: record key to owning batch id.
    #[instrument(target = COMPONENT, skip_all, err)]
    pub async fn select_inflight_records(&self) -> Result<BTreeMap<RecordKey, BatchId>> {
        self.pool
            .get()
            .await?
            .interact(|conn| {
                let transaction = conn.transaction()?;
                sql::select_inflight_records(&transaction)
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Select inflight task failed: {err}"))
            })?
    }

    /// Loads all per-record failure counters.
    #[instrument(target = COMPONENT, skip_all, err)]
    pub async fn select_failure_counts(&self) -> Result<BTreeMap<RecordKey, u32>> {
        self.pool
            .get()
            .await?
            .interact(|conn| {
                let transaction = conn.transaction()?;
                sql::select_failure_counts(&transaction)
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Select failure counts task failed: {err}"))
            })?
    }

    /// Increments the failure counter of a record key and returns the new value.
    #[instrument(target = COMPONENT, skip_all, fields(record_key = %record_key), err)]
    pub async fn bump_failure_count(&self, record_key: RecordKey) -> Result<u32> {
        self.pool
            .get()
            .await?
            .interact(move |conn| -> Result<u32> {
                let transaction = conn.transaction()?;
                let count = sql::bump_failure_count(&transaction, &record_key)?;
                transaction.commit()?;
                Ok(count)
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Bump failure count task failed: {err}"))
            })?
    }

    /// Appends one failure-log row, stamping it with the current time.
    #[instrument(target = COMPONENT, skip_all, fields(record_key = %entry.record_key, error_kind = %entry.error_kind), err)]
    pub async fn insert_failure_log(&self, entry: FailureLogEntry) -> Result<()> {
        self.pool
            .get()
            .await?
            .interact(move |conn| -> Result<()> {
                let transaction = conn.transaction()?;
                sql::insert_failure_log(&transaction, &entry, now_timestamp())?;
                transaction.commit()?;
                Ok(())
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Insert failure log task failed: {err}"))
            })?
    }

    /// Loads the record keys that already have a failure-log row for the given batch.
    ///
    /// Used by re-ingestion of a crashed-but-unfinalized batch to skip failures that were
    /// already counted.
    #[instrument(target = COMPONENT, skip_all, fields(batch_id = %batch_id), err)]
    pub async fn select_batch_failure_keys(
        &self,
        batch_id: BatchId,
    ) -> Result<BTreeSet<RecordKey>> {
        self.pool
            .get()
            .await?
            .interact(move |conn| {
                let transaction = conn.transaction()?;
                sql::select_batch_failure_keys(&transaction, &batch_id)
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!(
                    "Select batch failure keys task failed: {err}"
                ))
            })?
    }

    /// Loads the failure-log rows of one record key, newest first.
    #[instrument(target = COMPONENT, skip_all, fields(record_key = %record_key), err)]
    pub async fn select_failure_log(&self, record_key: RecordKey) -> Result<Vec<FailureLogRow>> {
        self.pool
            .get()
            .await?
            .interact(move |conn| {
                let transaction = conn.transaction()?;
                sql::select_failure_log(&transaction, &record_key)
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Select failure log task failed: {err}"))
            })?
    }

    /// Deletes the failure counters matching the filter, returning how many were removed.
    ///
    /// This is the operator's dead-letter reset; nothing resets counters automatically.
    #[instrument(target = COMPONENT, skip_all, err)]
    pub async fn reset_failure_counts(&self, filter: FailureFilter) -> Result<usize> {
        self.pool
            .get()
            .await?
            .interact(move |conn| -> Result<usize> {
                let transaction = conn.transaction()?;
                let deleted = sql::reset_failure_counts(&transaction, &filter)?;
                transaction.commit()?;
                Ok(deleted)
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Reset failure counts task failed: {err}"))
            })?
    }

    /// Loads the record keys whose failure counter strictly exceeds `max_retries`.
    #[instrument(target = COMPONENT, skip_all, err)]
    pub async fn select_dead_letters(&self, max_retries: u32) -> Result<Vec<(RecordKey, u32)>> {
        self.pool
            .get()
            .await?
            .interact(move |conn| {
                let transaction = conn.transaction()?;
                sql::select_dead_letters(&transaction, max_retries)
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Select dead letters task failed: {err}"))
            })?
    }
}
