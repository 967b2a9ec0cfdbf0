//! Wrapper functions for SQL statements.

#[macro_use]
pub(crate) mod utils;

use std::collections::{BTreeMap, BTreeSet};

use folio_domain::{BatchId, BatchStatus, FailureLogEntry, RecordKey, TerminalStatus};
use rusqlite::{params, types::Value};
use utils::read_record_key;

use super::{ActiveBatch, FailureFilter, FailureLogRow, Result};
use crate::{db::transaction::Transaction, errors::DatabaseError};

// BATCH QUERIES
// ================================================================================================

/// Select all batches with status `active`, ordered by ascending batch id.
///
/// The ordering is what makes terminal-batch processing reproducible across runs.
pub fn select_active_batches(transaction: &Transaction) -> Result<Vec<ActiveBatch>> {
    let mut stmt = transaction.prepare_cached(
        "
        SELECT
            batch_id,
            created_at
        FROM
            batches
        WHERE
            status = 'active'
        ORDER BY
            batch_id ASC;
    ",
    )?;
    let mut rows = stmt.query([])?;

    let mut batches = Vec::new();
    while let Some(row) = rows.next()? {
        let batch_id = BatchId::new(row.get::<_, String>(0)?);
        let created_at = utils::column_value_as_u64(row, 1)?;
        batches.push(ActiveBatch { batch_id, created_at });
    }
    Ok(batches)
}

/// Inserts a new active batch together with its membership and in-flight rows, all-or-nothing.
///
/// # Errors
///
/// - [`DatabaseError::BatchAlreadyExists`] if the batch id was inserted before (regardless of
///   its current status).
/// - [`DatabaseError::RecordsAlreadyInflight`] if any of the keys is already owned by another
///   active batch.
pub fn insert_batch(
    transaction: &Transaction,
    batch_id: &BatchId,
    created_at: u64,
    record_keys: &[RecordKey],
) -> Result<()> {
    let mut exists_stmt =
        transaction.prepare_cached("SELECT 1 FROM batches WHERE batch_id = ?1")?;
    if exists_stmt.exists(params![batch_id.as_str()])? {
        return Err(DatabaseError::BatchAlreadyExists(batch_id.clone()));
    }

    let mut inflight_stmt =
        transaction.prepare_cached("SELECT 1 FROM inflight_records WHERE record_key = ?1")?;
    let mut conflicting = Vec::new();
    for key in record_keys {
        if inflight_stmt.exists(params![key.to_string()])? {
            conflicting.push(key.clone());
        }
    }
    if !conflicting.is_empty() {
        return Err(DatabaseError::RecordsAlreadyInflight(conflicting));
    }

    let mut batch_stmt =
        transaction.prepare_cached(insert_sql!(batches { batch_id, status, created_at }))?;
    batch_stmt.execute(params![
        batch_id.as_str(),
        BatchStatus::Active.as_str(),
        utils::u64_to_value(created_at)
    ])?;

    let mut member_stmt =
        transaction.prepare_cached(insert_sql!(batch_members { batch_id, record_key }))?;
    let mut inflight_insert_stmt =
        transaction.prepare_cached(insert_sql!(inflight_records { record_key, batch_id }))?;
    for key in record_keys {
        let key = key.to_string();
        member_stmt.execute(params![batch_id.as_str(), key])?;
        inflight_insert_stmt.execute(params![key, batch_id.as_str()])?;
    }

    Ok(())
}

/// Moves an active batch to a terminal status and deletes its membership and in-flight rows.
///
/// # Errors
///
/// [`DatabaseError::BatchNotActive`] if the batch does not exist or was already finalized.
pub fn finalize_batch(
    transaction: &Transaction,
    batch_id: &BatchId,
    status: TerminalStatus,
) -> Result<()> {
    let mut status_stmt =
        transaction.prepare_cached("SELECT status FROM batches WHERE batch_id = ?1")?;
    let current: Option<String> = status_stmt
        .query(params![batch_id.as_str()])?
        .next()?
        .map(|row| row.get(0))
        .transpose()?;

    if current.as_deref() != Some(BatchStatus::Active.as_str()) {
        return Err(DatabaseError::BatchNotActive(batch_id.clone()));
    }

    let mut update_stmt =
        transaction.prepare_cached("UPDATE batches SET status = ?2 WHERE batch_id = ?1")?;
    update_stmt.execute(params![batch_id.as_str(), BatchStatus::from(status).as_str()])?;

    let mut delete_members_stmt =
        transaction.prepare_cached("DELETE FROM batch_members WHERE batch_id = ?1")?;
    delete_members_stmt.execute(params![batch_id.as_str()])?;

    let mut delete_inflight_stmt =
        transaction.prepare_cached("DELETE FROM inflight_records WHERE batch_id = ?1")?;
    delete_inflight_stmt.execute(params![batch_id.as_str()])?;

    Ok(())
}

/// Select the record keys submitted as part of the given batch, in key order.
pub fn select_batch_members(
    transaction: &Transaction,
    batch_id: &BatchId,
) -> Result<Vec<RecordKey>> {
    let mut stmt = transaction.prepare_cached(
        "SELECT record_key FROM batch_members WHERE batch_id = ?1 ORDER BY record_key ASC;",
    )?;
    let mut rows = stmt.query(params![batch_id.as_str()])?;

    let mut keys = Vec::new();
    while let Some(row) = rows.next()? {
        keys.push(read_record_key(row, 0)?);
    }
    keys.sort();
    Ok(keys)
}

// IN-FLIGHT QUERIES
// ================================================================================================

/// Select the full in-flight map: record key to owning batch id.
pub fn select_inflight_records(
    transaction: &Transaction,
) -> Result<BTreeMap<RecordKey, BatchId>> {
    let mut stmt =
        transaction.prepare_cached("SELECT record_key, batch_id FROM inflight_records;")?;
    let mut rows = stmt.query([])?;

    let mut inflight = BTreeMap::new();
    while let Some(row) = rows.next()? {
        let key = read_record_key(row, 0)?;
        let batch_id = BatchId::new(row.get::<_, String>(1)?);
        inflight.insert(key, batch_id);
    }
    Ok(inflight)
}

// FAILURE COUNT QUERIES
// ================================================================================================

/// Select all failure counters.
pub fn select_failure_counts(transaction: &Transaction) -> Result<BTreeMap<RecordKey, u32>> {
    let mut stmt = transaction.prepare_cached("SELECT record_key, count FROM failure_counts;")?;
    let mut rows = stmt.query([])?;

    let mut counts = BTreeMap::new();
    while let Some(row) = rows.next()? {
        let key = read_record_key(row, 0)?;
        let count: u32 = row.get(1)?;
        counts.insert(key, count);
    }
    Ok(counts)
}

/// Increment the failure counter of a record key, creating it at 1 on first failure.
///
/// # Returns
///
/// The new counter value.
pub fn bump_failure_count(transaction: &Transaction, record_key: &RecordKey) -> Result<u32> {
    let mut stmt = transaction.prepare_cached(
        "
        INSERT INTO failure_counts (record_key, state, school, year, page, count)
        VALUES (?1, ?2, ?3, ?4, ?5, 1)
        ON CONFLICT(record_key) DO UPDATE SET count = count + 1
        RETURNING count;
    ",
    )?;

    let count = stmt.query_row(
        params![
            record_key.to_string(),
            record_key.state(),
            record_key.school(),
            record_key.year(),
            record_key.page()
        ],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Delete the failure counters matching the filter.
///
/// # Returns
///
/// The number of counters deleted.
pub fn reset_failure_counts(transaction: &Transaction, filter: &FailureFilter) -> Result<usize> {
    let mut conditions: Vec<&str> = Vec::new();
    let mut parameters: Vec<Value> = Vec::new();

    if let Some(state) = &filter.state {
        conditions.push("state = ?");
        parameters.push(Value::from(state.clone()));
    }
    if let Some(school) = &filter.school {
        conditions.push("school = ?");
        parameters.push(Value::from(school.clone()));
    }
    if let Some(year) = filter.year {
        conditions.push("year = ?");
        parameters.push(Value::from(i64::from(year)));
    }

    let sql = if conditions.is_empty() {
        "DELETE FROM failure_counts".to_owned()
    } else {
        format!("DELETE FROM failure_counts WHERE {}", conditions.join(" AND "))
    };

    let mut stmt = transaction.prepare_cached(&sql)?;
    let deleted = stmt.execute(rusqlite::params_from_iter(parameters))?;
    Ok(deleted)
}

/// Select the record keys whose failure counter strictly exceeds `max_retries`, worst first.
pub fn select_dead_letters(
    transaction: &Transaction,
    max_retries: u32,
) -> Result<Vec<(RecordKey, u32)>> {
    let mut stmt = transaction.prepare_cached(
        "
        SELECT
            record_key,
            count
        FROM
            failure_counts
        WHERE
            count > ?1
        ORDER BY
            count DESC,
            record_key ASC;
    ",
    )?;
    let mut rows = stmt.query(params![max_retries])?;

    let mut dead = Vec::new();
    while let Some(row) = rows.next()? {
        let key = read_record_key(row, 0)?;
        let count: u32 = row.get(1)?;
        dead.push((key, count));
    }
    Ok(dead)
}

// FAILURE LOG QUERIES
// ================================================================================================

/// Append one failure-log row.
pub fn insert_failure_log(
    transaction: &Transaction,
    entry: &FailureLogEntry,
    created_at: u64,
) -> Result<()> {
    let mut stmt = transaction.prepare_cached(insert_sql!(failure_log {
        record_key,
        batch_id,
        attempt_number,
        error_kind,
        error_message,
        error_trace,
        raw_response_text,
        extracted_text,
        raw_response_blob,
        model_name,
        prompt_name,
        prompt_template,
        generation_config,
        created_at,
    }))?;

    stmt.execute(params![
        entry.record_key.to_string(),
        entry.batch_id.as_ref().map(BatchId::as_str),
        entry.attempt_number,
        entry.error_kind.as_str(),
        entry.error_message,
        entry.error_trace,
        entry.raw_response_text,
        entry.extracted_text,
        entry.raw_response_blob,
        entry.model_name,
        entry.prompt_name,
        entry.prompt_template,
        entry.generation_config,
        utils::u64_to_value(created_at),
    ])?;

    Ok(())
}

/// Select the record keys that already have a failure-log row for the given batch.
///
/// Re-ingesting a batch that crashed before finalization must not count its failures a second
/// time; this is the failure-side counterpart of the output-file existence check.
pub fn select_batch_failure_keys(
    transaction: &Transaction,
    batch_id: &BatchId,
) -> Result<BTreeSet<RecordKey>> {
    let mut stmt = transaction
        .prepare_cached("SELECT DISTINCT record_key FROM failure_log WHERE batch_id = ?1;")?;
    let mut rows = stmt.query(params![batch_id.as_str()])?;

    let mut keys = BTreeSet::new();
    while let Some(row) = rows.next()? {
        keys.insert(read_record_key(row, 0)?);
    }
    Ok(keys)
}

/// Select the failure-log rows of one record key, newest first.
pub fn select_failure_log(
    transaction: &Transaction,
    record_key: &RecordKey,
) -> Result<Vec<FailureLogRow>> {
    let mut stmt = transaction.prepare_cached(
        "
        SELECT
            id,
            batch_id,
            attempt_number,
            error_kind,
            error_message,
            error_trace,
            raw_response_text,
            extracted_text,
            raw_response_blob,
            model_name,
            prompt_name,
            prompt_template,
            generation_config,
            created_at
        FROM
            failure_log
        WHERE
            record_key = ?1
        ORDER BY
            id DESC;
    ",
    )?;
    let mut rows = stmt.query(params![record_key.to_string()])?;

    let mut log = Vec::new();
    while let Some(row) = rows.next()? {
        let error_kind: String = row.get(3)?;
        let error_kind = error_kind.parse().map_err(|err| {
            DatabaseError::DataCorrupted(format!("invalid error kind in failure log: {err}"))
        })?;

        let entry = FailureLogEntry {
            record_key: record_key.clone(),
            batch_id: row.get::<_, Option<String>>(1)?.map(BatchId::new),
            attempt_number: row.get(2)?,
            error_kind,
            error_message: row.get(4)?,
            error_trace: row.get(5)?,
            raw_response_text: row.get(6)?,
            extracted_text: row.get(7)?,
            raw_response_blob: row.get(8)?,
            model_name: row.get(9)?,
            prompt_name: row.get(10)?,
            prompt_template: row.get(11)?,
            generation_config: row.get(12)?,
        };

        log.push(FailureLogRow {
            id: utils::column_value_as_u64(row, 0)?,
            created_at: utils::column_value_as_u64(row, 13)?,
            entry,
        });
    }
    Ok(log)
}
