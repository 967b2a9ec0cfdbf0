use std::time::{SystemTime, UNIX_EPOCH};

use folio_domain::RecordKey;
use rusqlite::{params, types::Value, Connection, OptionalExtension, Row};

use crate::errors::DatabaseError;

/// Checks if a table exists in the database.
pub fn table_exists(conn: &Connection, table_name: &str) -> rusqlite::Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = $1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

/// Returns the schema version of the database.
pub fn schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row("SELECT * FROM pragma_schema_version", [], |row| row.get(0))
}

/// Auxiliary macro which substitutes `$src` token by `$dst` expression.
macro_rules! subst {
    ($src:tt, $dst:expr) => {
        $dst
    };
}

pub(crate) use subst;

/// Generates a simple insert SQL statement with parameters for the provided table name and fields.
/// Supports optional conflict resolution (adding "| replace" or "| ignore" at the end will generate
/// "OR REPLACE" and "OR IGNORE", correspondingly).
///
/// # Usage:
///
/// `insert_sql!(users { id, first_name, last_name, age } | replace);`
///
/// which generates:
/// "INSERT OR REPLACE INTO users (id, `first_name`, `last_name`, age) VALUES (?, ?, ?, ?)"
macro_rules! insert_sql {
    ($table:ident { $first_field:ident $(, $($field:ident),+)? $(,)? } $(, $on_conflict:expr)?) => {
        concat!(
            stringify!(INSERT $(OR $on_conflict)? INTO $table),
            " (",
            stringify!($first_field),
            $($(concat!(", ", stringify!($field))),+ ,)?
            ") VALUES (",
            subst!($first_field, "?"),
            $($(subst!($field, ", ?")),+ ,)?
            ")"
        )
    };

    ($table:ident { $first_field:ident $(, $($field:ident),+)? $(,)? } | replace) => {
        insert_sql!($table { $first_field, $($($field),+)? }, REPLACE)
    };

    ($table:ident { $first_field:ident $(, $($field:ident),+)? $(,)? } | ignore) => {
        insert_sql!($table { $first_field, $($($field),+)? }, IGNORE)
    };
}

pub(crate) use insert_sql;

/// Converts a `u64` into a [Value].
///
/// Sqlite uses `i64` as its internal representation format. Note that the `as` operator performs a
/// lossless conversion from `u64` to `i64`.
pub fn u64_to_value(v: u64) -> Value {
    #[allow(
        clippy::cast_possible_wrap,
        reason = "We store u64 as i64 as sqlite only allows the latter."
    )]
    Value::Integer(v as i64)
}

/// Gets a `u64` value from the database.
///
/// Sqlite uses `i64` as its internal representation format, and so when retrieving
/// we need to make sure we cast as `u64` to get the original value
pub fn column_value_as_u64<I: rusqlite::RowIndex>(
    row: &Row<'_>,
    index: I,
) -> rusqlite::Result<u64> {
    let value: i64 = row.get(index)?;
    #[allow(
        clippy::cast_sign_loss,
        reason = "We store u64 as i64 as sqlite only allows the latter."
    )]
    Ok(value as u64)
}

/// Parses a record key from a TEXT column.
///
/// A key that fails to parse means the database content does not match what this binary ever
/// writes, which is reported as corruption rather than a malformed-input error.
pub fn read_record_key<I: rusqlite::RowIndex>(
    row: &Row<'_>,
    index: I,
) -> Result<RecordKey, DatabaseError> {
    let raw: String = row.get(index)?;
    raw.parse()
        .map_err(|err| DatabaseError::DataCorrupted(format!("invalid record key {raw:?}: {err}")))
}

/// Current time as unix seconds, as stored in `created_at` columns.
pub fn now_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
