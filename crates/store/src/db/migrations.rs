use once_cell::sync::Lazy;
use rusqlite_migration::{Migrations, SchemaVersion, M};
use tracing::{debug, info, instrument};

use crate::{
    db::{connection::Connection, settings::Settings, sql::utils::schema_version},
    errors::DatabaseError,
    COMPONENT,
};

type Hash = blake3::Hash;

const MIGRATION_SCRIPTS: [&str; 1] = [include_str!("migrations/001-init.sql")];
static MIGRATION_HASHES: Lazy<Vec<Hash>> = Lazy::new(compute_migration_hashes);
static MIGRATIONS: Lazy<Migrations> = Lazy::new(prepare_migrations);

fn up(s: &'static str) -> M<'static> {
    M::up(s).foreign_key_check()
}

const DB_MIGRATION_HASH_FIELD: &str = "db-migration-hash";
const DB_SCHEMA_VERSION_FIELD: &str = "db-schema-version";

/// Applies any pending migrations and verifies that the database was produced by this exact
/// migration chain.
///
/// A database whose recorded migration hash or schema version disagrees with this binary is
/// reported as [`DatabaseError::UnsupportedDatabaseVersion`]; the caller treats that as
/// state-store corruption.
#[instrument(target = COMPONENT, skip_all, err)]
pub fn apply_migrations(conn: &mut Connection) -> super::Result<()> {
    let version_before = MIGRATIONS.current_version(conn.inner())?;

    info!(target: COMPONENT, version_before = %version_before, "Running database migrations");

    if let SchemaVersion::Inside(ver) = version_before {
        if !Settings::exists(conn)? {
            return Err(DatabaseError::UnsupportedDatabaseVersion);
        }

        let last_schema_version: u32 = Settings::get_value(conn, DB_SCHEMA_VERSION_FIELD)?
            .ok_or(DatabaseError::UnsupportedDatabaseVersion)?;
        let current_schema_version = schema_version(conn.inner())?;

        if last_schema_version != current_schema_version {
            return Err(DatabaseError::UnsupportedDatabaseVersion);
        }

        let expected_hash = MIGRATION_HASHES[ver.get() - 1].as_bytes().to_vec();
        let actual_hash: Option<Vec<u8>> = Settings::get_value(conn, DB_MIGRATION_HASH_FIELD)?;

        debug!(
            target: COMPONENT,
            expected_hash = %hex::encode(&expected_hash),
            actual_hash = ?actual_hash.as_ref().map(hex::encode),
            "Comparing migration hashes",
        );

        if actual_hash != Some(expected_hash) {
            return Err(DatabaseError::UnsupportedDatabaseVersion);
        }
    }

    MIGRATIONS.to_latest(conn.inner_mut()).map_err(DatabaseError::MigrationError)?;

    if version_before != MIGRATIONS.current_version(conn.inner())? {
        let last_hash = MIGRATION_HASHES[MIGRATION_HASHES.len() - 1].as_bytes().to_vec();
        debug!(target: COMPONENT, new_hash = %hex::encode(&last_hash), "Updating migration hash in settings table");
        Settings::set_value(conn, DB_MIGRATION_HASH_FIELD, &last_hash)?;
    }

    let new_schema_version = schema_version(conn.inner())?;
    Settings::set_value(conn, DB_SCHEMA_VERSION_FIELD, &new_schema_version)?;

    Ok(())
}

fn prepare_migrations() -> Migrations<'static> {
    Migrations::new(MIGRATION_SCRIPTS.map(up).to_vec())
}

fn compute_migration_hashes() -> Vec<Hash> {
    let mut accumulator = Hash::from_bytes([0; blake3::OUT_LEN]);
    MIGRATION_SCRIPTS
        .iter()
        .map(|sql| {
            let script_hash = blake3::hash(preprocess_sql(sql).as_bytes());
            let mut hasher = blake3::Hasher::new();
            hasher.update(accumulator.as_bytes());
            hasher.update(script_hash.as_bytes());
            accumulator = hasher.finalize();
            accumulator
        })
        .collect()
}

fn preprocess_sql(sql: &str) -> String {
    remove_spaces(sql)
}

fn remove_spaces(str: &str) -> String {
    str.chars().filter(|chr| !chr.is_whitespace()).collect()
}

#[test]
fn migrations_validate() {
    assert_eq!(MIGRATIONS.validate(), Ok(()));
}
