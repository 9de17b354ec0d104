//! Schema versioning and migrations
//!
//! Forward-only. The applied version lives in `PRAGMA user_version`, and each
//! step runs in the same transaction as the version bump.

use rusqlite::{Connection, TransactionBehavior};

use super::transactions::execute_in_transaction;
use crate::errors::{Result, TapeError};

/// Embedded schema SQL for version 1
const SCHEMA_V1_SQL: &str = include_str!("../../TAPE_SCHEMA.sql");

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Apply all migrations to bring the database to [`SCHEMA_VERSION`].
///
/// Returns the number of migrations applied.
pub fn migrate_to_latest(conn: &mut Connection) -> Result<u32> {
    let current = get_schema_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(TapeError::storage(format!(
            "database schema version {current} is newer than supported version {SCHEMA_VERSION}"
        )));
    }

    let mut applied = 0;
    for version in (current + 1)..=SCHEMA_VERSION {
        execute_in_transaction(conn, TransactionBehavior::Immediate, |tx| {
            apply_migration(tx, version)?;
            set_schema_version(tx, version)
        })?;
        applied += 1;
        tracing::info!(version, "Applied tape schema migration");
    }
    Ok(applied)
}

/// Get current schema version
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| TapeError::from_sqlite("failed to read user_version", e))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.pragma_update(None, "user_version", version)
        .map_err(|e| TapeError::from_sqlite("failed to set user_version", e))
}

fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => conn
            .execute_batch(SCHEMA_V1_SQL)
            .map_err(|e| TapeError::from_sqlite("failed to apply schema v1", e)),
        other => Err(TapeError::internal(format!("no migration for version {other}"))),
    }
}
