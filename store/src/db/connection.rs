//! Connection pooling and pragma configuration

use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::config::TapeConfig;
use crate::errors::{Result, TapeError};

pub type DbPool = Pool<SqliteConnectionManager>;
pub type PooledConn = PooledConnection<SqliteConnectionManager>;

/// Initialize the connection pool for `cfg.db_path`.
///
/// Every pooled connection gets WAL journaling, foreign keys, `synchronous =
/// NORMAL` and the configured busy timeout. A `:memory:` database is clamped
/// to one long-lived connection, because each in-memory connection would
/// otherwise see its own empty database.
pub fn initialize_pool(cfg: &TapeConfig) -> Result<DbPool> {
    let busy_timeout = Duration::from_millis(cfg.pool.busy_timeout_ms);
    let in_memory = cfg.is_in_memory();

    let manager = if in_memory {
        SqliteConnectionManager::memory()
    } else {
        let path = cfg.resolved_db_path();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                TapeError::storage_with_source(
                    format!("failed to create db directory: {}", parent.display()),
                    e,
                )
            })?;
        }
        SqliteConnectionManager::file(path)
    };
    let manager = manager.with_init(move |conn| apply_pragmas(conn, busy_timeout));

    let mut builder = Pool::builder()
        .connection_timeout(Duration::from_millis(cfg.pool.connection_timeout_ms));
    builder = if in_memory {
        builder.max_size(1).max_lifetime(None).idle_timeout(None)
    } else {
        builder.max_size(cfg.pool.max_size)
    };

    let pool = builder
        .build(manager)
        .map_err(|e| TapeError::storage_with_source("failed to build connection pool", e))?;

    {
        let conn = pool.get()?;
        verify_pragmas(&conn, in_memory)?;
    }

    tracing::debug!(
        db_path = %cfg.db_path,
        max_size = pool.max_size(),
        "Connection pool initialized"
    );
    Ok(pool)
}

/// Apply pragmas to a freshly opened connection
fn apply_pragmas(conn: &mut Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

/// Verify critical pragmas actually took effect
fn verify_pragmas(conn: &Connection, in_memory: bool) -> Result<()> {
    let foreign_keys: bool = conn
        .pragma_query_value(None, "foreign_keys", |row| row.get(0))
        .map_err(|e| TapeError::from_sqlite("failed to read foreign_keys pragma", e))?;
    if !foreign_keys {
        return Err(TapeError::storage("foreign key enforcement is disabled"));
    }

    // In-memory databases always report "memory".
    if !in_memory {
        let mode: String = conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .map_err(|e| TapeError::from_sqlite("failed to read journal_mode pragma", e))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(journal_mode = %mode, "Database is not in WAL mode");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_pool_uses_wal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = TapeConfig::with_db_path(dir.path().join("nested").join("tape.db"));
        let pool = initialize_pool(&cfg).expect("pool");
        let conn = pool.get().expect("conn");
        let mode: String = conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .expect("pragma");
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn memory_pool_is_shared() {
        let pool = initialize_pool(&TapeConfig::in_memory()).expect("pool");
        assert_eq!(pool.max_size(), 1);
        {
            let conn = pool.get().expect("conn");
            conn.execute_batch("CREATE TABLE scratch (x INTEGER)")
                .expect("create");
        }
        let conn = pool.get().expect("conn");
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM scratch", [], |row| row.get(0))
            .expect("scratch table is visible");
        assert_eq!(n, 0);
    }
}
