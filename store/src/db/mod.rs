//! Database layer for the tape store
//!
//! This module provides:
//! - Connection pooling (r2d2-sqlite) with WAL and busy-timeout pragmas
//! - Schema migrations tracked by `PRAGMA user_version`
//! - A transaction helper with automatic rollback

pub mod connection;
pub mod migrations;
pub mod transactions;

pub use connection::{DbPool, PooledConn, initialize_pool};
pub use migrations::{SCHEMA_VERSION, migrate_to_latest};
pub use transactions::execute_in_transaction;
