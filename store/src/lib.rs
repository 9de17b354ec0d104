//! Tape store: the durable conversation/event log behind an agent runtime.
//!
//! A tape is an append-only sequence of entries under an immutable id.
//! Human-readable names are aliases that can move between tapes; anchors mark
//! phase boundaries; context windows, forks and full-text search are all
//! computed from the same SQLite database.
//!
//! [`TapeStore`] is the entry point. The component modules take a plain
//! `rusqlite::Connection` (usually a transaction) so the store can compose
//! them into single atomic operations.

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod anchors;
pub mod config;
pub mod context;
pub mod db;
pub mod doctor;
pub mod entry_log;
pub mod errors;
pub mod fork;
pub mod identity;
pub mod locks;
pub mod search;
mod store;
pub mod types;

pub use config::TapeConfig;
pub use doctor::{CheckStatus, DoctorCheck, DoctorReport};
pub use errors::{ErrorCategory, Result, TapeError};
pub use fork::ForkOutcome;
pub use store::TapeStore;
pub use types::{
    Anchor, ContextPolicy, Cutoff, EntryKind, SearchMatch, SearchOptions, Tape, TapeAlias,
    TapeEntry, TapeId, TapeInfo,
};

/// Tape store version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
