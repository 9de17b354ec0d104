//! Tape store error types
//!
//! Every failure maps to one [`ErrorCategory`]. `Busy` is the only category a
//! caller should retry automatically; everything else is a definite failure.

use thiserror::Error;

use crate::types::TapeId;

/// Error category for structured logging and RPC error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Unknown tape id or unknown name
    NotFound,
    /// Alias collision on create/rename/fork
    NameInUse,
    /// Write attempted on an archived tape
    TapeArchived,
    /// Anchor or cutoff points past the tape head
    SeqNoOutOfRange,
    /// Named anchor does not exist on the tape
    AnchorNotFound,
    /// `Between` range whose end precedes its start
    DisjointRange,
    /// Reset on a tape that has no primary alias
    NoPrimaryAlias,
    /// Lock or transaction contention (retryable)
    Busy,
    /// Malformed caller input (names, kinds, payloads)
    InvalidInput,
    /// Database or pool failure that is not contention
    Storage,
    /// `tape.toml` or env misconfigured
    Config,
    /// Unexpected logic bugs
    Internal,
}

impl ErrorCategory {
    /// Machine-readable code for logging
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::NameInUse => "NAME_IN_USE",
            Self::TapeArchived => "TAPE_ARCHIVED",
            Self::SeqNoOutOfRange => "SEQ_NO_OUT_OF_RANGE",
            Self::AnchorNotFound => "ANCHOR_NOT_FOUND",
            Self::DisjointRange => "DISJOINT_RANGE",
            Self::NoPrimaryAlias => "NO_PRIMARY_ALIAS",
            Self::Busy => "BUSY",
            Self::InvalidInput => "INVALID_INPUT",
            Self::Storage => "STORAGE",
            Self::Config => "CONFIG",
            Self::Internal => "INTERNAL",
        }
    }

    /// Whether the caller should retry with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy)
    }
}

/// Tape store error with category and context
#[derive(Debug, Error)]
pub enum TapeError {
    #[error("tape not found: {tape}")]
    TapeNotFound { tape: String },

    #[error("no tape is named {name:?}")]
    NameNotFound { name: String },

    #[error("name {name:?} is already in use")]
    NameInUse { name: String },

    #[error("tape {tape_id} is archived")]
    TapeArchived { tape_id: TapeId },

    #[error("seq_no {seq_no} is out of range for tape {tape_id} (count {count})")]
    SeqNoOutOfRange {
        tape_id: TapeId,
        seq_no: u64,
        count: u64,
    },

    #[error("anchor {name:?} not found on tape {tape_id}")]
    AnchorNotFound { tape_id: TapeId, name: String },

    #[error("anchor range is disjoint: end {end} precedes start {start}")]
    DisjointRange { start: u64, end: u64 },

    #[error("tape {tape_id} has no primary alias")]
    NoPrimaryAlias { tape_id: TapeId },

    #[error("busy: {message}")]
    Busy {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    #[error("storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl TapeError {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::TapeNotFound { .. } | Self::NameNotFound { .. } => ErrorCategory::NotFound,
            Self::NameInUse { .. } => ErrorCategory::NameInUse,
            Self::TapeArchived { .. } => ErrorCategory::TapeArchived,
            Self::SeqNoOutOfRange { .. } => ErrorCategory::SeqNoOutOfRange,
            Self::AnchorNotFound { .. } => ErrorCategory::AnchorNotFound,
            Self::DisjointRange { .. } => ErrorCategory::DisjointRange,
            Self::NoPrimaryAlias { .. } => ErrorCategory::NoPrimaryAlias,
            Self::Busy { .. } => ErrorCategory::Busy,
            Self::InvalidInput { .. } => ErrorCategory::InvalidInput,
            Self::Storage { .. } => ErrorCategory::Storage,
            Self::Config { .. } => ErrorCategory::Config,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Shorthand for `self.category().is_retryable()`
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    pub fn tape_not_found(tape: impl ToString) -> Self {
        Self::TapeNotFound {
            tape: tape.to_string(),
        }
    }

    pub fn name_in_use(name: impl Into<String>) -> Self {
        Self::NameInUse { name: name.into() }
    }

    /// Create a busy error
    pub fn busy(message: impl Into<String>) -> Self {
        Self::Busy {
            message: message.into(),
            source: None,
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Create a storage error with source
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source
    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wrap a rusqlite error, classifying lock contention as `Busy`.
    pub fn from_sqlite(context: impl Into<String>, err: rusqlite::Error) -> Self {
        let message = context.into();
        if is_contention(&err) {
            Self::Busy {
                message,
                source: Some(Box::new(err)),
            }
        } else {
            Self::storage_with_source(message, err)
        }
    }
}

impl From<rusqlite::Error> for TapeError {
    fn from(err: rusqlite::Error) -> Self {
        Self::from_sqlite("sqlite", err)
    }
}

impl From<r2d2::Error> for TapeError {
    fn from(err: r2d2::Error) -> Self {
        // r2d2 only fails checkout on timeout, which is contention on the pool.
        Self::Busy {
            message: "timed out waiting for a pooled connection".to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<serde_json::Error> for TapeError {
    fn from(err: serde_json::Error) -> Self {
        Self::storage_with_source("failed to (de)serialize JSON column", err)
    }
}

/// SQLITE_BUSY / SQLITE_LOCKED, i.e. another writer holds the lock.
pub(crate) fn is_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

/// A UNIQUE/PRIMARY KEY constraint violation.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
                && matches!(
                    e.extended_code,
                    rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                )
        }
        _ => false,
    }
}

/// Result type for tape store operations
pub type Result<T> = std::result::Result<T, TapeError>;
