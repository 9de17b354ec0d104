//! Records and identifiers shared by every tape component.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::TapeError;

/// Immutable tape identity. Never reused once issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TapeId(Uuid);

impl TapeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Try to read `raw` as a tape id. This is the fast path of name resolution.
    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw.trim()).ok().map(Self)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TapeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TapeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for TapeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl ToSql for TapeId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_string()))
    }
}

impl FromSql for TapeId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Kind discriminator of a tape entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Message,
    ToolCall,
    ToolResult,
    Anchor,
    Event,
    Error,
    System,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Anchor => "anchor",
            Self::Event => "event",
            Self::Error => "error",
            Self::System => "system",
        }
    }

    /// Parse from string representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message" => Some(Self::Message),
            "tool_call" => Some(Self::ToolCall),
            "tool_result" => Some(Self::ToolResult),
            "anchor" => Some(Self::Anchor),
            "event" => Some(Self::Event),
            "error" => Some(Self::Error),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = TapeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| TapeError::invalid_input(format!("unknown entry kind {s:?}")))
    }
}

impl ToSql for EntryKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for EntryKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        Self::parse(raw).ok_or_else(|| FromSqlError::Other(format!("unknown entry kind {raw:?}").into()))
    }
}

/// A row from the `tapes` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tape {
    pub id: TapeId,
    pub created_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
    pub parent_tape_id: Option<TapeId>,
}

impl Tape {
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }
}

/// A row from the `tape_aliases` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TapeAlias {
    pub name: String,
    pub tape_id: TapeId,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
    pub demoted_at: Option<DateTime<Utc>>,
}

/// One immutable record in a tape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TapeEntry {
    pub tape_id: TapeId,
    pub seq_no: u64,
    pub kind: EntryKind,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// A named pointer to an entry sequence number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub tape_id: TapeId,
    pub name: String,
    pub seq_no: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

/// Tape metadata joined with its registry and log state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TapeInfo {
    #[serde(flatten)]
    pub tape: Tape,
    pub primary_name: Option<String>,
    pub entry_count: u64,
}

/// Where a fork stops copying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cutoff {
    SeqNo(u64),
    Anchor(String),
}

impl From<u64> for Cutoff {
    fn from(seq_no: u64) -> Self {
        Self::SeqNo(seq_no)
    }
}

impl From<&str> for Cutoff {
    fn from(name: &str) -> Self {
        Self::Anchor(name.to_string())
    }
}

/// Anchor-selection policy for a context window
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextPolicy {
    Full,
    #[default]
    LastAnchor,
    FromAnchor {
        name: String,
    },
    Between {
        start: String,
        end: String,
    },
}

impl ContextPolicy {
    /// Parse the short form used in config files (`full`, `last_anchor`).
    pub fn parse_simple(s: &str) -> Option<Self> {
        match s {
            "full" => Some(Self::Full),
            "last_anchor" => Some(Self::LastAnchor),
            _ => None,
        }
    }
}

/// One full-text search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub tape_id: TapeId,
    pub seq_no: u64,
    pub kind: EntryKind,
    pub snippet: String,
    pub score: f64,
}

/// Options for [`crate::TapeStore::search`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default)]
    pub include_archived: bool,
}

pub(crate) fn parse_timestamp(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

pub(crate) fn parse_optional_timestamp(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_timestamp).transpose()
}

/// Fixed-width UTC timestamp, so text ordering matches time ordering.
pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Decode a JSON text column, reporting failures against column `idx`.
pub(crate) fn json_column(idx: usize, raw: &str) -> rusqlite::Result<Value> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

// SQLite integers are i64. Sequence numbers and limits never approach the
// boundary, so saturate rather than fail.
pub(crate) fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn limit_to_sql(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

pub(crate) fn from_sql_int(raw: i64) -> u64 {
    u64::try_from(raw).unwrap_or_default()
}
