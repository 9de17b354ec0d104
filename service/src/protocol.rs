//! IPC protocol types for the tape service.
//!
//! Wire format is JSON-RPC-lite: one JSON object per line, `{id, method,
//! params}` in and `{id, result}` or `{id, error}` out. Every method that
//! addresses a tape takes a `tape` field holding either a name or an id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tape_store::{
    Anchor, ContextPolicy, Cutoff, DoctorReport, EntryKind, ErrorCategory, SearchMatch,
    SearchOptions, TapeAlias, TapeEntry, TapeError, TapeId, TapeInfo,
};

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    String(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: RequestId,
    pub result: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub id: RequestId,
    pub error: RpcErrorBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Error codes (JSON-RPC error.code)
// ─────────────────────────────────────────────────────────────────────────────

/// Standard JSON-RPC errors.
pub const ERR_INVALID_REQUEST: i64 = -32600;
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERR_INVALID_PARAMS: i64 = -32602;

/// Tape error codes, one per [`ErrorCategory`].
pub const ERR_NOT_FOUND: i64 = 100;
pub const ERR_NAME_IN_USE: i64 = 101;
pub const ERR_TAPE_ARCHIVED: i64 = 102;
pub const ERR_SEQ_NO_OUT_OF_RANGE: i64 = 103;
pub const ERR_ANCHOR_NOT_FOUND: i64 = 104;
pub const ERR_DISJOINT_RANGE: i64 = 105;
pub const ERR_NO_PRIMARY_ALIAS: i64 = 106;
pub const ERR_INVALID_INPUT: i64 = 110;
pub const ERR_BUSY: i64 = 200;
pub const ERR_STORAGE: i64 = 300;
pub const ERR_CONFIG: i64 = 301;
pub const ERR_INTERNAL: i64 = 302;

pub fn error_code(category: ErrorCategory) -> i64 {
    match category {
        ErrorCategory::NotFound => ERR_NOT_FOUND,
        ErrorCategory::NameInUse => ERR_NAME_IN_USE,
        ErrorCategory::TapeArchived => ERR_TAPE_ARCHIVED,
        ErrorCategory::SeqNoOutOfRange => ERR_SEQ_NO_OUT_OF_RANGE,
        ErrorCategory::AnchorNotFound => ERR_ANCHOR_NOT_FOUND,
        ErrorCategory::DisjointRange => ERR_DISJOINT_RANGE,
        ErrorCategory::NoPrimaryAlias => ERR_NO_PRIMARY_ALIAS,
        ErrorCategory::InvalidInput => ERR_INVALID_INPUT,
        ErrorCategory::Busy => ERR_BUSY,
        ErrorCategory::Storage => ERR_STORAGE,
        ErrorCategory::Config => ERR_CONFIG,
        ErrorCategory::Internal => ERR_INTERNAL,
    }
}

/// `error.data` for tape errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    pub category: String,
    pub retryable: bool,
}

/// A failed call, before it is wrapped in an [`RpcError`] envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcFailure {
    pub code: i64,
    pub message: String,
    pub data: Option<ErrorData>,
}

impl RpcFailure {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ERR_INVALID_PARAMS, message)
    }

    pub fn into_body(self) -> RpcErrorBody {
        RpcErrorBody {
            code: self.code,
            message: self.message,
            data: self
                .data
                .and_then(|data| serde_json::to_value(data).ok()),
        }
    }
}

impl From<TapeError> for RpcFailure {
    fn from(err: TapeError) -> Self {
        let category = err.category();
        Self {
            code: error_code(category),
            message: err.to_string(),
            data: Some(ErrorData {
                category: category.as_str().to_string(),
                retryable: category.is_retryable(),
            }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handshake
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloParams {
    pub protocol_version: String,
    pub client_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResult {
    pub protocol_version: String,
    pub service_version: String,
    pub capabilities: Vec<String>,
}

/// Every method the service answers, in `hello` capability order.
pub const METHODS: &[&str] = &[
    "hello",
    "tape.create",
    "tape.resolve",
    "tape.rename",
    "tape.append",
    "tape.read",
    "tape.handoff",
    "tape.anchors",
    "tape.anchor",
    "tape.context",
    "tape.fork",
    "tape.reset",
    "tape.search",
    "tape.info",
    "tape.list",
    "tape.aliases",
    "service.status",
    "service.doctor",
];

// ─────────────────────────────────────────────────────────────────────────────
// Registry: tape.create / tape.resolve / tape.rename / tape.aliases / tape.info / tape.list
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Params for methods that only name a tape (`tape.reset`, `tape.info`, `tape.aliases`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapeParams {
    pub tape: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveParams {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TapeIdResult {
    pub tape_id: TapeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameParams {
    pub tape: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasesResult {
    pub tape_id: TapeId,
    pub aliases: Vec<TapeAlias>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub include_archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResult {
    pub tapes: Vec<TapeInfo>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Entries: tape.append / tape.read / tape.context
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendParams {
    pub tape: String,
    pub kind: EntryKind,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeqNoResult {
    pub tape_id: TapeId,
    pub seq_no: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadParams {
    pub tape: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_seq: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntriesResult {
    pub tape_id: TapeId,
    pub entries: Vec<TapeEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextParams {
    pub tape: String,
    /// Omitted means the configured default policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<ContextPolicy>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Anchors: tape.handoff / tape.anchors / tape.anchor
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffParams {
    pub tape: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorsParams {
    pub tape: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorsResult {
    pub tape_id: TapeId,
    pub anchors: Vec<Anchor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorParams {
    pub tape: String,
    pub name: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle: tape.fork / tape.reset
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkParams {
    pub tape: String,
    pub name: String,
    /// A sequence number or an anchor name.
    pub cutoff: Cutoff,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkResult {
    pub tape_id: TapeId,
    pub parent_tape_id: TapeId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetResult {
    pub archived_tape_id: TapeId,
    pub tape_id: TapeId,
}

// ─────────────────────────────────────────────────────────────────────────────
// tape.search
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchParams {
    pub query: String,
    #[serde(flatten)]
    pub options: SearchOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub matches: Vec<SearchMatch>,
}

// ─────────────────────────────────────────────────────────────────────────────
// service.status / service.doctor
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatusResult {
    pub protocol_version: String,
    pub service_version: String,
    pub store_version: String,
    pub uptime_s: u64,
    pub connections: u32,
    pub db_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DoctorParams {
    #[serde(default)]
    pub repair: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorResult {
    pub healthy: bool,
    #[serde(flatten)]
    pub report: DoctorReport,
}
