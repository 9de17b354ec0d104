//! Full-text search over entry payloads (SQLite FTS5).
//!
//! `entry_fts.rowid` is `tape_entries.id`. Rows are written in the same
//! transaction as the entry they index, so a committed entry is searchable
//! immediately and a rolled-back one never is.

use rusqlite::{Connection, params};
use serde_json::Value;

use crate::errors::{Result, TapeError};
use crate::types::{SearchMatch, from_sql_int, limit_to_sql};

/// Upper bound FTS5 accepts for a snippet's token count.
const MAX_SNIPPET_TOKENS: u32 = 64;

/// Text to index for a payload, or `None` if it has nothing indexable.
///
/// A bare JSON string is indexed as-is. An object contributes its `field`
/// member when that is a string, or the joined `text` of each part when it
/// is an array of parts.
pub fn extract_text(payload: &Value, field: &str) -> Option<String> {
    let text = match payload {
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get(field)? {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    Value::String(s) => Some(s.as_str()),
                    Value::Object(obj) => obj.get("text").and_then(Value::as_str),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
            _ => return None,
        },
        _ => return None,
    };
    if text.trim().is_empty() { None } else { Some(text) }
}

/// Index one entry row. Payloads without indexable text are skipped.
pub fn index_entry(conn: &Connection, entry_rowid: i64, payload: &Value, field: &str) -> Result<bool> {
    let Some(text) = extract_text(payload, field) else {
        return Ok(false);
    };
    conn.execute(
        "INSERT INTO entry_fts (rowid, content) VALUES (?1, ?2)",
        params![entry_rowid, text],
    )
    .map_err(|e| TapeError::from_sqlite("failed to index entry", e))?;
    Ok(true)
}

/// Turn free text into an FTS5 query that requires every token.
///
/// Each whitespace-separated token becomes a quoted string, so operators,
/// column filters and prefix syntax in user text are matched literally.
pub fn build_match_query(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

/// Run a search, best matches first.
pub fn search(
    conn: &Connection,
    query: &str,
    limit: usize,
    include_archived: bool,
    snippet_tokens: u32,
) -> Result<Vec<SearchMatch>> {
    let Some(fts_query) = build_match_query(query) else {
        return Ok(Vec::new());
    };
    if limit == 0 {
        return Ok(Vec::new());
    }
    let tokens = snippet_tokens.clamp(1, MAX_SNIPPET_TOKENS);

    let mut stmt = conn
        .prepare(
            "SELECT e.tape_id, e.seq_no, e.kind,
                    snippet(entry_fts, 0, '[', ']', '...', ?2),
                    bm25(entry_fts) AS rank
             FROM entry_fts
             JOIN tape_entries e ON e.id = entry_fts.rowid
             JOIN tapes t ON t.id = e.tape_id
             WHERE entry_fts MATCH ?1
               AND (?3 OR t.archived_at IS NULL)
             ORDER BY rank, e.tape_id, e.seq_no
             LIMIT ?4",
        )
        .map_err(|e| TapeError::from_sqlite("failed to prepare search", e))?;
    let rows = stmt
        .query_map(
            params![fts_query, tokens, include_archived, limit_to_sql(limit)],
            |row| {
                let rank: f64 = row.get(4)?;
                Ok(SearchMatch {
                    tape_id: row.get(0)?,
                    seq_no: from_sql_int(row.get(1)?),
                    kind: row.get(2)?,
                    snippet: row.get(3)?,
                    score: -rank,
                })
            },
        )
        .map_err(|e| TapeError::from_sqlite("failed to run search", e))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| TapeError::from_sqlite("failed to read search row", e))
}

/// Number of rows currently in the index
pub fn indexed_count(conn: &Connection) -> Result<u64> {
    conn.query_row("SELECT COUNT(*) FROM entry_fts", [], |row| row.get(0))
        .map(from_sql_int)
        .map_err(|e| TapeError::from_sqlite("failed to count index rows", e))
}

/// Walk every entry payload, calling `visit(rowid, payload)`.
fn for_each_payload(
    conn: &Connection,
    mut visit: impl FnMut(i64, &Value) -> Result<()>,
) -> Result<()> {
    let mut stmt = conn
        .prepare("SELECT id, payload FROM tape_entries ORDER BY id")
        .map_err(|e| TapeError::from_sqlite("failed to prepare payload scan", e))?;
    let mut rows = stmt
        .query([])
        .map_err(|e| TapeError::from_sqlite("failed to scan payloads", e))?;
    while let Some(row) = rows
        .next()
        .map_err(|e| TapeError::from_sqlite("failed to read payload row", e))?
    {
        let rowid: i64 = row.get(0)?;
        let raw: String = row.get(1)?;
        let payload: Value = serde_json::from_str(&raw)?;
        visit(rowid, &payload)?;
    }
    Ok(())
}

/// Number of entries that have indexable text under `field`
pub fn indexable_count(conn: &Connection, field: &str) -> Result<u64> {
    let mut count = 0;
    for_each_payload(conn, |_, payload| {
        if extract_text(payload, field).is_some() {
            count += 1;
        }
        Ok(())
    })?;
    Ok(count)
}

/// Drop the index and re-derive it from `tape_entries`. Returns rows indexed.
pub fn rebuild(conn: &Connection, field: &str) -> Result<u64> {
    conn.execute("DELETE FROM entry_fts", [])
        .map_err(|e| TapeError::from_sqlite("failed to clear search index", e))?;
    let mut indexed = 0;
    for_each_payload(conn, |rowid, payload| {
        if index_entry(conn, rowid, payload, field)? {
            indexed += 1;
        }
        Ok(())
    })?;
    Ok(indexed)
}
