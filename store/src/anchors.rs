//! Named pointers into a tape's entry sequence.

use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value;

use crate::entry_log;
use crate::errors::{Result, TapeError};
use crate::identity::{self, MAX_NAME_CHARS};
use crate::types::{
    Anchor, TapeId, from_sql_int, json_column, limit_to_sql, now_rfc3339, parse_timestamp,
    to_sql_int,
};

const ANCHOR_COLUMNS: &str = "tape_id, name, seq_no, state, updated_at";

fn anchor_from_row(row: &Row<'_>) -> rusqlite::Result<Anchor> {
    let state: Option<String> = row.get(3)?;
    Ok(Anchor {
        tape_id: row.get(0)?,
        name: row.get(1)?,
        seq_no: from_sql_int(row.get(2)?),
        state: state.as_deref().map(|raw| json_column(3, raw)).transpose()?,
        updated_at: parse_timestamp(&row.get::<_, String>(4)?)?,
    })
}

pub fn validate_anchor_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(TapeError::invalid_input("anchor name must not be blank"));
    }
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(TapeError::invalid_input(format!(
            "anchor name is longer than {MAX_NAME_CHARS} characters"
        )));
    }
    Ok(())
}

/// Create or move the anchor `name` to `seq_no`.
///
/// `seq_no` must name an existing entry (`1..=count`).
pub fn set(
    conn: &Connection,
    tape_id: TapeId,
    name: &str,
    seq_no: u64,
    state: Option<&Value>,
) -> Result<Anchor> {
    validate_anchor_name(name)?;
    identity::require_active(conn, tape_id)?;
    let count = entry_log::head_seq(conn, tape_id)?;
    if seq_no == 0 || seq_no > count {
        return Err(TapeError::SeqNoOutOfRange {
            tape_id,
            seq_no,
            count,
        });
    }

    let state_json = state.map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO tape_anchors (tape_id, name, seq_no, state, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(tape_id, name) DO UPDATE SET
            seq_no = excluded.seq_no,
            state = excluded.state,
            updated_at = excluded.updated_at",
        params![tape_id, name, to_sql_int(seq_no), state_json, now_rfc3339()],
    )
    .map_err(|e| TapeError::from_sqlite("failed to upsert anchor", e))?;

    tracing::debug!(tape_id = %tape_id, anchor = name, seq_no, "Anchor set");
    get(conn, tape_id, name)
}

pub fn find(conn: &Connection, tape_id: TapeId, name: &str) -> Result<Option<Anchor>> {
    conn.query_row(
        &format!("SELECT {ANCHOR_COLUMNS} FROM tape_anchors WHERE tape_id = ?1 AND name = ?2"),
        params![tape_id, name],
        anchor_from_row,
    )
    .optional()
    .map_err(|e| TapeError::from_sqlite("failed to load anchor", e))
}

/// Load an anchor of an existing tape, `AnchorNotFound` if absent.
pub fn get(conn: &Connection, tape_id: TapeId, name: &str) -> Result<Anchor> {
    identity::require_tape(conn, tape_id)?;
    find(conn, tape_id, name)?.ok_or_else(|| TapeError::AnchorNotFound {
        tape_id,
        name: name.to_string(),
    })
}

/// Anchors of a tape, newest position first (ties by name).
pub fn list(conn: &Connection, tape_id: TapeId, limit: usize) -> Result<Vec<Anchor>> {
    identity::require_tape(conn, tape_id)?;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {ANCHOR_COLUMNS} FROM tape_anchors
             WHERE tape_id = ?1
             ORDER BY seq_no DESC, name
             LIMIT ?2"
        ))
        .map_err(|e| TapeError::from_sqlite("failed to prepare anchor list", e))?;
    let rows = stmt
        .query_map(params![tape_id, limit_to_sql(limit)], anchor_from_row)
        .map_err(|e| TapeError::from_sqlite("failed to list anchors", e))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| TapeError::from_sqlite("failed to decode anchor row", e))
}

/// Copy every anchor of `source` at or below `cutoff` onto `target`.
pub fn copy_up_to(conn: &Connection, source: TapeId, target: TapeId, cutoff: u64) -> Result<u64> {
    let copied = conn
        .execute(
            "INSERT INTO tape_anchors (tape_id, name, seq_no, state, updated_at)
             SELECT ?2, name, seq_no, state, updated_at FROM tape_anchors
             WHERE tape_id = ?1 AND seq_no <= ?3",
            params![source, target, to_sql_int(cutoff)],
        )
        .map_err(|e| TapeError::from_sqlite("failed to copy anchors", e))?;
    Ok(copied as u64)
}
