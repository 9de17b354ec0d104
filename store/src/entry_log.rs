//! Append-only entry log.
//!
//! Sequence numbers are `max(seq_no) + 1` computed inside the caller's
//! IMMEDIATE transaction, with `UNIQUE(tape_id, seq_no)` as the storage-level
//! backstop.

use rusqlite::{Connection, Row, params};
use serde_json::Value;

use crate::errors::{Result, TapeError};
use crate::identity;
use crate::search;
use crate::types::{
    EntryKind, TapeEntry, TapeId, from_sql_int, json_column, now_rfc3339, parse_timestamp,
    to_sql_int,
};

const ENTRY_COLUMNS: &str = "tape_id, seq_no, kind, payload, meta, created_at";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<TapeEntry> {
    let payload: String = row.get(3)?;
    let meta: Option<String> = row.get(4)?;
    Ok(TapeEntry {
        tape_id: row.get(0)?,
        seq_no: from_sql_int(row.get(1)?),
        kind: row.get(2)?,
        payload: json_column(3, &payload)?,
        meta: meta.as_deref().map(|raw| json_column(4, raw)).transpose()?,
        created_at: parse_timestamp(&row.get::<_, String>(5)?)?,
    })
}

/// Highest sequence number on the tape (0 when empty).
pub fn head_seq(conn: &Connection, tape_id: TapeId) -> Result<u64> {
    conn.query_row(
        "SELECT COALESCE(MAX(seq_no), 0) FROM tape_entries WHERE tape_id = ?1",
        params![tape_id],
        |row| row.get(0),
    )
    .map(from_sql_int)
    .map_err(|e| TapeError::from_sqlite("failed to read tape head", e))
}

/// Number of entries on an existing tape.
pub fn count(conn: &Connection, tape_id: TapeId) -> Result<u64> {
    identity::require_tape(conn, tape_id)?;
    conn.query_row(
        "SELECT COUNT(*) FROM tape_entries WHERE tape_id = ?1",
        params![tape_id],
        |row| row.get(0),
    )
    .map(from_sql_int)
    .map_err(|e| TapeError::from_sqlite("failed to count entries", e))
}

/// Insert one entry row at `seq_no` and index it.
#[allow(clippy::too_many_arguments)]
fn insert_entry(
    conn: &Connection,
    text_field: &str,
    tape_id: TapeId,
    seq_no: u64,
    kind: EntryKind,
    payload: &Value,
    meta: Option<&Value>,
    created_at: &str,
) -> Result<()> {
    let payload_json = serde_json::to_string(payload)?;
    let meta_json = meta.map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO tape_entries (tape_id, seq_no, kind, payload, meta, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![tape_id, to_sql_int(seq_no), kind, payload_json, meta_json, created_at],
    )
    .map_err(|e| TapeError::from_sqlite("failed to insert entry", e))?;
    search::index_entry(conn, conn.last_insert_rowid(), payload, text_field)?;
    Ok(())
}

/// Append an entry to an active tape, returning its sequence number.
pub fn append(
    conn: &Connection,
    text_field: &str,
    tape_id: TapeId,
    kind: EntryKind,
    payload: &Value,
    meta: Option<&Value>,
) -> Result<u64> {
    identity::require_active(conn, tape_id)?;
    let seq_no = head_seq(conn, tape_id)? + 1;
    insert_entry(
        conn,
        text_field,
        tape_id,
        seq_no,
        kind,
        payload,
        meta,
        &now_rfc3339(),
    )?;
    Ok(seq_no)
}

/// Read entries `from_seq..=to_seq` in order.
///
/// Out-of-range bounds clamp: `from_seq = 0` reads from 1, a missing or
/// too-large `to_seq` reads to the head, and an inverted range is empty.
pub fn read(
    conn: &Connection,
    tape_id: TapeId,
    from_seq: u64,
    to_seq: Option<u64>,
) -> Result<Vec<TapeEntry>> {
    identity::require_tape(conn, tape_id)?;
    let from_seq = from_seq.max(1);
    let to_seq = to_seq.unwrap_or(u64::MAX);
    if to_seq < from_seq {
        return Ok(Vec::new());
    }

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM tape_entries
             WHERE tape_id = ?1 AND seq_no >= ?2 AND seq_no <= ?3
             ORDER BY seq_no"
        ))
        .map_err(|e| TapeError::from_sqlite("failed to prepare entry read", e))?;
    let rows = stmt
        .query_map(
            params![tape_id, to_sql_int(from_seq), to_sql_int(to_seq)],
            entry_from_row,
        )
        .map_err(|e| TapeError::from_sqlite("failed to read entries", e))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| TapeError::from_sqlite("failed to decode entry row", e))
}

/// Sequence number of the newest entry of `kind`, if any.
pub fn last_seq_of_kind(conn: &Connection, tape_id: TapeId, kind: EntryKind) -> Result<Option<u64>> {
    conn.query_row(
        "SELECT MAX(seq_no) FROM tape_entries WHERE tape_id = ?1 AND kind = ?2",
        params![tape_id, kind],
        |row| row.get::<_, Option<i64>>(0),
    )
    .map(|seq| seq.map(from_sql_int))
    .map_err(|e| TapeError::from_sqlite("failed to find last entry of kind", e))
}

/// Copy entries `1..=cutoff` of `source` onto the empty tape `target`,
/// keeping their sequence numbers and creation times. Returns rows copied.
pub fn copy_prefix(
    conn: &Connection,
    text_field: &str,
    source: TapeId,
    target: TapeId,
    cutoff: u64,
) -> Result<u64> {
    if cutoff == 0 {
        return Ok(0);
    }
    let mut stmt = conn
        .prepare(
            "SELECT seq_no, kind, payload, meta, created_at FROM tape_entries
             WHERE tape_id = ?1 AND seq_no <= ?2
             ORDER BY seq_no",
        )
        .map_err(|e| TapeError::from_sqlite("failed to prepare prefix copy", e))?;
    let mut rows = stmt
        .query(params![source, to_sql_int(cutoff)])
        .map_err(|e| TapeError::from_sqlite("failed to scan source entries", e))?;

    let mut copied = 0;
    while let Some(row) = rows
        .next()
        .map_err(|e| TapeError::from_sqlite("failed to read source entry", e))?
    {
        let seq_no = from_sql_int(row.get(0)?);
        let kind: EntryKind = row.get(1)?;
        let payload = json_column(2, &row.get::<_, String>(2)?)?;
        let meta = row
            .get::<_, Option<String>>(3)?
            .map(|raw| json_column(3, &raw))
            .transpose()?;
        let created_at: String = row.get(4)?;
        insert_entry(
            conn,
            text_field,
            target,
            seq_no,
            kind,
            &payload,
            meta.as_ref(),
            &created_at,
        )?;
        copied += 1;
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate_to_latest;
    use crate::errors::ErrorCategory;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn setup() -> (Connection, TapeId) {
        let mut conn = Connection::open_in_memory().expect("open");
        migrate_to_latest(&mut conn).expect("migrate");
        let tape = identity::create(&conn, Some("t")).expect("create");
        (conn, tape)
    }

    fn message(conn: &Connection, tape: TapeId, text: &str) -> u64 {
        append(
            conn,
            "content",
            tape,
            EntryKind::Message,
            &json!({"role": "user", "content": text}),
            None,
        )
        .expect("append")
    }

    #[test]
    fn appends_number_from_one() {
        let (conn, tape) = setup();
        assert_eq!(message(&conn, tape, "a"), 1);
        assert_eq!(message(&conn, tape, "b"), 2);
        let seq = append(
            &conn,
            "content",
            tape,
            EntryKind::ToolCall,
            &json!({"tool": "ls"}),
            Some(&json!({"latency_ms": 3})),
        )
        .expect("tool call");
        assert_eq!(seq, 3);
        assert_eq!(count(&conn, tape).expect("count"), 3);

        let entries = read(&conn, tape, 1, None).expect("read");
        assert_eq!(
            entries.iter().map(|e| e.seq_no).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(entries[2].kind, EntryKind::ToolCall);
        assert_eq!(entries[2].meta, Some(json!({"latency_ms": 3})));
        assert_eq!(entries[0].payload["content"], json!("a"));
    }

    #[test]
    fn read_clamps_out_of_range() {
        let (conn, tape) = setup();
        for text in ["a", "b", "c"] {
            message(&conn, tape, text);
        }
        assert_eq!(read(&conn, tape, 0, None).expect("zero").len(), 3);
        assert_eq!(read(&conn, tape, 2, Some(99)).expect("past head").len(), 2);
        assert!(read(&conn, tape, 3, Some(2)).expect("inverted").is_empty());
        assert!(read(&conn, tape, 10, None).expect("beyond").is_empty());
    }

    #[test]
    fn unknown_and_archived_tapes() {
        let (conn, tape) = setup();
        let missing = TapeId::new();
        assert_eq!(
            read(&conn, missing, 1, None).expect_err("read").category(),
            ErrorCategory::NotFound
        );
        assert_eq!(
            count(&conn, missing).expect_err("count").category(),
            ErrorCategory::NotFound
        );

        identity::archive_tape(&conn, tape).expect("archive");
        let err = append(&conn, "content", tape, EntryKind::Message, &json!("x"), None)
            .expect_err("archived");
        assert_eq!(err.category(), ErrorCategory::TapeArchived);
    }

    #[test]
    fn last_seq_of_kind_finds_newest() {
        let (conn, tape) = setup();
        assert_eq!(last_seq_of_kind(&conn, tape, EntryKind::Anchor).expect("none"), None);
        message(&conn, tape, "a");
        append(&conn, "content", tape, EntryKind::Anchor, &json!({"name": "p"}), None)
            .expect("anchor");
        message(&conn, tape, "b");
        assert_eq!(
            last_seq_of_kind(&conn, tape, EntryKind::Anchor).expect("some"),
            Some(2)
        );
    }

    #[test]
    fn copy_prefix_preserves_rows() {
        let (conn, source) = setup();
        for text in ["a", "b", "c"] {
            message(&conn, source, text);
        }
        let target = identity::insert_tape(&conn, Some(source)).expect("target");
        assert_eq!(copy_prefix(&conn, "content", source, target, 2).expect("copy"), 2);

        let original = read(&conn, source, 1, Some(2)).expect("source");
        let copy = read(&conn, target, 1, None).expect("copy");
        assert_eq!(copy.len(), 2);
        for (a, b) in original.iter().zip(&copy) {
            assert_eq!((a.seq_no, a.kind, &a.payload, a.created_at), (b.seq_no, b.kind, &b.payload, b.created_at));
            assert_eq!(b.tape_id, target);
        }
        assert_eq!(search::indexed_count(&conn).expect("indexed"), 5);
    }
}
