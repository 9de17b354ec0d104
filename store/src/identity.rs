//! Identity registry: tapes and their name aliases.
//!
//! A tape id is immutable. Names are aliases over ids; at most one alias per
//! tape and at most one alias per name is primary, which the partial unique
//! indexes in the schema enforce. Demoted aliases stay behind as rename
//! history and keep resolving to their tape.

use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::errors::{Result, TapeError, is_unique_violation};
use crate::types::{
    Tape, TapeAlias, TapeId, TapeInfo, from_sql_int, limit_to_sql, now_rfc3339,
    parse_optional_timestamp, parse_timestamp,
};

/// Longest accepted alias or anchor name, in characters.
pub const MAX_NAME_CHARS: usize = 128;

/// Check that `name` can be used as an alias.
///
/// Names may not be blank, may not exceed [`MAX_NAME_CHARS`] and may not parse
/// as a tape id, otherwise `resolve` would be ambiguous.
pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(TapeError::invalid_input("tape name must not be blank"));
    }
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(TapeError::invalid_input(format!(
            "tape name is longer than {MAX_NAME_CHARS} characters"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(TapeError::invalid_input(
            "tape name must not contain control characters",
        ));
    }
    if TapeId::parse(name).is_some() {
        return Err(TapeError::invalid_input(format!(
            "tape name {name:?} looks like a tape id"
        )));
    }
    Ok(())
}

const TAPE_COLUMNS: &str = "id, created_at, archived_at, parent_tape_id";

fn tape_from_row(row: &Row<'_>) -> rusqlite::Result<Tape> {
    Ok(Tape {
        id: row.get(0)?,
        created_at: parse_timestamp(&row.get::<_, String>(1)?)?,
        archived_at: parse_optional_timestamp(row.get(2)?)?,
        parent_tape_id: row.get(3)?,
    })
}

const ALIAS_COLUMNS: &str = "name, tape_id, is_primary, created_at, demoted_at";

fn alias_from_row(row: &Row<'_>) -> rusqlite::Result<TapeAlias> {
    Ok(TapeAlias {
        name: row.get(0)?,
        tape_id: row.get(1)?,
        is_primary: row.get(2)?,
        created_at: parse_timestamp(&row.get::<_, String>(3)?)?,
        demoted_at: parse_optional_timestamp(row.get(4)?)?,
    })
}

pub fn fetch_tape(conn: &Connection, tape_id: TapeId) -> Result<Option<Tape>> {
    conn.query_row(
        &format!("SELECT {TAPE_COLUMNS} FROM tapes WHERE id = ?1"),
        params![tape_id],
        tape_from_row,
    )
    .optional()
    .map_err(|e| TapeError::from_sqlite("failed to load tape", e))
}

/// Load a tape, failing with `TapeNotFound` if the id is unknown.
pub fn require_tape(conn: &Connection, tape_id: TapeId) -> Result<Tape> {
    fetch_tape(conn, tape_id)?.ok_or_else(|| TapeError::tape_not_found(tape_id))
}

/// Load a tape that accepts writes.
pub fn require_active(conn: &Connection, tape_id: TapeId) -> Result<Tape> {
    let tape = require_tape(conn, tape_id)?;
    if tape.is_archived() {
        return Err(TapeError::TapeArchived { tape_id });
    }
    Ok(tape)
}

/// Insert a new, empty tape row.
pub fn insert_tape(conn: &Connection, parent: Option<TapeId>) -> Result<TapeId> {
    let id = TapeId::new();
    conn.execute(
        "INSERT INTO tapes (id, created_at, parent_tape_id) VALUES (?1, ?2, ?3)",
        params![id, now_rfc3339(), parent],
    )
    .map_err(|e| TapeError::from_sqlite("failed to insert tape", e))?;
    Ok(id)
}

pub fn archive_tape(conn: &Connection, tape_id: TapeId) -> Result<()> {
    conn.execute(
        "UPDATE tapes SET archived_at = ?2 WHERE id = ?1 AND archived_at IS NULL",
        params![tape_id, now_rfc3339()],
    )
    .map_err(|e| TapeError::from_sqlite("failed to archive tape", e))?;
    Ok(())
}

/// Create a tape, optionally registering `name` as its primary alias.
pub fn create(conn: &Connection, name: Option<&str>) -> Result<TapeId> {
    if let Some(name) = name {
        validate_name(name)?;
        ensure_name_available(conn, name, None)?;
    }
    let tape_id = insert_tape(conn, None)?;
    if let Some(name) = name {
        insert_primary_alias(conn, tape_id, name)?;
    }
    Ok(tape_id)
}

/// The tape a name currently points at: its primary holder, else the holder
/// of the most recently created historical alias.
///
/// Archived tapes never answer to a name; they stay reachable by id only.
pub fn lookup_name(conn: &Connection, name: &str) -> Result<Option<TapeId>> {
    conn.query_row(
        "SELECT a.tape_id FROM tape_aliases a
         JOIN tapes t ON t.id = a.tape_id
         WHERE a.name = ?1 AND t.archived_at IS NULL
         ORDER BY a.is_primary DESC, a.created_at DESC, a.id DESC
         LIMIT 1",
        params![name],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| TapeError::from_sqlite("failed to look up tape name", e))
}

/// Resolve a tape id or alias.
///
/// Input that parses as a tape id is returned as-is without touching the
/// database; an unknown id surfaces as `TapeNotFound` on first use.
pub fn resolve(conn: &Connection, name_or_id: &str) -> Result<TapeId> {
    if let Some(id) = TapeId::parse(name_or_id) {
        return Ok(id);
    }
    lookup_name(conn, name_or_id)?.ok_or_else(|| TapeError::NameNotFound {
        name: name_or_id.to_string(),
    })
}

/// Fail with `NameInUse` unless `name` is unused or already points at `owner`.
pub fn ensure_name_available(conn: &Connection, name: &str, owner: Option<TapeId>) -> Result<()> {
    match lookup_name(conn, name)? {
        Some(holder) if Some(holder) != owner => Err(TapeError::name_in_use(name)),
        _ => Ok(()),
    }
}

pub fn primary_alias(conn: &Connection, tape_id: TapeId) -> Result<Option<TapeAlias>> {
    conn.query_row(
        &format!("SELECT {ALIAS_COLUMNS} FROM tape_aliases WHERE tape_id = ?1 AND is_primary = 1"),
        params![tape_id],
        alias_from_row,
    )
    .optional()
    .map_err(|e| TapeError::from_sqlite("failed to load primary alias", e))
}

/// Insert `name` as the primary alias of `tape_id`.
///
/// The caller must have demoted any previous primary of the tape and of the
/// name in the same transaction.
pub fn insert_primary_alias(conn: &Connection, tape_id: TapeId, name: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO tape_aliases (name, tape_id, is_primary, created_at) VALUES (?1, ?2, 1, ?3)",
        params![name, tape_id, now_rfc3339()],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            TapeError::name_in_use(name)
        } else {
            TapeError::from_sqlite("failed to insert alias", e)
        }
    })?;
    Ok(())
}

/// Demote the tape's primary alias, returning its name if there was one.
pub fn demote_primary(conn: &Connection, tape_id: TapeId) -> Result<Option<String>> {
    let name = primary_alias(conn, tape_id)?.map(|alias| alias.name);
    if name.is_some() {
        conn.execute(
            "UPDATE tape_aliases SET is_primary = 0, demoted_at = ?2
             WHERE tape_id = ?1 AND is_primary = 1",
            params![tape_id, now_rfc3339()],
        )
        .map_err(|e| TapeError::from_sqlite("failed to demote alias", e))?;
    }
    Ok(name)
}

/// Give `tape_id` the primary name `new_name`.
///
/// Returns `false` when `new_name` already is the primary name. A former name
/// of the same tape is re-promoted instead of duplicated.
pub fn rename(conn: &Connection, tape_id: TapeId, new_name: &str) -> Result<bool> {
    validate_name(new_name)?;
    require_active(conn, tape_id)?;

    if let Some(current) = primary_alias(conn, tape_id)?
        && current.name == new_name
    {
        return Ok(false);
    }
    ensure_name_available(conn, new_name, Some(tape_id))?;
    demote_primary(conn, tape_id)?;

    let promoted = conn
        .execute(
            "UPDATE tape_aliases SET is_primary = 1, demoted_at = NULL
             WHERE tape_id = ?1 AND name = ?2",
            params![tape_id, new_name],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                TapeError::name_in_use(new_name)
            } else {
                TapeError::from_sqlite("failed to promote alias", e)
            }
        })?;
    if promoted == 0 {
        insert_primary_alias(conn, tape_id, new_name)?;
    }
    Ok(true)
}

/// Full alias history of a tape: the primary first, then newest first.
pub fn aliases(conn: &Connection, tape_id: TapeId) -> Result<Vec<TapeAlias>> {
    require_tape(conn, tape_id)?;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {ALIAS_COLUMNS} FROM tape_aliases
             WHERE tape_id = ?1
             ORDER BY is_primary DESC, created_at DESC, id DESC"
        ))
        .map_err(|e| TapeError::from_sqlite("failed to prepare alias query", e))?;
    let rows = stmt
        .query_map(params![tape_id], alias_from_row)
        .map_err(|e| TapeError::from_sqlite("failed to query aliases", e))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| TapeError::from_sqlite("failed to read alias row", e))
}

const INFO_SELECT: &str = "SELECT t.id, t.created_at, t.archived_at, t.parent_tape_id,
        (SELECT a.name FROM tape_aliases a WHERE a.tape_id = t.id AND a.is_primary = 1),
        (SELECT COUNT(*) FROM tape_entries e WHERE e.tape_id = t.id)
     FROM tapes t";

fn info_from_row(row: &Row<'_>) -> rusqlite::Result<TapeInfo> {
    Ok(TapeInfo {
        tape: tape_from_row(row)?,
        primary_name: row.get(4)?,
        entry_count: from_sql_int(row.get(5)?),
    })
}

pub fn tape_info(conn: &Connection, tape_id: TapeId) -> Result<TapeInfo> {
    conn.query_row(
        &format!("{INFO_SELECT} WHERE t.id = ?1"),
        params![tape_id],
        info_from_row,
    )
    .optional()
    .map_err(|e| TapeError::from_sqlite("failed to load tape info", e))?
    .ok_or_else(|| TapeError::tape_not_found(tape_id))
}

/// Tapes newest first.
pub fn list_tapes(conn: &Connection, include_archived: bool, limit: usize) -> Result<Vec<TapeInfo>> {
    let mut stmt = conn
        .prepare(&format!(
            "{INFO_SELECT}
             WHERE (?1 OR t.archived_at IS NULL)
             ORDER BY t.created_at DESC, t.id
             LIMIT ?2"
        ))
        .map_err(|e| TapeError::from_sqlite("failed to prepare tape list", e))?;
    let rows = stmt
        .query_map(params![include_archived, limit_to_sql(limit)], info_from_row)
        .map_err(|e| TapeError::from_sqlite("failed to list tapes", e))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| TapeError::from_sqlite("failed to read tape row", e))
}
