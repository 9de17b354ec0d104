//! Consistency checks over the whole database.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, TapeError};
use crate::search;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Ok,
    /// Inconsistent, but derived state that a repair can rebuild
    Warn,
    /// Inconsistent ground truth; needs manual attention
    Failed,
    Repaired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoctorCheck {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

impl DoctorCheck {
    fn new(name: &str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoctorReport {
    pub checks: Vec<DoctorCheck>,
}

impl DoctorReport {
    /// True when no check is left in `Warn` or `Failed`.
    pub fn is_healthy(&self) -> bool {
        self.checks
            .iter()
            .all(|check| matches!(check.status, CheckStatus::Ok | CheckStatus::Repaired))
    }

    pub fn check(&self, name: &str) -> Option<&DoctorCheck> {
        self.checks.iter().find(|check| check.name == name)
    }
}

pub const CHECK_INTEGRITY: &str = "integrity";
pub const CHECK_SEQUENCES: &str = "sequences";
pub const CHECK_PRIMARY_ALIASES: &str = "primary_aliases";
pub const CHECK_ANCHORS: &str = "anchors";
pub const CHECK_SEARCH_INDEX: &str = "search_index";

/// Run every check. With `repair`, rebuild the search index when it drifted.
pub fn run(conn: &Connection, text_field: &str, repair: bool) -> Result<DoctorReport> {
    let checks = vec![
        check_integrity(conn)?,
        check_sequences(conn)?,
        check_primary_aliases(conn)?,
        check_anchors(conn)?,
        check_search_index(conn, text_field, repair)?,
    ];
    for check in &checks {
        if check.status != CheckStatus::Ok {
            tracing::warn!(check = %check.name, status = ?check.status, detail = %check.detail, "Doctor finding");
        }
    }
    Ok(DoctorReport { checks })
}

fn strings(conn: &Connection, sql: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| TapeError::from_sqlite("failed to prepare doctor query", e))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| TapeError::from_sqlite("failed to run doctor query", e))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| TapeError::from_sqlite("failed to read doctor row", e))
}

fn findings(name: &str, found: Vec<String>, what: &str) -> DoctorCheck {
    if found.is_empty() {
        DoctorCheck::new(name, CheckStatus::Ok, "ok")
    } else {
        DoctorCheck::new(
            name,
            CheckStatus::Failed,
            format!("{} {what}: {}", found.len(), found.join(", ")),
        )
    }
}

fn check_integrity(conn: &Connection) -> Result<DoctorCheck> {
    let mut rows = strings(conn, "PRAGMA integrity_check")?;
    if rows.len() == 1 && rows[0] == "ok" {
        return Ok(DoctorCheck::new(CHECK_INTEGRITY, CheckStatus::Ok, "ok"));
    }
    rows.truncate(10);
    Ok(DoctorCheck::new(
        CHECK_INTEGRITY,
        CheckStatus::Failed,
        rows.join("; "),
    ))
}

fn check_sequences(conn: &Connection) -> Result<DoctorCheck> {
    let gaps = strings(
        conn,
        "SELECT tape_id FROM tape_entries
         GROUP BY tape_id
         HAVING MIN(seq_no) != 1 OR MAX(seq_no) != COUNT(*)
         ORDER BY tape_id",
    )?;
    Ok(findings(CHECK_SEQUENCES, gaps, "tapes with sequence gaps"))
}

fn check_primary_aliases(conn: &Connection) -> Result<DoctorCheck> {
    let orphaned = strings(
        conn,
        "SELECT t.id FROM tapes t
         WHERE t.archived_at IS NULL
           AND EXISTS (SELECT 1 FROM tape_aliases a WHERE a.tape_id = t.id)
           AND NOT EXISTS (SELECT 1 FROM tape_aliases a WHERE a.tape_id = t.id AND a.is_primary = 1)
         ORDER BY t.id",
    )?;
    Ok(findings(
        CHECK_PRIMARY_ALIASES,
        orphaned,
        "active tapes with aliases but no primary",
    ))
}

fn check_anchors(conn: &Connection) -> Result<DoctorCheck> {
    let dangling = strings(
        conn,
        "SELECT a.tape_id || '/' || a.name FROM tape_anchors a
         WHERE NOT EXISTS (
             SELECT 1 FROM tape_entries e WHERE e.tape_id = a.tape_id AND e.seq_no = a.seq_no
         )
         ORDER BY a.tape_id, a.name",
    )?;
    Ok(findings(CHECK_ANCHORS, dangling, "dangling anchors"))
}

fn check_search_index(conn: &Connection, text_field: &str, repair: bool) -> Result<DoctorCheck> {
    let indexed = search::indexed_count(conn)?;
    let indexable = search::indexable_count(conn, text_field)?;
    if indexed == indexable {
        return Ok(DoctorCheck::new(
            CHECK_SEARCH_INDEX,
            CheckStatus::Ok,
            format!("{indexed} rows"),
        ));
    }
    let detail = format!("{indexed} index rows for {indexable} indexable entries");
    if !repair {
        return Ok(DoctorCheck::new(CHECK_SEARCH_INDEX, CheckStatus::Warn, detail));
    }
    let rebuilt = search::rebuild(conn, text_field)?;
    Ok(DoctorCheck::new(
        CHECK_SEARCH_INDEX,
        CheckStatus::Repaired,
        format!("{detail}; rebuilt {rebuilt} rows"),
    ))
}
