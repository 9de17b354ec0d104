//! Fork and reset.
//!
//! Both run entirely inside the caller's transaction. A fork is an eager
//! prefix copy: cost is proportional to the cutoff, not to the source length.

use rusqlite::Connection;

use crate::anchors;
use crate::entry_log;
use crate::errors::{Result, TapeError};
use crate::identity;
use crate::types::{Cutoff, TapeId};

/// Result of a successful fork
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkOutcome {
    pub tape_id: TapeId,
    pub cutoff: u64,
    pub entries_copied: u64,
    pub anchors_copied: u64,
}

/// Turn a cutoff into a sequence number on `source`.
///
/// `SeqNo(0)` is an empty fork; anything past the head is out of range.
pub fn resolve_cutoff(conn: &Connection, source: TapeId, cutoff: &Cutoff) -> Result<u64> {
    match cutoff {
        Cutoff::Anchor(name) => Ok(anchors::get(conn, source, name)?.seq_no),
        Cutoff::SeqNo(seq_no) => {
            let count = entry_log::count(conn, source)?;
            if *seq_no > count {
                return Err(TapeError::SeqNoOutOfRange {
                    tape_id: source,
                    seq_no: *seq_no,
                    count,
                });
            }
            Ok(*seq_no)
        }
    }
}

/// Create `new_name` as a child of `source` holding entries `1..=cutoff`.
///
/// Anchors of the source at or before the cutoff are copied along, so anchor
/// policies keep working on the fork. Archived sources may be forked.
pub fn fork(
    conn: &Connection,
    text_field: &str,
    source: TapeId,
    new_name: &str,
    cutoff: &Cutoff,
) -> Result<ForkOutcome> {
    identity::validate_name(new_name)?;
    identity::require_tape(conn, source)?;
    let cutoff = resolve_cutoff(conn, source, cutoff)?;
    identity::ensure_name_available(conn, new_name, None)?;

    let tape_id = identity::insert_tape(conn, Some(source))?;
    let entries_copied = entry_log::copy_prefix(conn, text_field, source, tape_id, cutoff)?;
    let anchors_copied = anchors::copy_up_to(conn, source, tape_id, cutoff)?;
    identity::insert_primary_alias(conn, tape_id, new_name)?;

    Ok(ForkOutcome {
        tape_id,
        cutoff,
        entries_copied,
        anchors_copied,
    })
}

/// Archive `tape_id` and move its primary name to a fresh, empty child tape.
pub fn reset(conn: &Connection, tape_id: TapeId) -> Result<TapeId> {
    let tape = identity::require_tape(conn, tape_id)?;
    if tape.is_archived() {
        return Err(TapeError::TapeArchived { tape_id });
    }
    let alias =
        identity::primary_alias(conn, tape_id)?.ok_or(TapeError::NoPrimaryAlias { tape_id })?;

    identity::archive_tape(conn, tape_id)?;
    let new_tape = identity::insert_tape(conn, Some(tape_id))?;
    identity::demote_primary(conn, tape_id)?;
    identity::insert_primary_alias(conn, new_tape, &alias.name)?;
    Ok(new_tape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate_to_latest;
    use crate::errors::ErrorCategory;
    use crate::types::EntryKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn setup() -> (Connection, TapeId) {
        let mut conn = Connection::open_in_memory().expect("open");
        migrate_to_latest(&mut conn).expect("migrate");
        let tape = identity::create(&conn, Some("main")).expect("create");
        for i in 1..=4 {
            entry_log::append(
                &conn,
                "content",
                tape,
                EntryKind::Message,
                &json!({"content": format!("m{i}")}),
                None,
            )
            .expect("append");
        }
        (conn, tape)
    }

    #[test]
    fn fork_by_seq_no() {
        let (conn, source) = setup();
        let outcome = fork(&conn, "content", source, "branch", &Cutoff::SeqNo(2)).expect("fork");
        assert_eq!(outcome.entries_copied, 2);
        assert_eq!(identity::resolve(&conn, "branch").expect("resolve"), outcome.tape_id);

        let tape = identity::require_tape(&conn, outcome.tape_id).expect("tape");
        assert_eq!(tape.parent_tape_id, Some(source));
        assert_eq!(entry_log::count(&conn, outcome.tape_id).expect("count"), 2);
    }

    #[test]
    fn fork_at_zero_is_empty() {
        let (conn, source) = setup();
        let outcome = fork(&conn, "content", source, "empty", &Cutoff::SeqNo(0)).expect("fork");
        assert_eq!(outcome.entries_copied, 0);
        assert_eq!(entry_log::count(&conn, outcome.tape_id).expect("count"), 0);
    }

    #[test]
    fn fork_by_anchor_copies_anchors() {
        let (conn, source) = setup();
        anchors::set(&conn, source, "mid", 3, None).expect("mid");
        anchors::set(&conn, source, "end", 4, None).expect("end");
        let outcome = fork(&conn, "content", source, "branch", &Cutoff::from("mid")).expect("fork");
        assert_eq!(outcome.cutoff, 3);
        assert_eq!(outcome.anchors_copied, 1);
        assert!(anchors::find(&conn, outcome.tape_id, "mid").expect("find").is_some());
    }

    #[test]
    fn fork_errors() {
        let (conn, source) = setup();
        let err = fork(&conn, "content", source, "b", &Cutoff::SeqNo(5)).expect_err("range");
        assert_eq!(err.category(), ErrorCategory::SeqNoOutOfRange);

        let err = fork(&conn, "content", source, "b", &Cutoff::from("nope")).expect_err("anchor");
        assert_eq!(err.category(), ErrorCategory::AnchorNotFound);

        let err = fork(&conn, "content", source, "main", &Cutoff::SeqNo(1)).expect_err("name");
        assert_eq!(err.category(), ErrorCategory::NameInUse);
    }

    #[test]
    fn reset_moves_name_and_archives() {
        let (conn, old) = setup();
        let new = reset(&conn, old).expect("reset");
        assert_ne!(new, old);
        assert_eq!(identity::resolve(&conn, "main").expect("resolve"), new);
        assert!(identity::require_tape(&conn, old).expect("old").is_archived());
        assert_eq!(entry_log::count(&conn, old).expect("history"), 4);
        assert_eq!(entry_log::count(&conn, new).expect("fresh"), 0);
        assert_eq!(
            identity::require_tape(&conn, new).expect("new").parent_tape_id,
            Some(old)
        );

        let err = reset(&conn, old).expect_err("archived");
        assert_eq!(err.category(), ErrorCategory::TapeArchived);
    }

    #[test]
    fn reset_requires_primary_alias() {
        let (conn, _) = setup();
        let anonymous = identity::create(&conn, None).expect("anonymous");
        let err = reset(&conn, anonymous).expect_err("no alias");
        assert_eq!(err.category(), ErrorCategory::NoPrimaryAlias);
    }
}
