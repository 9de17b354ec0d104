//! Context-window selection.
//!
//! [`slice`] is pure: it sees only the entries and anchors it is handed. The
//! store narrows what it loads to the window a policy can return, and the
//! result is the same as slicing the whole tape.

use crate::errors::{Result, TapeError};
use crate::types::{Anchor, ContextPolicy, EntryKind, TapeEntry, TapeId};

/// Select the window of `entries` (ordered by `seq_no`) that `policy` allows.
///
/// - `Full`: everything.
/// - `LastAnchor`: entries after the newest `anchor`-kind entry, or everything
///   if there is none.
/// - `FromAnchor`: entries after the named anchor.
/// - `Between`: entries from the start anchor through the end anchor,
///   inclusive.
pub fn slice(
    tape_id: TapeId,
    entries: Vec<TapeEntry>,
    policy: &ContextPolicy,
    anchors: &[Anchor],
) -> Result<Vec<TapeEntry>> {
    match policy {
        ContextPolicy::Full => Ok(entries),
        ContextPolicy::LastAnchor => {
            let last = entries
                .iter()
                .rev()
                .find(|entry| entry.kind == EntryKind::Anchor)
                .map(|entry| entry.seq_no);
            Ok(match last {
                Some(seq_no) => after(entries, seq_no),
                None => entries,
            })
        }
        ContextPolicy::FromAnchor { name } => {
            let seq_no = anchor_seq(tape_id, anchors, name)?;
            Ok(after(entries, seq_no))
        }
        ContextPolicy::Between { start, end } => {
            let start = anchor_seq(tape_id, anchors, start)?;
            let end = anchor_seq(tape_id, anchors, end)?;
            if end < start {
                return Err(TapeError::DisjointRange { start, end });
            }
            Ok(entries
                .into_iter()
                .filter(|entry| (start..=end).contains(&entry.seq_no))
                .collect())
        }
    }
}

fn after(entries: Vec<TapeEntry>, seq_no: u64) -> Vec<TapeEntry> {
    entries
        .into_iter()
        .filter(|entry| entry.seq_no > seq_no)
        .collect()
}

fn anchor_seq(tape_id: TapeId, anchors: &[Anchor], name: &str) -> Result<u64> {
    anchors
        .iter()
        .find(|anchor| anchor.name == name)
        .map(|anchor| anchor.seq_no)
        .ok_or_else(|| TapeError::AnchorNotFound {
            tape_id,
            name: name.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCategory;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn entry(tape_id: TapeId, seq_no: u64, kind: EntryKind) -> TapeEntry {
        TapeEntry {
            tape_id,
            seq_no,
            kind,
            payload: json!({}),
            meta: None,
            created_at: Utc::now(),
        }
    }

    fn anchor(tape_id: TapeId, name: &str, seq_no: u64) -> Anchor {
        Anchor {
            tape_id,
            name: name.to_string(),
            seq_no,
            state: None,
            updated_at: Utc::now(),
        }
    }

    /// m m m a m m a m  (anchors "one" at 4, "two" at 7)
    fn fixture() -> (TapeId, Vec<TapeEntry>, Vec<Anchor>) {
        let id = TapeId::new();
        let kinds = [
            EntryKind::Message,
            EntryKind::Message,
            EntryKind::Message,
            EntryKind::Anchor,
            EntryKind::Message,
            EntryKind::Message,
            EntryKind::Anchor,
            EntryKind::Message,
        ];
        let entries = kinds
            .iter()
            .enumerate()
            .map(|(i, kind)| entry(id, i as u64 + 1, *kind))
            .collect();
        let anchors = vec![anchor(id, "one", 4), anchor(id, "two", 7)];
        (id, entries, anchors)
    }

    fn seqs(entries: &[TapeEntry]) -> Vec<u64> {
        entries.iter().map(|e| e.seq_no).collect()
    }

    #[test]
    fn full_returns_everything() {
        let (id, entries, anchors) = fixture();
        let out = slice(id, entries, &ContextPolicy::Full, &anchors).expect("slice");
        assert_eq!(seqs(&out), (1..=8).collect::<Vec<_>>());
    }

    #[test]
    fn last_anchor_uses_newest_anchor_entry() {
        let (id, entries, anchors) = fixture();
        let out = slice(id, entries, &ContextPolicy::LastAnchor, &anchors).expect("slice");
        assert_eq!(seqs(&out), vec![8]);
    }

    #[test]
    fn last_anchor_without_anchor_entries_is_full() {
        let id = TapeId::new();
        let entries = vec![entry(id, 1, EntryKind::Message), entry(id, 2, EntryKind::Event)];
        let out = slice(id, entries, &ContextPolicy::LastAnchor, &[]).expect("slice");
        assert_eq!(seqs(&out), vec![1, 2]);
    }

    #[test]
    fn last_anchor_at_head_is_empty() {
        let id = TapeId::new();
        let entries = vec![entry(id, 1, EntryKind::Message), entry(id, 2, EntryKind::Anchor)];
        let out = slice(id, entries, &ContextPolicy::LastAnchor, &[]).expect("slice");
        assert!(out.is_empty());
    }

    #[test]
    fn from_anchor_is_exclusive() {
        let (id, entries, anchors) = fixture();
        let policy = ContextPolicy::FromAnchor {
            name: "one".to_string(),
        };
        let out = slice(id, entries, &policy, &anchors).expect("slice");
        assert_eq!(seqs(&out), vec![5, 6, 7, 8]);
    }

    #[test]
    fn between_is_inclusive() {
        let (id, entries, anchors) = fixture();
        let policy = ContextPolicy::Between {
            start: "one".to_string(),
            end: "two".to_string(),
        };
        let out = slice(id, entries, &policy, &anchors).expect("slice");
        assert_eq!(seqs(&out), vec![4, 5, 6, 7]);
    }

    #[test]
    fn between_rejects_reversed_anchors() {
        let (id, entries, anchors) = fixture();
        let policy = ContextPolicy::Between {
            start: "two".to_string(),
            end: "one".to_string(),
        };
        let err = slice(id, entries, &policy, &anchors).expect_err("disjoint");
        assert_eq!(err.category(), ErrorCategory::DisjointRange);
    }

    #[test]
    fn unknown_anchor_names() {
        let (id, entries, anchors) = fixture();
        let policy = ContextPolicy::FromAnchor {
            name: "missing".to_string(),
        };
        let err = slice(id, entries.clone(), &policy, &anchors).expect_err("missing");
        assert_eq!(err.category(), ErrorCategory::AnchorNotFound);

        let policy = ContextPolicy::Between {
            start: "one".to_string(),
            end: "missing".to_string(),
        };
        let err = slice(id, entries, &policy, &anchors).expect_err("missing end");
        assert_eq!(err.category(), ErrorCategory::AnchorNotFound);
    }
}
