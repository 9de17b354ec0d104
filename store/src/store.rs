//! `TapeStore`: the facade every caller goes through.
//!
//! Owns the connection pool and the per-tape lock table. Each write takes the
//! tape's in-process lock, then runs in one IMMEDIATE transaction; reads use a
//! pooled connection of their own and see a committed snapshot.

use rusqlite::{Transaction, TransactionBehavior};
use serde_json::{Value, json};

use crate::anchors;
use crate::config::TapeConfig;
use crate::context;
use crate::db::{self, DbPool, PooledConn};
use crate::doctor::{self, DoctorReport};
use crate::entry_log;
use crate::errors::Result;
use crate::fork;
use crate::identity;
use crate::locks::TapeLocks;
use crate::search;
use crate::types::{
    Anchor, ContextPolicy, Cutoff, EntryKind, SearchMatch, SearchOptions, TapeAlias, TapeEntry,
    TapeId, TapeInfo,
};

const DEFAULT_TAPE_LIST_LIMIT: usize = 100;

pub struct TapeStore {
    cfg: TapeConfig,
    pool: DbPool,
    locks: TapeLocks,
}

impl TapeStore {
    /// Open the store described by `cfg`, creating and migrating the database
    pub fn open(cfg: TapeConfig) -> Result<Self> {
        let pool = db::initialize_pool(&cfg)?;
        let applied = {
            let mut conn = pool.get()?;
            db::migrate_to_latest(&mut conn)?
        };

        tracing::info!(
            db_path = %cfg.db_path,
            schema_version = db::SCHEMA_VERSION,
            migrations_applied = applied,
            "Tape store opened"
        );

        Ok(Self {
            cfg,
            pool,
            locks: TapeLocks::new(),
        })
    }

    /// Open a private in-memory store (tests, scratch sessions)
    pub fn open_in_memory() -> Result<Self> {
        Self::open(TapeConfig::in_memory())
    }

    pub fn config(&self) -> &TapeConfig {
        &self.cfg
    }

    pub(crate) fn conn(&self) -> Result<PooledConn> {
        Ok(self.pool.get()?)
    }

    fn text_field(&self) -> &str {
        &self.cfg.search.text_field
    }

    /// Run `op` in an IMMEDIATE transaction, holding `tape`'s write lock if given.
    fn write<T>(&self, tape: Option<TapeId>, op: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let handle = tape.map(|id| self.locks.handle(id));
        let _guard = handle.as_ref().map(|h| h.lock());
        let mut conn = self.conn()?;
        db::execute_in_transaction(&mut conn, TransactionBehavior::Immediate, op)
    }

    /// Run `op` in a read transaction so multi-query reads see one snapshot.
    fn read_snapshot<T>(&self, op: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.conn()?;
        db::execute_in_transaction(&mut conn, TransactionBehavior::Deferred, op)
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Identity
    // ─────────────────────────────────────────────────────────────────────────────

    /// Create a tape, optionally with a primary name
    pub fn create_tape(&self, name: Option<&str>) -> Result<TapeId> {
        let tape_id = self.write(None, |tx| identity::create(tx, name))?;
        tracing::debug!(tape_id = %tape_id, name = name.unwrap_or(""), "Tape created");
        Ok(tape_id)
    }

    /// Resolve a name or id to a tape id
    pub fn resolve(&self, name_or_id: &str) -> Result<TapeId> {
        let conn = self.conn()?;
        identity::resolve(&conn, name_or_id)
    }

    /// Make `new_name` the tape's primary name. The old primary stays as history.
    pub fn rename(&self, tape_id: TapeId, new_name: &str) -> Result<()> {
        let changed = self.write(Some(tape_id), |tx| identity::rename(tx, tape_id, new_name))?;
        if changed {
            tracing::debug!(tape_id = %tape_id, name = new_name, "Tape renamed");
        }
        Ok(())
    }

    pub fn aliases(&self, tape_id: TapeId) -> Result<Vec<TapeAlias>> {
        let conn = self.conn()?;
        identity::aliases(&conn, tape_id)
    }

    pub fn tape_info(&self, tape_id: TapeId) -> Result<TapeInfo> {
        let conn = self.conn()?;
        identity::tape_info(&conn, tape_id)
    }

    /// Tapes newest first; archived tapes only when asked for.
    pub fn list_tapes(&self, include_archived: bool, limit: Option<usize>) -> Result<Vec<TapeInfo>> {
        let limit = limit.unwrap_or(DEFAULT_TAPE_LIST_LIMIT);
        let conn = self.conn()?;
        identity::list_tapes(&conn, include_archived, limit)
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Entry log
    // ─────────────────────────────────────────────────────────────────────────────

    /// Append an entry and index it, returning its sequence number
    pub fn append(
        &self,
        tape_id: TapeId,
        kind: EntryKind,
        payload: &Value,
        meta: Option<&Value>,
    ) -> Result<u64> {
        let seq_no = self.write(Some(tape_id), |tx| {
            entry_log::append(tx, self.text_field(), tape_id, kind, payload, meta)
        })?;
        tracing::debug!(tape_id = %tape_id, seq_no, kind = %kind, "Entry appended");
        Ok(seq_no)
    }

    /// Read entries in order; `from_seq` defaults to 1 and `to_seq` to the head
    pub fn read(
        &self,
        tape_id: TapeId,
        from_seq: Option<u64>,
        to_seq: Option<u64>,
    ) -> Result<Vec<TapeEntry>> {
        let conn = self.conn()?;
        entry_log::read(&conn, tape_id, from_seq.unwrap_or(1), to_seq)
    }

    pub fn count(&self, tape_id: TapeId) -> Result<u64> {
        let conn = self.conn()?;
        entry_log::count(&conn, tape_id)
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Anchors
    // ─────────────────────────────────────────────────────────────────────────────

    /// Mark a phase boundary.
    ///
    /// In one transaction: an `event` entry records the handoff for audit, an
    /// `anchor` entry follows it, and the anchor `name` is pointed at that
    /// anchor entry. The anchor entry is the new head, so a `LastAnchor`
    /// context is empty until something else is appended.
    pub fn handoff(&self, tape_id: TapeId, name: &str, state: Option<&Value>) -> Result<u64> {
        anchors::validate_anchor_name(name)?;
        let state_value = state.cloned().unwrap_or(Value::Null);
        let seq_no = self.write(Some(tape_id), |tx| {
            let text_field = self.text_field();
            entry_log::append(
                tx,
                text_field,
                tape_id,
                EntryKind::Event,
                &json!({"name": "handoff", "anchor": name, "state": state_value}),
                None,
            )?;
            let seq_no = entry_log::append(
                tx,
                text_field,
                tape_id,
                EntryKind::Anchor,
                &json!({"name": name, "state": state_value}),
                None,
            )?;
            anchors::set(tx, tape_id, name, seq_no, state)?;
            Ok(seq_no)
        })?;
        tracing::debug!(tape_id = %tape_id, anchor = name, seq_no, "Handoff recorded");
        Ok(seq_no)
    }

    /// Create or move an anchor without writing entries
    pub fn set_anchor(
        &self,
        tape_id: TapeId,
        name: &str,
        seq_no: u64,
        state: Option<&Value>,
    ) -> Result<Anchor> {
        self.write(Some(tape_id), |tx| anchors::set(tx, tape_id, name, seq_no, state))
    }

    pub fn get_anchor(&self, tape_id: TapeId, name: &str) -> Result<Anchor> {
        let conn = self.conn()?;
        anchors::get(&conn, tape_id, name)
    }

    /// Anchors newest position first; `limit` defaults to the configured list limit
    pub fn list_anchors(&self, tape_id: TapeId, limit: Option<usize>) -> Result<Vec<Anchor>> {
        let limit = limit.unwrap_or(self.cfg.anchors.default_list_limit);
        let conn = self.conn()?;
        anchors::list(&conn, tape_id, limit)
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Context
    // ─────────────────────────────────────────────────────────────────────────────

    /// The entries a consumer should see under `policy`.
    ///
    /// Only the rows the policy can return are loaded: from the newest anchor
    /// entry for `LastAnchor`, from the named anchor for `FromAnchor`, and the
    /// anchor range for `Between`.
    pub fn context(&self, tape_id: TapeId, policy: &ContextPolicy) -> Result<Vec<TapeEntry>> {
        self.read_snapshot(|tx| {
            let (from_seq, to_seq, anchor_rows) = match policy {
                ContextPolicy::Full => (1, None, Vec::new()),
                ContextPolicy::LastAnchor => {
                    identity::require_tape(tx, tape_id)?;
                    let from = entry_log::last_seq_of_kind(tx, tape_id, EntryKind::Anchor)?;
                    (from.unwrap_or(1), None, Vec::new())
                }
                ContextPolicy::FromAnchor { name } => {
                    let anchor = anchors::get(tx, tape_id, name)?;
                    (anchor.seq_no, None, vec![anchor])
                }
                ContextPolicy::Between { start, end } => {
                    let start = anchors::get(tx, tape_id, start)?;
                    let end = anchors::get(tx, tape_id, end)?;
                    // A reversed range loads nothing extra; the slicer reports it.
                    let to_seq = end.seq_no.max(start.seq_no);
                    (start.seq_no, Some(to_seq), vec![start, end])
                }
            };
            let entries = entry_log::read(tx, tape_id, from_seq, to_seq)?;
            context::slice(tape_id, entries, policy, &anchor_rows)
        })
    }

    /// Context under the configured default policy
    pub fn default_context(&self, tape_id: TapeId) -> Result<Vec<TapeEntry>> {
        self.context(tape_id, &self.cfg.default_context_policy())
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Fork / reset
    // ─────────────────────────────────────────────────────────────────────────────

    /// Branch `tape_id` into a new tape named `new_name` holding its prefix up to `cutoff`
    pub fn fork(&self, tape_id: TapeId, new_name: &str, cutoff: &Cutoff) -> Result<TapeId> {
        let outcome = self.write(Some(tape_id), |tx| {
            fork::fork(tx, self.text_field(), tape_id, new_name, cutoff)
        })?;
        tracing::info!(
            source = %tape_id,
            tape_id = %outcome.tape_id,
            name = new_name,
            cutoff = outcome.cutoff,
            copied = outcome.entries_copied,
            anchors = outcome.anchors_copied,
            "Tape forked"
        );
        Ok(outcome.tape_id)
    }

    /// Archive `tape_id` and give its primary name to a new empty tape
    pub fn reset(&self, tape_id: TapeId) -> Result<TapeId> {
        let new_tape = self.write(Some(tape_id), |tx| fork::reset(tx, tape_id))?;
        tracing::info!(archived = %tape_id, tape_id = %new_tape, "Tape reset");
        Ok(new_tape)
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Search / maintenance
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn search(&self, query: &str, opts: &SearchOptions) -> Result<Vec<SearchMatch>> {
        let limit = opts.limit.unwrap_or(self.cfg.search.default_limit);
        let conn = self.conn()?;
        search::search(
            &conn,
            query,
            limit,
            opts.include_archived,
            self.cfg.search.snippet_tokens,
        )
    }

    /// Re-derive the search index from the entry log, returning rows indexed
    pub fn rebuild_index(&self) -> Result<u64> {
        let indexed = self.write(None, |tx| search::rebuild(tx, self.text_field()))?;
        tracing::info!(indexed, text_field = self.text_field(), "Search index rebuilt");
        Ok(indexed)
    }

    /// Check database consistency; with `repair`, rebuild derived state
    pub fn doctor(&self, repair: bool) -> Result<DoctorReport> {
        let report = if repair {
            self.write(None, |tx| doctor::run(tx, self.text_field(), true))?
        } else {
            self.read_snapshot(|tx| doctor::run(tx, self.text_field(), false))?
        };
        tracing::info!(healthy = report.is_healthy(), repair, "Doctor finished");
        Ok(report)
    }

    /// Ensure `tape_id` names an existing tape
    pub fn require_tape(&self, tape_id: TapeId) -> Result<()> {
        let conn = self.conn()?;
        identity::require_tape(&conn, tape_id).map(|_| ())
    }
}

impl std::fmt::Debug for TapeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapeStore")
            .field("db_path", &self.cfg.db_path)
            .field("pool_size", &self.pool.max_size())
            .finish_non_exhaustive()
    }
}
