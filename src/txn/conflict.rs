//! Conflict Tracker - rw-antidependency bookkeeping for serializable snapshot isolation
//!
//! Every SSI transaction has an entry with two flags: `in_conflict` (some
//! concurrent transaction read a version this one overwrote) and
//! `out_conflict` (this one read a version a concurrent transaction
//! overwrote). A transaction with both flags is the pivot of a dangerous
//! structure and must not commit.
//!
//! When an edge touches a transaction that already committed, the flags can
//! no longer stop it, so the live end of the edge is doomed instead:
//! - reader -> committed writer that has an outgoing edge: doom the reader
//! - committed reader that has an incoming edge -> writer: doom the writer
//!
//! Entries of committed transactions are kept until the safe floor passes
//! their commit timestamp, since later edges may still reach them.

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::types::{Cid, TxnId};

// ============================================================================
// Conflict Result
// ============================================================================

/// Outcome of the commit-time check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResult {
    /// Safe to commit
    NoConflict,
    /// An edge to an already committed transaction closed a dangerous structure
    Doomed,
    /// Both an incoming and an outgoing rw-antidependency
    Pivot,
}

impl ConflictResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, ConflictResult::NoConflict)
    }
}

// ============================================================================
// Transaction State
// ============================================================================

#[derive(Debug, Clone)]
struct SsiTxnState {
    begin_cid: Cid,
    /// Set once the transaction commits
    commit_cid: Option<Cid>,
    in_conflict: bool,
    out_conflict: bool,
    doomed: bool,
}

impl SsiTxnState {
    /// Whether this transaction overlapped a transaction that began at `begin_cid`
    fn overlaps(&self, begin_cid: Cid) -> bool {
        self.commit_cid.map_or(true, |commit| commit > begin_cid)
    }

    fn check(&self) -> ConflictResult {
        if self.doomed {
            ConflictResult::Doomed
        } else if self.in_conflict && self.out_conflict {
            ConflictResult::Pivot
        } else {
            ConflictResult::NoConflict
        }
    }
}

// ============================================================================
// Conflict Tracker
// ============================================================================

/// Conflict flags of every live or recently committed SSI transaction
#[derive(Debug, Default)]
pub struct ConflictTracker {
    txns: Mutex<AHashMap<TxnId, SsiTxnState>>,
}

impl ConflictTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, txn_id: TxnId, begin_cid: Cid) {
        self.txns.lock().insert(
            txn_id,
            SsiTxnState {
                begin_cid,
                commit_cid: None,
                in_conflict: false,
                out_conflict: false,
                doomed: false,
            },
        );
    }

    /// `reader` read versions that `writers` overwrote; returns true if the reader is doomed
    pub fn add_read_edges(&self, reader: TxnId, writers: &[TxnId]) -> bool {
        let mut txns = self.txns.lock();
        let Some(reader_begin) = txns.get(&reader).map(|s| s.begin_cid) else {
            return false;
        };

        let mut doomed = false;
        let mut any_edge = false;
        for writer in writers.iter().copied().filter(|w| *w != reader) {
            let Some(state) = txns.get_mut(&writer) else { continue };
            if !state.overlaps(reader_begin) {
                continue;
            }
            if state.commit_cid.is_some() && state.out_conflict {
                doomed = true;
            }
            state.in_conflict = true;
            any_edge = true;
        }

        let Some(state) = txns.get_mut(&reader) else { return false };
        state.out_conflict |= any_edge;
        state.doomed |= doomed;
        state.doomed
    }

    /// `writer` overwrote a version `readers` read; returns true if the writer is doomed
    pub fn add_write_edges(&self, writer: TxnId, readers: &[TxnId]) -> bool {
        let mut txns = self.txns.lock();
        let Some(writer_begin) = txns.get(&writer).map(|s| s.begin_cid) else {
            return false;
        };

        let mut doomed = false;
        let mut any_edge = false;
        for reader in readers.iter().copied().filter(|r| *r != writer) {
            let Some(state) = txns.get_mut(&reader) else { continue };
            if !state.overlaps(writer_begin) {
                continue;
            }
            if state.commit_cid.is_some() && state.in_conflict {
                doomed = true;
            }
            state.out_conflict = true;
            any_edge = true;
        }

        let Some(state) = txns.get_mut(&writer) else { return false };
        state.in_conflict |= any_edge;
        state.doomed |= doomed;
        state.doomed
    }

    /// Check `txn_id` and, if it may commit, draw its commit timestamp and
    /// mark it committed in one step so no edge slips in between
    pub fn try_commit(&self, txn_id: TxnId, commit_cid: impl FnOnce() -> Cid) -> Result<Cid, ConflictResult> {
        let mut txns = self.txns.lock();
        let Some(state) = txns.get_mut(&txn_id) else {
            return Err(ConflictResult::Doomed);
        };
        let verdict = state.check();
        if !verdict.is_ok() {
            return Err(verdict);
        }
        let cid = commit_cid();
        state.commit_cid = Some(cid);
        Ok(cid)
    }

    /// Current verdict for a live transaction
    pub fn check(&self, txn_id: TxnId) -> ConflictResult {
        self.txns
            .lock()
            .get(&txn_id)
            .map_or(ConflictResult::Doomed, SsiTxnState::check)
    }

    /// Forget an aborted transaction
    pub fn remove(&self, txn_id: TxnId) {
        self.txns.lock().remove(&txn_id);
    }

    /// Drop committed entries no live transaction overlaps; returns their ids
    pub fn collect(&self, floor: Cid) -> Vec<TxnId> {
        let mut txns = self.txns.lock();
        let mut dropped = Vec::new();
        txns.retain(|txn_id, state| {
            let keep = state.commit_cid.map_or(true, |commit| commit >= floor);
            if !keep {
                dropped.push(*txn_id);
            }
            keep
        });
        dropped
    }

    pub fn flags(&self, txn_id: TxnId) -> Option<(bool, bool)> {
        self.txns
            .lock()
            .get(&txn_id)
            .map(|state| (state.in_conflict, state.out_conflict))
    }

    pub fn len(&self) -> usize {
        self.txns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.txns.lock().is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
