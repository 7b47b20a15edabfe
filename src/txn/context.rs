//! Transaction - per-transaction state passed explicitly to every operation
//!
//! Tracks the read/write set the protocols validate, install or roll back,
//! plus the bookkeeping that must be released exactly once at the end
//! (epoch registration, rollback pool, shared read locks).

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};

use crate::storage::mvcc::{EpochGuard, RollbackSegmentPool};
use crate::types::{Cid, ItemPointer, RwType, TxnId, TxnResult, MAX_CID};

// ============================================================================
// Transaction
// ============================================================================

/// One transaction's identity, timestamps and read/write set
///
/// Owned by the executing thread; the protocols mutate it through
/// `&mut Transaction` and never share it.
#[derive(Debug)]
pub struct Transaction {
    txn_id: TxnId,
    begin_cid: Cid,
    /// MAX_CID until commit assigns one
    end_cid: Cid,
    rw_set: AHashMap<ItemPointer, RwType>,
    insert_count: usize,
    /// Entries other than plain reads: they hold ownership until the end
    owned_count: usize,
    result: TxnResult,
    /// Exits the epoch when released or when the transaction is dropped
    epoch: Option<EpochGuard>,
    rollback_pool: Option<Arc<RollbackSegmentPool>>,
    /// Shared locks already given back (pessimistic protocol)
    released_read_locks: AHashSet<ItemPointer>,
    finished: bool,
}

impl Transaction {
    pub(crate) fn new(txn_id: TxnId, begin_cid: Cid, epoch: EpochGuard) -> Self {
        Self {
            txn_id,
            begin_cid,
            end_cid: MAX_CID,
            rw_set: AHashMap::new(),
            insert_count: 0,
            owned_count: 0,
            result: TxnResult::Success,
            epoch: Some(epoch),
            rollback_pool: None,
            released_read_locks: AHashSet::new(),
            finished: false,
        }
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn begin_cid(&self) -> Cid {
        self.begin_cid
    }

    pub fn end_cid(&self) -> Cid {
        self.end_cid
    }

    pub(crate) fn set_end_cid(&mut self, cid: Cid) {
        self.end_cid = cid;
    }

    pub fn result(&self) -> TxnResult {
        self.result
    }

    pub fn set_result(&mut self, result: TxnResult) {
        self.result = result;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn mark_finished(&mut self) {
        self.finished = true;
    }

    pub(crate) fn take_epoch(&mut self) -> Option<EpochGuard> {
        self.epoch.take()
    }

    /// Whether the transaction still holds its epoch registration
    pub fn holds_epoch(&self) -> bool {
        self.epoch.is_some()
    }

    pub fn rollback_pool(&self) -> Option<&Arc<RollbackSegmentPool>> {
        self.rollback_pool.as_ref()
    }

    pub(crate) fn set_rollback_pool(&mut self, pool: Arc<RollbackSegmentPool>) {
        self.rollback_pool = Some(pool);
    }

    pub(crate) fn take_rollback_pool(&mut self) -> Option<Arc<RollbackSegmentPool>> {
        self.rollback_pool.take()
    }

    // ========================================================================
    // Read/Write Set
    // ========================================================================

    pub fn rw_type(&self, location: ItemPointer) -> Option<RwType> {
        self.rw_set.get(&location).copied()
    }

    /// Entries ordered by location, so installs and logs are deterministic
    pub fn rw_entries(&self) -> Vec<(ItemPointer, RwType)> {
        let mut entries: Vec<_> = self.rw_set.iter().map(|(l, k)| (*l, *k)).collect();
        entries.sort_unstable_by_key(|(l, _)| *l);
        entries
    }

    pub fn rw_set_len(&self) -> usize {
        self.rw_set.len()
    }

    pub fn insert_count(&self) -> usize {
        self.insert_count
    }

    /// Whether any entry installs a write at commit
    pub fn is_written(&self) -> bool {
        self.rw_set.values().any(RwType::is_write)
    }

    /// Only plain reads: commit takes the fast path
    pub fn is_read_only(&self) -> bool {
        self.owned_count == 0
    }

    fn set_kind(&mut self, location: ItemPointer, kind: RwType) {
        let previous = self.rw_set.insert(location, kind);
        let was_owned = matches!(previous, Some(k) if k != RwType::Read);
        if !was_owned && kind != RwType::Read {
            self.owned_count += 1;
        }
    }

    pub fn record_read(&mut self, location: ItemPointer) {
        if !self.rw_set.contains_key(&location) {
            self.set_kind(location, RwType::Read);
        }
    }

    pub fn record_read_own(&mut self, location: ItemPointer) {
        match self.rw_type(location) {
            None | Some(RwType::Read) => self.set_kind(location, RwType::ReadOwn),
            Some(_) => {}
        }
    }

    pub fn record_update(&mut self, location: ItemPointer) {
        match self.rw_type(location) {
            None | Some(RwType::Read) | Some(RwType::ReadOwn) => self.set_kind(location, RwType::Update),
            Some(RwType::Update) | Some(RwType::Insert) => {}
            Some(kind) => panic!("update of {} after {:?} in txn {}", location, kind, self.txn_id),
        }
    }

    pub fn record_insert(&mut self, location: ItemPointer) {
        if let Some(kind) = self.rw_type(location) {
            panic!("insert into {} already recorded as {:?} in txn {}", location, kind, self.txn_id);
        }
        self.set_kind(location, RwType::Insert);
        self.insert_count += 1;
    }

    /// Returns true when the deleted tuple was this transaction's own insert
    pub fn record_delete(&mut self, location: ItemPointer) -> bool {
        match self.rw_type(location) {
            None | Some(RwType::Read) | Some(RwType::ReadOwn) | Some(RwType::Update) => {
                self.set_kind(location, RwType::Delete);
                false
            }
            Some(RwType::Insert) => {
                self.set_kind(location, RwType::InsDel);
                self.insert_count -= 1;
                true
            }
            Some(kind) => panic!("delete of {} after {:?} in txn {}", location, kind, self.txn_id),
        }
    }

    // ========================================================================
    // Shared Read Locks
    // ========================================================================

    /// Remember that the shared lock on `location` was given back; false if it already was
    pub(crate) fn mark_read_lock_released(&mut self, location: ItemPointer) -> bool {
        self.released_read_locks.insert(location)
    }

    pub(crate) fn read_lock_released(&self, location: ItemPointer) -> bool {
        self.released_read_locks.contains(&location)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished && self.epoch.is_some() {
            log::warn!(
                "txn {} dropped without commit or abort; releasing its epoch",
                self.txn_id
            );
        }
    }
}
