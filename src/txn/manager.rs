//! Transaction Manager - the shared concurrency-control contract
//!
//! `TransactionManager` is implemented once per protocol. Its default
//! methods carry the snapshot skeleton every protocol starts from:
//! visibility by owner and `[begin, end)`, ownership by one CAS on the
//! owner word, and the version-creating writes. `ManagerCore` holds the
//! per-database collaborators and the phases a commit or abort is built
//! from (validate, install, roll back, end).
//!
//! Install discipline for an update committed at `c`:
//! ```text
//! new.end = MAX; new.begin = c      (new version becomes current at c)
//! fence
//! old.end = c                       (old version stops being current)
//! fence
//! new.owner = INITIAL; old.owner = INITIAL
//! ```

use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

use crate::data::Row;
use crate::storage::catalog::Catalog;
use crate::storage::index_entry::IndexEntry;
use crate::storage::mvcc::{EpochManager, GarbageCollector, IdAllocator, SegmentDirectory, SegmentRef};
use crate::storage::tile_group::{TileGroup, TileGroupHeader};
use crate::storage::wal::CommitLog;
use crate::types::{
    Cid, ItemPointer, Oid, ProtocolKind, RwType, TxnId, TxnResult, Visibility, INITIAL_TXN_ID,
    INVALID_CID, INVALID_TXN_ID, MAX_CID, MAX_TXN_ID,
};

use super::context::Transaction;

/// Full fence between header stores that readers must observe in order
#[inline]
pub(crate) fn memory_fence() {
    fence(Ordering::SeqCst);
}

// ============================================================================
// Version Chain Direction
// ============================================================================

/// Which way `next` points in a version chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOrder {
    /// `old.next = new`, `new.prev = old`; the index keeps the oldest
    /// surviving version
    OldToNew,
    /// `new.next = old`, `old.prev = new`; the index is swung to the newest
    NewToOld,
}

impl ChainOrder {
    /// The version created from the one at `slot`
    pub fn newer(self, header: &TileGroupHeader, slot: Oid) -> ItemPointer {
        match self {
            ChainOrder::OldToNew => header.next_item_pointer(slot),
            ChainOrder::NewToOld => header.prev_item_pointer(slot),
        }
    }

    /// The version the one at `slot` was created from
    pub fn older(self, header: &TileGroupHeader, slot: Oid) -> ItemPointer {
        match self {
            ChainOrder::OldToNew => header.prev_item_pointer(slot),
            ChainOrder::NewToOld => header.next_item_pointer(slot),
        }
    }
}

// ============================================================================
// Snapshot Visibility
// ============================================================================

/// Visibility of a version from its owner and interval, as seen by `txn`
pub fn snapshot_visibility(txn: &Transaction, owner: TxnId, begin: Cid, end: Cid) -> Visibility {
    let read_ts = txn.begin_cid();
    let in_interval = begin <= read_ts && read_ts < end;

    if owner == INVALID_TXN_ID {
        // Aborted version, free slot, or committed tombstone
        return if in_interval { Visibility::Deleted } else { Visibility::Invisible };
    }

    if owner == txn.txn_id() {
        if begin == MAX_CID && end != INVALID_CID {
            return Visibility::Ok;
        }
        if end == INVALID_CID {
            return Visibility::Deleted;
        }
        // The committed version this transaction is replacing
        return Visibility::Invisible;
    }

    if owner != INITIAL_TXN_ID && begin == MAX_CID {
        // Someone else's uncommitted version
        return Visibility::Invisible;
    }

    if in_interval {
        Visibility::Ok
    } else {
        Visibility::Invisible
    }
}

/// Called right after winning the owner CAS. A commit that retired the
/// version between the caller's ownable check and the CAS has already
/// stamped it, so the ownership is handed back and the caller fails.
pub(crate) fn confirm_current<M: TransactionManager + ?Sized>(
    manager: &M,
    txn: &mut Transaction,
    header: &TileGroupHeader,
    slot: Oid,
) -> bool {
    if manager.is_current(txn, header, slot) {
        return true;
    }
    log::debug!(
        "txn {} owned ({}, {}) after it was overwritten",
        txn.txn_id(),
        header.group_id(),
        slot
    );
    let _ = header.cas_transaction_id(slot, txn.txn_id(), INITIAL_TXN_ID);
    txn.set_result(TxnResult::Failure);
    false
}

// ============================================================================
// Manager Core
// ============================================================================

/// Collaborators one database shares among all transactions, plus the
/// commit/abort phases every protocol composes
pub struct ManagerCore {
    catalog: Arc<Catalog>,
    epochs: Arc<EpochManager>,
    segments: Arc<SegmentDirectory>,
    gc: Arc<GarbageCollector>,
    log: Option<Arc<dyn CommitLog>>,
    /// Total committed transactions (for monitoring)
    total_committed: AtomicU64,
    /// Total aborted transactions (for monitoring)
    total_aborted: AtomicU64,
    /// Commits that took the read-only path
    total_read_only: AtomicU64,
}

impl ManagerCore {
    pub fn new(
        catalog: Arc<Catalog>,
        epochs: Arc<EpochManager>,
        segments: Arc<SegmentDirectory>,
        gc: Arc<GarbageCollector>,
        log: Option<Arc<dyn CommitLog>>,
    ) -> Self {
        Self {
            catalog,
            epochs,
            segments,
            gc,
            log,
            total_committed: AtomicU64::new(0),
            total_aborted: AtomicU64::new(0),
            total_read_only: AtomicU64::new(0),
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn epochs(&self) -> &Arc<EpochManager> {
        &self.epochs
    }

    pub fn ids(&self) -> &IdAllocator {
        self.epochs.id_allocator()
    }

    pub fn segments(&self) -> &Arc<SegmentDirectory> {
        &self.segments
    }

    pub fn gc(&self) -> &Arc<GarbageCollector> {
        &self.gc
    }

    pub(crate) fn log(&self) -> Option<&dyn CommitLog> {
        self.log.as_deref()
    }

    pub fn total_committed(&self) -> u64 {
        self.total_committed.load(Ordering::Relaxed)
    }

    pub fn total_aborted(&self) -> u64 {
        self.total_aborted.load(Ordering::Relaxed)
    }

    pub fn total_read_only(&self) -> u64 {
        self.total_read_only.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn group(&self, location: ItemPointer) -> Arc<TileGroup> {
        self.catalog.group_of(location)
    }

    // ========================================================================
    // Begin
    // ========================================================================

    /// Register in the current epoch, then draw the begin timestamp and id
    pub fn begin(&self, with_rollback_pool: bool) -> Transaction {
        let (guard, begin_cid) = self.epochs.enter();
        let txn_id = self.ids().next_transaction_id();
        assert!(txn_id <= MAX_TXN_ID, "transaction id space exhausted");

        let mut txn = Transaction::new(txn_id, begin_cid, guard);
        if with_rollback_pool {
            txn.set_rollback_pool(self.segments.create_pool());
        }
        log::debug!("txn {} begins at cid {}", txn_id, begin_cid);
        txn
    }

    // ========================================================================
    // Version Creation
    // ========================================================================

    /// Claim a free slot for a version `txn` is inserting
    pub(crate) fn claim_inserted(&self, txn: &Transaction, group: &TileGroup, slot: Oid) {
        let header = group.header();
        assert_eq!(
            header.transaction_id(slot),
            INVALID_TXN_ID,
            "slot ({}, {}) is not free",
            group.id(),
            slot
        );
        header.set_begin_commit_id(slot, MAX_CID);
        header.set_end_commit_id(slot, MAX_CID);
        header.set_transaction_id(slot, txn.txn_id());
    }

    /// Set up `new` as the uncommitted successor of `old` and link the two
    pub(crate) fn link_new_version(
        &self,
        txn: &Transaction,
        old: ItemPointer,
        new: ItemPointer,
        chain: ChainOrder,
        tombstone: bool,
    ) {
        let old_group = self.group(old);
        let new_group = self.group(new);
        let oh = old_group.header();
        let nh = new_group.header();

        self.claim_inserted(txn, &new_group, new.offset);
        if tombstone {
            nh.set_end_commit_id(new.offset, INVALID_CID);
        }

        // The new version's back link goes first so a reader that follows
        // the forward link always finds a consistent pair
        match chain {
            ChainOrder::OldToNew => {
                nh.set_prev_item_pointer(new.offset, old);
                oh.set_next_item_pointer(old.offset, new);
            }
            ChainOrder::NewToOld => {
                nh.set_next_item_pointer(new.offset, old);
                oh.set_prev_item_pointer(old.offset, new);
            }
        }
    }

    // ========================================================================
    // Validation
    // ========================================================================

    /// Every non-insert entry is still owned by `txn`, or still the current
    /// committed version at `at`
    pub fn validate_reads(&self, txn: &Transaction, at: Cid) -> bool {
        for (location, kind) in txn.rw_entries() {
            if matches!(kind, RwType::Insert | RwType::InsDel) {
                continue;
            }
            let group = self.group(location);
            let header = group.header();
            let slot = location.offset;

            let owner = header.transaction_id(slot);
            if owner == txn.txn_id() {
                continue;
            }
            if owner == INITIAL_TXN_ID
                && header.begin_commit_id(slot) <= txn.begin_cid()
                && at < header.end_commit_id(slot)
            {
                continue;
            }
            log::debug!("txn {} fails validation on {} at cid {}", txn.txn_id(), location, at);
            return false;
        }
        true
    }

    // ========================================================================
    // Install
    // ========================================================================

    /// Make every write of `txn` current as of `end_cid` and release ownership
    pub fn install_write_set(&self, txn: &Transaction, end_cid: Cid, chain: ChainOrder) {
        let log = self.log();
        if let Some(log) = log {
            log.log_begin(end_cid);
        }

        for (location, kind) in txn.rw_entries() {
            let group = self.group(location);
            let header = group.header();
            let slot = location.offset;

            match kind {
                RwType::Read => {}
                RwType::ReadOwn => {
                    header.set_transaction_id(slot, INITIAL_TXN_ID);
                }
                RwType::Update | RwType::Delete => {
                    let new = chain.newer(header, slot);
                    assert!(!new.is_null(), "{} of {} has no new version", kind_name(kind), location);
                    let new_group = self.group(new);
                    let nh = new_group.header();

                    nh.set_end_commit_id(new.offset, MAX_CID);
                    nh.set_begin_commit_id(new.offset, end_cid);
                    memory_fence();
                    header.set_end_commit_id(slot, end_cid);
                    memory_fence();

                    if kind == RwType::Update {
                        nh.set_transaction_id(new.offset, INITIAL_TXN_ID);
                        header.set_transaction_id(slot, INITIAL_TXN_ID);
                        if let Some(log) = log {
                            log.log_update(end_cid, location, new);
                        }
                    } else {
                        nh.set_transaction_id(new.offset, INVALID_TXN_ID);
                        header.set_transaction_id(slot, INITIAL_TXN_ID);
                        if let Some(log) = log {
                            log.log_delete(end_cid, location);
                        }
                        self.gc.recycle(new, end_cid);
                    }
                    self.gc.recycle(location, end_cid);
                }
                RwType::Insert => {
                    header.set_end_commit_id(slot, MAX_CID);
                    header.set_begin_commit_id(slot, end_cid);
                    memory_fence();
                    header.set_transaction_id(slot, INITIAL_TXN_ID);
                    if let Some(log) = log {
                        log.log_insert(end_cid, location);
                    }
                }
                RwType::InsDel => {
                    header.set_begin_commit_id(slot, MAX_CID);
                    header.set_end_commit_id(slot, MAX_CID);
                    memory_fence();
                    header.set_transaction_id(slot, INVALID_TXN_ID);
                    self.gc.recycle(location, end_cid);
                }
            }
        }

        if let Some(log) = log {
            log.log_commit(end_cid);
        }
    }

    // ========================================================================
    // Rollback
    // ========================================================================

    /// Return every slot `txn` touched to its state before the transaction
    pub fn rollback_write_set(&self, txn: &Transaction, chain: ChainOrder) {
        let retire_cid = self.ids().current_commit_id();

        for (location, kind) in txn.rw_entries() {
            let group = self.group(location);
            let header = group.header();
            let slot = location.offset;

            match kind {
                RwType::Read => {}
                RwType::ReadOwn => {
                    header.set_transaction_id(slot, INITIAL_TXN_ID);
                }
                RwType::Update | RwType::Delete => {
                    let new = chain.newer(header, slot);
                    if !new.is_null() {
                        let new_group = self.group(new);
                        let nh = new_group.header();
                        nh.set_begin_commit_id(new.offset, MAX_CID);
                        nh.set_end_commit_id(new.offset, MAX_CID);
                        memory_fence();
                        nh.set_transaction_id(new.offset, INVALID_TXN_ID);

                        match chain {
                            ChainOrder::OldToNew => {
                                header.set_next_item_pointer(slot, ItemPointer::NULL);
                                nh.set_prev_item_pointer(new.offset, ItemPointer::NULL);
                            }
                            ChainOrder::NewToOld => {
                                header.set_prev_item_pointer(slot, ItemPointer::NULL);
                                nh.set_next_item_pointer(new.offset, ItemPointer::NULL);
                            }
                        }
                        self.gc.recycle(new, retire_cid);
                    }
                    header.set_end_commit_id(slot, MAX_CID);
                    memory_fence();
                    header.set_transaction_id(slot, INITIAL_TXN_ID);
                }
                RwType::Insert | RwType::InsDel => {
                    header.set_begin_commit_id(slot, MAX_CID);
                    header.set_end_commit_id(slot, MAX_CID);
                    memory_fence();
                    header.set_transaction_id(slot, INVALID_TXN_ID);
                    self.gc.recycle(location, retire_cid);
                }
            }
        }
    }

    // ========================================================================
    // End
    // ========================================================================

    /// Release the epoch and rollback pool, record the outcome
    pub fn end_transaction(&self, txn: &mut Transaction, result: TxnResult) -> TxnResult {
        assert!(!txn.is_finished(), "txn {} ended twice", txn.txn_id());

        drop(txn.take_epoch());
        if let Some(pool) = txn.take_rollback_pool() {
            if result == TxnResult::Success && txn.end_cid() != MAX_CID {
                self.segments.retain(&pool, txn.end_cid());
            } else {
                self.segments.mark_garbage(&pool, self.ids().current_commit_id());
            }
        }

        txn.set_result(result);
        txn.mark_finished();

        match result {
            TxnResult::Success => {
                self.total_committed.fetch_add(1, Ordering::Relaxed);
                if txn.is_read_only() {
                    self.total_read_only.fetch_add(1, Ordering::Relaxed);
                }
                log::debug!("txn {} committed at cid {}", txn.txn_id(), txn.end_cid());
            }
            _ => {
                self.total_aborted.fetch_add(1, Ordering::Relaxed);
                log::debug!("txn {} aborted", txn.txn_id());
            }
        }
        result
    }
}

fn kind_name(kind: RwType) -> &'static str {
    match kind {
        RwType::Delete => "delete",
        _ => "update",
    }
}

// ============================================================================
// Transaction Manager Trait
// ============================================================================

/// The concurrency-control contract an executor drives
///
/// Executors look up a version with `find_visible_version`/`is_visible`,
/// read it with `perform_read`, write it by taking ownership and calling a
/// `perform_*` method, and finish with `commit_transaction` or
/// `abort_transaction`. A `false` return or a `Failure` result means the
/// transaction lost a race and must be aborted.
pub trait TransactionManager: Send + Sync {
    fn core(&self) -> &ManagerCore;

    fn protocol(&self) -> ProtocolKind;

    fn chain_order(&self) -> ChainOrder {
        ChainOrder::OldToNew
    }

    /// Whether updates happen in place with rollback segments
    fn uses_rollback_segments(&self) -> bool {
        false
    }

    /// Owning transaction of a slot, with any protocol bits masked off
    fn owner_of(&self, header: &TileGroupHeader, slot: Oid) -> TxnId {
        header.transaction_id(slot)
    }

    /// Protocol metadata for a version that is being created
    fn init_version(&self, _txn: &Transaction, _group: &TileGroup, _slot: Oid) {}

    // ========================================================================
    // Visibility / Ownership
    // ========================================================================

    fn is_visible(&self, txn: &Transaction, header: &TileGroupHeader, slot: Oid) -> Visibility {
        let owner = self.owner_of(header, slot);
        let begin = header.begin_commit_id(slot);
        let end = header.end_commit_id(slot);

        // Owned committed version: current until txn links a successor
        if owner == txn.txn_id() && begin != MAX_CID && end == MAX_CID {
            return if self.chain_order().newer(header, slot).is_null() {
                Visibility::Ok
            } else {
                Visibility::Invisible
            };
        }
        snapshot_visibility(txn, owner, begin, end)
    }

    fn is_owner(&self, txn: &Transaction, header: &TileGroupHeader, slot: Oid) -> bool {
        self.owner_of(header, slot) == txn.txn_id()
    }

    /// The version is the newest one `txn` may overwrite
    fn is_current(&self, _txn: &Transaction, header: &TileGroupHeader, slot: Oid) -> bool {
        header.end_commit_id(slot) == MAX_CID
    }

    /// Nobody owns the version and it is current
    fn is_ownable(&self, txn: &Transaction, header: &TileGroupHeader, slot: Oid) -> bool {
        self.owner_of(header, slot) == INITIAL_TXN_ID && self.is_current(txn, header, slot)
    }

    fn acquire_ownership(&self, txn: &mut Transaction, header: &TileGroupHeader, slot: Oid) -> bool {
        match header.cas_transaction_id(slot, INITIAL_TXN_ID, txn.txn_id()) {
            Ok(_) => confirm_current(self, txn, header, slot),
            Err(owner) => {
                log::debug!(
                    "txn {} lost ownership race on ({}, {}) to {}",
                    txn.txn_id(),
                    header.group_id(),
                    slot,
                    owner
                );
                txn.set_result(TxnResult::Failure);
                false
            }
        }
    }

    /// Give back an ownership that was acquired but not used
    fn yield_ownership(&self, txn: &mut Transaction, location: ItemPointer) {
        let group = self.core().group(location);
        let _ = group
            .header()
            .cas_transaction_id(location.offset, txn.txn_id(), INITIAL_TXN_ID);
    }

    // ========================================================================
    // Reads and Writes
    // ========================================================================

    fn perform_read(&self, txn: &mut Transaction, location: ItemPointer, acquire_ownership: bool) -> bool {
        let group = self.core().group(location);
        let header = group.header();
        let slot = location.offset;

        if self.is_owner(txn, header, slot) {
            return true;
        }
        if acquire_ownership {
            if !self.is_ownable(txn, header, slot) {
                txn.set_result(TxnResult::Failure);
                return false;
            }
            if !self.acquire_ownership(txn, header, slot) {
                return false;
            }
            txn.record_read_own(location);
        } else {
            txn.record_read(location);
        }
        true
    }

    /// `index_entry` is the cell the executor's index holds for the new
    /// tuple; it is remembered on the slot so the entry can be moved when
    /// the slot it points at is garbage-collected
    fn perform_insert(&self, txn: &mut Transaction, location: ItemPointer, index_entry: Option<Arc<IndexEntry>>) {
        let group = self.core().group(location);
        group.set_index_entry(location.offset, index_entry);
        self.init_version(txn, &group, location.offset);
        self.core().claim_inserted(txn, &group, location.offset);
        txn.record_insert(location);
    }

    /// `new` becomes the uncommitted successor of `old`, which `txn` owns
    fn perform_update(&self, txn: &mut Transaction, old: ItemPointer, new: ItemPointer) {
        let core = self.core();
        let old_group = core.group(old);
        assert!(
            self.is_owner(txn, old_group.header(), old.offset),
            "txn {} updates {} without owning it",
            txn.txn_id(),
            old
        );
        self.init_version(txn, &core.group(new), new.offset);
        core.link_new_version(txn, old, new, self.chain_order(), false);
        txn.record_update(old);
    }

    /// Further update of a version `txn` created itself
    fn perform_update_in_place(&self, txn: &mut Transaction, location: ItemPointer) {
        let group = self.core().group(location);
        let header = group.header();
        assert!(self.is_owner(txn, header, location.offset), "txn {} does not own {}", txn.txn_id(), location);
        assert_eq!(
            header.begin_commit_id(location.offset),
            MAX_CID,
            "in-place update of committed version {}",
            location
        );
        if txn.rw_type(location) != Some(RwType::Insert) {
            let older = self.chain_order().older(header, location.offset);
            if !older.is_null() {
                txn.record_update(older);
            }
        }
    }

    /// `new` becomes an uncommitted tombstone succeeding `old`
    fn perform_delete(&self, txn: &mut Transaction, old: ItemPointer, new: ItemPointer) {
        let core = self.core();
        let old_group = core.group(old);
        assert!(
            self.is_owner(txn, old_group.header(), old.offset),
            "txn {} deletes {} without owning it",
            txn.txn_id(),
            old
        );
        self.init_version(txn, &core.group(new), new.offset);
        core.link_new_version(txn, old, new, self.chain_order(), true);
        txn.record_delete(old);
    }

    /// Delete a version `txn` created itself
    fn perform_delete_in_place(&self, txn: &mut Transaction, location: ItemPointer) {
        let group = self.core().group(location);
        let header = group.header();
        assert!(self.is_owner(txn, header, location.offset), "txn {} does not own {}", txn.txn_id(), location);
        assert_eq!(
            header.begin_commit_id(location.offset),
            MAX_CID,
            "in-place delete of committed version {}",
            location
        );
        header.set_end_commit_id(location.offset, INVALID_CID);
        if txn.rw_type(location) == Some(RwType::Insert) {
            txn.record_delete(location);
        } else {
            let older = self.chain_order().older(header, location.offset);
            assert!(!older.is_null(), "{} has no older version", location);
            txn.record_delete(older);
        }
    }

    /// In-place update guarded by a rollback segment (rollback-segment protocol only)
    fn perform_update_with_rb(&self, _txn: &mut Transaction, _location: ItemPointer, _segment: SegmentRef) {
        panic!("{} protocol does not keep rollback segments", self.protocol());
    }

    /// In-place delete (rollback-segment protocol only)
    fn perform_delete_with_rb(&self, _txn: &mut Transaction, _location: ItemPointer) {
        panic!("{} protocol does not keep rollback segments", self.protocol());
    }

    // ========================================================================
    // Transaction Lifecycle
    // ========================================================================

    fn begin_transaction(&self) -> Transaction {
        self.core().begin(self.uses_rollback_segments())
    }

    /// Optimistic commit: validate the read set, then install
    fn commit_transaction(&self, txn: &mut Transaction) -> TxnResult {
        let core = self.core();
        if txn.result() == TxnResult::Failure {
            return self.abort_transaction(txn);
        }

        if txn.is_read_only() {
            let at = core.ids().current_commit_id();
            if !core.validate_reads(txn, at) {
                return self.abort_transaction(txn);
            }
            return core.end_transaction(txn, TxnResult::Success);
        }

        let end_cid = core.ids().next_commit_id();
        txn.set_end_cid(end_cid);
        if !core.validate_reads(txn, end_cid) {
            return self.abort_transaction(txn);
        }
        core.install_write_set(txn, end_cid, self.chain_order());
        core.end_transaction(txn, TxnResult::Success)
    }

    fn abort_transaction(&self, txn: &mut Transaction) -> TxnResult {
        let core = self.core();
        core.rollback_write_set(txn, self.chain_order());
        core.end_transaction(txn, TxnResult::Aborted)
    }

    // ========================================================================
    // Lookup Helpers
    // ========================================================================

    /// Walk a chain from `head` along `next` to the first version `txn`
    /// sees as `Ok` or `Deleted`
    fn find_visible_version(&self, txn: &Transaction, head: ItemPointer) -> Option<(ItemPointer, Visibility)> {
        let mut location = head;
        while !location.is_null() {
            let group = self.core().catalog().get_tile_group(location.block).ok()?;
            let header = group.header();
            match self.is_visible(txn, header, location.offset) {
                Visibility::Invisible => location = header.next_item_pointer(location.offset),
                visibility => return Some((location, visibility)),
            }
        }
        None
    }

    /// The values `txn` sees at `location`, if any
    fn read_tuple(&self, txn: &Transaction, location: ItemPointer) -> Option<Row> {
        let group = self.core().group(location);
        match self.is_visible(txn, group.header(), location.offset) {
            Visibility::Ok => Some(group.read_row(location.offset)),
            _ => None,
        }
    }

    /// Drop protocol bookkeeping nobody at or above `floor` can need
    fn collect(&self, _floor: Cid) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mvcc::EpochConfig;

    fn txn_at(id: TxnId) -> Transaction {
        let em = Arc::new(EpochManager::new(EpochConfig::default(), Arc::new(IdAllocator::new())));
        for _ in 0..9 {
            em.id_allocator().next_commit_id();
        }
        let (guard, _) = em.enter();
        // begin cid is 10
        Transaction::new(id, 10, guard)
    }

    #[test]
    fn test_visibility_uncontended() {
        let t = txn_at(5);
        assert_eq!(snapshot_visibility(&t, INITIAL_TXN_ID, 3, MAX_CID), Visibility::Ok);
        assert_eq!(snapshot_visibility(&t, INITIAL_TXN_ID, 10, 12), Visibility::Ok);
        assert_eq!(snapshot_visibility(&t, INITIAL_TXN_ID, 3, 10), Visibility::Invisible);
        assert_eq!(snapshot_visibility(&t, INITIAL_TXN_ID, 11, MAX_CID), Visibility::Invisible);
    }

    #[test]
    fn test_visibility_own_versions() {
        let t = txn_at(5);
        // new version
        assert_eq!(snapshot_visibility(&t, 5, MAX_CID, MAX_CID), Visibility::Ok);
        // tentatively deleted
        assert_eq!(snapshot_visibility(&t, 5, MAX_CID, INVALID_CID), Visibility::Deleted);
        // the committed version being replaced
        assert_eq!(snapshot_visibility(&t, 5, 3, MAX_CID), Visibility::Invisible);
    }

    #[test]
    fn test_visibility_other_owner() {
        let t = txn_at(5);
        // uncommitted insert by someone else
        assert_eq!(snapshot_visibility(&t, 9, MAX_CID, MAX_CID), Visibility::Invisible);
        // committed version someone else is updating
        assert_eq!(snapshot_visibility(&t, 9, 3, MAX_CID), Visibility::Ok);
    }

    #[test]
    fn test_visibility_invalid_owner() {
        let t = txn_at(5);
        // committed tombstone
        assert_eq!(snapshot_visibility(&t, INVALID_TXN_ID, 4, MAX_CID), Visibility::Deleted);
        // free or aborted slot
        assert_eq!(snapshot_visibility(&t, INVALID_TXN_ID, MAX_CID, MAX_CID), Visibility::Invisible);
    }

    #[test]
    fn test_chain_order_neighbours() {
        let header = TileGroupHeader::new(0, 2);
        let a = ItemPointer::new(0, 0);
        let b = ItemPointer::new(0, 1);
        header.set_next_item_pointer(0, b);
        header.set_prev_item_pointer(1, a);
        assert_eq!(ChainOrder::OldToNew.newer(&header, 0), b);
        assert_eq!(ChainOrder::OldToNew.older(&header, 1), a);
        assert_eq!(ChainOrder::NewToOld.older(&header, 0), b);
        assert_eq!(ChainOrder::NewToOld.newer(&header, 1), a);
    }
}
