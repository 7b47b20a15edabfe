//! Serializable snapshot isolation
//!
//! Snapshot reads plus rw-antidependency tracking. Every read registers the
//! reader on the version (a SIREAD mark) and records an edge to whoever owns
//! or has already overwritten it; every ownership acquisition records edges
//! from the version's registered readers. A transaction that ends up with
//! both an incoming and an outgoing edge is refused at commit. Reads are not
//! validated otherwise.
//!
//! A mark is only useful while the tracker knows its reader. Aborts take
//! their marks back at once; committed readers keep theirs until the
//! tracker forgets them at collection.

use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::storage::extension::{ExtensionArena, ExtensionRef, SlotExtension};
use crate::storage::tile_group::{TileGroup, TileGroupHeader};
use crate::txn::conflict::ConflictTracker;
use crate::txn::context::Transaction;
use crate::txn::manager::{confirm_current, memory_fence, ManagerCore, TransactionManager};
use crate::types::{Cid, ItemPointer, Oid, ProtocolKind, RwType, TxnId, TxnResult, INITIAL_TXN_ID, INVALID_TXN_ID};

use super::ReaderList;

/// SIREAD marks and creator of one version
#[derive(Debug, Default)]
pub struct SsiExtension {
    readers: ReaderList,
    creator: AtomicU64,
}

impl SlotExtension for SsiExtension {
    fn reset(&self) {
        self.readers.reset();
        self.creator.store(INVALID_TXN_ID, Ordering::Release);
    }
}

pub struct SsiTxnManager {
    core: ManagerCore,
    extensions: ExtensionArena<SsiExtension>,
    tracker: ConflictTracker,
    /// Versions each committed reader still holds marks on
    committed_marks: Mutex<AHashMap<TxnId, Vec<ItemPointer>>>,
}

impl SsiTxnManager {
    pub fn new(core: ManagerCore) -> Self {
        Self {
            core,
            extensions: ExtensionArena::new(),
            tracker: ConflictTracker::new(),
            committed_marks: Mutex::new(AHashMap::new()),
        }
    }

    pub fn tracker(&self) -> &ConflictTracker {
        &self.tracker
    }

    fn extension(&self, group: &TileGroup, slot: Oid) -> ExtensionRef<SsiExtension> {
        match self.extensions.get(group, slot) {
            Some(ext) => ext,
            None => self.extensions.init(group, slot),
        }
    }

    /// SIREAD marks currently held on `location`
    pub fn siread_count(&self, location: ItemPointer) -> usize {
        let group = self.core.group(location);
        self.extensions
            .get(&group, location.offset)
            .map_or(0, |ext| ext.readers.with_locked(|readers| readers.len()))
    }

    fn clear_marks(&self, txn_id: TxnId, locations: &[ItemPointer]) {
        for location in locations {
            let Ok(group) = self.core.catalog().get_tile_group(location.block) else { continue };
            if let Some(ext) = self.extensions.get(&group, location.offset) {
                ext.readers.remove(txn_id);
            }
        }
    }

    /// Every version `txn` may have marked: a read can later turn into an
    /// ownership of the same version
    fn marked_locations(txn: &Transaction) -> Vec<ItemPointer> {
        txn.rw_entries()
            .into_iter()
            .filter(|(_, kind)| !matches!(kind, RwType::Insert | RwType::InsDel))
            .map(|(location, _)| location)
            .collect()
    }

    /// Transactions that own or created a version newer than `location`
    fn overwriters(&self, txn: &Transaction, location: ItemPointer) -> Vec<TxnId> {
        let mut writers = Vec::new();
        let group = self.core.group(location);
        let owner = group.header().transaction_id(location.offset);
        if owner != INITIAL_TXN_ID && owner != INVALID_TXN_ID && owner != txn.txn_id() {
            writers.push(owner);
        }

        let mut next = group.header().next_item_pointer(location.offset);
        while !next.is_null() {
            let Ok(newer) = self.core.catalog().get_tile_group(next.block) else { break };
            if let Some(ext) = self.extensions.get(&newer, next.offset) {
                let creator = ext.creator.load(Ordering::Acquire);
                if creator != INVALID_TXN_ID && creator != txn.txn_id() && !writers.contains(&creator) {
                    writers.push(creator);
                }
            }
            next = newer.header().next_item_pointer(next.offset);
        }
        writers
    }

    /// Registered readers of `location` and every older version still chained to it
    fn readers_of_chain(&self, location: ItemPointer) -> Vec<TxnId> {
        let mut readers = Vec::new();
        let mut current = location;
        while !current.is_null() {
            let Ok(group) = self.core.catalog().get_tile_group(current.block) else { break };
            if let Some(ext) = self.extensions.get(&group, current.offset) {
                for reader in ext.readers.snapshot() {
                    if !readers.contains(&reader) {
                        readers.push(reader);
                    }
                }
            }
            current = group.header().prev_item_pointer(current.offset);
        }
        readers
    }
}

impl TransactionManager for SsiTxnManager {
    fn core(&self) -> &ManagerCore {
        &self.core
    }

    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Ssi
    }

    fn init_version(&self, txn: &Transaction, group: &TileGroup, slot: Oid) {
        let ext = self.extensions.init(group, slot);
        ext.creator.store(txn.txn_id(), Ordering::Release);
    }

    fn acquire_ownership(&self, txn: &mut Transaction, header: &TileGroupHeader, slot: Oid) -> bool {
        if let Err(owner) = header.cas_transaction_id(slot, INITIAL_TXN_ID, txn.txn_id()) {
            log::debug!("txn {} lost ownership race on ({}, {}) to {}", txn.txn_id(), header.group_id(), slot, owner);
            txn.set_result(TxnResult::Failure);
            return false;
        }
        if !confirm_current(self, txn, header, slot) {
            return false;
        }
        memory_fence();

        let location = ItemPointer::new(header.group_id(), slot);
        let readers = self.readers_of_chain(location);
        if self.tracker.add_write_edges(txn.txn_id(), &readers) {
            log::debug!("txn {} doomed by an edge from a committed reader of {}", txn.txn_id(), location);
            let _ = header.cas_transaction_id(slot, txn.txn_id(), INITIAL_TXN_ID);
            txn.set_result(TxnResult::Failure);
            return false;
        }
        true
    }

    fn perform_read(&self, txn: &mut Transaction, location: ItemPointer, acquire_ownership: bool) -> bool {
        let group = self.core.group(location);
        let header = group.header();
        let slot = location.offset;

        if self.is_owner(txn, header, slot) {
            return true;
        }
        if acquire_ownership {
            if !self.is_ownable(txn, header, slot) || !self.acquire_ownership(txn, header, slot) {
                txn.set_result(TxnResult::Failure);
                return false;
            }
            txn.record_read_own(location);
            return true;
        }

        let ext = self.extension(&group, slot);
        ext.readers.add(txn.txn_id());
        memory_fence();

        let writers = self.overwriters(txn, location);
        if !writers.is_empty() && self.tracker.add_read_edges(txn.txn_id(), &writers) {
            log::debug!("txn {} doomed reading {}", txn.txn_id(), location);
            ext.readers.remove(txn.txn_id());
            txn.set_result(TxnResult::Failure);
            return false;
        }
        txn.record_read(location);
        true
    }

    fn begin_transaction(&self) -> Transaction {
        let txn = self.core.begin(false);
        self.tracker.register(txn.txn_id(), txn.begin_cid());
        txn
    }

    fn commit_transaction(&self, txn: &mut Transaction) -> TxnResult {
        let core = &self.core;
        if txn.result() == TxnResult::Failure {
            return self.abort_transaction(txn);
        }

        let read_only = txn.is_read_only();
        let verdict = self.tracker.try_commit(txn.txn_id(), || {
            if read_only {
                core.ids().current_commit_id()
            } else {
                core.ids().next_commit_id()
            }
        });
        let end_cid: Cid = match verdict {
            Ok(cid) => cid,
            Err(conflict) => {
                log::debug!("txn {} refused at commit: {:?}", txn.txn_id(), conflict);
                return self.abort_transaction(txn);
            }
        };

        let marked = Self::marked_locations(txn);
        if !marked.is_empty() {
            self.committed_marks.lock().insert(txn.txn_id(), marked);
        }

        if read_only {
            return core.end_transaction(txn, TxnResult::Success);
        }
        txn.set_end_cid(end_cid);
        core.install_write_set(txn, end_cid, self.chain_order());
        core.end_transaction(txn, TxnResult::Success)
    }

    fn abort_transaction(&self, txn: &mut Transaction) -> TxnResult {
        self.tracker.remove(txn.txn_id());
        self.clear_marks(txn.txn_id(), &Self::marked_locations(txn));
        self.core.rollback_write_set(txn, self.chain_order());
        self.core.end_transaction(txn, TxnResult::Aborted)
    }

    fn collect(&self, floor: Cid) {
        let dropped = self.tracker.collect(floor);
        if dropped.is_empty() {
            return;
        }
        let released: Vec<(TxnId, Vec<ItemPointer>)> = {
            let mut marks = self.committed_marks.lock();
            dropped
                .iter()
                .filter_map(|txn_id| marks.remove(txn_id).map(|locations| (*txn_id, locations)))
                .collect()
        };
        for (txn_id, locations) in &released {
            self.clear_marks(*txn_id, locations);
        }
        log::trace!("dropped {} committed SSI entries below cid {}", dropped.len(), floor);
    }
}
