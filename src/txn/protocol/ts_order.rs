//! Timestamp-ordering protocol
//!
//! Transactions are serialized in begin-timestamp order. Every version
//! remembers the latest begin timestamp that read it; a writer whose own
//! timestamp is older than that reader is refused. Reads of a version that
//! another transaction owns are refused too. Commits stamp their versions
//! with the transaction's begin timestamp, and no commit id is drawn.
//!
//! Versions chain new-to-old and the index entry of a tuple always points
//! at the newest one, so updates swing it forward and aborts swing it back.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::storage::extension::{ExtensionArena, ExtensionRef, SlotExtension};
use crate::storage::index_entry::IndexEntry;
use crate::storage::tile_group::{TileGroup, TileGroupHeader};
use crate::txn::context::Transaction;
use crate::txn::manager::{confirm_current, ChainOrder, ManagerCore, TransactionManager};
use crate::types::{Cid, ItemPointer, Oid, ProtocolKind, RwType, TxnResult, INITIAL_TXN_ID};

/// Per-version metadata; the mutex doubles as the version's spinlock
#[derive(Debug, Default)]
pub struct TsExtension {
    last_reader_cid: Mutex<Cid>,
}

impl TsExtension {
    pub fn last_reader_cid(&self) -> Cid {
        *self.last_reader_cid.lock()
    }
}

impl SlotExtension for TsExtension {
    fn reset(&self) {
        *self.last_reader_cid.lock() = 0;
    }
}

pub struct TsOrderTxnManager {
    core: ManagerCore,
    extensions: ExtensionArena<TsExtension>,
}

impl TsOrderTxnManager {
    pub fn new(core: ManagerCore) -> Self {
        Self { core, extensions: ExtensionArena::new() }
    }

    fn extension(&self, group: &TileGroup, slot: Oid) -> ExtensionRef<TsExtension> {
        match self.extensions.get(group, slot) {
            Some(ext) => ext,
            None => self.extensions.init(group, slot),
        }
    }

    /// Last reader timestamp recorded on a version (0 if never read)
    pub fn last_reader_cid(&self, location: ItemPointer) -> Cid {
        let group = self.core.group(location);
        self.extensions
            .get(&group, location.offset)
            .map(|ext| ext.last_reader_cid())
            .unwrap_or(0)
    }

    /// Swing the index entry of `from` to `to`, carrying the back-pointer along
    fn move_index_entry(&self, from: ItemPointer, to: ItemPointer) {
        let from_group = self.core.group(from);
        if let Some(entry) = from_group.index_entry(from.offset) {
            let to_group = self.core.group(to);
            to_group.set_index_entry(to.offset, Some(Arc::clone(&entry)));
            entry.compare_and_swap(from, to);
        }
    }

    fn perform_version_write(&self, txn: &mut Transaction, old: ItemPointer, new: ItemPointer, tombstone: bool) {
        let old_group = self.core.group(old);
        assert!(
            self.is_owner(txn, old_group.header(), old.offset),
            "txn {} writes {} without owning it",
            txn.txn_id(),
            old
        );
        let new_group = self.core.group(new);
        self.extensions.init(&new_group, new.offset);
        self.core.link_new_version(txn, old, new, ChainOrder::NewToOld, tombstone);
        self.move_index_entry(old, new);
        if tombstone {
            txn.record_delete(old);
        } else {
            txn.record_update(old);
        }
    }
}

impl TransactionManager for TsOrderTxnManager {
    fn core(&self) -> &ManagerCore {
        &self.core
    }

    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::TimestampOrdering
    }

    fn chain_order(&self) -> ChainOrder {
        ChainOrder::NewToOld
    }

    fn init_version(&self, _txn: &Transaction, group: &TileGroup, slot: Oid) {
        self.extensions.init(group, slot);
    }

    fn acquire_ownership(&self, txn: &mut Transaction, header: &TileGroupHeader, slot: Oid) -> bool {
        let location = ItemPointer::new(header.group_id(), slot);
        let group = self.core.group(location);
        let ext = self.extension(&group, slot);
        let last_reader_cid = ext.last_reader_cid.lock();

        if *last_reader_cid > txn.begin_cid() {
            log::debug!(
                "txn {} (ts {}) cannot write {}: read at ts {}",
                txn.txn_id(),
                txn.begin_cid(),
                location,
                *last_reader_cid
            );
            txn.set_result(TxnResult::Failure);
            return false;
        }
        if header.cas_transaction_id(slot, INITIAL_TXN_ID, txn.txn_id()).is_err() {
            txn.set_result(TxnResult::Failure);
            return false;
        }
        confirm_current(self, txn, header, slot)
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

        {
            let ext = self.extension(&group, slot);
            let mut last_reader_cid = ext.last_reader_cid.lock();
            if header.transaction_id(slot) != INITIAL_TXN_ID {
                log::trace!("txn {} cannot read owned version {}", txn.txn_id(), location);
                return false;
            }
            *last_reader_cid = (*last_reader_cid).max(txn.begin_cid());
        }
        txn.record_read(location);
        true
    }

    fn perform_insert(&self, txn: &mut Transaction, location: ItemPointer, index_entry: Option<Arc<IndexEntry>>) {
        let group = self.core.group(location);
        self.extensions.init(&group, location.offset);
        group.set_index_entry(location.offset, index_entry);
        self.core.claim_inserted(txn, &group, location.offset);
        txn.record_insert(location);
    }

    fn perform_update(&self, txn: &mut Transaction, old: ItemPointer, new: ItemPointer) {
        self.perform_version_write(txn, old, new, false);
    }

    fn perform_delete(&self, txn: &mut Transaction, old: ItemPointer, new: ItemPointer) {
        self.perform_version_write(txn, old, new, true);
    }

    fn commit_transaction(&self, txn: &mut Transaction) -> TxnResult {
        if txn.result() == TxnResult::Failure {
            return self.abort_transaction(txn);
        }
        if txn.is_read_only() {
            return self.core.end_transaction(txn, TxnResult::Success);
        }

        let end_cid = txn.begin_cid();
        txn.set_end_cid(end_cid);
        self.core.install_write_set(txn, end_cid, ChainOrder::NewToOld);
        self.core.end_transaction(txn, TxnResult::Success)
    }

    fn abort_transaction(&self, txn: &mut Transaction) -> TxnResult {
        for (location, kind) in txn.rw_entries() {
            if !matches!(kind, RwType::Update | RwType::Delete) {
                continue;
            }
            let group = self.core.group(location);
            let new = ChainOrder::NewToOld.newer(group.header(), location.offset);
            if !new.is_null() {
                self.move_index_entry(new, location);
            }
        }
        self.core.rollback_write_set(txn, ChainOrder::NewToOld);
        self.core.end_transaction(txn, TxnResult::Aborted)
    }
}
