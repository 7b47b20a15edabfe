//! Eager-write protocol - writers wait for earlier readers at commit
//!
//! Readers register on the version they read. A writer takes ownership
//! right away, even of a version others are reading, and records a
//! dependency on each of those readers; its commit then waits until every
//! such reader has finished. Conflicts are resolved wait-die: a writer
//! younger than a running reader aborts instead of waiting, so waits only
//! ever point from older to younger transactions and cannot form a cycle.
//! Reads of a version another transaction owns fail.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use crossbeam_utils::Backoff;
use parking_lot::{Mutex, RwLock};

use crate::storage::extension::{ExtensionArena, ExtensionRef, SlotExtension};
use crate::storage::tile_group::{TileGroup, TileGroupHeader};
use crate::txn::context::Transaction;
use crate::txn::manager::{ManagerCore, TransactionManager};
use crate::types::{ItemPointer, Oid, ProtocolKind, RwType, TxnId, TxnResult, INITIAL_TXN_ID};

use super::ReaderList;

/// Wait-for bookkeeping of one running transaction
#[derive(Debug, Default)]
struct EagerContext {
    /// Readers this transaction must outlive before committing
    waiting_for: AtomicUsize,
    /// Writers waiting for this transaction
    dependents: Mutex<Vec<TxnId>>,
    finished: AtomicBool,
}

pub struct EagerWriteTxnManager {
    core: ManagerCore,
    extensions: ExtensionArena<ReaderList>,
    running: RwLock<AHashMap<TxnId, Arc<EagerContext>>>,
}

impl EagerWriteTxnManager {
    pub fn new(core: ManagerCore) -> Self {
        Self {
            core,
            extensions: ExtensionArena::new(),
            running: RwLock::new(AHashMap::new()),
        }
    }

    fn extension(&self, group: &TileGroup, slot: Oid) -> ExtensionRef<ReaderList> {
        match self.extensions.get(group, slot) {
            Some(ext) => ext,
            None => self.extensions.init(group, slot),
        }
    }

    fn context(&self, txn_id: TxnId) -> Option<Arc<EagerContext>> {
        self.running.read().get(&txn_id).cloned()
    }

    /// Readers the commit of `txn_id` is still waiting for
    pub fn waiting_for(&self, txn_id: TxnId) -> usize {
        self.context(txn_id)
            .map_or(0, |ctx| ctx.waiting_for.load(Ordering::Acquire))
    }

    pub fn running_count(&self) -> usize {
        self.running.read().len()
    }

    /// Make `writer` wait for `reader`; false if the reader already finished
    fn add_dependency(reader: &EagerContext, writer: &EagerContext, writer_id: TxnId) -> bool {
        let mut dependents = reader.dependents.lock();
        if reader.finished.load(Ordering::Acquire) {
            return false;
        }
        dependents.push(writer_id);
        writer.waiting_for.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Deregister from every version read and release waiting writers
    fn finish(&self, txn: &Transaction) {
        for (location, kind) in txn.rw_entries() {
            if kind != RwType::Read {
                continue;
            }
            let group = self.core.group(location);
            if let Some(readers) = self.extensions.get(&group, location.offset) {
                readers.remove(txn.txn_id());
            }
        }

        let Some(ctx) = self.running.write().remove(&txn.txn_id()) else { return };
        let dependents = {
            let mut dependents = ctx.dependents.lock();
            ctx.finished.store(true, Ordering::Release);
            std::mem::take(&mut *dependents)
        };
        for writer in dependents {
            if let Some(waiting) = self.context(writer) {
                waiting.waiting_for.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

impl TransactionManager for EagerWriteTxnManager {
    fn core(&self) -> &ManagerCore {
        &self.core
    }

    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::EagerWrite
    }

    fn init_version(&self, _txn: &Transaction, group: &TileGroup, slot: Oid) {
        self.extensions.init(group, slot);
    }

    fn acquire_ownership(&self, txn: &mut Transaction, header: &TileGroupHeader, slot: Oid) -> bool {
        let location = ItemPointer::new(header.group_id(), slot);
        let group = self.core.group(location);
        let me = txn.txn_id();
        let Some(my_ctx) = self.context(me) else {
            txn.set_result(TxnResult::Failure);
            return false;
        };

        let acquired = self.extension(&group, slot).with_locked(|readers| {
            readers.retain(|r| *r != me);
            if header.cas_transaction_id(slot, INITIAL_TXN_ID, me).is_err() {
                return false;
            }
            if !self.is_current(txn, header, slot) {
                let _ = header.cas_transaction_id(slot, me, INITIAL_TXN_ID);
                return false;
            }

            let running: Vec<(TxnId, Arc<EagerContext>)> = readers
                .iter()
                .filter_map(|r| self.context(*r).map(|ctx| (*r, ctx)))
                .collect();
            if let Some((older, _)) = running.iter().find(|(r, _)| *r < me) {
                log::debug!("txn {} dies writing {} read by older txn {}", me, location, older);
                let _ = header.cas_transaction_id(slot, me, INITIAL_TXN_ID);
                return false;
            }
            for (_, reader) in &running {
                Self::add_dependency(reader, &my_ctx, me);
            }
            true
        });

        if !acquired {
            txn.set_result(TxnResult::Failure);
        }
        acquired
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

        let registered = self.extension(&group, slot).with_locked(|readers| {
            if header.transaction_id(slot) != INITIAL_TXN_ID {
                return false;
            }
            if !readers.contains(&txn.txn_id()) {
                readers.push(txn.txn_id());
            }
            true
        });
        if !registered {
            log::trace!("txn {} cannot read owned version {}", txn.txn_id(), location);
            return false;
        }
        txn.record_read(location);
        true
    }

    fn begin_transaction(&self) -> Transaction {
        let txn = self.core.begin(false);
        self.running
            .write()
            .insert(txn.txn_id(), Arc::new(EagerContext::default()));
        txn
    }

    fn commit_transaction(&self, txn: &mut Transaction) -> TxnResult {
        let core = &self.core;
        if txn.result() == TxnResult::Failure {
            return self.abort_transaction(txn);
        }
        if txn.is_read_only() {
            self.finish(txn);
            return core.end_transaction(txn, TxnResult::Success);
        }

        if let Some(ctx) = self.context(txn.txn_id()) {
            let backoff = Backoff::new();
            while ctx.waiting_for.load(Ordering::Acquire) > 0 {
                backoff.snooze();
            }
        }

        let end_cid = core.ids().next_commit_id();
        txn.set_end_cid(end_cid);
        core.install_write_set(txn, end_cid, self.chain_order());
        self.finish(txn);
        core.end_transaction(txn, TxnResult::Success)
    }

    fn abort_transaction(&self, txn: &mut Transaction) -> TxnResult {
        self.core.rollback_write_set(txn, self.chain_order());
        self.finish(txn);
        self.core.end_transaction(txn, TxnResult::Aborted)
    }
}
