//! Optimistic protocol with in-place updates and rollback segments
//!
//! A tuple has a single master slot. Before overwriting columns a writer
//! saves their current values in a segment of its own rollback pool and
//! prepends it to the tuple's undo chain:
//!
//! ```text
//! master (newest values) -> seg(ts = MAX, unsealed) -> seg(ts = c2) -> seg(ts = c1) -> NULL
//! ```
//!
//! Commit seals the unsealed segments with the commit timestamp; abort
//! replays them onto the master. A reader rebuilds its image by applying
//! every segment that is unsealed or sealed after its snapshot. Deletes
//! only raise a flag until commit. Validation is the optimistic one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::data::Row;
use crate::storage::extension::{ExtensionArena, ExtensionRef, SlotExtension};
use crate::storage::mvcc::SegmentRef;
use crate::storage::tile_group::{TileGroup, TileGroupHeader};
use crate::txn::context::Transaction;
use crate::txn::manager::{memory_fence, snapshot_visibility, ManagerCore, TransactionManager};
use crate::types::{
    Cid, ItemPointer, Oid, ProtocolKind, RwType, TxnResult, Visibility, INITIAL_TXN_ID, INVALID_CID,
    INVALID_TXN_ID, MAX_CID,
};

/// Undo-chain head and pending-delete flag of one master slot
#[derive(Debug)]
pub struct RbExtension {
    head: AtomicU64,
    deleted: AtomicBool,
}

impl Default for RbExtension {
    fn default() -> Self {
        Self {
            head: AtomicU64::new(SegmentRef::pack_opt(None)),
            deleted: AtomicBool::new(false),
        }
    }
}

impl RbExtension {
    pub fn head(&self) -> Option<SegmentRef> {
        SegmentRef::unpack(self.head.load(Ordering::Acquire))
    }

    fn set_head(&self, head: Option<SegmentRef>) {
        self.head.store(SegmentRef::pack_opt(head), Ordering::Release);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }
}

impl SlotExtension for RbExtension {
    fn reset(&self) {
        self.set_head(None);
        self.deleted.store(false, Ordering::Release);
    }
}

pub struct OptimisticRbTxnManager {
    core: ManagerCore,
    extensions: ExtensionArena<RbExtension>,
}

impl OptimisticRbTxnManager {
    pub fn new(core: ManagerCore) -> Self {
        Self { core, extensions: ExtensionArena::new() }
    }

    fn extension(&self, group: &TileGroup, slot: Oid) -> ExtensionRef<RbExtension> {
        match self.extensions.get(group, slot) {
            Some(ext) => ext,
            None => self.extensions.init(group, slot),
        }
    }

    /// Head of the undo chain at `location`
    pub fn undo_head(&self, location: ItemPointer) -> Option<SegmentRef> {
        let group = self.core.group(location);
        self.extensions.get(&group, location.offset)?.head()
    }

    /// Timestamp of the newest segment, `None` if the chain is empty
    fn head_timestamp(&self, group: &TileGroup, slot: Oid) -> Option<Cid> {
        let head = self.extensions.get(group, slot)?.head()?;
        self.core.segments().resolve(head).map(|seg| seg.timestamp())
    }

    /// Seal the unsealed prefix of the undo chain; returns how many were sealed
    fn seal_chain(&self, ext: &RbExtension, end_cid: Cid) -> usize {
        let mut sealed = 0;
        let mut cursor = ext.head();
        while let Some(r) = cursor {
            let Some(seg) = self.core.segments().resolve(r) else { break };
            if seg.is_sealed() {
                break;
            }
            seg.seal(end_cid);
            sealed += 1;
            cursor = seg.next();
        }
        sealed
    }

    /// Replay the unsealed prefix onto the master and unlink it
    fn replay_chain(&self, group: &TileGroup, slot: Oid, ext: &RbExtension) {
        let mut cursor = ext.head();
        while let Some(r) = cursor {
            let Some(seg) = self.core.segments().resolve(r) else {
                cursor = None;
                break;
            };
            if seg.is_sealed() {
                break;
            }
            seg.apply_to_tuple(group, slot);
            cursor = seg.next();
        }
        ext.set_head(cursor);
    }

    fn install(&self, txn: &Transaction, end_cid: Cid) {
        let core = &self.core;
        let log = core.log();
        if let Some(log) = log {
            log.log_begin(end_cid);
        }

        for (location, kind) in txn.rw_entries() {
            let group = core.group(location);
            let header = group.header();
            let slot = location.offset;

            match kind {
                RwType::Read => {}
                RwType::ReadOwn => header.set_transaction_id(slot, INITIAL_TXN_ID),
                RwType::Update => {
                    let ext = self.extension(&group, slot);
                    self.seal_chain(&ext, end_cid);
                    memory_fence();
                    header.set_begin_commit_id(slot, end_cid);
                    memory_fence();
                    header.set_transaction_id(slot, INITIAL_TXN_ID);
                    if let Some(log) = log {
                        log.log_update(end_cid, location, location);
                    }
                }
                RwType::Delete => {
                    let ext = self.extension(&group, slot);
                    header.set_end_commit_id(slot, end_cid);
                    memory_fence();
                    if self.seal_chain(&ext, end_cid) > 0 {
                        memory_fence();
                        header.set_begin_commit_id(slot, end_cid);
                    }
                    ext.deleted.store(false, Ordering::Release);
                    memory_fence();
                    header.set_transaction_id(slot, INITIAL_TXN_ID);
                    if let Some(log) = log {
                        log.log_delete(end_cid, location);
                    }
                    core.gc().recycle(location, end_cid);
                }
                RwType::Insert => {
                    let ext = self.extension(&group, slot);
                    self.seal_chain(&ext, end_cid);
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
                    core.gc().recycle(location, end_cid);
                }
            }
        }

        if let Some(log) = log {
            log.log_commit(end_cid);
        }
    }

    fn rollback(&self, txn: &Transaction) {
        let core = &self.core;
        let retire_cid = core.ids().current_commit_id();

        for (location, kind) in txn.rw_entries() {
            let group = core.group(location);
            let header = group.header();
            let slot = location.offset;

            match kind {
                RwType::Read => {}
                RwType::ReadOwn => header.set_transaction_id(slot, INITIAL_TXN_ID),
                RwType::Update | RwType::Delete => {
                    let ext = self.extension(&group, slot);
                    self.replay_chain(&group, slot, &ext);
                    ext.deleted.store(false, Ordering::Release);
                    memory_fence();
                    header.set_transaction_id(slot, INITIAL_TXN_ID);
                }
                RwType::Insert | RwType::InsDel => {
                    header.set_begin_commit_id(slot, MAX_CID);
                    header.set_end_commit_id(slot, MAX_CID);
                    memory_fence();
                    header.set_transaction_id(slot, INVALID_TXN_ID);
                    core.gc().recycle(location, retire_cid);
                }
            }
        }
    }
}

impl TransactionManager for OptimisticRbTxnManager {
    fn core(&self) -> &ManagerCore {
        &self.core
    }

    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::OptimisticRb
    }

    fn uses_rollback_segments(&self) -> bool {
        true
    }

    fn init_version(&self, _txn: &Transaction, group: &TileGroup, slot: Oid) {
        self.extensions.init(group, slot);
    }

    /// `Ok` means the master's current values are the caller's image;
    /// `Invisible` may still resolve through `read_tuple`
    fn is_visible(&self, txn: &Transaction, header: &TileGroupHeader, slot: Oid) -> Visibility {
        let owner = header.transaction_id(slot);
        let group = self.core.group(ItemPointer::new(header.group_id(), slot));

        if owner == txn.txn_id() {
            let deleted = header.end_commit_id(slot) == INVALID_CID
                || self.extensions.get(&group, slot).is_some_and(|ext| ext.is_deleted());
            return if deleted { Visibility::Deleted } else { Visibility::Ok };
        }
        if owner != INVALID_TXN_ID
            && self.head_timestamp(&group, slot).is_some_and(|ts| ts > txn.begin_cid())
        {
            return Visibility::Invisible;
        }
        snapshot_visibility(txn, owner, header.begin_commit_id(slot), header.end_commit_id(slot))
    }

    /// Not deleted, and not overwritten since `txn`'s snapshot
    fn is_current(&self, txn: &Transaction, header: &TileGroupHeader, slot: Oid) -> bool {
        header.end_commit_id(slot) == MAX_CID && header.begin_commit_id(slot) <= txn.begin_cid()
    }

    fn perform_update(&self, _txn: &mut Transaction, old: ItemPointer, _new: ItemPointer) {
        panic!("{} updates {} in place; use perform_update_with_rb", self.protocol(), old);
    }

    fn perform_delete(&self, _txn: &mut Transaction, old: ItemPointer, _new: ItemPointer) {
        panic!("{} deletes {} in place; use perform_delete_with_rb", self.protocol(), old);
    }

    fn perform_update_with_rb(&self, txn: &mut Transaction, location: ItemPointer, segment: SegmentRef) {
        let group = self.core.group(location);
        let slot = location.offset;
        assert!(
            self.is_owner(txn, group.header(), slot),
            "txn {} updates {} without owning it",
            txn.txn_id(),
            location
        );
        let seg = self
            .core
            .segments()
            .resolve(segment)
            .unwrap_or_else(|| panic!("segment {:?} does not resolve", segment));

        let ext = self.extension(&group, slot);
        seg.set_next(ext.head());
        ext.set_head(Some(segment));
        txn.record_update(location);
    }

    fn perform_delete_with_rb(&self, txn: &mut Transaction, location: ItemPointer) {
        let group = self.core.group(location);
        let header = group.header();
        let slot = location.offset;
        assert!(self.is_owner(txn, header, slot), "txn {} deletes {} without owning it", txn.txn_id(), location);

        let ext = self.extension(&group, slot);
        ext.deleted.store(true, Ordering::Release);
        if txn.record_delete(location) {
            header.set_end_commit_id(slot, INVALID_CID);
        }
    }

    fn commit_transaction(&self, txn: &mut Transaction) -> TxnResult {
        let core = &self.core;
        if txn.result() == TxnResult::Failure {
            return self.abort_transaction(txn);
        }

        if txn.is_read_only() {
            if !core.validate_reads(txn, core.ids().current_commit_id()) {
                return self.abort_transaction(txn);
            }
            return core.end_transaction(txn, TxnResult::Success);
        }

        let end_cid = core.ids().next_commit_id();
        txn.set_end_cid(end_cid);
        if !core.validate_reads(txn, end_cid) {
            return self.abort_transaction(txn);
        }
        self.install(txn, end_cid);
        core.end_transaction(txn, TxnResult::Success)
    }

    fn abort_transaction(&self, txn: &mut Transaction) -> TxnResult {
        self.rollback(txn);
        self.core.end_transaction(txn, TxnResult::Aborted)
    }

    /// Rebuild the image `txn` sees from the master and its undo chain
    fn read_tuple(&self, txn: &Transaction, location: ItemPointer) -> Option<Row> {
        let group = self.core.group(location);
        let header = group.header();
        let slot = location.offset;
        let read_ts = txn.begin_cid();

        let owner = header.transaction_id(slot);
        if owner == txn.txn_id() {
            return match self.is_visible(txn, header, slot) {
                Visibility::Ok => Some(group.read_row(slot)),
                _ => None,
            };
        }
        if owner == INVALID_TXN_ID {
            return None;
        }

        // Header first, values second, chain last: a writer publishes its
        // segment before touching the values, so any change the copy caught
        // is undone below
        let begin = header.begin_commit_id(slot);
        let end = header.end_commit_id(slot);
        let mut row = group.read_row(slot);

        let mut applied: Option<(Cid, Cid)> = None;
        let mut cursor = self.extensions.get(&group, slot).and_then(|ext| ext.head());
        while let Some(r) = cursor {
            let Some(seg) = self.core.segments().resolve(r) else { break };
            let ts = seg.timestamp();
            if ts <= read_ts {
                break;
            }
            seg.apply_to_row(group.schema(), &mut row);
            let image_end = applied.map_or(end, |(_, e)| e).min(ts);
            applied = Some((seg.restored_begin(), image_end));
            cursor = seg.next();
        }

        let (image_begin, image_end) = match applied {
            Some(interval) => interval,
            None if owner != INITIAL_TXN_ID && begin == MAX_CID => return None,
            None => (begin, end),
        };
        (image_begin <= read_ts && read_ts < image_end).then_some(row)
    }
}
