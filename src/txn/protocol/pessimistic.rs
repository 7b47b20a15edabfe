//! Pessimistic protocol - shared read locks packed into the owner word
//!
//! ```text
//! owner word:  [ reader count : 16 ][ owner txn id : 48 ]
//! ```
//!
//! A reader CASes the count up while nobody owns the version; a writer
//! CASes `(0 readers, INITIAL)` to `(0 readers, self)`, so it can only take
//! ownership of a version no other transaction is reading. Locks are held
//! to the end of the transaction. Nothing is validated at commit.

use crossbeam_utils::Backoff;

use crate::storage::tile_group::TileGroupHeader;
use crate::txn::context::Transaction;
use crate::txn::manager::{confirm_current, ManagerCore, TransactionManager};
use crate::types::{ItemPointer, Oid, ProtocolKind, RwType, TxnId, TxnResult, INITIAL_TXN_ID};

const READ_COUNT_SHIFT: u32 = 48;
const TXN_ID_MASK: u64 = (1 << READ_COUNT_SHIFT) - 1;
const ONE_READER: u64 = 1 << READ_COUNT_SHIFT;
/// Readers a single version can hold before further reads fail
pub const MAX_READERS: u64 = (1 << (64 - READ_COUNT_SHIFT)) - 1;

#[inline]
fn owner_bits(word: u64) -> TxnId {
    word & TXN_ID_MASK
}

#[inline]
pub(crate) fn reader_count(word: u64) -> u64 {
    word >> READ_COUNT_SHIFT
}

pub struct PessimisticTxnManager {
    core: ManagerCore,
}

impl PessimisticTxnManager {
    pub fn new(core: ManagerCore) -> Self {
        Self { core }
    }

    /// Take a shared lock; fails if a writer owns the version or the count is saturated
    fn acquire_read_lock(&self, header: &TileGroupHeader, slot: Oid) -> bool {
        let backoff = Backoff::new();
        loop {
            let word = header.transaction_id(slot);
            if owner_bits(word) != INITIAL_TXN_ID || reader_count(word) >= MAX_READERS {
                return false;
            }
            match header.cas_transaction_id(slot, word, word + ONE_READER) {
                Ok(_) => return true,
                Err(_) => backoff.spin(),
            }
        }
    }

    fn release_read_lock(&self, header: &TileGroupHeader, slot: Oid) {
        let backoff = Backoff::new();
        loop {
            let word = header.transaction_id(slot);
            assert!(
                reader_count(word) > 0,
                "read lock released on ({}, {}) with no readers",
                header.group_id(),
                slot
            );
            match header.cas_transaction_id(slot, word, word - ONE_READER) {
                Ok(_) => return,
                Err(_) => backoff.spin(),
            }
        }
    }

    /// Give back the caller's own shared lock on `location`, once
    fn release_own_read_lock(&self, txn: &mut Transaction, header: &TileGroupHeader, location: ItemPointer) {
        if txn.rw_type(location) == Some(RwType::Read) && txn.mark_read_lock_released(location) {
            self.release_read_lock(header, location.offset);
        }
    }

    fn release_all_read_locks(&self, txn: &mut Transaction) {
        for (location, kind) in txn.rw_entries() {
            if kind != RwType::Read || txn.read_lock_released(location) {
                continue;
            }
            let group = self.core.group(location);
            self.release_own_read_lock(txn, group.header(), location);
        }
    }
}

impl TransactionManager for PessimisticTxnManager {
    fn core(&self) -> &ManagerCore {
        &self.core
    }

    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Pessimistic
    }

    fn owner_of(&self, header: &TileGroupHeader, slot: Oid) -> TxnId {
        owner_bits(header.transaction_id(slot))
    }

    fn acquire_ownership(&self, txn: &mut Transaction, header: &TileGroupHeader, slot: Oid) -> bool {
        let location = ItemPointer::new(header.group_id(), slot);
        self.release_own_read_lock(txn, header, location);

        match header.cas_transaction_id(slot, INITIAL_TXN_ID, txn.txn_id()) {
            Ok(_) => confirm_current(self, txn, header, slot),
            Err(word) => {
                log::debug!(
                    "txn {} cannot own {}: owner {} with {} readers",
                    txn.txn_id(),
                    location,
                    owner_bits(word),
                    reader_count(word)
                );
                txn.set_result(TxnResult::Failure);
                false
            }
        }
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

        // Already locked by an earlier read
        if txn.rw_type(location).is_some() {
            return true;
        }
        if !self.acquire_read_lock(header, slot) {
            log::trace!("txn {} cannot read-lock {}", txn.txn_id(), location);
            return false;
        }
        txn.record_read(location);
        true
    }

    fn commit_transaction(&self, txn: &mut Transaction) -> TxnResult {
        if txn.result() == TxnResult::Failure {
            return self.abort_transaction(txn);
        }
        self.release_all_read_locks(txn);
        if txn.is_read_only() {
            return self.core.end_transaction(txn, TxnResult::Success);
        }

        let end_cid = self.core.ids().next_commit_id();
        txn.set_end_cid(end_cid);
        self.core.install_write_set(txn, end_cid, self.chain_order());
        self.core.end_transaction(txn, TxnResult::Success)
    }

    fn abort_transaction(&self, txn: &mut Transaction) -> TxnResult {
        self.release_all_read_locks(txn);
        self.core.rollback_write_set(txn, self.chain_order());
        self.core.end_transaction(txn, TxnResult::Aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_word_layout() {
        let word = 3 * ONE_READER + INITIAL_TXN_ID;
        assert_eq!(owner_bits(word), INITIAL_TXN_ID);
        assert_eq!(reader_count(word), 3);
        assert_eq!(MAX_READERS, 65535);
        assert_eq!(owner_bits(crate::types::MAX_TXN_ID), crate::types::MAX_TXN_ID);
    }
}
