//! Concurrency-control protocols
//!
//! Each protocol implements `TransactionManager`, keeping the default
//! snapshot skeleton where it can and overriding the steps where its
//! conflict handling differs.

pub mod eager_write;
pub mod optimistic;
pub mod optimistic_rb;
pub mod pessimistic;
pub mod ssi;
pub mod ts_order;

pub use eager_write::EagerWriteTxnManager;
pub use optimistic::OptimisticTxnManager;
pub use optimistic_rb::OptimisticRbTxnManager;
pub use pessimistic::PessimisticTxnManager;
pub use ssi::SsiTxnManager;
pub use ts_order::TsOrderTxnManager;

use parking_lot::Mutex;

use crate::storage::extension::SlotExtension;
use crate::types::TxnId;

/// Transactions registered as readers of one version
#[derive(Debug, Default)]
pub struct ReaderList {
    readers: Mutex<Vec<TxnId>>,
}

impl ReaderList {
    /// Add `txn_id` unless already present; false if it was
    pub fn add(&self, txn_id: TxnId) -> bool {
        let mut readers = self.readers.lock();
        if readers.contains(&txn_id) {
            return false;
        }
        readers.push(txn_id);
        true
    }

    pub fn remove(&self, txn_id: TxnId) {
        self.readers.lock().retain(|r| *r != txn_id);
    }

    pub fn snapshot(&self) -> Vec<TxnId> {
        self.readers.lock().clone()
    }

    /// Run `f` with the list locked
    pub fn with_locked<R>(&self, f: impl FnOnce(&mut Vec<TxnId>) -> R) -> R {
        f(&mut self.readers.lock())
    }
}

impl SlotExtension for ReaderList {
    fn reset(&self) {
        self.readers.lock().clear();
    }
}
