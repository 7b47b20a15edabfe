//! Index entry: the indirection cell an index holds for one logical tuple
//!
//! Protocols that chain versions new-to-old swing the cell to the newest
//! version; the others leave it on the oldest and readers walk forward.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::ItemPointer;

#[derive(Debug)]
pub struct IndexEntry {
    head: AtomicU64,
}

impl IndexEntry {
    pub fn new(location: ItemPointer) -> Self {
        Self { head: AtomicU64::new(location.pack()) }
    }

    pub fn get(&self) -> ItemPointer {
        ItemPointer::unpack(self.head.load(Ordering::Acquire))
    }

    pub fn set(&self, location: ItemPointer) {
        self.head.store(location.pack(), Ordering::Release);
    }

    /// Swing the head from `expected` to `new`; false if someone moved it first
    pub fn compare_and_swap(&self, expected: ItemPointer, new: ItemPointer) -> bool {
        self.head
            .compare_exchange(expected.pack(), new.pack(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for IndexEntry {
    fn default() -> Self {
        Self::new(ItemPointer::NULL)
    }
}
