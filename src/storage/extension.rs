//! Typed per-slot metadata owned by a concurrency-control protocol
//!
//! Each protocol that needs more than the common header (a last-reader
//! timestamp, a reader list, an undo-chain head) keeps an `ExtensionArena`
//! of its own struct, indexed by `(tile group, slot)`. A cell is stamped with
//! the slot generation it was initialized for; once the garbage collector
//! recycles the slot the stamp no longer matches and the cell reads as absent
//! until the next version created in that slot initializes it again.

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use super::tile_group::TileGroup;
use crate::types::Oid;

const UNSTAMPED: u64 = u64::MAX;

/// Per-slot metadata of one protocol
pub trait SlotExtension: Default + Send + Sync {
    /// Return to the state of a freshly created version
    fn reset(&self);
}

struct ExtensionCell<T> {
    stamp: AtomicU64,
    value: T,
}

struct ExtensionBlock<T> {
    cells: Box<[ExtensionCell<T>]>,
}

/// Handle to one initialized cell
pub struct ExtensionRef<T> {
    block: Arc<ExtensionBlock<T>>,
    index: usize,
}

impl<T> Deref for ExtensionRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.block.cells[self.index].value
    }
}

/// Arena of `T` cells, one block per tile group
pub struct ExtensionArena<T: SlotExtension> {
    blocks: RwLock<AHashMap<Oid, Arc<ExtensionBlock<T>>>>,
}

impl<T: SlotExtension> ExtensionArena<T> {
    pub fn new() -> Self {
        Self { blocks: RwLock::new(AHashMap::new()) }
    }

    fn block(&self, group: &TileGroup) -> Arc<ExtensionBlock<T>> {
        if let Some(block) = self.blocks.read().get(&group.id()) {
            return Arc::clone(block);
        }
        let mut blocks = self.blocks.write();
        let block = blocks.entry(group.id()).or_insert_with(|| {
            Arc::new(ExtensionBlock {
                cells: (0..group.capacity())
                    .map(|_| ExtensionCell { stamp: AtomicU64::new(UNSTAMPED), value: T::default() })
                    .collect(),
            })
        });
        Arc::clone(block)
    }

    /// Reset the cell for the version being created in `slot`.
    ///
    /// Called by the creating transaction before the version is published.
    pub fn init(&self, group: &TileGroup, slot: Oid) -> ExtensionRef<T> {
        let block = self.block(group);
        let index = slot as usize;
        let cell = &block.cells[index];
        cell.value.reset();
        cell.stamp
            .store(group.header().generation(slot) as u64, Ordering::Release);
        ExtensionRef { block, index }
    }

    /// The cell for `slot`, if it was initialized for the slot's current generation
    pub fn get(&self, group: &TileGroup, slot: Oid) -> Option<ExtensionRef<T>> {
        let block = Arc::clone(self.blocks.read().get(&group.id())?);
        let index = slot as usize;
        let stamp = block.cells.get(index)?.stamp.load(Ordering::Acquire);
        (stamp == group.header().generation(slot) as u64).then_some(ExtensionRef { block, index })
    }

    /// Forget a tile group's block (e.g. after the group is dropped)
    pub fn drop_group(&self, group_id: Oid) {
        self.blocks.write().remove(&group_id);
    }
}

impl<T: SlotExtension> Default for ExtensionArena<T> {
    fn default() -> Self {
        Self::new()
    }
}
