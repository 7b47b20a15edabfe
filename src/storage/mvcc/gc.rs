//! Garbage Collector - recycles tuple slots no transaction can observe
//!
//! Commit queues every superseded version, abort every discarded one, each
//! with the timestamp after which it stopped mattering. A run takes the
//! safe floor from the epoch manager, unlinks and frees every queued slot
//! below it, and reclaims rollback pools the same way.
//!
//! A freed slot may be the one an index entry points at (the oldest
//! version of an old-to-new chain, or a deleted tuple). Before anything is
//! freed the entry is moved to the nearest newer version that survives the
//! run, or cleared when the whole chain dies.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use rayon::prelude::*;

use super::rollback::SegmentDirectory;
use crate::storage::catalog::Catalog;
use crate::storage::tile_group::TileGroup;
use crate::txn::ChainOrder;
use crate::types::{Cid, ItemPointer, Oid};

// ============================================================================
// GC Configuration
// ============================================================================

/// Default interval between GC runs (in milliseconds)
const DEFAULT_GC_INTERVAL_MS: u64 = 100;

/// Default minimum queued slots before GC triggers
const DEFAULT_MIN_PENDING_FOR_GC: usize = 64;

/// GC configuration
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Minimum interval between GC runs
    pub interval: Duration,
    /// Minimum queued slot count before GC triggers
    pub min_pending: usize,
    /// Whether GC is enabled
    pub enabled: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_GC_INTERVAL_MS),
            min_pending: DEFAULT_MIN_PENDING_FOR_GC,
            enabled: true,
        }
    }
}

// ============================================================================
// GC Statistics
// ============================================================================

/// Statistics from a GC run
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Number of tuple slots returned to their free lists
    pub slots_reclaimed: usize,
    /// Number of rollback pools dropped
    pub pools_reclaimed: usize,
    /// Duration of the GC run
    pub duration: Duration,
    /// Safe floor used for this run
    pub floor: Cid,
}

#[derive(Debug, Clone, Copy)]
struct RecycledSlot {
    location: ItemPointer,
    retire_cid: Cid,
}

// ============================================================================
// Garbage Collector
// ============================================================================

/// Garbage collector for tuple slots and rollback pools
///
/// Safety guarantee: a slot is freed only when its retirement timestamp is
/// below the floor, i.e. every live transaction began after it stopped
/// being the version anyone could read.
pub struct GarbageCollector {
    /// Configuration
    config: GcConfig,
    /// Slots waiting for the floor to pass them
    pending: Mutex<Vec<RecycledSlot>>,
    /// Last GC run time
    last_run: AtomicU64, // stored as epoch millis
    /// Whether a GC is currently in progress
    running: AtomicBool,
    /// Total slots reclaimed across all GC runs
    total_reclaimed: AtomicU64,
}

impl GarbageCollector {
    /// Create a new garbage collector with default config
    pub fn new() -> Self {
        Self::with_config(GcConfig::default())
    }

    /// Create with custom config
    pub fn with_config(config: GcConfig) -> Self {
        Self {
            config,
            pending: Mutex::new(Vec::new()),
            last_run: AtomicU64::new(0),
            running: AtomicBool::new(false),
            total_reclaimed: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Queue a slot that stops being observable once the floor passes `retire_cid`
    pub fn recycle(&self, location: ItemPointer, retire_cid: Cid) {
        self.pending.lock().push(RecycledSlot { location, retire_cid });
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn now_millis() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Check if GC should run based on heuristics
    pub fn should_run(&self) -> bool {
        if !self.config.enabled {
            return false;
        }

        // Don't run if already running
        if self.running.load(Ordering::Relaxed) {
            return false;
        }

        if self.pending_count() < self.config.min_pending {
            return false;
        }

        let last = self.last_run.load(Ordering::Relaxed);
        let interval_millis = self.config.interval.as_millis() as u64;
        Self::now_millis().saturating_sub(last) >= interval_millis
    }

    /// Run garbage collection against `floor`; `chain` is the direction the
    /// protocol links its versions in
    ///
    /// Returns statistics about the GC run, or None if another run is in progress.
    pub fn run(&self, catalog: &Catalog, segments: &SegmentDirectory, floor: Cid, chain: ChainOrder) -> Option<GcStats> {
        // Try to acquire the running flag (CAS to prevent concurrent GC)
        if self.running.compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed).is_err() {
            return None;
        }

        let start = Instant::now();
        let ready: Vec<RecycledSlot> = {
            let mut pending = self.pending.lock();
            let (ready, waiting): (Vec<_>, Vec<_>) = pending.drain(..).partition(|s| s.retire_cid < floor);
            *pending = waiting;
            ready
        };

        Self::move_index_entries(catalog, &ready, chain);

        let mut by_group: AHashMap<Oid, Vec<Oid>> = AHashMap::new();
        for slot in &ready {
            by_group.entry(slot.location.block).or_default().push(slot.location.offset);
        }

        let slots_reclaimed: usize = by_group
            .into_iter()
            .collect::<Vec<_>>()
            .into_par_iter()
            .map(|(block, mut slots)| {
                slots.sort_unstable();
                slots.dedup();
                match catalog.get_tile_group(block) {
                    Ok(group) => {
                        for &slot in &slots {
                            Self::unlink_and_free(catalog, &group, slot);
                        }
                        slots.len()
                    }
                    // Dropped groups take their slots with them
                    Err(_) => 0,
                }
            })
            .sum();

        let pools_reclaimed = segments.reclaim(floor);

        let duration = start.elapsed();
        self.total_reclaimed.fetch_add(slots_reclaimed as u64, Ordering::Relaxed);
        self.last_run.store(Self::now_millis(), Ordering::Relaxed);

        // Release running flag
        self.running.store(false, Ordering::SeqCst);

        if slots_reclaimed > 0 || pools_reclaimed > 0 {
            log::debug!(
                "gc below cid {}: {} slots, {} rollback pools in {:?}",
                floor, slots_reclaimed, pools_reclaimed, duration
            );
        }

        Some(GcStats { slots_reclaimed, pools_reclaimed, duration, floor })
    }

    /// Point every index entry that rests on a dying slot at the nearest
    /// newer version outside the batch, or at nothing
    fn move_index_entries(catalog: &Catalog, ready: &[RecycledSlot], chain: ChainOrder) {
        let dying: AHashSet<ItemPointer> = ready.iter().map(|s| s.location).collect();

        for location in &dying {
            let Ok(group) = catalog.get_tile_group(location.block) else { continue };
            let Some(entry) = group.take_index_entry(location.offset) else { continue };
            if entry.get() != *location {
                continue;
            }

            let mut target = chain.newer(group.header(), location.offset);
            while !target.is_null() && dying.contains(&target) {
                target = match catalog.get_tile_group(target.block) {
                    Ok(g) => chain.newer(g.header(), target.offset),
                    Err(_) => ItemPointer::NULL,
                };
            }

            if target.is_null() {
                entry.compare_and_swap(*location, ItemPointer::NULL);
                continue;
            }
            if let Ok(g) = catalog.get_tile_group(target.block) {
                g.set_index_entry(target.offset, Some(Arc::clone(&entry)));
                entry.compare_and_swap(*location, target);
                log::trace!("index entry moved from {} to {}", location, target);
            }
        }
    }

    /// Cut the links neighbours still hold to a dead slot, then free it
    fn unlink_and_free(catalog: &Catalog, group: &TileGroup, slot: Oid) {
        let header = group.header();
        let location = ItemPointer::new(group.id(), slot);

        let next = header.next_item_pointer(slot);
        if !next.is_null() {
            if let Ok(g) = catalog.get_tile_group(next.block) {
                g.header().clear_prev_if(next.offset, location);
            }
        }
        let prev = header.prev_item_pointer(slot);
        if !prev.is_null() {
            if let Ok(g) = catalog.get_tile_group(prev.block) {
                g.header().clear_next_if(prev.offset, location);
            }
        }
        header.recycle_slot(slot);
    }

    /// Try to run GC if conditions are met (non-blocking)
    pub fn maybe_run(
        &self,
        catalog: &Catalog,
        segments: &SegmentDirectory,
        floor: Cid,
        chain: ChainOrder,
    ) -> Option<GcStats> {
        if self.should_run() {
            self.run(catalog, segments, floor, chain)
        } else {
            None
        }
    }

    /// Total slots reclaimed across all GC runs
    pub fn total_reclaimed(&self) -> u64 {
        self.total_reclaimed.load(Ordering::Relaxed)
    }

    /// Whether GC is currently running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

impl Default for GarbageCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataType, Schema};
    use crate::storage::index_entry::IndexEntry;
    use crate::types::{INITIAL_TXN_ID, MAX_CID};

    fn setup() -> (Catalog, Arc<TileGroup>) {
        let catalog = Catalog::new();
        let schema = Arc::new(Schema::from_pairs(&[("v", DataType::Int64)]));
        let group = catalog.create_tile_group(schema, 8);
        (catalog, group)
    }

    /// old -> new chain of two committed versions
    fn chain(group: &TileGroup) -> (ItemPointer, ItemPointer) {
        let old = group.allocate().unwrap();
        let new = group.allocate().unwrap();
        let h = group.header();
        h.set_transaction_id(old.offset, INITIAL_TXN_ID);
        h.set_begin_commit_id(old.offset, 2);
        h.set_end_commit_id(old.offset, 5);
        h.set_next_item_pointer(old.offset, new);
        h.set_transaction_id(new.offset, INITIAL_TXN_ID);
        h.set_begin_commit_id(new.offset, 5);
        h.set_end_commit_id(new.offset, MAX_CID);
        h.set_prev_item_pointer(new.offset, old);
        (old, new)
    }

    #[test]
    fn test_gc_respects_floor() {
        let (catalog, group) = setup();
        let segments = SegmentDirectory::new();
        let gc = GarbageCollector::new();
        let (old, new) = chain(&group);
        gc.recycle(old, 5);

        let stats = gc.run(&catalog, &segments, 5, ChainOrder::OldToNew).unwrap();
        assert_eq!(stats.slots_reclaimed, 0);
        assert_eq!(gc.pending_count(), 1);
        assert!(!group.header().is_free(old.offset));

        let stats = gc.run(&catalog, &segments, 6, ChainOrder::OldToNew).unwrap();
        assert_eq!(stats.slots_reclaimed, 1);
        assert!(group.header().is_free(old.offset));
        assert!(group.header().prev_item_pointer(new.offset).is_null());
        assert_eq!(gc.total_reclaimed(), 1);
    }

    #[test]
    fn test_reclaimed_slot_is_reused() {
        let (catalog, group) = setup();
        let gc = GarbageCollector::new();
        let (old, _) = chain(&group);
        gc.recycle(old, 5);
        gc.run(&catalog, &SegmentDirectory::new(), 100, ChainOrder::OldToNew);
        assert_eq!(group.allocate().unwrap(), old);
    }

    #[test]
    fn test_duplicate_recycle_frees_once() {
        let (catalog, group) = setup();
        let gc = GarbageCollector::new();
        let (old, _) = chain(&group);
        gc.recycle(old, 5);
        gc.recycle(old, 5);
        let stats = gc.run(&catalog, &SegmentDirectory::new(), 100, ChainOrder::OldToNew).unwrap();
        assert_eq!(stats.slots_reclaimed, 1);
        assert_eq!(group.allocate().unwrap(), old);
        assert_ne!(group.allocate().unwrap(), old);
    }

    #[test]
    fn test_dropped_group_is_skipped() {
        let (catalog, group) = setup();
        let gc = GarbageCollector::new();
        let (old, _) = chain(&group);
        gc.recycle(old, 1);
        catalog.drop_tile_group(group.id()).unwrap();
        let stats = gc.run(&catalog, &SegmentDirectory::new(), 100, ChainOrder::OldToNew).unwrap();
        assert_eq!(stats.slots_reclaimed, 0);
        assert_eq!(gc.pending_count(), 0);
    }

    #[test]
    fn test_index_entry_follows_surviving_version() {
        let (catalog, group) = setup();
        let gc = GarbageCollector::new();
        let (old, new) = chain(&group);
        let entry = Arc::new(IndexEntry::new(old));
        group.set_index_entry(old.offset, Some(Arc::clone(&entry)));

        gc.recycle(old, 5);
        gc.run(&catalog, &SegmentDirectory::new(), 6, ChainOrder::OldToNew).unwrap();
        assert_eq!(entry.get(), new);
        assert!(group.index_entry(old.offset).is_none());
        assert!(Arc::ptr_eq(&group.index_entry(new.offset).unwrap(), &entry));
    }

    #[test]
    fn test_index_entry_cleared_with_whole_chain() {
        let (catalog, group) = setup();
        let gc = GarbageCollector::new();
        let (old, new) = chain(&group);
        let entry = Arc::new(IndexEntry::new(old));
        group.set_index_entry(old.offset, Some(Arc::clone(&entry)));

        // a committed delete retires both versions at once
        gc.recycle(new, 5);
        gc.recycle(old, 5);
        let stats = gc.run(&catalog, &SegmentDirectory::new(), 6, ChainOrder::OldToNew).unwrap();
        assert_eq!(stats.slots_reclaimed, 2);
        assert!(entry.get().is_null());
    }

    #[test]
    fn test_index_entry_elsewhere_is_left_alone() {
        let (catalog, group) = setup();
        let gc = GarbageCollector::new();
        let (old, new) = chain(&group);
        // new-to-old: the entry already sits on the newest version
        let entry = Arc::new(IndexEntry::new(new));
        group.set_index_entry(old.offset, Some(Arc::clone(&entry)));
        group.set_index_entry(new.offset, Some(Arc::clone(&entry)));

        gc.recycle(old, 5);
        gc.run(&catalog, &SegmentDirectory::new(), 6, ChainOrder::NewToOld).unwrap();
        assert_eq!(entry.get(), new);
        assert!(group.index_entry(new.offset).is_some());
    }

    #[test]
    fn test_should_run_heuristics() {
        let gc = GarbageCollector::with_config(GcConfig {
            interval: Duration::from_millis(0),
            min_pending: 2,
            enabled: true,
        });
        assert!(!gc.should_run());
        gc.recycle(ItemPointer::new(0, 0), 1);
        gc.recycle(ItemPointer::new(0, 1), 1);
        assert!(gc.should_run());

        let disabled = GarbageCollector::with_config(GcConfig { enabled: false, ..GcConfig::default() });
        disabled.recycle(ItemPointer::new(0, 0), 1);
        assert!(!disabled.should_run());
    }
}
