//! Tile groups: fixed-capacity blocks of tuple slots with per-slot MVCC headers
//!
//! ```text
//! TileGroup
//! ├── header: TileGroupHeader
//! │     slot i: owner | begin_cid | end_cid | prev | next | generation
//! ├── rows:   slot i: RwLock<Vec<Value>>
//! └── index:  slot i: index entry currently pointing at the slot, if any
//! ```
//!
//! The header is the only state the concurrency-control protocols touch
//! directly. Every cell is an atomic word; protocols impose their own
//! ordering with fences on top of the Acquire/Release accessors here.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::data::{ColumnId, Schema, Value};
use crate::storage::index_entry::IndexEntry;
use crate::types::{Cid, ItemPointer, Oid, TxnId, INVALID_TXN_ID, MAX_CID};
use crate::{CcError, Result};

// ============================================================================
// Header Slot
// ============================================================================

#[derive(Debug)]
struct HeaderSlot {
    txn_id: AtomicU64,
    begin_cid: AtomicU64,
    end_cid: AtomicU64,
    prev: AtomicU64,
    next: AtomicU64,
    /// Bumped every time the slot is recycled
    generation: AtomicU32,
}

impl HeaderSlot {
    fn new() -> Self {
        Self {
            txn_id: AtomicU64::new(INVALID_TXN_ID),
            begin_cid: AtomicU64::new(MAX_CID),
            end_cid: AtomicU64::new(MAX_CID),
            prev: AtomicU64::new(ItemPointer::NULL.pack()),
            next: AtomicU64::new(ItemPointer::NULL.pack()),
            generation: AtomicU32::new(0),
        }
    }
}

// ============================================================================
// Tile Group Header
// ============================================================================

/// MVCC metadata for every slot of one tile group
#[derive(Debug)]
pub struct TileGroupHeader {
    group_id: Oid,
    slots: Box<[HeaderSlot]>,
    /// Slots below this index have been handed out at least once
    next_unused: AtomicU32,
    /// Slots given back by the garbage collector
    free_list: Mutex<Vec<Oid>>,
}

impl TileGroupHeader {
    pub fn new(group_id: Oid, capacity: usize) -> Self {
        Self {
            group_id,
            slots: (0..capacity).map(|_| HeaderSlot::new()).collect(),
            next_unused: AtomicU32::new(0),
            free_list: Mutex::new(Vec::new()),
        }
    }

    pub fn group_id(&self) -> Oid {
        self.group_id
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn slot(&self, slot: Oid) -> &HeaderSlot {
        let capacity = self.slots.len();
        self.slots.get(slot as usize).unwrap_or_else(|| {
            panic!("slot {} out of range for tile group {} (capacity {})", slot, self.group_id, capacity)
        })
    }

    // ========================================================================
    // Owner
    // ========================================================================

    /// Raw owner word. Protocols that pack extra state into it mask it themselves.
    #[inline]
    pub fn transaction_id(&self, slot: Oid) -> TxnId {
        self.slot(slot).txn_id.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_transaction_id(&self, slot: Oid, txn_id: TxnId) {
        self.slot(slot).txn_id.store(txn_id, Ordering::Release);
    }

    /// Atomic compare-and-swap of the owner word. `Err` carries the word seen.
    #[inline]
    pub fn cas_transaction_id(&self, slot: Oid, expected: TxnId, new: TxnId) -> std::result::Result<TxnId, TxnId> {
        self.slot(slot)
            .txn_id
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
    }

    // ========================================================================
    // Timestamps
    // ========================================================================

    #[inline]
    pub fn begin_commit_id(&self, slot: Oid) -> Cid {
        self.slot(slot).begin_cid.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_begin_commit_id(&self, slot: Oid, cid: Cid) {
        self.slot(slot).begin_cid.store(cid, Ordering::Release);
    }

    #[inline]
    pub fn end_commit_id(&self, slot: Oid) -> Cid {
        self.slot(slot).end_cid.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_end_commit_id(&self, slot: Oid, cid: Cid) {
        self.slot(slot).end_cid.store(cid, Ordering::Release);
    }

    // ========================================================================
    // Version Chain Links
    // ========================================================================

    #[inline]
    pub fn prev_item_pointer(&self, slot: Oid) -> ItemPointer {
        ItemPointer::unpack(self.slot(slot).prev.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_prev_item_pointer(&self, slot: Oid, ptr: ItemPointer) {
        self.slot(slot).prev.store(ptr.pack(), Ordering::Release);
    }

    #[inline]
    pub fn next_item_pointer(&self, slot: Oid) -> ItemPointer {
        ItemPointer::unpack(self.slot(slot).next.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_next_item_pointer(&self, slot: Oid, ptr: ItemPointer) {
        self.slot(slot).next.store(ptr.pack(), Ordering::Release);
    }

    /// Clear `prev` only if it still points at `expected`
    pub fn clear_prev_if(&self, slot: Oid, expected: ItemPointer) -> bool {
        self.slot(slot)
            .prev
            .compare_exchange(expected.pack(), ItemPointer::NULL.pack(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clear `next` only if it still points at `expected`
    pub fn clear_next_if(&self, slot: Oid, expected: ItemPointer) -> bool {
        self.slot(slot)
            .next
            .compare_exchange(expected.pack(), ItemPointer::NULL.pack(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // ========================================================================
    // Slot Lifecycle
    // ========================================================================

    /// Generation of a slot; changes whenever the slot is recycled
    #[inline]
    pub fn generation(&self, slot: Oid) -> u32 {
        self.slot(slot).generation.load(Ordering::Acquire)
    }

    /// Whether the slot is in the free state
    pub fn is_free(&self, slot: Oid) -> bool {
        self.transaction_id(slot) == INVALID_TXN_ID
            && self.begin_commit_id(slot) == MAX_CID
            && self.end_commit_id(slot) == MAX_CID
    }

    /// Hand out a free slot: recycled ones first, then never-used ones
    pub fn allocate_slot(&self) -> Option<Oid> {
        if let Some(slot) = self.free_list.lock().pop() {
            return Some(slot);
        }
        let capacity = self.slots.len() as u32;
        self.next_unused
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < capacity).then_some(n + 1))
            .ok()
    }

    /// Reset a slot to the free state and put it back on the free list
    pub(crate) fn recycle_slot(&self, slot: Oid) {
        let s = self.slot(slot);
        s.begin_cid.store(MAX_CID, Ordering::Release);
        s.end_cid.store(MAX_CID, Ordering::Release);
        s.prev.store(ItemPointer::NULL.pack(), Ordering::Release);
        s.next.store(ItemPointer::NULL.pack(), Ordering::Release);
        s.generation.fetch_add(1, Ordering::AcqRel);
        s.txn_id.store(INVALID_TXN_ID, Ordering::Release);
        self.free_list.lock().push(slot);
    }

    /// Slots currently handed out (never-used slots excluded)
    pub fn allocated_count(&self) -> usize {
        self.next_unused.load(Ordering::Acquire) as usize - self.free_list.lock().len()
    }
}

// ============================================================================
// Tile Group
// ============================================================================

/// A block of tuple slots: MVCC header plus row payloads
#[derive(Debug)]
pub struct TileGroup {
    id: Oid,
    schema: Arc<Schema>,
    header: TileGroupHeader,
    rows: Box<[RwLock<Vec<Value>>]>,
    /// Back-pointers the garbage collector follows to move an index entry
    /// off a slot before freeing it
    index_links: Box<[Mutex<Option<Arc<IndexEntry>>>]>,
}

impl TileGroup {
    pub fn new(id: Oid, schema: Arc<Schema>, capacity: usize) -> Self {
        Self {
            id,
            header: TileGroupHeader::new(id, capacity),
            rows: (0..capacity).map(|_| RwLock::new(schema.empty_row())).collect(),
            index_links: (0..capacity).map(|_| Mutex::new(None)).collect(),
            schema,
        }
    }

    pub fn id(&self) -> Oid {
        self.id
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn header(&self) -> &TileGroupHeader {
        &self.header
    }

    pub fn capacity(&self) -> usize {
        self.rows.len()
    }

    /// Allocate a free slot and return its location
    pub fn allocate(&self) -> Result<ItemPointer> {
        self.header
            .allocate_slot()
            .map(|slot| ItemPointer::new(self.id, slot))
            .ok_or(CcError::TileGroupFull(self.id))
    }

    #[inline]
    fn row(&self, slot: Oid) -> &RwLock<Vec<Value>> {
        let capacity = self.rows.len();
        self.rows
            .get(slot as usize)
            .unwrap_or_else(|| panic!("slot {} out of range for tile group {} (capacity {})", slot, self.id, capacity))
    }

    pub fn read_row(&self, slot: Oid) -> Vec<Value> {
        self.row(slot).read().clone()
    }

    pub fn value(&self, slot: Oid, column: ColumnId) -> Value {
        self.row(slot)
            .read()
            .get(column as usize)
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn set_value(&self, slot: Oid, column: ColumnId, value: Value) {
        let mut row = self.row(slot).write();
        assert!((column as usize) < row.len(), "column {} out of range", column);
        row[column as usize] = value;
    }

    pub fn write_row(&self, slot: Oid, values: Vec<Value>) {
        assert_eq!(values.len(), self.schema.len(), "row width does not match schema");
        *self.row(slot).write() = values;
    }

    #[inline]
    fn index_link(&self, slot: Oid) -> &Mutex<Option<Arc<IndexEntry>>> {
        let capacity = self.index_links.len();
        self.index_links
            .get(slot as usize)
            .unwrap_or_else(|| panic!("slot {} out of range for tile group {} (capacity {})", slot, self.id, capacity))
    }

    /// Index entry registered for the version in `slot`
    pub fn index_entry(&self, slot: Oid) -> Option<Arc<IndexEntry>> {
        self.index_link(slot).lock().clone()
    }

    pub fn set_index_entry(&self, slot: Oid, entry: Option<Arc<IndexEntry>>) {
        *self.index_link(slot).lock() = entry;
    }

    pub(crate) fn take_index_entry(&self, slot: Oid) -> Option<Arc<IndexEntry>> {
        self.index_link(slot).lock().take()
    }

    /// Copy the payload of `from_slot` into `to_slot` of `target`
    pub fn copy_row(&self, from_slot: Oid, target: &TileGroup, to_slot: Oid) {
        let values = self.read_row(from_slot);
        target.write_row(to_slot, values);
    }
}
