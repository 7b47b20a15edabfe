//! Rollback segments - before-images for in-place updates
//!
//! A transaction that updates a tuple in place first copies the columns it
//! is about to overwrite into a segment of its own pool and prepends that
//! segment to the tuple's undo chain. Commit seals the segments with the
//! commit timestamp; abort replays them onto the tuple. Readers whose
//! snapshot predates a segment apply it to rebuild the image they may see.
//!
//! Segment payload layout (little endian):
//! ```text
//! per target column, at its recorded offset:
//!   flag: 1 byte (0 = NULL, 1 = value)
//!   value: Bool 1B | Int32 4B | Int64 8B | Float64 8B | String u32 len + bytes
//! ```

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Mutex, RwLock};

use crate::data::{ColumnId, DataType, Schema, Value};
use crate::storage::tile_group::TileGroup;
use crate::types::{Cid, Oid, MAX_CID};

/// Pool identifier; unique for the lifetime of a database
pub type PoolId = u32;

/// Bytes charged per segment for its fixed fields
const SEGMENT_HEADER_SIZE: usize = 26;
/// Bytes charged per target column entry
const COLUMN_ENTRY_SIZE: usize = 6;

const NULL_SEGMENT: u64 = u64::MAX;

// ============================================================================
// Segment Reference
// ============================================================================

/// Address of a segment: (pool, index within pool)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentRef {
    pub pool: PoolId,
    pub index: u32,
}

impl SegmentRef {
    pub fn pack(self) -> u64 {
        ((self.pool as u64) << 32) | self.index as u64
    }

    pub fn unpack(word: u64) -> Option<Self> {
        (word != NULL_SEGMENT).then(|| Self {
            pool: (word >> 32) as PoolId,
            index: word as u32,
        })
    }

    /// Packed form of "no segment"
    pub fn pack_opt(r: Option<SegmentRef>) -> u64 {
        r.map(SegmentRef::pack).unwrap_or(NULL_SEGMENT)
    }
}

// ============================================================================
// Rollback Segment
// ============================================================================

#[derive(Debug)]
pub struct RollbackSegment {
    next: AtomicU64,
    /// MAX_CID until sealed by the owner's commit
    timestamp: AtomicU64,
    /// Begin timestamp of the image this segment restores
    restored_begin: Cid,
    columns: Vec<(ColumnId, u32)>,
    data: Box<[u8]>,
}

impl RollbackSegment {
    pub fn next(&self) -> Option<SegmentRef> {
        SegmentRef::unpack(self.next.load(Ordering::Acquire))
    }

    pub fn set_next(&self, next: Option<SegmentRef>) {
        self.next.store(SegmentRef::pack_opt(next), Ordering::Release);
    }

    pub fn timestamp(&self) -> Cid {
        self.timestamp.load(Ordering::Acquire)
    }

    pub fn is_sealed(&self) -> bool {
        self.timestamp() != MAX_CID
    }

    pub fn seal(&self, commit_id: Cid) {
        self.timestamp.store(commit_id, Ordering::Release);
    }

    pub fn restored_begin(&self) -> Cid {
        self.restored_begin
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_ids(&self) -> impl Iterator<Item = ColumnId> + '_ {
        self.columns.iter().map(|(id, _)| *id)
    }

    /// Decoded before-image of the `i`-th target column
    pub fn value(&self, i: usize, schema: &Schema) -> Value {
        let (column, offset) = self.columns[i];
        match schema.column(column) {
            Some(def) => decode_value(&self.data[offset as usize..], def.data_type),
            None => Value::Null,
        }
    }

    /// Overwrite the target columns of an in-memory row
    pub fn apply_to_row(&self, schema: &Schema, row: &mut [Value]) {
        for (i, (column, _)) in self.columns.iter().enumerate() {
            if let Some(cell) = row.get_mut(*column as usize) {
                *cell = self.value(i, schema);
            }
        }
    }

    /// Overwrite the target columns of the stored tuple
    pub fn apply_to_tuple(&self, group: &TileGroup, slot: Oid) {
        let schema = group.schema();
        for (i, (column, _)) in self.columns.iter().enumerate() {
            group.set_value(slot, *column, self.value(i, schema));
        }
    }

    pub fn allocated_size(&self) -> usize {
        SEGMENT_HEADER_SIZE + COLUMN_ENTRY_SIZE * self.columns.len() + self.data.len()
    }
}

fn encode_value(buf: &mut [u8], value: &Value, data_type: DataType) {
    match (data_type, value) {
        (DataType::Bool, Value::Bool(v)) => {
            buf[0] = 1;
            buf[1] = *v as u8;
        }
        (DataType::Int32, Value::Int32(v)) => {
            buf[0] = 1;
            LittleEndian::write_i32(&mut buf[1..5], *v);
        }
        (DataType::Int64, Value::Int64(v)) => {
            buf[0] = 1;
            LittleEndian::write_i64(&mut buf[1..9], *v);
        }
        (DataType::Float64, Value::Float64(v)) => {
            buf[0] = 1;
            LittleEndian::write_f64(&mut buf[1..9], *v);
        }
        (DataType::String, Value::String(s)) => {
            buf[0] = 1;
            LittleEndian::write_u32(&mut buf[1..5], s.len() as u32);
            buf[5..5 + s.len()].copy_from_slice(s.as_bytes());
        }
        // NULL or a value the column cannot hold: flag stays 0
        _ => {}
    }
}

fn decode_value(buf: &[u8], data_type: DataType) -> Value {
    if buf.first().copied() != Some(1) {
        return Value::Null;
    }
    let payload = &buf[1..];
    match data_type {
        DataType::Bool => Value::Bool(payload[0] != 0),
        DataType::Int32 => Value::Int32(LittleEndian::read_i32(payload)),
        DataType::Int64 => Value::Int64(LittleEndian::read_i64(payload)),
        DataType::Float64 => Value::Float64(LittleEndian::read_f64(payload)),
        DataType::String => {
            let len = LittleEndian::read_u32(payload) as usize;
            Value::String(String::from_utf8_lossy(&payload[4..4 + len]).into_owned())
        }
    }
}

// ============================================================================
// Rollback Segment Pool
// ============================================================================

/// Arena of the segments one transaction created
#[derive(Debug)]
pub struct RollbackSegmentPool {
    id: PoolId,
    segments: RwLock<Vec<Arc<RollbackSegment>>>,
    allocated_bytes: AtomicUsize,
}

impl RollbackSegmentPool {
    fn new(id: PoolId) -> Self {
        Self {
            id,
            segments: RwLock::new(Vec::new()),
            allocated_bytes: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    /// Copy the current values of `target_columns` into a new, unsealed,
    /// unlinked segment
    pub fn create_segment_from_tuple(
        &self,
        schema: &Schema,
        target_columns: &[ColumnId],
        row: &[Value],
        restored_begin: Cid,
    ) -> SegmentRef {
        let mut columns = Vec::with_capacity(target_columns.len());
        let mut size = 0usize;
        for &column in target_columns {
            let def = schema
                .column(column)
                .unwrap_or_else(|| panic!("column {} is not in the schema", column));
            columns.push((column, size as u32));
            size += def.encoded_len(&row[column as usize]);
        }

        let mut data = vec![0u8; size].into_boxed_slice();
        for &(column, offset) in &columns {
            let def = &schema.columns()[column as usize];
            encode_value(&mut data[offset as usize..], &row[column as usize], def.data_type);
        }

        let segment = RollbackSegment {
            next: AtomicU64::new(NULL_SEGMENT),
            timestamp: AtomicU64::new(MAX_CID),
            restored_begin,
            columns,
            data,
        };
        self.allocated_bytes
            .fetch_add(segment.allocated_size(), Ordering::Relaxed);

        let mut segments = self.segments.write();
        segments.push(Arc::new(segment));
        SegmentRef { pool: self.id, index: (segments.len() - 1) as u32 }
    }

    pub fn segment(&self, index: u32) -> Option<Arc<RollbackSegment>> {
        self.segments.read().get(index as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.segments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.read().is_empty()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Segment Directory
// ============================================================================

/// Per-database table of rollback pools
///
/// Pools stay resolvable while live, while retained for readers that may
/// still need committed before-images, and while waiting as garbage after
/// an abort. `reclaim` drops them once the safe floor passes.
#[derive(Debug, Default)]
pub struct SegmentDirectory {
    next_pool_id: AtomicU32,
    pools: RwLock<AHashMap<PoolId, Arc<RollbackSegmentPool>>>,
    retained: Mutex<BTreeSet<(Cid, PoolId)>>,
    garbage: Mutex<Vec<(Cid, PoolId)>>,
}

impl SegmentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_pool(&self) -> Arc<RollbackSegmentPool> {
        let id = self.next_pool_id.fetch_add(1, Ordering::Relaxed);
        let pool = Arc::new(RollbackSegmentPool::new(id));
        self.pools.write().insert(id, Arc::clone(&pool));
        pool
    }

    /// Resolve a reference; a reference into a reclaimed pool resolves to nothing
    pub fn resolve(&self, r: SegmentRef) -> Option<Arc<RollbackSegment>> {
        let pool = Arc::clone(self.pools.read().get(&r.pool)?);
        pool.segment(r.index)
    }

    /// Keep a committed pool until the floor passes `end_commit_id`
    pub fn retain(&self, pool: &RollbackSegmentPool, end_commit_id: Cid) {
        if pool.is_empty() {
            self.discard(pool.id());
            return;
        }
        self.retained.lock().insert((end_commit_id, pool.id()));
    }

    /// Keep an aborted pool until the floor passes `retire_cid`
    pub fn mark_garbage(&self, pool: &RollbackSegmentPool, retire_cid: Cid) {
        if pool.is_empty() {
            self.discard(pool.id());
            return;
        }
        self.garbage.lock().push((retire_cid, pool.id()));
    }

    fn discard(&self, pool_id: PoolId) {
        self.pools.write().remove(&pool_id);
    }

    /// Drop every retained or garbage pool whose timestamp is below `floor`
    pub fn reclaim(&self, floor: Cid) -> usize {
        let mut expired = Vec::new();
        {
            let mut retained = self.retained.lock();
            while retained.first().is_some_and(|&(cid, _)| cid < floor) {
                if let Some((_, pool_id)) = retained.pop_first() {
                    expired.push(pool_id);
                }
            }
        }
        {
            let mut garbage = self.garbage.lock();
            garbage.retain(|&(cid, pool_id)| {
                if cid < floor {
                    expired.push(pool_id);
                    false
                } else {
                    true
                }
            });
        }

        if !expired.is_empty() {
            let mut pools = self.pools.write();
            for pool_id in &expired {
                pools.remove(pool_id);
            }
        }
        expired.len()
    }

    pub fn live_pools(&self) -> usize {
        self.pools.read().len()
    }

    pub fn retained_count(&self) -> usize {
        self.retained.lock().len()
    }

    pub fn garbage_count(&self) -> usize {
        self.garbage.lock().len()
    }
}
