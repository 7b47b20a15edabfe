//! Catalog - resolves tile group ids to tile groups

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use super::tile_group::TileGroup;
use crate::data::Schema;
use crate::types::{ItemPointer, Oid};
use crate::{CcError, Result};

/// Registry of every live tile group of a database
#[derive(Debug, Default)]
pub struct Catalog {
    groups: RwLock<AHashMap<Oid, Arc<TileGroup>>>,
    next_group_id: AtomicU32,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a tile group with `capacity` slots
    pub fn create_tile_group(&self, schema: Arc<Schema>, capacity: usize) -> Arc<TileGroup> {
        let id = self.next_group_id.fetch_add(1, Ordering::Relaxed);
        let group = Arc::new(TileGroup::new(id, schema, capacity));
        self.groups.write().insert(id, Arc::clone(&group));
        log::debug!("created tile group {} with {} slots", id, capacity);
        group
    }

    pub fn get_tile_group(&self, id: Oid) -> Result<Arc<TileGroup>> {
        self.groups
            .read()
            .get(&id)
            .cloned()
            .ok_or(CcError::TileGroupNotFound(id))
    }

    /// Lookup for locations a transaction already holds; a miss is a broken invariant
    pub(crate) fn group_of(&self, location: ItemPointer) -> Arc<TileGroup> {
        match self.groups.read().get(&location.block) {
            Some(group) => Arc::clone(group),
            None => panic!("tile group of {} is not registered", location),
        }
    }

    pub fn tile_groups(&self) -> Vec<Arc<TileGroup>> {
        let mut groups: Vec<_> = self.groups.read().values().cloned().collect();
        groups.sort_by_key(|g| g.id());
        groups
    }

    pub fn drop_tile_group(&self, id: Oid) -> Result<()> {
        self.groups
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(CcError::TileGroupNotFound(id))
    }

    pub fn len(&self) -> usize {
        self.groups.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.read().is_empty()
    }
}
