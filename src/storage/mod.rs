//! Storage module - tile groups and the MVCC machinery around them
//!
//! Tile groups hold tuple slots with their MVCC headers; the catalog
//! resolves group ids; `mvcc` tracks epochs, undo records and garbage;
//! `wal` receives committed writes.

pub mod catalog;
pub mod extension;
pub mod index_entry;
pub mod mvcc;
pub mod tile_group;
pub mod wal;

pub use catalog::Catalog;
pub use extension::{ExtensionArena, ExtensionRef, SlotExtension};
pub use index_entry::IndexEntry;
pub use tile_group::{TileGroup, TileGroupHeader};
pub use wal::{CommitLog, LogRecord, MemoryLog, WalLog};
