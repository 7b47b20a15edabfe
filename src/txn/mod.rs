//! Transaction Manager - MVCC concurrency control for the tile-group store
//!
//! Architecture:
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  TransactionManager (one per protocol)           │
//! │  - Visibility and ownership of versions          │
//! │  - perform_read / insert / update / delete       │
//! │  - Commit (validate, install) and abort          │
//! ├──────────────────────────────────────────────────┤
//! │  ManagerCore                                     │
//! │  - Epochs, commit ids, rollback pools, GC queue  │
//! │  - Install and rollback phases                   │
//! ├──────────────────────────────────────────────────┤
//! │  Transaction                                     │
//! │  - Begin/end timestamps                          │
//! │  - Read/write set                                │
//! ├──────────────────────────────────────────────────┤
//! │  ConflictTracker (SSI)                           │
//! │  - rw-antidependency flags                       │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod conflict;
pub mod context;
pub mod factory;
pub mod manager;
pub mod protocol;

#[cfg(test)]
mod tests;

pub use conflict::{ConflictResult, ConflictTracker};
pub use context::Transaction;
pub use factory::create_manager;
pub use manager::{snapshot_visibility, ChainOrder, ManagerCore, TransactionManager};
