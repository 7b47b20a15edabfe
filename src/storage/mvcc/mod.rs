//! MVCC support subsystem
//!
//! Decides when superseded state may be reclaimed:
//! - Epochs bound the begin timestamps of live transactions
//! - Rollback segments keep before-images for in-place updates
//! - Garbage collection recycles slots and pools below the safe floor
//!
//! Architecture:
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │              EpochManager                         │
//! │  - Ring of epochs with reference counts          │
//! │  - safe_commit_floor(): oldest observable cid    │
//! ├──────────────────────────────────────────────────┤
//! │  SegmentDirectory / RollbackSegmentPool          │
//! │  - Per-transaction arenas of undo records        │
//! │  - Retained until the floor passes their seal    │
//! ├──────────────────────────────────────────────────┤
//! │  GarbageCollector                                │
//! │  - Recycles dead tuple slots                     │
//! │  - Reclaims retained and garbage pools           │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod epoch;
pub mod gc;
pub mod rollback;

pub use epoch::{EpochConfig, EpochGuard, EpochManager, EpochTicker, EpochToken, IdAllocator};
pub use gc::{GarbageCollector, GcConfig, GcStats};
pub use rollback::{PoolId, RollbackSegment, RollbackSegmentPool, SegmentDirectory, SegmentRef};
