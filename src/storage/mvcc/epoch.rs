//! Epoch Manager - bounds the begin timestamps of live transactions
//!
//! Time is cut into epochs kept in a fixed ring. A transaction registers
//! in the current epoch and only then draws its begin timestamp, so every
//! live transaction's begin is at least the commit counter value recorded
//! when its epoch opened. The tail is the oldest epoch still referenced;
//! its `start_cid` is the safe floor below which superseded state is no
//! longer observable by anyone.
//!
//! ```text
//!   tail                         current
//!    │                              │
//!    ▼                              ▼
//!  [e5: 2 refs][e6: 0][e7: 1 ref][e8: 3 refs][ free ... ]
//!    start=40   start=52 ...        start=77
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::types::{Cid, TxnId, START_CID, START_TXN_ID};
use crate::Result;

// ============================================================================
// Id Allocator
// ============================================================================

/// Per-database source of transaction ids and commit timestamps.
///
/// Begin and commit timestamps come from the same counter.
#[derive(Debug)]
pub struct IdAllocator {
    next_txn_id: AtomicU64,
    next_cid: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next_txn_id: AtomicU64::new(START_TXN_ID),
            next_cid: AtomicU64::new(START_CID),
        }
    }

    pub fn next_transaction_id(&self) -> TxnId {
        self.next_txn_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_commit_id(&self) -> Cid {
        self.next_cid.fetch_add(1, Ordering::SeqCst)
    }

    /// The id the next `next_commit_id` call will return, without allocating it
    pub fn current_commit_id(&self) -> Cid {
        self.next_cid.load(Ordering::SeqCst)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Default ticker period
const DEFAULT_EPOCH_INTERVAL_MS: u64 = 40;

/// Default number of epochs in the ring
const DEFAULT_EPOCH_RING_CAPACITY: usize = 4096;

/// Epoch configuration
#[derive(Debug, Clone)]
pub struct EpochConfig {
    /// Period of the background ticker
    pub interval: Duration,
    /// Ring size; at least 2
    pub capacity: usize,
}

impl Default for EpochConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_EPOCH_INTERVAL_MS),
            capacity: DEFAULT_EPOCH_RING_CAPACITY,
        }
    }
}

// ============================================================================
// Epoch
// ============================================================================

#[derive(Debug)]
struct Epoch {
    ref_count: AtomicU32,
    /// Highest begin timestamp of any transaction that entered
    max_begin_cid: AtomicU64,
    /// Commit counter value when the epoch opened
    start_cid: AtomicU64,
}

impl Epoch {
    fn new(start_cid: Cid) -> Self {
        Self {
            ref_count: AtomicU32::new(0),
            max_begin_cid: AtomicU64::new(0),
            start_cid: AtomicU64::new(start_cid),
        }
    }
}

/// Proof of registration in an epoch; hand it back to `exit_epoch` exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EpochToken(u64);

impl EpochToken {
    pub fn epoch(&self) -> u64 {
        self.0
    }
}

/// Registration that exits its epoch when dropped, so a transaction that
/// is abandoned without commit or abort cannot pin the floor
pub struct EpochGuard {
    epochs: Arc<EpochManager>,
    token: EpochToken,
}

impl EpochGuard {
    pub fn token(&self) -> EpochToken {
        self.token
    }
}

impl Drop for EpochGuard {
    fn drop(&mut self) {
        self.epochs.exit_epoch(self.token);
    }
}

impl std::fmt::Debug for EpochGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EpochGuard").field(&self.token.0).finish()
    }
}

// ============================================================================
// Epoch Manager
// ============================================================================

pub struct EpochManager {
    config: EpochConfig,
    ids: Arc<IdAllocator>,
    ring: Box<[CachePadded<Epoch>]>,
    /// Absolute number of the epoch new transactions enter
    current: AtomicU64,
    /// Absolute number of the oldest epoch that may still be referenced
    tail: AtomicU64,
    /// Serializes entering against epoch turnover
    gate: Mutex<()>,
    max_dead_begin: AtomicU64,
}

impl EpochManager {
    pub fn new(config: EpochConfig, ids: Arc<IdAllocator>) -> Self {
        assert!(config.capacity >= 2, "epoch ring needs at least two slots");
        let start = ids.current_commit_id();
        Self {
            ring: (0..config.capacity).map(|_| CachePadded::new(Epoch::new(start))).collect(),
            config,
            ids,
            current: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            gate: Mutex::new(()),
            max_dead_begin: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &EpochConfig {
        &self.config
    }

    pub fn id_allocator(&self) -> &Arc<IdAllocator> {
        &self.ids
    }

    #[inline]
    fn epoch(&self, number: u64) -> &Epoch {
        &self.ring[(number % self.ring.len() as u64) as usize]
    }

    /// Register in the current epoch and draw a begin timestamp.
    ///
    /// The timestamp is drawn after registration, so it can never fall
    /// below the floor computed while this transaction is live.
    pub fn enter_epoch(&self) -> (EpochToken, Cid) {
        let number = {
            let _gate = self.gate.lock();
            let number = self.current.load(Ordering::Acquire);
            self.epoch(number).ref_count.fetch_add(1, Ordering::AcqRel);
            number
        };
        let begin_cid = self.ids.next_commit_id();
        self.epoch(number).max_begin_cid.fetch_max(begin_cid, Ordering::AcqRel);
        (EpochToken(number), begin_cid)
    }

    /// `enter_epoch` with the exit tied to the returned guard
    pub fn enter(self: &Arc<Self>) -> (EpochGuard, Cid) {
        let (token, begin_cid) = self.enter_epoch();
        (EpochGuard { epochs: Arc::clone(self), token }, begin_cid)
    }

    pub fn exit_epoch(&self, token: EpochToken) {
        let previous = self.epoch(token.0).ref_count.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "epoch {} exited more often than entered", token.0);
    }

    /// One tick: open a new epoch and move the tail past drained ones.
    ///
    /// Returns false when the ring is full and the oldest epoch is still
    /// referenced; the current epoch then stays open.
    pub fn advance(&self) -> bool {
        let _gate = self.gate.lock();
        let current = self.current.load(Ordering::Acquire);
        let next = current + 1;
        let capacity = self.ring.len() as u64;

        if next - self.tail.load(Ordering::Acquire) >= capacity {
            self.advance_tail_locked(current);
            if next - self.tail.load(Ordering::Acquire) >= capacity {
                log::warn!("epoch ring full, epoch {} still referenced", self.tail.load(Ordering::Acquire));
                return false;
            }
        }

        let epoch = self.epoch(next);
        epoch.ref_count.store(0, Ordering::Release);
        epoch.max_begin_cid.store(0, Ordering::Release);
        epoch.start_cid.store(self.ids.current_commit_id(), Ordering::Release);
        self.current.store(next, Ordering::Release);

        self.advance_tail_locked(next);
        true
    }

    fn advance_tail_locked(&self, current: u64) {
        let mut tail = self.tail.load(Ordering::Acquire);
        while tail < current {
            let epoch = self.epoch(tail);
            if epoch.ref_count.load(Ordering::Acquire) != 0 {
                break;
            }
            self.max_dead_begin
                .fetch_max(epoch.max_begin_cid.load(Ordering::Acquire), Ordering::AcqRel);
            tail += 1;
        }
        self.tail.store(tail, Ordering::Release);
    }

    /// Every live transaction began at or after this timestamp; anything
    /// that stopped being current before it can be reclaimed
    pub fn safe_commit_floor(&self) -> Cid {
        let _gate = self.gate.lock();
        let tail = self.tail.load(Ordering::Acquire);
        self.epoch(tail).start_cid.load(Ordering::Acquire)
    }

    /// Highest begin timestamp among drained epochs
    pub fn max_dead_begin_cid(&self) -> Cid {
        self.max_dead_begin.load(Ordering::Acquire)
    }

    pub fn current_epoch(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    pub fn tail_epoch(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    /// Transactions registered in epochs `tail..=current`
    pub fn active_count(&self) -> u64 {
        let _gate = self.gate.lock();
        let current = self.current.load(Ordering::Acquire);
        (self.tail.load(Ordering::Acquire)..=current)
            .map(|n| self.epoch(n).ref_count.load(Ordering::Acquire) as u64)
            .sum()
    }

    /// Start a background thread that calls `advance` every interval and
    /// then `on_tick` with the new safe floor
    pub fn spawn_ticker<F>(self: &Arc<Self>, on_tick: F) -> Result<EpochTicker>
    where
        F: Fn(Cid) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let manager = Arc::clone(self);
        let stop_flag = Arc::clone(&stop);
        let interval = self.config.interval;

        let handle = thread::Builder::new()
            .name("tilecc-epoch".to_string())
            .spawn(move || {
                while !stop_flag.load(Ordering::Acquire) {
                    thread::park_timeout(interval);
                    if stop_flag.load(Ordering::Acquire) {
                        break;
                    }
                    manager.advance();
                    on_tick(manager.safe_commit_floor());
                }
            })?;

        log::info!("epoch ticker started ({:?} interval)", interval);
        Ok(EpochTicker { stop, handle: Some(handle) })
    }
}

// ============================================================================
// Epoch Ticker
// ============================================================================

/// Handle to the background ticker; stopping or dropping it joins the thread
pub struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                log::error!("epoch ticker thread panicked");
            } else {
                log::info!("epoch ticker stopped");
            }
        }
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
