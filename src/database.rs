//! Database - the per-instance handle
//!
//! Owns everything one instance shares among its transactions: the tile
//! group catalog, the id counters and epoch ring, the rollback pools, the
//! garbage collector, the optional commit log and the protocol chosen by
//! the configuration. Nothing here is global; two databases in one process
//! never see each other's transactions.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::CcConfig;
use crate::data::Schema;
use crate::storage::catalog::Catalog;
use crate::storage::mvcc::{EpochManager, EpochTicker, GarbageCollector, GcStats, IdAllocator, SegmentDirectory};
use crate::storage::tile_group::TileGroup;
use crate::storage::wal::{CommitLog, WalLog};
use crate::txn::{create_manager, ManagerCore, TransactionManager};
use crate::types::ProtocolKind;
use crate::Result;

pub struct Database {
    config: CcConfig,
    catalog: Arc<Catalog>,
    epochs: Arc<EpochManager>,
    segments: Arc<SegmentDirectory>,
    gc: Arc<GarbageCollector>,
    log: Option<Arc<dyn CommitLog>>,
    manager: Arc<dyn TransactionManager>,
    ticker: Mutex<Option<EpochTicker>>,
}

impl Database {
    /// Open a database; a configured `wal_path` is opened as the commit log
    pub fn open(config: CcConfig) -> Result<Self> {
        let log = match &config.wal_path {
            Some(path) => Some(Arc::new(WalLog::open(path)?) as Arc<dyn CommitLog>),
            None => None,
        };
        Self::with_log(config, log)
    }

    /// In-memory database with default settings and no commit log
    pub fn in_memory(protocol: ProtocolKind) -> Result<Self> {
        Self::with_log(CcConfig::with_protocol(protocol), None)
    }

    /// Open a database that writes committed changes to `log`
    pub fn with_log(config: CcConfig, log: Option<Arc<dyn CommitLog>>) -> Result<Self> {
        config.validate()?;

        let catalog = Arc::new(Catalog::new());
        let ids = Arc::new(IdAllocator::new());
        let epochs = Arc::new(EpochManager::new(config.epoch_config(), ids));
        let segments = Arc::new(SegmentDirectory::new());
        let gc = Arc::new(GarbageCollector::with_config(config.gc_config()));

        let core = ManagerCore::new(
            Arc::clone(&catalog),
            Arc::clone(&epochs),
            Arc::clone(&segments),
            Arc::clone(&gc),
            log.clone(),
        );
        let manager = create_manager(config.protocol, core);

        Ok(Self {
            config,
            catalog,
            epochs,
            segments,
            gc,
            log,
            manager,
            ticker: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &CcConfig {
        &self.config
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.config.protocol
    }

    pub fn txn_manager(&self) -> &Arc<dyn TransactionManager> {
        &self.manager
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn epoch_manager(&self) -> &Arc<EpochManager> {
        &self.epochs
    }

    pub fn segments(&self) -> &Arc<SegmentDirectory> {
        &self.segments
    }

    pub fn gc(&self) -> &Arc<GarbageCollector> {
        &self.gc
    }

    pub fn commit_log(&self) -> Option<&Arc<dyn CommitLog>> {
        self.log.as_ref()
    }

    pub fn create_tile_group(&self, schema: Arc<Schema>, capacity: usize) -> Arc<TileGroup> {
        self.catalog.create_tile_group(schema, capacity)
    }

    // ========================================================================
    // Background Maintenance
    // ========================================================================

    /// Start the epoch ticker; each tick may also run GC and protocol cleanup
    pub fn start_background(&self) -> Result<()> {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return Ok(());
        }

        let catalog = Arc::clone(&self.catalog);
        let segments = Arc::clone(&self.segments);
        let gc = Arc::clone(&self.gc);
        let manager = Arc::clone(&self.manager);
        *ticker = Some(self.epochs.spawn_ticker(move |floor| {
            manager.collect(floor);
            gc.maybe_run(&catalog, &segments, floor, manager.chain_order());
        })?);
        Ok(())
    }

    pub fn is_background_running(&self) -> bool {
        self.ticker.lock().as_ref().is_some_and(EpochTicker::is_running)
    }

    /// Stop the ticker and wait for it to exit
    pub fn shutdown(&self) {
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.stop();
        }
    }

    /// Advance the epoch and collect everything below the new floor now
    pub fn collect_garbage(&self) -> Option<GcStats> {
        self.epochs.advance();
        let floor = self.epochs.safe_commit_floor();
        self.manager.collect(floor);
        self.gc.run(&self.catalog, &self.segments, floor, self.manager.chain_order())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataType;
    use crate::storage::wal::LogRecord;
    use crate::types::{TxnResult, START_CID};
    use std::time::Duration;

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::from_pairs(&[("id", DataType::Int64)]))
    }

    #[test]
    fn test_open_every_protocol() {
        for kind in ProtocolKind::ALL {
            let db = Database::in_memory(kind).unwrap();
            assert_eq!(db.protocol(), kind);
            assert_eq!(db.txn_manager().protocol(), kind);
            assert_eq!(db.txn_manager().uses_rollback_segments(), kind == ProtocolKind::OptimisticRb);
        }
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = CcConfig { epoch_ring_capacity: 0, ..CcConfig::default() };
        assert!(Database::open(config).is_err());
    }

    #[test]
    fn test_databases_are_independent() {
        let a = Database::in_memory(ProtocolKind::Optimistic).unwrap();
        let b = Database::in_memory(ProtocolKind::Optimistic).unwrap();

        let mut t = a.txn_manager().begin_transaction();
        a.txn_manager().commit_transaction(&mut t);
        assert_eq!(a.txn_manager().core().total_committed(), 1);
        assert_eq!(b.txn_manager().core().total_committed(), 0);
        assert_eq!(b.epoch_manager().id_allocator().current_commit_id(), START_CID);
    }

    #[test]
    fn test_background_ticker() {
        let config = CcConfig { epoch_interval_ms: 1, ..CcConfig::default() };
        let db = Database::open(config).unwrap();
        db.start_background().unwrap();
        db.start_background().unwrap();
        assert!(db.is_background_running());

        let start = db.epoch_manager().current_epoch();
        std::thread::sleep(Duration::from_millis(50));
        assert!(db.epoch_manager().current_epoch() > start);

        db.shutdown();
        assert!(!db.is_background_running());
    }

    #[test]
    fn test_open_with_wal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commit.wal");
        let config = CcConfig { wal_path: Some(path.clone()), ..CcConfig::default() };

        {
            let db = Database::open(config).unwrap();
            let group = db.create_tile_group(schema(), 4);
            let manager = db.txn_manager();

            let mut t = manager.begin_transaction();
            let loc = group.allocate().unwrap();
            group.write_row(loc.offset, vec![7i64.into()]);
            manager.perform_insert(&mut t, loc, None);
            assert_eq!(manager.commit_transaction(&mut t), TxnResult::Success);
        }

        let records = WalLog::read_all(&path).unwrap();
        assert!(matches!(records.first(), Some(LogRecord::Begin { .. })));
        assert!(matches!(records.get(1), Some(LogRecord::Insert { .. })));
        assert!(matches!(records.last(), Some(LogRecord::Commit { .. })));
    }
}
