//! Protocol selection

use std::sync::Arc;

use super::manager::{ManagerCore, TransactionManager};
use super::protocol::{
    EagerWriteTxnManager, OptimisticRbTxnManager, OptimisticTxnManager, PessimisticTxnManager, SsiTxnManager,
    TsOrderTxnManager,
};
use crate::types::ProtocolKind;

/// Build the manager for `kind` around a database's shared collaborators
pub fn create_manager(kind: ProtocolKind, core: ManagerCore) -> Arc<dyn TransactionManager> {
    log::info!("concurrency control protocol: {}", kind);
    match kind {
        ProtocolKind::Pessimistic => Arc::new(PessimisticTxnManager::new(core)),
        ProtocolKind::Optimistic => Arc::new(OptimisticTxnManager::new(core)),
        ProtocolKind::OptimisticRb => Arc::new(OptimisticRbTxnManager::new(core)),
        ProtocolKind::TimestampOrdering => Arc::new(TsOrderTxnManager::new(core)),
        ProtocolKind::Ssi => Arc::new(SsiTxnManager::new(core)),
        ProtocolKind::EagerWrite => Arc::new(EagerWriteTxnManager::new(core)),
    }
}
