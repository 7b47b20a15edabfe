//! Optimistic protocol - snapshot reads, read-set validation at commit
//!
//! Uses the shared skeleton unchanged: readers never block writers, and a
//! transaction whose reads were overwritten before its commit timestamp
//! aborts during validation.

use crate::txn::manager::{ManagerCore, TransactionManager};
use crate::types::ProtocolKind;

pub struct OptimisticTxnManager {
    core: ManagerCore,
}

impl OptimisticTxnManager {
    pub fn new(core: ManagerCore) -> Self {
        Self { core }
    }
}

impl TransactionManager for OptimisticTxnManager {
    fn core(&self) -> &ManagerCore {
        &self.core
    }

    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Optimistic
    }
}
