//! tilecc - multi-protocol MVCC concurrency control for a tile-group row store
//!
//! Every tuple slot carries an owner word and a validity interval
//! `[begin_cid, end_cid)`. A `TransactionManager` decides per slot whether a
//! transaction may see it, own it, or must give up, and installs or rolls
//! back a transaction's writes atomically with respect to readers.
//!
//! Six protocols share that data model: pessimistic read locks, optimistic
//! validation, optimistic with rollback segments, timestamp ordering,
//! serializable snapshot isolation and eager writes with wait-die.
//! A `Database` owns the counters, epochs and registries one instance needs.

pub mod config;
pub mod data;
pub mod database;
pub mod storage;
pub mod txn;
pub mod types;

// Re-export main types
pub use config::CcConfig;
pub use data::{DataType, Row, Schema, Value};
pub use database::Database;
pub use types::{
    Cid, ItemPointer, Oid, ProtocolKind, RwType, TxnId, TxnResult, Visibility,
};
pub use txn::{Transaction, TransactionManager};

/// Concurrency-control error type
#[derive(Debug, thiserror::Error)]
pub enum CcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown concurrency protocol: {0}")]
    UnknownProtocol(String),

    #[error("Tile group not found: {0}")]
    TileGroupNotFound(Oid),

    #[error("Tile group {0} is full")]
    TileGroupFull(Oid),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Checksum mismatch at offset {0}")]
    ChecksumMismatch(u64),

    #[error("Invalid log file: {0}")]
    InvalidLogFile(String),
}

pub type Result<T> = std::result::Result<T, CcError>;
