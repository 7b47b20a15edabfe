//! Identifiers, sentinels and small enums shared by storage and transactions

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CcError;

// ============================================================================
// Identifiers
// ============================================================================

/// Transaction identifier
pub type TxnId = u64;

/// Commit timestamp
pub type Cid = u64;

/// Object identifier (tile group id or slot offset)
pub type Oid = u32;

/// Owner of an aborted version, a committed tombstone, or a free slot
pub const INVALID_TXN_ID: TxnId = 0;
/// Owner of a committed version nobody is writing
pub const INITIAL_TXN_ID: TxnId = 1;
/// First id handed out to a real transaction
pub const START_TXN_ID: TxnId = 2;
/// Transaction ids stay below 2^48 so the owner word has room for a reader count
pub const MAX_TXN_ID: TxnId = (1 << 48) - 1;

/// `end_cid` of a version deleted by a transaction that has not committed yet
pub const INVALID_CID: Cid = 0;
/// First commit id handed out
pub const START_CID: Cid = 1;
/// +infinity
pub const MAX_CID: Cid = u64::MAX;

pub const INVALID_OID: Oid = u32::MAX;

// ============================================================================
// Item Pointer
// ============================================================================

/// Location of a tuple version: (tile group, slot)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemPointer {
    pub block: Oid,
    pub offset: Oid,
}

impl ItemPointer {
    pub const NULL: ItemPointer = ItemPointer { block: INVALID_OID, offset: INVALID_OID };

    pub fn new(block: Oid, offset: Oid) -> Self {
        Self { block, offset }
    }

    pub fn is_null(&self) -> bool {
        self.block == INVALID_OID
    }

    /// Pack into one word so chain links can live in a single atomic
    pub fn pack(self) -> u64 {
        ((self.block as u64) << 32) | self.offset as u64
    }

    pub fn unpack(word: u64) -> Self {
        Self {
            block: (word >> 32) as Oid,
            offset: word as Oid,
        }
    }
}

impl Default for ItemPointer {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for ItemPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "(null)")
        } else {
            write!(f, "({}, {})", self.block, self.offset)
        }
    }
}

// ============================================================================
// Visibility / Read-Write Kinds / Results
// ============================================================================

/// What a transaction may do with a version it found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Invisible,
    Deleted,
    Ok,
}

/// Kind of access recorded in a transaction's read/write set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RwType {
    Read,
    /// Read with ownership taken, e.g. `SELECT ... FOR UPDATE`
    ReadOwn,
    Update,
    Delete,
    Insert,
    /// Inserted and then deleted by the same transaction
    InsDel,
}

impl RwType {
    /// Whether the entry installs something at commit
    pub fn is_write(&self) -> bool {
        matches!(self, RwType::Update | RwType::Delete | RwType::Insert | RwType::InsDel)
    }
}

/// Outcome of a transaction or of its last operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnResult {
    Success,
    /// An operation lost a race; the caller must abort
    Failure,
    Aborted,
}

// ============================================================================
// Protocol Kind
// ============================================================================

/// The closed set of concurrency-control protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    Pessimistic,
    Optimistic,
    OptimisticRb,
    TimestampOrdering,
    Ssi,
    EagerWrite,
}

impl ProtocolKind {
    pub const ALL: [ProtocolKind; 6] = [
        ProtocolKind::Pessimistic,
        ProtocolKind::Optimistic,
        ProtocolKind::OptimisticRb,
        ProtocolKind::TimestampOrdering,
        ProtocolKind::Ssi,
        ProtocolKind::EagerWrite,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ProtocolKind::Pessimistic => "pessimistic",
            ProtocolKind::Optimistic => "optimistic",
            ProtocolKind::OptimisticRb => "optimistic_rb",
            ProtocolKind::TimestampOrdering => "timestamp_ordering",
            ProtocolKind::Ssi => "ssi",
            ProtocolKind::EagerWrite => "eager_write",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProtocolKind {
    type Err = CcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "pessimistic" | "2pl" => Ok(ProtocolKind::Pessimistic),
            "optimistic" | "occ" => Ok(ProtocolKind::Optimistic),
            "optimistic_rb" | "rb" => Ok(ProtocolKind::OptimisticRb),
            "timestamp_ordering" | "to" => Ok(ProtocolKind::TimestampOrdering),
            "ssi" => Ok(ProtocolKind::Ssi),
            "eager_write" | "eager" => Ok(ProtocolKind::EagerWrite),
            _ => Err(CcError::UnknownProtocol(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_pointer_pack() {
        let p = ItemPointer::new(7, 42);
        assert_eq!(ItemPointer::unpack(p.pack()), p);
        assert!(ItemPointer::unpack(ItemPointer::NULL.pack()).is_null());
        assert!(!p.is_null());
    }

    #[test]
    fn test_sentinels_are_ordered() {
        assert!(INVALID_TXN_ID < INITIAL_TXN_ID);
        assert!(INITIAL_TXN_ID < START_TXN_ID);
        assert!(INVALID_CID < START_CID);
        assert_eq!(MAX_TXN_ID >> 48, 0);
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!("occ".parse::<ProtocolKind>().unwrap(), ProtocolKind::Optimistic);
        assert_eq!("Timestamp-Ordering".parse::<ProtocolKind>().unwrap(), ProtocolKind::TimestampOrdering);
        assert_eq!("2pl".parse::<ProtocolKind>().unwrap(), ProtocolKind::Pessimistic);
        assert!("mystery".parse::<ProtocolKind>().is_err());
        for kind in ProtocolKind::ALL {
            assert_eq!(kind.name().parse::<ProtocolKind>().unwrap(), kind);
        }
    }
}
