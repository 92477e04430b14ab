//! Shared handle types for OpalDB.

use serde::{Deserialize, Serialize};

/// Opaque transaction handle.
///
/// Index operations accept an optional transaction and thread it through
/// unchanged; interpretation belongs to the transaction and log subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transaction {
    id: u64,
}

impl Transaction {
    /// Creates a transaction handle with the given id.
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    /// Returns the transaction id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl std::fmt::Display for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn:{}", self.id)
    }
}
