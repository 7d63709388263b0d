//! Write transactions over the conversion store.
//!
//! An expansion stages delete-all plus the full record set for one entity and
//! commits once; the backend applies every staged write or none of them.
//! Single-edge writes use the same path with fewer staged writes.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Whether a transaction may stage writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

/// Backend-assigned transaction number, shown as `tx-<n>` in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(pub u64);

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// A unit of staged conversion writes.
pub trait Transaction: Send + Sync {
    fn id(&self) -> TxId;
    fn mode(&self) -> TxMode;

    /// Writes staged and not yet committed.
    fn pending(&self) -> usize;

    /// Fails with `TxError` when the transaction was opened read-only.
    fn ensure_writable(&self) -> Result<()> {
        match self.mode() {
            TxMode::ReadWrite => Ok(()),
            TxMode::ReadOnly => Err(Error::TxError(format!("write attempted in read-only {}", self.id()))),
        }
    }
}
