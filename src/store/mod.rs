//! Storage collaborators
//!
//! The core reads and writes two places: a remote row store holding device
//! and session records, and a local key-value vault holding every private
//! key half. Both are trait seams; [`memory`] provides in-process
//! implementations for tests and embedding.

pub mod memory;
pub mod remote;
pub mod vault;

pub use memory::{MemoryDirectory, MemoryVault};
pub use remote::{
    DeviceDirectory, DeviceRecord, NewDevice, NewSession, SessionDirectory, SessionPatch,
    SessionRecord,
};
pub use vault::KeyVault;

/// Storage errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// A `single`-cardinality lookup matched no row.
    #[error("row not found")]
    RowNotFound,
    /// A `single`-cardinality lookup matched more than one row.
    #[error("expected one row, found {0}")]
    Cardinality(usize),
    /// Backend failure, fatal to the current operation.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Current wall-clock time in unix milliseconds.
pub(crate) fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
