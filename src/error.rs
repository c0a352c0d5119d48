//! Error types for emberkv
//!
//! Provides a unified error type for all operations. Volume and WAL errors
//! propagate through the store unchanged; engine wrappers only add their own.

use std::path::PathBuf;

use thiserror::Error;

use crate::store::Recid;

/// Result type alias using EmberError
pub type Result<T> = std::result::Result<T, EmberError>;

/// Unified error type for emberkv operations
#[derive(Debug, Error)]
pub enum EmberError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    /// Backing medium unreadable or unwritable. Never retried internally,
    /// except for the rename/delete retry loop.
    #[error("IO failure: {0}")]
    Io(#[from] std::io::Error),

    /// Access outside the allocated volume. Indicates an allocator bug.
    #[error("Address error: {len} bytes at offset {offset} outside volume of {size} bytes")]
    Address { offset: u64, len: u64, size: u64 },

    // -------------------------------------------------------------------------
    // Record Errors
    // -------------------------------------------------------------------------
    /// Stored length or checksum mismatch for a single record.
    #[error("Corrupt record {recid}: {reason}")]
    CorruptRecord { recid: Recid, reason: String },

    #[error("Record not found: {0}")]
    RecordNotFound(Recid),

    // -------------------------------------------------------------------------
    // WAL Errors
    // -------------------------------------------------------------------------
    #[error("WAL corruption detected: {0}")]
    WalCorruption(String),

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Compaction requires a committed store, found uncommitted changes")]
    UncommittedChanges,

    #[error("Data directory is locked by another process: {}", .0.display())]
    Locked(PathBuf),

    #[error("Engine is closed")]
    Closed,

    /// A map handle outlived its map, e.g. one created in a rolled-back
    /// transaction. Reopen the map by name.
    #[error("Stale map handle: segment record {0} no longer belongs to this map")]
    StaleMap(Recid),

    // -------------------------------------------------------------------------
    // Engine Wrapper Errors
    // -------------------------------------------------------------------------
    /// Backpressure from the async write queue; retry later.
    #[error("Async write queue saturated (capacity {capacity})")]
    QueueSaturated { capacity: usize },

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for EmberError {
    fn from(err: bincode::Error) -> Self {
        EmberError::Serialization(err.to_string())
    }
}

impl EmberError {
    /// True for errors a caller is expected to handle in normal operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EmberError::RecordNotFound(_) | EmberError::QueueSaturated { .. }
        )
    }
}
