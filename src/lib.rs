//! # emberkv
//!
//! An embeddable, single-process key-value storage engine with:
//! - Paged volumes over memory or a file
//! - Redo-only write-ahead logging and crash recovery
//! - A record store with best-fit free-space reuse and compaction
//! - Optional cache / metrics / async-write wrappers
//! - Segment-locked hash and ordered maps
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Maps (HashMap / TreeMap)                     │
//! │          2^N segments, one RwLock per segment                │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │           Engine chain: Cache → Metrics → Async              │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                        Store                                 │
//! │       (recid index, free space, pending transaction)         │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │     WAL     │ ───────► │   Volume    │
//!   │  (Append)   │  apply   │   (Paged)   │
//!   └─────────────┘          └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod volume;
pub mod wal;
pub mod store;
pub mod engine;
pub mod map;
pub mod db;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{EmberError, Result};
pub use config::{CacheMode, Config, Location, QueueFullPolicy, WalSyncStrategy};
pub use db::Db;
pub use engine::{Engine, EngineStats, PressureLevel};
pub use map::{HashMap, MapKind, TreeMap};
pub use store::{Recid, Store};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of emberkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
