//! Concurrent Map Layer
//!
//! Hash and ordered maps on top of the engine chain. The keyspace is split
//! into `2^N` segments by key hash; each segment has its own lock and its
//! own structure records, so operations on different segments never
//! contend.
//!
//! ## Routing
//! ```text
//!   key ──xxh64──► hash
//!                   │
//!        ┌──────────┴───────────┐
//!   hash & (segments-1)    hash >> 32
//!   = segment index        = bucket bits (hash map only)
//! ```
//!
//! ## Locking
//! - reads: shared segment lock
//! - value-only updates: upgradable lock (readers still proceed)
//! - inserts/removes that change layout: exclusive lock
//! - `len` / iteration: segments one at a time in index order, so the
//!   result is weakly consistent
//!
//! No structure is cached in memory; everything is read back through the
//! engine, which keeps maps correct across `rollback`. A map created inside
//! a transaction that is later rolled back must be reopened: every segment
//! record carries the map's id, and a handle whose segment record was freed
//! or reused fails with `StaleMap`.

mod catalog;
mod hash;
mod segment;
mod tree;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLockWriteGuard;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use crate::config::Config;
use crate::engine::Engine;
use crate::error::{EmberError, Result};
use crate::store::Recid;

pub use catalog::{Catalog, MapKind};
pub use hash::HashMap;
pub use segment::{Access, SegmentLock};
pub use tree::TreeMap;

const HASH_SEED: u64 = 0x656d_6265_726b_7600;

/// Stable 64-bit key hash
pub fn hash_key(key: &[u8]) -> u64 {
    xxh64(key, HASH_SEED)
}

/// Map root record: one structure record per segment
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MapRoot {
    id: u64,
    segments: Vec<Recid>,
}

/// Per-segment structure record, tagged with the id of its map
trait SegmentRecord: DeserializeOwned {
    fn map_id(&self) -> u64;
}

/// Unique per map created by this process, and unlikely to repeat across runs
fn new_map_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut seed = [0u8; 24];
    seed[..8].copy_from_slice(&nanos.to_le_bytes());
    seed[8..16].copy_from_slice(&count.to_le_bytes());
    seed[16..].copy_from_slice(&u64::from(std::process::id()).to_le_bytes());
    xxh64(&seed, HASH_SEED)
}

/// Exclusive hold on one segment, for tests and diagnostics
pub struct SegmentHold<'a> {
    _guard: RwLockWriteGuard<'a, Recid>,
}

/// The segment locks of one map, each guarding its structure record
struct SegmentTable {
    segments: Vec<SegmentLock<Recid>>,
    mask: u64,
    map_id: u64,
    /// Trace every map operation
    log: bool,
}

impl SegmentTable {
    fn new(map_id: u64, roots: Vec<Recid>, fair: bool, log: bool) -> Result<Self> {
        if roots.is_empty() || !roots.len().is_power_of_two() {
            return Err(EmberError::Storage(format!(
                "map has {} segments, expected a power of two",
                roots.len()
            )));
        }
        let mask = roots.len() as u64 - 1;
        Ok(Self {
            segments: roots
                .into_iter()
                .map(|root| SegmentLock::new(root, fair))
                .collect(),
            mask,
            map_id,
            log,
        })
    }

    /// Load a segment record, failing if it no longer belongs to this map
    fn load<T: SegmentRecord>(&self, engine: &dyn Engine, recid: Recid) -> Result<T> {
        let record: T = match load(engine, recid) {
            Ok(record) => record,
            Err(EmberError::RecordNotFound(_)) | Err(EmberError::Serialization(_)) => {
                return Err(EmberError::StaleMap(recid))
            }
            Err(e) => return Err(e),
        };
        if record.map_id() != self.map_id {
            return Err(EmberError::StaleMap(recid));
        }
        Ok(record)
    }

    fn index_of(&self, hash: u64) -> usize {
        (hash & self.mask) as usize
    }

    fn for_hash(&self, hash: u64) -> &SegmentLock<Recid> {
        &self.segments[self.index_of(hash)]
    }

    fn len(&self) -> usize {
        self.segments.len()
    }

    fn hold(&self, index: usize) -> SegmentHold<'_> {
        SegmentHold {
            _guard: self.segments[index].hold(),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

fn load<T: DeserializeOwned>(engine: &dyn Engine, recid: Recid) -> Result<T> {
    decode(&engine.get(recid)?)
}

/// Create a root record pointing at `segments` fresh segment records
///
/// `new_segment` receives the new map's id to tag each record with.
fn create_root(
    engine: &dyn Engine,
    segments: usize,
    mut new_segment: impl FnMut(u64) -> Result<Vec<u8>>,
) -> Result<Recid> {
    let id = new_map_id();
    let mut roots = Vec::with_capacity(segments);
    for _ in 0..segments {
        roots.push(engine.put(&new_segment(id)?)?);
    }
    engine.put(&encode(&MapRoot { id, segments: roots })?)
}

fn open_segments(
    engine: &dyn Engine,
    root: Recid,
    options: &MapOptions,
) -> Result<SegmentTable> {
    let root: MapRoot = load(engine, root)?;
    SegmentTable::new(root.id, root.segments, options.fair, options.log)
}

/// Per-handle settings taken from the configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct MapOptions {
    /// Fair segment lock hand-off
    pub fair: bool,
    /// Trace every map operation
    pub log: bool,
}

impl MapOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            fair: config.lock_fairness,
            log: config.diagnostics.log_maps,
        }
    }
}

/// Handle type returned by the map constructors
pub type SharedEngine = Arc<dyn Engine>;
