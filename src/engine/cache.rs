//! Instance cache wrapper
//!
//! Keeps decoded payloads keyed by recid. Writers invalidate under a
//! per-recid stripe lock before delegating, and a reader fills the cache
//! while holding the same stripe shared, so a fill can never land after a
//! conflicting invalidation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::config::CacheMode;
use crate::error::Result;
use crate::store::Recid;

use super::{Engine, EngineStats, PressureLevel};

const STRIPES: usize = 64;

/// A full LRU cache evicts this fraction of its capacity in one pass
const EVICTION_BATCH_DIVISOR: usize = 8;

/// Snapshot of cache counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub mode: CacheMode,
    pub entries: usize,
    /// Entry bound, `None` for unbounded modes
    pub capacity: Option<usize>,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

struct CacheEntry {
    value: Bytes,
    /// Logical clock at last access, for LRU ordering
    last_access: AtomicU64,
}

pub struct CacheEngine {
    inner: Arc<dyn Engine>,
    mode: CacheMode,
    capacity: usize,
    entries: RwLock<HashMap<Recid, CacheEntry>>,
    stripes: Vec<RwLock<()>>,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
    /// Trace hits, misses and invalidations
    log: bool,
}

impl CacheEngine {
    pub fn new(inner: Arc<dyn Engine>, mode: CacheMode, capacity: usize) -> Self {
        Self {
            inner,
            mode,
            capacity,
            entries: RwLock::new(HashMap::new()),
            stripes: (0..STRIPES).map(|_| RwLock::new(())).collect(),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            log: false,
        }
    }

    pub fn with_op_logging(mut self, enabled: bool) -> Self {
        self.log = enabled;
        self
    }

    fn stripe(&self, recid: Recid) -> &RwLock<()> {
        &self.stripes[recid as usize & (STRIPES - 1)]
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn bounded(&self) -> bool {
        self.mode == CacheMode::Lru
    }

    fn lookup(&self, recid: Recid) -> Option<Bytes> {
        let entries = self.entries.read();
        entries.get(&recid).map(|entry| {
            entry.last_access.store(self.tick(), Ordering::Relaxed);
            entry.value.clone()
        })
    }

    fn insert(&self, recid: Recid, value: Bytes) {
        if self.bounded() && self.capacity == 0 {
            return;
        }
        let clock = self.tick();
        let mut entries = self.entries.write();

        if self.bounded() && entries.len() >= self.capacity && !entries.contains_key(&recid) {
            self.evict_oldest(&mut entries);
        }

        entries.insert(
            recid,
            CacheEntry {
                value,
                last_access: AtomicU64::new(clock),
            },
        );
    }

    /// Drop the least recently used batch, leaving room for at least one entry
    ///
    /// One scan per batch keeps a full cache's inserts amortized constant.
    fn evict_oldest(&self, entries: &mut HashMap<Recid, CacheEntry>) {
        let excess = (entries.len() + 1).saturating_sub(self.capacity);
        let batch = (self.capacity / EVICTION_BATCH_DIVISOR).max(excess).max(1);

        let mut by_age: Vec<(u64, Recid)> = entries
            .iter()
            .map(|(&key, entry)| (entry.last_access.load(Ordering::Relaxed), key))
            .collect();
        let batch = batch.min(by_age.len());
        if batch == 0 {
            return;
        }
        by_age.select_nth_unstable(batch - 1);
        for &(_, key) in &by_age[..batch] {
            entries.remove(&key);
        }
        self.evictions.fetch_add(batch as u64, Ordering::Relaxed);
        if self.log {
            tracing::trace!(evicted = batch, remaining = entries.len(), "cache evict");
        }
    }

    fn invalidate(&self, recid: Recid) {
        if self.entries.write().remove(&recid).is_some() {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
            if self.log {
                tracing::trace!(recid, "cache invalidate");
            }
        }
    }

    fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            mode: self.mode,
            entries: self.len(),
            capacity: self.bounded().then_some(self.capacity),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

impl Engine for CacheEngine {
    fn put(&self, payload: &[u8]) -> Result<Recid> {
        // New recids were invalidated when last deleted
        self.inner.put(payload)
    }

    fn preallocate(&self) -> Result<Recid> {
        self.inner.preallocate()
    }

    fn get(&self, recid: Recid) -> Result<Bytes> {
        let _stripe = self.stripe(recid).read();
        if let Some(value) = self.lookup(recid) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            if self.log {
                tracing::trace!(recid, "cache hit");
            }
            return Ok(value);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        if self.log {
            tracing::trace!(recid, "cache miss");
        }
        let value = self.inner.get(recid)?;
        self.insert(recid, value.clone());
        Ok(value)
    }

    fn contains(&self, recid: Recid) -> Result<bool> {
        if self.entries.read().contains_key(&recid) {
            return Ok(true);
        }
        self.inner.contains(recid)
    }

    fn update(&self, recid: Recid, payload: &[u8]) -> Result<()> {
        let _stripe = self.stripe(recid).write();
        self.invalidate(recid);
        self.inner.update(recid, payload)
    }

    fn delete(&self, recid: Recid) -> Result<()> {
        let _stripe = self.stripe(recid).write();
        self.invalidate(recid);
        self.inner.delete(recid)
    }

    fn commit(&self) -> Result<()> {
        self.inner.commit()
    }

    /// Cached values may hold rolled-back payloads; drop them all
    fn rollback(&self) -> Result<()> {
        let _stripes: Vec<_> = self.stripes.iter().map(|s| s.write()).collect();
        let result = self.inner.rollback();
        self.clear();
        result
    }

    fn compact(&self) -> Result<()> {
        self.inner.compact()
    }

    fn stats(&self) -> EngineStats {
        let mut stats = self.inner.stats();
        stats.cache = Some(self.cache_stats());
        stats
    }

    fn close(&self) -> Result<()> {
        self.clear();
        self.inner.close()
    }

    fn release_memory(&self, level: PressureLevel) {
        let shed = match (self.mode, level) {
            (CacheMode::Weak, _) => true,
            (CacheMode::Soft, PressureLevel::Critical) => true,
            _ => false,
        };
        if shed {
            let mut entries = self.entries.write();
            let dropped = entries.len();
            entries.clear();
            self.evictions.fetch_add(dropped as u64, Ordering::Relaxed);
            if self.log {
                tracing::debug!(mode = ?self.mode, ?level, dropped, "Cache released memory");
            }
        }
        self.inner.release_memory(level);
    }
}
