//! Engine Module
//!
//! The record-level contract every layer above the store talks to, and the
//! decorators that wrap it.
//!
//! ## Wrapper Chain
//! ```text
//!   map layer / Db
//!        │
//!   ┌────▼─────┐  cached decoded values, invalidated before delegating
//!   │  Cache   │
//!   └────┬─────┘
//!   ┌────▼─────┐  counters and timings, never changes outcomes
//!   │ Metrics  │
//!   └────┬─────┘
//!   ┌────▼─────┐  bounded queue + worker, read-your-writes via pending map
//!   │  Async   │
//!   └────┬─────┘
//!   ┌────▼─────┐
//!   │  Store   │
//!   └──────────┘
//! ```
//!
//! Each wrapper is optional; disabled ones are left out of the chain.
//! The cache sits above the async queue so invalidation happens
//! synchronously with the logical write.

mod async_write;
mod cache;
mod metrics;
mod sweeper;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::config::{CacheMode, Config};
use crate::error::Result;
use crate::store::{Recid, Store, StoreStats};

pub use async_write::{AsyncStats, AsyncWriteEngine};
pub use cache::{CacheEngine, CacheStats};
pub use metrics::{MetricsEngine, MetricsSnapshot, OperationStats};
pub use sweeper::CacheSweeper;

/// How hard the cache should shed entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureLevel {
    /// Drop weakly held entries
    Moderate,
    /// Drop weakly and softly held entries
    Critical,
}

/// Stats gathered down the chain; wrappers fill in their own section
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub store: StoreStats,
    pub cache: Option<CacheStats>,
    pub async_writes: Option<AsyncStats>,
    pub metrics: Option<MetricsSnapshot>,
}

/// Record-level storage contract
///
/// Implemented by [`Store`] and by every wrapper. Wrappers delegate to an
/// inner engine and may short-circuit, but never swallow an inner error.
pub trait Engine: Send + Sync {
    fn put(&self, payload: &[u8]) -> Result<Recid>;

    /// Reserve a recid whose payload reads as empty until updated
    fn preallocate(&self) -> Result<Recid>;

    fn get(&self, recid: Recid) -> Result<Bytes>;

    fn contains(&self, recid: Recid) -> Result<bool>;

    fn update(&self, recid: Recid, payload: &[u8]) -> Result<()>;

    fn delete(&self, recid: Recid) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;

    fn compact(&self) -> Result<()>;

    fn stats(&self) -> EngineStats;

    /// Drain, release resources; further calls fail with `Closed`
    fn close(&self) -> Result<()>;

    /// Memory-pressure signal; only caches react
    fn release_memory(&self, _level: PressureLevel) {}
}

impl Engine for Store {
    fn put(&self, payload: &[u8]) -> Result<Recid> {
        Store::put(self, payload)
    }

    fn preallocate(&self) -> Result<Recid> {
        Store::preallocate(self)
    }

    fn get(&self, recid: Recid) -> Result<Bytes> {
        Store::get(self, recid)
    }

    fn contains(&self, recid: Recid) -> Result<bool> {
        Store::contains(self, recid)
    }

    fn update(&self, recid: Recid, payload: &[u8]) -> Result<()> {
        Store::update(self, recid, payload)
    }

    fn delete(&self, recid: Recid) -> Result<()> {
        Store::delete(self, recid)
    }

    fn commit(&self) -> Result<()> {
        Store::commit(self)
    }

    fn rollback(&self) -> Result<()> {
        Store::rollback(self)
    }

    fn compact(&self) -> Result<()> {
        Store::compact(self)
    }

    fn stats(&self) -> EngineStats {
        EngineStats {
            store: Store::stats(self),
            ..EngineStats::default()
        }
    }

    fn close(&self) -> Result<()> {
        Store::close(self)
    }
}

/// Wrap `store` in the wrappers `config` enables
pub fn build_chain(store: Arc<Store>, config: &Config) -> Result<Arc<dyn Engine>> {
    let mut engine: Arc<dyn Engine> = store;

    let log_ops = config.diagnostics.log_engine_wrappers;

    if config.async_write {
        engine = Arc::new(
            AsyncWriteEngine::new(
                engine,
                config.async_write_queue_size,
                config.queue_full_policy,
            )?
            .with_op_logging(log_ops),
        );
    }
    if config.metrics {
        engine = Arc::new(MetricsEngine::new(
            engine,
            Duration::from_millis(config.metrics_log_period_ms),
        ));
    }
    if config.cache_mode != CacheMode::Disabled {
        engine = Arc::new(
            CacheEngine::new(engine, config.cache_mode, config.cache_size).with_op_logging(log_ops),
        );
    }

    if log_ops {
        tracing::debug!(
            cache = ?config.cache_mode,
            metrics = config.metrics,
            async_write = config.async_write,
            "Engine chain built"
        );
    }
    Ok(engine)
}
