//! Database Handle
//!
//! Ties the pieces together for callers: opens the store, builds the
//! wrapper chain the config asks for, and hands out named maps.
//!
//! ## Responsibilities
//! - Validate the configuration and open the store
//! - Route record operations through the wrapper chain
//! - Resolve named hash/tree maps through the catalog
//! - Clean shutdown (drain async writes, checkpoint, release the lock)
//!
//! Dropping a `Db` without calling [`Db::close`] behaves like a crash:
//! uncommitted work is lost and the WAL is replayed at the next open.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::config::{CacheMode, Config, Location};
use crate::engine::{build_chain, CacheSweeper, Engine, EngineStats, PressureLevel};
use crate::error::Result;
use crate::map::{Catalog, HashMap, MapKind, MapOptions, TreeMap};
use crate::store::{Recid, Store};

pub struct Db {
    config: Config,

    /// Direct handle for checks that bypass the wrappers
    store: Arc<Store>,

    /// Top of the wrapper chain; every record operation goes through here
    engine: Arc<dyn Engine>,

    catalog: Catalog,

    /// Periodic memory-pressure signal for the cache, if one is configured
    sweeper: Option<CacheSweeper>,
}

impl Db {
    /// Open or create a database
    ///
    /// On startup:
    /// 1. Validate the configuration
    /// 2. Open the store (lock, WAL replay, index rebuild)
    /// 3. Wrap it in the enabled cache/metrics/async layers
    /// 4. Start the cache sweeper
    ///
    /// The volume page size of an existing store wins over the configured one;
    /// [`Db::config`] reports the size in effect.
    pub fn open(location: Location, config: Config) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(Store::open(&location, &config)?);
        let config = store.config().clone();
        let engine = build_chain(Arc::clone(&store), &config)?;
        let catalog = Catalog::new(Arc::clone(&engine));

        let sweeper = if config.cache_mode != CacheMode::Disabled
            && config.cache_executor_period_ms > 0
        {
            let period = Duration::from_millis(config.cache_executor_period_ms);
            Some(CacheSweeper::start(&engine, period)?)
        } else {
            None
        };

        Ok(Self {
            config,
            store,
            engine,
            catalog,
            sweeper,
        })
    }

    /// Open an in-memory database
    pub fn memory(config: Config) -> Result<Self> {
        Self::open(Location::Memory, config)
    }

    // =========================================================================
    // Record Operations
    // =========================================================================

    pub fn put(&self, payload: &[u8]) -> Result<Recid> {
        self.engine.put(payload)
    }

    pub fn preallocate(&self) -> Result<Recid> {
        self.engine.preallocate()
    }

    pub fn get(&self, recid: Recid) -> Result<Bytes> {
        self.engine.get(recid)
    }

    pub fn contains(&self, recid: Recid) -> Result<bool> {
        self.engine.contains(recid)
    }

    pub fn update(&self, recid: Recid, payload: &[u8]) -> Result<()> {
        self.engine.update(recid, payload)
    }

    pub fn delete(&self, recid: Recid) -> Result<()> {
        self.engine.delete(recid)
    }

    // =========================================================================
    // Transactions and Maintenance
    // =========================================================================

    /// Make every change since the last commit durable
    pub fn commit(&self) -> Result<()> {
        self.engine.commit()
    }

    /// Discard every change since the last commit
    ///
    /// Maps created since the last commit are gone afterwards and must be
    /// reopened by name.
    pub fn rollback(&self) -> Result<()> {
        self.engine.rollback()
    }

    /// Rewrite the volume without free space; requires no pending changes
    pub fn compact(&self) -> Result<()> {
        self.engine.compact()
    }

    /// Full non-overlap check of the committed layout
    pub fn check_consistency(&self) -> Result<()> {
        self.store.check_consistency()
    }

    pub fn stats(&self) -> EngineStats {
        self.engine.stats()
    }

    pub fn release_memory(&self, level: PressureLevel) {
        self.engine.release_memory(level)
    }

    // =========================================================================
    // Named Maps
    // =========================================================================

    /// Open the hash map `name`, creating it on first use
    pub fn hash_map(&self, name: &str) -> Result<HashMap> {
        let root = self.catalog.open_or_create(name, MapKind::Hash, || {
            HashMap::create(&self.engine, self.config.concurrency_level)
        })?;
        HashMap::open(Arc::clone(&self.engine), root, MapOptions::from_config(&self.config))
    }

    /// Open the ordered map `name`, creating it on first use
    pub fn tree_map(&self, name: &str) -> Result<TreeMap> {
        let root = self.catalog.open_or_create(name, MapKind::Tree, || {
            TreeMap::create(&self.engine, self.config.concurrency_level)
        })?;
        TreeMap::open(Arc::clone(&self.engine), root, MapOptions::from_config(&self.config))
    }

    /// Named maps in name order
    pub fn maps(&self) -> Result<Vec<(String, MapKind)>> {
        self.catalog.list()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn location(&self) -> &Location {
        self.store.location()
    }

    /// Drain pending writes, checkpoint and release the directory
    ///
    /// Uncommitted changes are discarded.
    pub fn close(mut self) -> Result<()> {
        if let Some(mut sweeper) = self.sweeper.take() {
            sweeper.stop();
        }
        self.engine.close()
    }
}
