//! Metrics wrapper: per-operation counts, failures and cumulative latency.
//! A snapshot is logged at most once per period.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::Result;
use crate::store::Recid;

use super::{Engine, EngineStats, PressureLevel};

/// Counters for one operation kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationStats {
    pub count: u64,
    pub errors: u64,
    pub total_nanos: u64,
}

impl OperationStats {
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.total_nanos / self.count)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub puts: OperationStats,
    pub preallocations: OperationStats,
    pub gets: OperationStats,
    pub updates: OperationStats,
    pub deletes: OperationStats,
    pub commits: OperationStats,
    pub rollbacks: OperationStats,
    pub compactions: OperationStats,
    pub uptime: Duration,
}

#[derive(Default)]
struct OpCounter {
    count: AtomicU64,
    errors: AtomicU64,
    total_nanos: AtomicU64,
}

impl OpCounter {
    fn record(&self, elapsed: Duration, failed: bool) {
        self.count.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.total_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> OperationStats {
        OperationStats {
            count: self.count.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            total_nanos: self.total_nanos.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct Counters {
    puts: OpCounter,
    preallocations: OpCounter,
    gets: OpCounter,
    updates: OpCounter,
    deletes: OpCounter,
    commits: OpCounter,
    rollbacks: OpCounter,
    compactions: OpCounter,
}

pub struct MetricsEngine {
    inner: Arc<dyn Engine>,
    counters: Counters,
    started: Instant,
    log_period: Duration,
    last_log: Mutex<Instant>,
}

impl MetricsEngine {
    pub fn new(inner: Arc<dyn Engine>, log_period: Duration) -> Self {
        let now = Instant::now();
        Self {
            inner,
            counters: Counters::default(),
            started: now,
            log_period,
            last_log: Mutex::new(now),
        }
    }

    fn timed<T>(&self, counter: &OpCounter, op: impl FnOnce() -> Result<T>) -> Result<T> {
        let start = Instant::now();
        let result = op();
        counter.record(start.elapsed(), result.is_err());
        self.maybe_log();
        result
    }

    fn maybe_log(&self) {
        // Whoever holds the lock is already logging
        let Some(mut last) = self.last_log.try_lock() else {
            return;
        };
        if last.elapsed() < self.log_period {
            return;
        }
        *last = Instant::now();
        drop(last);

        let s = self.snapshot();
        tracing::info!(
            puts = s.puts.count,
            gets = s.gets.count,
            updates = s.updates.count,
            deletes = s.deletes.count,
            commits = s.commits.count,
            rollbacks = s.rollbacks.count,
            errors = s.puts.errors + s.gets.errors + s.updates.errors + s.deletes.errors,
            mean_get_us = s.gets.mean().as_micros() as u64,
            mean_commit_us = s.commits.mean().as_micros() as u64,
            "Engine metrics"
        );
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = &self.counters;
        MetricsSnapshot {
            puts: c.puts.snapshot(),
            preallocations: c.preallocations.snapshot(),
            gets: c.gets.snapshot(),
            updates: c.updates.snapshot(),
            deletes: c.deletes.snapshot(),
            commits: c.commits.snapshot(),
            rollbacks: c.rollbacks.snapshot(),
            compactions: c.compactions.snapshot(),
            uptime: self.started.elapsed(),
        }
    }
}

impl Engine for MetricsEngine {
    fn put(&self, payload: &[u8]) -> Result<Recid> {
        self.timed(&self.counters.puts, || self.inner.put(payload))
    }

    fn preallocate(&self) -> Result<Recid> {
        self.timed(&self.counters.preallocations, || self.inner.preallocate())
    }

    fn get(&self, recid: Recid) -> Result<Bytes> {
        self.timed(&self.counters.gets, || self.inner.get(recid))
    }

    fn contains(&self, recid: Recid) -> Result<bool> {
        self.inner.contains(recid)
    }

    fn update(&self, recid: Recid, payload: &[u8]) -> Result<()> {
        self.timed(&self.counters.updates, || self.inner.update(recid, payload))
    }

    fn delete(&self, recid: Recid) -> Result<()> {
        self.timed(&self.counters.deletes, || self.inner.delete(recid))
    }

    fn commit(&self) -> Result<()> {
        self.timed(&self.counters.commits, || self.inner.commit())
    }

    fn rollback(&self) -> Result<()> {
        self.timed(&self.counters.rollbacks, || self.inner.rollback())
    }

    fn compact(&self) -> Result<()> {
        self.timed(&self.counters.compactions, || self.inner.compact())
    }

    fn stats(&self) -> EngineStats {
        let mut stats = self.inner.stats();
        stats.metrics = Some(self.snapshot());
        stats
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }

    fn release_memory(&self, level: PressureLevel) {
        self.inner.release_memory(level);
    }
}
