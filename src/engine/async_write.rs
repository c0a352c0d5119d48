//! Asynchronous write wrapper
//!
//! `put` / `update` / `delete` go into a bounded queue drained by one
//! background worker, in submission order. A pending map keeps the latest
//! submitted value per recid so reads see their own writes before the
//! worker gets to them.
//!
//! ## Queue Flow
//! ```text
//!   caller ──► pending map ──► bounded channel ──► worker ──► inner engine
//!     ▲                                              │
//!     └──────────── ack (flush barrier) ◄────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::config::QueueFullPolicy;
use crate::error::{EmberError, Result};
use crate::store::Recid;

use super::{Engine, EngineStats, PressureLevel};

/// Snapshot of queue counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AsyncStats {
    pub capacity: usize,
    pub queued: usize,
    pub pending_records: usize,
    pub submitted: u64,
    pub applied: u64,
    pub rejected: u64,
}

enum Command {
    /// `None` deletes
    Write {
        recid: Recid,
        value: Option<Bytes>,
        seq: u64,
    },
    Flush(Sender<()>),
    Shutdown,
}

/// Latest submitted, not yet applied, state of a recid
struct Pending {
    seq: u64,
    value: Option<Bytes>,
}

/// State shared with the worker thread
#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<Recid, Pending>>,
    /// First failure since the last flush
    error: Mutex<Option<EmberError>>,
    applied: AtomicU64,
    /// Trace each queued and applied write
    log: AtomicBool,
}

pub struct AsyncWriteEngine {
    inner: Arc<dyn Engine>,
    sender: Sender<Command>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    capacity: usize,
    policy: QueueFullPolicy,
    /// Held from seq assignment until the command is queued, so queue order
    /// matches seq order; the worker never takes it
    submit_order: Mutex<()>,
    seq: AtomicU64,
    submitted: AtomicU64,
    rejected: AtomicU64,
    closed: AtomicBool,
}

impl AsyncWriteEngine {
    pub fn new(inner: Arc<dyn Engine>, capacity: usize, policy: QueueFullPolicy) -> Result<Self> {
        let (sender, receiver) = channel::bounded(capacity);
        let shared = Arc::new(Shared::default());

        let worker = {
            let inner = Arc::clone(&inner);
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("emberkv-async-writer".into())
                .spawn(move || run_worker(inner, receiver, shared))?
        };

        Ok(Self {
            inner,
            sender,
            shared,
            worker: Mutex::new(Some(worker)),
            capacity,
            policy,
            submit_order: Mutex::new(()),
            seq: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn with_op_logging(self, enabled: bool) -> Self {
        self.shared.log.store(enabled, Ordering::Relaxed);
        self
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EmberError::Closed);
        }
        Ok(())
    }

    fn submit(&self, recid: Recid, value: Option<Bytes>) -> Result<()> {
        self.ensure_open()?;
        let _order = self.submit_order.lock();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;

        match self.policy {
            QueueFullPolicy::Block => {
                // Registered first so the worker always finds it after applying
                self.shared.pending.lock().insert(
                    recid,
                    Pending {
                        seq,
                        value: value.clone(),
                    },
                );
                if self
                    .sender
                    .send(Command::Write { recid, value, seq })
                    .is_err()
                {
                    let mut pending = self.shared.pending.lock();
                    if pending.get(&recid).map(|p| p.seq) == Some(seq) {
                        pending.remove(&recid);
                    }
                    return Err(EmberError::Closed);
                }
            }
            QueueFullPolicy::Fail => {
                // try_send never blocks, so holding the map here cannot stall the worker
                let mut pending = self.shared.pending.lock();
                let command = Command::Write {
                    recid,
                    value: value.clone(),
                    seq,
                };
                match self.sender.try_send(command) {
                    Ok(()) => {
                        pending.insert(recid, Pending { seq, value });
                    }
                    Err(TrySendError::Full(_)) => {
                        self.rejected.fetch_add(1, Ordering::Relaxed);
                        return Err(EmberError::QueueSaturated {
                            capacity: self.capacity,
                        });
                    }
                    Err(TrySendError::Disconnected(_)) => return Err(EmberError::Closed),
                }
            }
        }

        self.submitted.fetch_add(1, Ordering::Relaxed);
        if self.shared.log.load(Ordering::Relaxed) {
            tracing::trace!(recid, seq, queued = self.sender.len(), "async enqueue");
        }
        Ok(())
    }

    /// Wait until everything queued so far has been applied
    ///
    /// Surfaces the first worker failure since the previous flush.
    pub fn flush(&self) -> Result<()> {
        self.drain()?;
        self.take_error()
    }

    fn drain(&self) -> Result<()> {
        let (ack_tx, ack_rx) = channel::bounded(1);
        self.sender
            .send(Command::Flush(ack_tx))
            .map_err(|_| EmberError::Closed)?;
        ack_rx.recv().map_err(|_| EmberError::Closed)
    }

    fn take_error(&self) -> Result<()> {
        match self.shared.error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn stop_worker(&self) -> Result<()> {
        let Some(handle) = self.worker.lock().take() else {
            return Ok(());
        };
        // The worker may already be gone; join tells us either way
        let _ = self.sender.send(Command::Shutdown);
        handle
            .join()
            .map_err(|_| EmberError::Storage("async write worker panicked".into()))
    }

    pub fn async_stats(&self) -> AsyncStats {
        AsyncStats {
            capacity: self.capacity,
            queued: self.sender.len(),
            pending_records: self.shared.pending.lock().len(),
            submitted: self.submitted.load(Ordering::Relaxed),
            applied: self.shared.applied.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

fn run_worker(inner: Arc<dyn Engine>, receiver: Receiver<Command>, shared: Arc<Shared>) {
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Write { recid, value, seq } => {
                let result = match &value {
                    Some(payload) => inner.update(recid, payload),
                    None => inner.delete(recid),
                };
                if let Err(e) = result {
                    tracing::error!(recid, error = %e, "Async write failed");
                    let mut slot = shared.error.lock();
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                }

                let mut pending = shared.pending.lock();
                if pending.get(&recid).map(|p| p.seq) == Some(seq) {
                    pending.remove(&recid);
                }
                drop(pending);
                shared.applied.fetch_add(1, Ordering::Relaxed);
                if shared.log.load(Ordering::Relaxed) {
                    tracing::trace!(recid, seq, delete = value.is_none(), "async apply");
                }
            }
            Command::Flush(ack) => {
                // Flusher may have given up waiting
                let _ = ack.send(());
            }
            Command::Shutdown => break,
        }
    }
    if shared.log.load(Ordering::Relaxed) {
        tracing::debug!(applied = shared.applied.load(Ordering::Relaxed), "Async write worker stopped");
    }
}

impl Engine for AsyncWriteEngine {
    /// The recid is reserved synchronously; the payload write is queued
    fn put(&self, payload: &[u8]) -> Result<Recid> {
        let recid = self.inner.preallocate()?;
        if let Err(e) = self.submit(recid, Some(Bytes::copy_from_slice(payload))) {
            if let Err(cleanup) = self.inner.delete(recid) {
                tracing::warn!(recid, error = %cleanup, "Failed to release reserved recid");
            }
            return Err(e);
        }
        Ok(recid)
    }

    fn preallocate(&self) -> Result<Recid> {
        self.ensure_open()?;
        self.inner.preallocate()
    }

    fn get(&self, recid: Recid) -> Result<Bytes> {
        self.ensure_open()?;
        if let Some(pending) = self.shared.pending.lock().get(&recid) {
            return match &pending.value {
                Some(value) => Ok(value.clone()),
                None => Err(EmberError::RecordNotFound(recid)),
            };
        }
        self.inner.get(recid)
    }

    fn contains(&self, recid: Recid) -> Result<bool> {
        self.ensure_open()?;
        if let Some(pending) = self.shared.pending.lock().get(&recid) {
            return Ok(pending.value.is_some());
        }
        self.inner.contains(recid)
    }

    fn update(&self, recid: Recid, payload: &[u8]) -> Result<()> {
        if !self.contains(recid)? {
            return Err(EmberError::RecordNotFound(recid));
        }
        self.submit(recid, Some(Bytes::copy_from_slice(payload)))
    }

    fn delete(&self, recid: Recid) -> Result<()> {
        if !self.contains(recid)? {
            return Err(EmberError::RecordNotFound(recid));
        }
        self.submit(recid, None)
    }

    fn commit(&self) -> Result<()> {
        self.ensure_open()?;
        self.flush()?;
        self.inner.commit()
    }

    /// Queued writes are applied, then discarded along with their failures
    fn rollback(&self) -> Result<()> {
        self.ensure_open()?;
        self.drain()?;
        if let Err(e) = self.take_error() {
            tracing::debug!(error = %e, "Discarding async write failure on rollback");
        }
        self.inner.rollback()
    }

    fn compact(&self) -> Result<()> {
        self.ensure_open()?;
        self.flush()?;
        self.inner.compact()
    }

    fn stats(&self) -> EngineStats {
        let mut stats = self.inner.stats();
        stats.async_writes = Some(self.async_stats());
        stats
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let drained = self.drain().and_then(|_| self.take_error());
        let stopped = self.stop_worker();
        let closed = self.inner.close();
        drained.and(stopped).and(closed)
    }

    fn release_memory(&self, level: PressureLevel) {
        self.inner.release_memory(level);
    }
}

impl Drop for AsyncWriteEngine {
    fn drop(&mut self) {
        if let Err(e) = self.stop_worker() {
            tracing::error!(error = %e, "Async write worker did not stop cleanly");
        }
    }
}
