//! Periodic cache sweep
//!
//! Raises a `Moderate` memory-pressure signal on the wrapper chain every
//! period, so weakly held cache entries are shed without the caller ever
//! calling `release_memory`. Soft and hard-reference entries are unaffected.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};

use crate::error::Result;

use super::{Engine, PressureLevel};

/// Background thread signalling memory pressure, stopped on drop
pub struct CacheSweeper {
    stop: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl CacheSweeper {
    /// Start sweeping `engine` every `period`
    ///
    /// Holds only a weak reference; the thread exits once the chain is gone.
    pub fn start(engine: &Arc<dyn Engine>, period: Duration) -> Result<Self> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let target: Weak<dyn Engine> = Arc::downgrade(engine);

        let worker = thread::Builder::new()
            .name("emberkv-cache-sweeper".to_string())
            .spawn(move || {
                let mut sweeps = 0u64;
                loop {
                    match stop_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let Some(engine) = target.upgrade() else {
                        break;
                    };
                    engine.release_memory(PressureLevel::Moderate);
                    sweeps += 1;
                }
                tracing::debug!(sweeps, "Cache sweeper stopped");
            })?;

        tracing::debug!(period_ms = period.as_millis() as u64, "Cache sweeper started");
        Ok(Self {
            stop: Some(stop_tx),
            worker: Some(worker),
        })
    }

    /// Stop the thread and wait for it to exit
    pub fn stop(&mut self) {
        // Dropping the sender wakes the sweeper with Disconnected
        self.stop.take();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                tracing::error!("Cache sweeper panicked");
            }
        }
    }
}

impl Drop for CacheSweeper {
    fn drop(&mut self) {
        self.stop();
    }
}
