//! Write-Ahead Log (WAL) Module
//!
//! Provides durability guarantees through append-only logging.
//!
//! ## Responsibilities
//! - Append log entries before the volume is touched
//! - CRC32 checksums for corruption and torn-write detection
//! - Log Sequence Numbers (LSN) for ordering
//! - Transaction framing (begin / write / commit / rollback)
//! - Crash recovery, replay and checkpoint truncation
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Entry 1                                 │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! ├─────────────────────────────────────────┤
//! │ Entry 2                                 │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! └─────────────────────────────────────────┘
//! ```
//!
//! `Data` is the bincode encoding of `(txn_id, Operation)`.

mod entry;
mod reader;
mod recovery;
mod writer;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::WalSyncStrategy;
use crate::error::Result;
use crate::volume::Volume;

pub use entry::{Operation, WalEntry, HEADER_SIZE, MAX_ENTRY_SIZE};
pub use reader::{TailState, WalIterator, WalReader};
pub use recovery::{CommittedTxn, RecoveryResult, ReplayStats, WalRecovery};
pub use writer::WalWriter;

pub(crate) use recovery::apply;

/// Bytes of payload shown when content logging is on
const CONTENT_PREVIEW: usize = 32;

/// An open transaction; consumed by `commit` or `rollback`
#[derive(Debug)]
#[must_use = "a transaction must be committed or rolled back"]
pub struct TxnHandle {
    id: u64,
}

impl TxnHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Transactional front-end over the WAL file
///
/// Entries from concurrent transactions may interleave in the file; each
/// transaction's own entries stay in order.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<WalWriter>,
    next_txn: AtomicU64,
    log_content: bool,
}

impl WriteAheadLog {
    /// Open or create the log at `path`
    ///
    /// Existing entries are kept until `recover` replays them.
    pub fn open(path: &Path, sync_strategy: WalSyncStrategy, log_content: bool) -> Result<Self> {
        let writer = WalWriter::open(path, sync_strategy)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(writer),
            next_txn: AtomicU64::new(1),
            log_content,
        })
    }

    pub fn begin_transaction(&self) -> Result<TxnHandle> {
        let id = self.next_txn.fetch_add(1, Ordering::SeqCst);
        self.writer.lock().append(id, Operation::Begin)?;
        tracing::trace!(txn = id, "WAL begin");
        Ok(TxnHandle { id })
    }

    /// Log a whole-region overwrite; must precede the matching volume write
    pub fn log_write(&self, txn: &TxnHandle, offset: u64, data: &[u8]) -> Result<()> {
        if self.log_content {
            let preview = &data[..data.len().min(CONTENT_PREVIEW)];
            tracing::trace!(txn = txn.id, offset, len = data.len(), content = ?preview, "WAL write");
        } else {
            tracing::trace!(txn = txn.id, offset, len = data.len(), "WAL write");
        }
        self.writer.lock().append(
            txn.id,
            Operation::Write {
                offset,
                data: data.to_vec(),
            },
        )?;
        Ok(())
    }

    /// Log a zero-fill of `[offset, offset + len)`
    pub fn log_clear(&self, txn: &TxnHandle, offset: u64, len: u64) -> Result<()> {
        tracing::trace!(txn = txn.id, offset, len, "WAL clear");
        self.writer.lock().append(txn.id, Operation::Clear { offset, len })?;
        Ok(())
    }

    /// Append the commit marker and force the log to disk
    ///
    /// The transaction is permanent once this returns.
    pub fn commit(&self, txn: TxnHandle) -> Result<u64> {
        let mut writer = self.writer.lock();
        let lsn = writer.append(txn.id, Operation::Commit)?;
        writer.sync()?;
        tracing::debug!(txn = txn.id, lsn, "WAL commit");
        Ok(lsn)
    }

    pub fn rollback(&self, txn: TxnHandle) -> Result<()> {
        self.writer.lock().append(txn.id, Operation::Rollback)?;
        tracing::debug!(txn = txn.id, "WAL rollback");
        Ok(())
    }

    /// Replay committed transactions onto `volume`, then checkpoint
    ///
    /// A torn or corrupted tail is treated as "not committed".
    pub fn recover(&self, volume: &dyn Volume) -> Result<RecoveryResult> {
        let mut writer = self.writer.lock();
        writer.sync()?;

        let (entries, result) = WalRecovery::recover(&self.path)?;
        let stats = WalRecovery::replay(&entries, volume)?;
        volume.sync()?;
        writer.truncate()?;

        if result.entries_recovered > 0 || result.was_truncated {
            tracing::info!(
                entries = result.entries_recovered,
                corrupted = result.entries_corrupted,
                committed = result.transactions_committed,
                discarded = result.transactions_discarded,
                applied = stats.operations,
                last_lsn = result.last_lsn,
                "WAL recovery complete"
            );
        }
        Ok(result)
    }

    /// Make the volume durable and drop every logged entry
    ///
    /// Caller must ensure no transaction is open.
    pub fn checkpoint(&self, volume: &dyn Volume) -> Result<()> {
        let mut writer = self.writer.lock();
        volume.sync()?;
        let size = writer.size();
        writer.truncate()?;
        tracing::debug!(truncated_bytes = size, "WAL checkpoint");
        Ok(())
    }

    /// Force buffered entries to disk
    pub fn sync(&self) -> Result<()> {
        self.writer.lock().sync()
    }

    /// Bytes currently in the log
    pub fn size(&self) -> u64 {
        self.writer.lock().size()
    }

    pub fn current_lsn(&self) -> u64 {
        self.writer.lock().current_lsn()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
