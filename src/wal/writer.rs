//! WAL Writer
//!
//! Handles appending entries to the WAL file.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::WalSyncStrategy;
use crate::error::Result;

use super::{Operation, WalEntry, WalRecovery};

/// Writes entries to the WAL file
pub struct WalWriter {
    path: PathBuf,
    /// Opened in append mode, so truncation needs no seek
    writer: BufWriter<File>,
    next_lsn: u64,
    sync_strategy: WalSyncStrategy,
    /// Bytes currently in the log
    size: u64,
}

impl WalWriter {
    /// Open or create a WAL file
    ///
    /// An existing log keeps its valid entries (a torn tail is cut off so new
    /// entries stay reachable); LSNs continue after the last valid one.
    pub fn open(path: &Path, sync_strategy: WalSyncStrategy) -> Result<Self> {
        let last_lsn = if path.exists() {
            WalRecovery::repair(path)?.last_lsn
        } else {
            0
        };

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            next_lsn: last_lsn + 1,
            sync_strategy,
            size,
        })
    }

    /// Append an entry to the WAL, returning its LSN
    pub fn append(&mut self, txn: u64, operation: Operation) -> Result<u64> {
        let lsn = self.next_lsn;
        let frame = WalEntry::new(lsn, txn, operation).serialize()?;

        self.writer.write_all(&frame)?;
        self.size += frame.len() as u64;
        self.next_lsn += 1;

        if self.sync_strategy == WalSyncStrategy::EveryWrite {
            self.sync()?;
        }
        Ok(lsn)
    }

    /// Force sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Discard every entry (checkpoint); LSNs keep increasing
    pub fn truncate(&mut self) -> Result<()> {
        self.writer.flush()?;
        let file = self.writer.get_ref();
        file.set_len(0)?;
        file.sync_all()?;
        self.size = 0;
        Ok(())
    }

    /// Get the last assigned LSN (0 if none)
    pub fn current_lsn(&self) -> u64 {
        self.next_lsn - 1
    }

    /// Bytes currently in the log, including buffered ones
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
