//! WAL Recovery
//!
//! Handles crash recovery by replaying the WAL. Only transactions with a
//! trailing commit marker are applied; everything else is discarded.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::path::Path;

use crate::error::Result;
use crate::volume::Volume;

use super::reader::{TailState, WalReader};
use super::{Operation, WalEntry};

/// Handles WAL recovery after crash
pub struct WalRecovery;

/// Result of a recovery operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Number of entries successfully recovered
    pub entries_recovered: u64,

    /// Number of corrupted entries skipped
    pub entries_corrupted: u64,

    /// Last valid LSN
    pub last_lsn: u64,

    /// Whether the WAL was truncated (partial writes removed)
    pub was_truncated: bool,

    /// Transactions with a commit marker
    pub transactions_committed: u64,

    /// Transactions rolled back or left open
    pub transactions_discarded: u64,
}

/// Writes of one committed transaction, in log order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedTxn {
    pub txn: u64,
    pub commit_lsn: u64,
    pub operations: Vec<Operation>,
}

/// Outcome of applying committed transactions to a volume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub transactions: u64,
    pub operations: u64,
}

impl WalRecovery {
    /// Recover entries from a WAL file
    ///
    /// This will:
    /// 1. Read all valid entries
    /// 2. Stop at the first torn or corrupted entry
    /// 3. Truncate the file after the last valid entry
    /// 4. Return all valid entries in order
    pub fn recover(path: &Path) -> Result<(Vec<WalEntry>, RecoveryResult)> {
        Self::scan(path, true)
    }

    /// Verify integrity of a WAL file without modifying it
    pub fn verify(path: &Path) -> Result<RecoveryResult> {
        Self::scan(path, false).map(|(_, result)| result)
    }

    /// Cut a torn or corrupted tail off, keeping the valid prefix
    pub fn repair(path: &Path) -> Result<RecoveryResult> {
        Self::scan(path, true).map(|(_, result)| result)
    }

    fn scan(path: &Path, truncate: bool) -> Result<(Vec<WalEntry>, RecoveryResult)> {
        let mut reader = WalReader::open(path)?;
        let mut entries = Vec::new();
        let mut result = RecoveryResult::default();

        while let Some(entry) = reader.next_entry()? {
            result.last_lsn = entry.lsn;
            result.entries_recovered += 1;
            entries.push(entry);
        }

        match reader.tail() {
            Some(TailState::Clean) | None => {}
            Some(TailState::Torn) => result.was_truncated = true,
            Some(TailState::Corrupt) => {
                result.was_truncated = true;
                result.entries_corrupted = 1;
            }
        }

        let (committed, discarded) = Self::count_transactions(&entries);
        result.transactions_committed = committed;
        result.transactions_discarded = discarded;

        if truncate && result.was_truncated {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(reader.valid_len())?;
            file.sync_all()?;
            tracing::warn!(
                path = %path.display(),
                valid_len = reader.valid_len(),
                file_len = reader.file_len(),
                "Truncated invalid WAL tail"
            );
        }

        Ok((entries, result))
    }

    fn count_transactions(entries: &[WalEntry]) -> (u64, u64) {
        let mut open: HashSet<u64> = HashSet::new();
        let (mut committed, mut discarded) = (0u64, 0u64);
        for entry in entries {
            match entry.operation {
                Operation::Begin => {
                    open.insert(entry.txn);
                }
                Operation::Commit => {
                    if open.remove(&entry.txn) {
                        committed += 1;
                    }
                }
                Operation::Rollback => {
                    if open.remove(&entry.txn) {
                        discarded += 1;
                    }
                }
                Operation::Write { .. } | Operation::Clear { .. } => {}
            }
        }
        (committed, discarded + open.len() as u64)
    }

    /// Group entries into committed transactions, in commit order
    ///
    /// Transactions may interleave in the log; each is emitted when its
    /// commit marker is reached. Writes outside a begun transaction are ignored.
    pub fn committed_transactions(entries: &[WalEntry]) -> Vec<CommittedTxn> {
        let mut open: HashMap<u64, Vec<Operation>> = HashMap::new();
        let mut committed = Vec::new();

        for entry in entries {
            match &entry.operation {
                Operation::Begin => {
                    open.insert(entry.txn, Vec::new());
                }
                Operation::Write { .. } | Operation::Clear { .. } => {
                    if let Some(ops) = open.get_mut(&entry.txn) {
                        ops.push(entry.operation.clone());
                    }
                }
                Operation::Commit => {
                    if let Some(operations) = open.remove(&entry.txn) {
                        committed.push(CommittedTxn {
                            txn: entry.txn,
                            commit_lsn: entry.lsn,
                            operations,
                        });
                    }
                }
                Operation::Rollback => {
                    open.remove(&entry.txn);
                }
            }
        }
        committed
    }

    /// Apply committed transactions to `volume`
    ///
    /// Writes are whole-region overwrites, so replaying the same log twice
    /// leaves the volume exactly as replaying it once.
    pub fn replay(entries: &[WalEntry], volume: &dyn Volume) -> Result<ReplayStats> {
        let mut stats = ReplayStats::default();
        for txn in Self::committed_transactions(entries) {
            for op in &txn.operations {
                apply(volume, op)?;
                stats.operations += 1;
            }
            stats.transactions += 1;
        }
        Ok(stats)
    }
}

/// Apply one region operation to the volume, growing it as needed
pub(crate) fn apply(volume: &dyn Volume, op: &Operation) -> Result<()> {
    match op {
        Operation::Write { offset, data } => {
            volume.ensure_available(offset + data.len() as u64)?;
            volume.write(*offset, data)
        }
        Operation::Clear { offset, len } => {
            volume.ensure_available(offset + len)?;
            volume.clear(*offset, *len)
        }
        Operation::Begin | Operation::Commit | Operation::Rollback => Ok(()),
    }
}
