//! Tests for WAL Recovery
//!
//! These tests verify:
//! - Recovery from a clean WAL and from an empty WAL
//! - Torn tails and corrupted entries are cut off
//! - Only committed transactions are replayed, in commit order
//! - Replay is idempotent
//! - Verify mode reports without modifying the file

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use emberkv::volume::{MemoryVolume, Volume, VolumeOptions};
use emberkv::wal::{Operation, WalEntry, WalRecovery, HEADER_SIZE};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_wal() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let wal_path = temp_dir.path().join("data.wal");
    (temp_dir, wal_path)
}

fn small_volume() -> MemoryVolume {
    MemoryVolume::new(VolumeOptions {
        page_shift: 10,
        zero_out: true,
        print_stack_at_offset: None,
    })
}

/// Builds a log with increasing LSNs
struct LogBuilder {
    entries: Vec<WalEntry>,
}

impl LogBuilder {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn push(mut self, txn: u64, operation: Operation) -> Self {
        let lsn = self.entries.len() as u64 + 1;
        self.entries.push(WalEntry::new(lsn, txn, operation));
        self
    }

    fn write(self, txn: u64, offset: u64, data: &[u8]) -> Self {
        self.push(
            txn,
            Operation::Write {
                offset,
                data: data.to_vec(),
            },
        )
    }

    fn save(&self, path: &PathBuf) {
        let mut file = File::create(path).unwrap();
        for entry in &self.entries {
            file.write_all(&entry.serialize().unwrap()).unwrap();
        }
        file.sync_all().unwrap();
    }
}

// =============================================================================
// Scanning
// =============================================================================

#[test]
fn test_recover_clean_log() {
    let (_dir, path) = setup_temp_wal();
    let log = LogBuilder::new()
        .push(1, Operation::Begin)
        .write(1, 0, b"hello")
        .push(1, Operation::Commit);
    log.save(&path);

    let (entries, result) = WalRecovery::recover(&path).unwrap();

    assert_eq!(entries, log.entries);
    assert_eq!(result.entries_recovered, 3);
    assert_eq!(result.entries_corrupted, 0);
    assert_eq!(result.last_lsn, 3);
    assert!(!result.was_truncated);
    assert_eq!(result.transactions_committed, 1);
}

#[test]
fn test_recover_empty_log() {
    let (_dir, path) = setup_temp_wal();
    File::create(&path).unwrap();

    let (entries, result) = WalRecovery::recover(&path).unwrap();
    assert!(entries.is_empty());
    assert_eq!(result.last_lsn, 0);
    assert!(!result.was_truncated);
}

#[test]
fn test_recover_truncates_torn_tail() {
    let (_dir, path) = setup_temp_wal();
    LogBuilder::new()
        .push(1, Operation::Begin)
        .push(1, Operation::Commit)
        .save(&path);
    let valid_len = std::fs::metadata(&path).unwrap().len();

    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0x11; 20]).unwrap();
    drop(file);

    let (entries, result) = WalRecovery::recover(&path).unwrap();
    assert_eq!(entries.len(), 2);
    assert!(result.was_truncated);
    assert_eq!(result.entries_corrupted, 0);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), valid_len);
}

#[test]
fn test_recover_counts_corrupt_entry() {
    let (_dir, path) = setup_temp_wal();
    LogBuilder::new()
        .push(1, Operation::Begin)
        .push(1, Operation::Commit)
        .save(&path);

    let mut frame = WalEntry::new(3, 2, Operation::Begin).serialize().unwrap();
    frame[HEADER_SIZE] ^= 0xFF;
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&frame).unwrap();
    drop(file);

    let (entries, result) = WalRecovery::recover(&path).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(result.entries_corrupted, 1);
    assert!(result.was_truncated);
}

#[test]
fn test_verify_does_not_modify_file() {
    let (_dir, path) = setup_temp_wal();
    LogBuilder::new().push(1, Operation::Begin).save(&path);
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0x22; 5]).unwrap();
    drop(file);
    let before = std::fs::metadata(&path).unwrap().len();

    let result = WalRecovery::verify(&path).unwrap();

    assert!(result.was_truncated);
    assert_eq!(result.transactions_discarded, 1);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), before);
}

// =============================================================================
// Transaction Grouping
// =============================================================================

#[test]
fn test_only_committed_transactions_are_grouped() {
    let log = LogBuilder::new()
        .push(1, Operation::Begin)
        .push(2, Operation::Begin)
        .write(1, 0, b"a")
        .write(2, 8, b"b")
        .push(3, Operation::Begin)
        .write(3, 16, b"c")
        .push(2, Operation::Commit)
        .push(3, Operation::Rollback)
        .write(1, 24, b"d")
        .push(1, Operation::Commit)
        // Never begun: ignored
        .write(9, 32, b"x")
        .push(9, Operation::Commit);

    let committed = WalRecovery::committed_transactions(&log.entries);

    let order: Vec<u64> = committed.iter().map(|t| t.txn).collect();
    assert_eq!(order, vec![2, 1]);
    assert_eq!(committed[1].operations.len(), 2);
    assert_eq!(committed[1].commit_lsn, 10);
}

#[test]
fn test_uncommitted_transaction_is_not_replayed() {
    let log = LogBuilder::new()
        .push(1, Operation::Begin)
        .write(1, 0, b"committed")
        .push(1, Operation::Commit)
        .push(2, Operation::Begin)
        .write(2, 0, b"CLOBBERED");

    let volume = small_volume();
    let stats = WalRecovery::replay(&log.entries, &volume).unwrap();

    assert_eq!(stats.transactions, 1);
    assert_eq!(stats.operations, 1);
    assert_eq!(volume.read(0, 9).unwrap(), b"committed");
}

#[test]
fn test_replay_grows_volume_and_clears() {
    let log = LogBuilder::new()
        .push(1, Operation::Begin)
        .write(1, 3000, &[0xFF; 100])
        .push(1, Operation::Commit)
        .push(2, Operation::Begin)
        .push(2, Operation::Clear {
            offset: 3050,
            len: 10,
        })
        .push(2, Operation::Commit);

    let volume = small_volume();
    WalRecovery::replay(&log.entries, &volume).unwrap();

    assert_eq!(volume.length(), 4096);
    let bytes = volume.read(3000, 100).unwrap();
    assert!(bytes[..50].iter().all(|&b| b == 0xFF));
    assert!(bytes[50..60].iter().all(|&b| b == 0));
    assert!(bytes[60..].iter().all(|&b| b == 0xFF));
}

#[test]
fn test_replay_twice_equals_replay_once() {
    let log = LogBuilder::new()
        .push(1, Operation::Begin)
        .write(1, 0, b"first version")
        .write(1, 100, b"other")
        .push(1, Operation::Commit)
        .push(2, Operation::Begin)
        .write(2, 0, b"second")
        .push(2, Operation::Clear { offset: 100, len: 2 })
        .push(2, Operation::Commit);

    let once = small_volume();
    WalRecovery::replay(&log.entries, &once).unwrap();

    let twice = small_volume();
    WalRecovery::replay(&log.entries, &twice).unwrap();
    WalRecovery::replay(&log.entries, &twice).unwrap();

    assert_eq!(once.length(), twice.length());
    assert_eq!(
        once.read(0, once.length() as usize).unwrap(),
        twice.read(0, twice.length() as usize).unwrap()
    );
}
