//! Tests for the record Store
//!
//! These tests verify:
//! - Record round-trips of all sizes, including page-crossing payloads
//! - Preallocation, in-place update and relocation
//! - Commit / rollback semantics and free-space reuse
//! - Compaction and automatic checkpoints
//! - Directory ownership, corruption detection and lifecycle errors

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use emberkv::config::{Config, Diagnostics, Location};
use emberkv::store::{Store, DATA_FILE, MAX_PAYLOAD_SIZE, RECORD_HEADER_SIZE};
use emberkv::EmberError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn test_config() -> Config {
    Config::builder()
        .volume_page_size(4096)
        .file_lock_heartbeat_ms(50)
        .diagnostics(Diagnostics {
            paranoid: true,
            ..Diagnostics::default()
        })
        .build()
}

fn memory_store() -> Store {
    Store::open(&Location::Memory, &test_config()).unwrap()
}

fn setup_temp_store() -> (TempDir, Store) {
    let temp_dir = TempDir::new().unwrap();
    let store = open_dir(temp_dir.path());
    (temp_dir, store)
}

fn open_dir(path: &Path) -> Store {
    Store::open(&Location::directory(path), &test_config()).unwrap()
}

fn open_dir_without_zeroing(path: &Path) -> Store {
    let config = Config {
        zero_unused_space: false,
        ..test_config()
    };
    Store::open(&Location::directory(path), &config).unwrap()
}

// =============================================================================
// Record Operations
// =============================================================================

#[test]
fn test_round_trip_various_sizes() {
    let store = memory_store();
    let sizes = [0usize, 1, 15, 16, 17, 1000, 4096, 10_000];

    let recids: Vec<_> = sizes
        .iter()
        .map(|&len| {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
            (store.put(&payload).unwrap(), payload)
        })
        .collect();

    // Before and after commit
    for (recid, payload) in &recids {
        assert_eq!(&store.get(*recid).unwrap()[..], &payload[..]);
    }
    store.commit().unwrap();
    for (recid, payload) in &recids {
        assert_eq!(&store.get(*recid).unwrap()[..], &payload[..]);
    }
}

#[test]
fn test_unknown_recids_are_not_found() {
    let store = memory_store();
    assert!(matches!(store.get(0), Err(EmberError::RecordNotFound(0))));
    assert!(matches!(store.get(999), Err(EmberError::RecordNotFound(999))));
    assert!(matches!(
        store.update(999, b"x"),
        Err(EmberError::RecordNotFound(999))
    ));
    assert!(matches!(store.delete(999), Err(EmberError::RecordNotFound(999))));
    assert!(!store.contains(999).unwrap());
}

#[test]
fn test_preallocate_then_update() {
    let store = memory_store();
    let recid = store.preallocate().unwrap();

    assert!(store.contains(recid).unwrap());
    assert!(store.get(recid).unwrap().is_empty());
    assert_eq!(store.locate(recid).unwrap(), None);

    store.update(recid, b"filled in").unwrap();
    store.commit().unwrap();
    assert_eq!(&store.get(recid).unwrap()[..], b"filled in");
    assert!(store.locate(recid).unwrap().is_some());
}

#[test]
fn test_update_that_fits_stays_in_place() {
    let store = memory_store();
    let recid = store.put(&[1u8; 40]).unwrap();
    store.commit().unwrap();
    let offset = store.locate(recid).unwrap();

    store.update(recid, &[2u8; 20]).unwrap();
    store.commit().unwrap();

    assert_eq!(store.locate(recid).unwrap(), offset);
    assert_eq!(&store.get(recid).unwrap()[..], &[2u8; 20]);
}

#[test]
fn test_growing_update_relocates() {
    let store = memory_store();
    let recid = store.put(&[1u8; 16]).unwrap();
    let neighbour = store.put(&[9u8; 16]).unwrap();
    store.commit().unwrap();
    let old_offset = store.locate(recid).unwrap();

    store.update(recid, &[3u8; 500]).unwrap();
    store.commit().unwrap();

    assert_ne!(store.locate(recid).unwrap(), old_offset);
    assert_eq!(&store.get(recid).unwrap()[..], &[3u8; 500][..]);
    assert_eq!(&store.get(neighbour).unwrap()[..], &[9u8; 16]);
    assert!(store.stats().free_bytes > 0);
    store.check_consistency().unwrap();
}

#[test]
fn test_delete_frees_recid_for_reuse() {
    let store = memory_store();
    let a = store.put(b"a").unwrap();
    store.commit().unwrap();

    store.delete(a).unwrap();
    assert!(matches!(store.get(a), Err(EmberError::RecordNotFound(_))));
    store.commit().unwrap();

    assert_eq!(store.put(b"b").unwrap(), a);
}

#[test]
fn test_delete_preallocated_record() {
    let store = memory_store();
    let recid = store.preallocate().unwrap();
    store.delete(recid).unwrap();
    store.commit().unwrap();
    assert!(!store.contains(recid).unwrap());
}

// =============================================================================
// Transactions
// =============================================================================

#[test]
fn test_rollback_restores_committed_state() {
    let store = memory_store();
    let kept = store.put(b"original").unwrap();
    let doomed = store.put(b"to delete").unwrap();
    store.commit().unwrap();
    let stats_before = store.stats();

    store.update(kept, &[0xAB; 300]).unwrap();
    store.delete(doomed).unwrap();
    let fresh = store.put(b"never committed").unwrap();
    assert!(store.has_uncommitted_changes());

    store.rollback().unwrap();

    assert!(!store.has_uncommitted_changes());
    assert_eq!(&store.get(kept).unwrap()[..], b"original");
    assert_eq!(&store.get(doomed).unwrap()[..], b"to delete");
    assert!(matches!(store.get(fresh), Err(EmberError::RecordNotFound(_))));

    let stats_after = store.stats();
    assert_eq!(stats_after.tail, stats_before.tail);
    assert_eq!(stats_after.max_recid, stats_before.max_recid);
    store.check_consistency().unwrap();
}

#[test]
fn test_released_space_not_reused_before_commit() {
    let store = memory_store();
    let a = store.put(&[1u8; 64]).unwrap();
    store.commit().unwrap();
    let offset = store.locate(a).unwrap();

    store.delete(a).unwrap();
    let b = store.put(&[2u8; 64]).unwrap();
    assert_ne!(store.locate(b).unwrap(), offset);

    // Rolling back must leave the original record intact
    store.rollback().unwrap();
    assert_eq!(&store.get(a).unwrap()[..], &[1u8; 64][..]);
}

#[test]
fn test_commit_without_changes_is_noop() {
    let store = memory_store();
    let before = store.stats().commits;
    store.commit().unwrap();
    assert_eq!(store.stats().commits, before);
}

// =============================================================================
// Persistence
// =============================================================================

#[test]
fn test_committed_records_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let a;
    let b;
    {
        let store = open_dir(temp_dir.path());
        a = store.put(b"alpha").unwrap();
        b = store.put(&vec![0x42; 9000]).unwrap();
        store.commit().unwrap();
        store.close().unwrap();
    }

    let store = open_dir(temp_dir.path());
    assert_eq!(&store.get(a).unwrap()[..], b"alpha");
    assert_eq!(&store.get(b).unwrap()[..], &vec![0x42; 9000][..]);
    store.check_consistency().unwrap();
}

#[test]
fn test_free_space_rebuilt_on_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let offset;
    {
        let store = open_dir(temp_dir.path());
        let a = store.put(&[1u8; 200]).unwrap();
        store.put(&[2u8; 200]).unwrap();
        store.commit().unwrap();
        offset = store.locate(a).unwrap();
        store.delete(a).unwrap();
        store.commit().unwrap();
        store.close().unwrap();
    }

    let store = open_dir(temp_dir.path());
    assert!(store.stats().free_bytes >= 200);
    let c = store.put(&[3u8; 200]).unwrap();
    assert_eq!(store.locate(c).unwrap(), offset);
}

#[test]
fn test_second_open_is_locked() {
    let (temp_dir, _store) = setup_temp_store();
    let second = Store::open(&Location::directory(temp_dir.path()), &test_config());
    assert!(matches!(second, Err(EmberError::Locked(_))));
}

#[test]
fn test_close_releases_directory() {
    let (temp_dir, store) = setup_temp_store();
    store.close().unwrap();
    let reopened = open_dir(temp_dir.path());
    assert!(!reopened.is_closed());
}

#[test]
fn test_corrupt_payload_is_detected_per_record() {
    let temp_dir = TempDir::new().unwrap();
    let good;
    let bad;
    let offset;
    {
        let store = open_dir(temp_dir.path());
        good = store.put(b"good record").unwrap();
        bad = store.put(b"bad record").unwrap();
        store.commit().unwrap();
        offset = store.locate(bad).unwrap().unwrap();
        store.close().unwrap();
    }

    let mut file = OpenOptions::new()
        .write(true)
        .open(temp_dir.path().join(DATA_FILE))
        .unwrap();
    file.seek(SeekFrom::Start(offset + RECORD_HEADER_SIZE)).unwrap();
    file.write_all(b"X").unwrap();
    file.sync_all().unwrap();
    drop(file);

    let store = open_dir(temp_dir.path());
    assert!(matches!(
        store.get(bad),
        Err(EmberError::CorruptRecord { recid, .. }) if recid == bad
    ));
    // Engine stays usable
    assert_eq!(&store.get(good).unwrap()[..], b"good record");
    store.put(b"still writable").unwrap();
    store.commit().unwrap();
}

// =============================================================================
// Maintenance
// =============================================================================

#[test]
fn test_compaction_discards_free_space() {
    let (_dir, store) = setup_temp_store();
    let mut kept = Vec::new();
    for i in 0..50u8 {
        let recid = store.put(&vec![i; 300]).unwrap();
        if i % 2 == 0 {
            kept.push((recid, i));
        } else {
            store.commit().unwrap();
            store.delete(recid).unwrap();
        }
    }
    store.commit().unwrap();
    let before = store.stats();
    assert!(before.free_bytes > 0);

    store.compact().unwrap();

    let after = store.stats();
    assert!(after.tail < before.tail);
    assert_eq!(after.free_bytes, 0);
    assert_eq!(after.compactions, 1);
    for (recid, i) in kept {
        assert_eq!(&store.get(recid).unwrap()[..], &vec![i; 300][..]);
    }
    store.check_consistency().unwrap();
}

#[test]
fn test_compacted_store_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let recid;
    {
        let store = open_dir(temp_dir.path());
        let junk = store.put(&[0u8; 4000]).unwrap();
        recid = store.put(b"survivor").unwrap();
        store.commit().unwrap();
        store.delete(junk).unwrap();
        store.commit().unwrap();
        store.compact().unwrap();
        store.close().unwrap();
    }

    let store = open_dir(temp_dir.path());
    assert_eq!(&store.get(recid).unwrap()[..], b"survivor");
    assert!(!temp_dir.path().join("data.ember.compact").exists());
}

#[test]
fn test_compaction_requires_committed_state() {
    let store = memory_store();
    store.put(b"pending").unwrap();
    assert!(matches!(store.compact(), Err(EmberError::UncommittedChanges)));
}

#[test]
fn test_memory_store_compaction() {
    let store = memory_store();
    let a = store.put(&[1u8; 1000]).unwrap();
    let b = store.put(&[2u8; 10]).unwrap();
    store.commit().unwrap();
    store.delete(a).unwrap();
    store.commit().unwrap();

    store.compact().unwrap();
    assert_eq!(&store.get(b).unwrap()[..], &[2u8; 10]);
    assert_eq!(store.stats().free_bytes, 0);
}

#[test]
fn test_wal_checkpoints_automatically() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .volume_page_size(4096)
        .wal_checkpoint_bytes(1024)
        .build();
    let store = Store::open(&Location::directory(temp_dir.path()), &config).unwrap();

    for _ in 0..5 {
        store.put(&[7u8; 600]).unwrap();
        store.commit().unwrap();
    }

    let stats = store.stats();
    assert!(stats.checkpoints > 0);
    assert!(stats.wal_bytes < 2048);
}

#[test]
fn test_explicit_checkpoint_empties_wal() {
    let (_dir, store) = setup_temp_store();
    store.put(b"x").unwrap();
    store.commit().unwrap();
    assert!(store.stats().wal_bytes > 0);

    store.checkpoint().unwrap();
    assert_eq!(store.stats().wal_bytes, 0);
}

#[test]
fn test_closed_store_rejects_everything() {
    let store = memory_store();
    store.close().unwrap();

    assert!(store.is_closed());
    assert!(matches!(store.put(b"x"), Err(EmberError::Closed)));
    assert!(matches!(store.commit(), Err(EmberError::Closed)));
    assert!(matches!(store.compact(), Err(EmberError::Closed)));
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = Config::builder().volume_page_size(1000).build();
    assert!(matches!(
        Store::open(&Location::Memory, &config),
        Err(EmberError::Config(_))
    ));
}

#[test]
fn test_oversized_payload_is_rejected_up_front() {
    let (temp_dir, store) = setup_temp_store();
    let kept = store.put(b"small").unwrap();

    let oversized = vec![0u8; MAX_PAYLOAD_SIZE + 1];
    assert!(matches!(store.put(&oversized), Err(EmberError::Storage(_))));
    assert!(matches!(store.update(kept, &oversized), Err(EmberError::Storage(_))));
    drop(oversized);

    // The rest of the batch still commits
    store.commit().unwrap();
    store.close().unwrap();

    let store = open_dir(temp_dir.path());
    assert_eq!(&store.get(kept).unwrap()[..], b"small");
}

// =============================================================================
// Without Zero-Fill
// =============================================================================

#[test]
fn test_store_without_zeroing_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let small;
    let large;
    {
        let store = open_dir_without_zeroing(temp_dir.path());
        small = store.put(b"sparse").unwrap();
        // Forces the file to grow by several pages
        large = store.put(&vec![0x5C; 20_000]).unwrap();
        store.commit().unwrap();
        store.update(small, b"sparse v2").unwrap();
        store.commit().unwrap();
        store.close().unwrap();
    }

    let store = open_dir_without_zeroing(temp_dir.path());
    assert_eq!(&store.get(small).unwrap()[..], b"sparse v2");
    assert_eq!(&store.get(large).unwrap()[..], &vec![0x5C; 20_000][..]);
    store.check_consistency().unwrap();
}

#[test]
fn test_released_space_keeps_old_bytes_without_zeroing() {
    let temp_dir = TempDir::new().unwrap();
    let offset;
    {
        let store = open_dir_without_zeroing(temp_dir.path());
        let a = store.put(&[0xA1; 200]).unwrap();
        store.put(&[0xB2; 200]).unwrap();
        store.commit().unwrap();
        offset = store.locate(a).unwrap().unwrap();
        store.delete(a).unwrap();
        store.commit().unwrap();
        store.close().unwrap();
    }

    // The freed record was not cleared on disk
    let image = std::fs::read(temp_dir.path().join(DATA_FILE)).unwrap();
    let payload_at = (offset + RECORD_HEADER_SIZE) as usize;
    assert_eq!(&image[payload_at..payload_at + 200], &[0xA1; 200][..]);

    // Stale bytes do not confuse the free-space rebuild, and the gap is reused
    let store = open_dir_without_zeroing(temp_dir.path());
    assert!(store.stats().free_bytes >= 200);
    let c = store.put(&[0xC3; 200]).unwrap();
    assert_eq!(store.locate(c).unwrap(), Some(offset));
    assert_eq!(&store.get(c).unwrap()[..], &[0xC3; 200][..]);
    store.check_consistency().unwrap();
}

#[test]
fn test_released_space_is_cleared_with_zeroing() {
    let temp_dir = TempDir::new().unwrap();
    let offset;
    {
        let store = open_dir(temp_dir.path());
        let a = store.put(&[0xA1; 200]).unwrap();
        store.put(&[0xB2; 200]).unwrap();
        store.commit().unwrap();
        offset = store.locate(a).unwrap().unwrap();
        store.delete(a).unwrap();
        store.commit().unwrap();
        store.close().unwrap();
    }

    let image = std::fs::read(temp_dir.path().join(DATA_FILE)).unwrap();
    let at = offset as usize;
    assert!(image[at..at + 200].iter().all(|&b| b == 0));
}
