//! Tests for the segmented hash and tree maps
//!
//! These tests verify:
//! - Insert/get/replace/remove semantics for both map kinds
//! - Hash segment growth and tree leaf splits/merges
//! - Ordered iteration and range bounds
//! - Segment isolation under a held segment lock
//! - Catalog persistence, kind checks and rollback behavior
//! - Concurrent writers with fair and unfair locks
//! - Handles to rolled-back maps fail instead of touching reused records

use std::ops::Bound;
use std::thread;
use std::time::Duration;

use crossbeam::channel;
use emberkv::config::{CacheMode, Config, Diagnostics, Location};
use emberkv::{Db, EmberError, MapKind};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn memory_db(concurrency: usize) -> Db {
    Db::memory(Config::builder().concurrency_level(concurrency).build()).unwrap()
}

fn key(i: u32) -> Vec<u8> {
    format!("key-{:05}", i).into_bytes()
}

fn value(i: u32) -> Vec<u8> {
    format!("value-{}", i).into_bytes()
}

// =============================================================================
// Hash Map
// =============================================================================

#[test]
fn test_hash_insert_get_replace_remove() {
    let db = memory_db(4);
    let map = db.hash_map("users").unwrap();

    assert!(map.is_empty().unwrap());
    assert_eq!(map.insert(b"alice", b"1").unwrap(), None);
    assert_eq!(map.insert(b"bob", b"2").unwrap(), None);
    assert_eq!(map.get(b"alice").unwrap(), Some(b"1".to_vec()));
    assert!(map.contains_key(b"bob").unwrap());
    assert_eq!(map.len().unwrap(), 2);

    assert_eq!(map.insert(b"alice", b"10").unwrap(), Some(b"1".to_vec()));
    assert_eq!(map.get(b"alice").unwrap(), Some(b"10".to_vec()));
    assert_eq!(map.len().unwrap(), 2);

    assert_eq!(map.remove(b"bob").unwrap(), Some(b"2".to_vec()));
    assert_eq!(map.remove(b"bob").unwrap(), None);
    assert_eq!(map.get(b"bob").unwrap(), None);
    assert_eq!(map.len().unwrap(), 1);
}

#[test]
fn test_hash_empty_key_and_value() {
    let db = memory_db(1);
    let map = db.hash_map("edge").unwrap();

    map.insert(b"", b"empty key").unwrap();
    map.insert(b"empty value", b"").unwrap();
    assert_eq!(map.get(b"").unwrap(), Some(b"empty key".to_vec()));
    assert_eq!(map.get(b"empty value").unwrap(), Some(Vec::new()));
}

#[test]
fn test_hash_segment_grows() {
    let db = memory_db(1);
    let map = db.hash_map("big").unwrap();

    for i in 0..1500 {
        map.insert(&key(i), &value(i)).unwrap();
    }
    db.commit().unwrap();

    assert_eq!(map.len().unwrap(), 1500);
    for i in (0..1500).step_by(7) {
        assert_eq!(map.get(&key(i)).unwrap(), Some(value(i)));
    }

    let mut keys = map.keys().unwrap();
    keys.sort();
    assert_eq!(keys.len(), 1500);
    assert_eq!(keys[0], key(0));
    db.check_consistency().unwrap();
}

#[test]
fn test_hash_remove_from_chain_middle() {
    let db = memory_db(1);
    let map = db.hash_map("chain").unwrap();
    for i in 0..300 {
        map.insert(&key(i), &value(i)).unwrap();
    }
    for i in (0..300).filter(|i| i % 3 == 0) {
        assert_eq!(map.remove(&key(i)).unwrap(), Some(value(i)));
    }

    assert_eq!(map.len().unwrap(), 200);
    for i in 0..300 {
        let expected = (i % 3 != 0).then(|| value(i));
        assert_eq!(map.get(&key(i)).unwrap(), expected);
    }
}

// =============================================================================
// Tree Map
// =============================================================================

#[test]
fn test_tree_iterates_in_key_order() {
    let db = memory_db(4);
    let map = db.tree_map("sorted").unwrap();

    for i in [5u32, 1, 9, 3, 7, 0, 8, 2, 6, 4] {
        map.insert(&key(i), &value(i)).unwrap();
    }

    let keys = map.keys().unwrap();
    let expected: Vec<Vec<u8>> = (0..10).map(key).collect();
    assert_eq!(keys, expected);
    assert_eq!(map.len().unwrap(), 10);
}

#[test]
fn test_tree_range_bounds() {
    let db = memory_db(2);
    let map = db.tree_map("ranges").unwrap();
    for i in 0..50 {
        map.insert(&key(i), &value(i)).unwrap();
    }
    let (k10, k20) = (key(10), key(20));

    let inclusive = map
        .range(Bound::Included(&k10[..]), Bound::Included(&k20[..]))
        .unwrap();
    assert_eq!(inclusive.len(), 11);
    assert_eq!(inclusive[0], (key(10), value(10)));
    assert_eq!(inclusive[10].0, key(20));

    let exclusive = map
        .range(Bound::Excluded(&k10[..]), Bound::Excluded(&k20[..]))
        .unwrap();
    assert_eq!(exclusive.len(), 9);
    assert_eq!(exclusive[0].0, key(11));

    let tail = map.range(Bound::Included(&k20[..]), Bound::Unbounded).unwrap();
    assert_eq!(tail.len(), 30);

    let head = map.range(Bound::Unbounded, Bound::Excluded(&k10[..])).unwrap();
    assert_eq!(head.len(), 10);

    let empty = map
        .range(Bound::Included(&k20[..]), Bound::Excluded(&k10[..]))
        .unwrap();
    assert!(empty.is_empty());
}

#[test]
fn test_tree_splits_and_shrinks() {
    let db = memory_db(1);
    let map = db.tree_map("leaves").unwrap();

    // Descending inserts split the first leaf repeatedly
    for i in (0..400).rev() {
        map.insert(&key(i), &value(i)).unwrap();
    }
    assert_eq!(map.len().unwrap(), 400);
    assert_eq!(map.keys().unwrap(), (0..400).map(key).collect::<Vec<_>>());

    // Emptying whole leaves removes them from the index
    for i in 0..390 {
        assert_eq!(map.remove(&key(i)).unwrap(), Some(value(i)));
    }
    assert_eq!(map.len().unwrap(), 10);
    assert_eq!(map.keys().unwrap(), (390..400).map(key).collect::<Vec<_>>());

    // Keys below every remaining leaf still land somewhere sensible
    map.insert(&key(0), &value(0)).unwrap();
    assert_eq!(map.get(&key(0)).unwrap(), Some(value(0)));
    assert_eq!(map.keys().unwrap()[0], key(0));

    db.commit().unwrap();
    db.check_consistency().unwrap();
}

#[test]
fn test_tree_replace_keeps_count() {
    let db = memory_db(2);
    let map = db.tree_map("replace").unwrap();
    map.insert(b"k", b"v1").unwrap();
    assert_eq!(map.insert(b"k", b"v2").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(map.len().unwrap(), 1);
    assert_eq!(map.get(b"k").unwrap(), Some(b"v2".to_vec()));
    assert_eq!(map.remove(b"missing").unwrap(), None);
}

// =============================================================================
// Segments
// =============================================================================

#[test]
fn test_segment_count_follows_concurrency_level() {
    let db = memory_db(8);
    let hash = db.hash_map("h").unwrap();
    let tree = db.tree_map("t").unwrap();
    assert_eq!(hash.segment_count(), 8);
    assert_eq!(tree.segment_count(), 8);
    assert!(hash.segment_of(b"anything") < 8);
}

#[test]
fn test_held_segment_does_not_block_others() {
    let db = memory_db(4);
    let map = db.hash_map("isolated").unwrap();

    let blocked_key = key(0);
    let blocked_segment = map.segment_of(&blocked_key);
    let free_key = (1..)
        .map(key)
        .find(|k| map.segment_of(k) != blocked_segment)
        .unwrap();

    let (map_ref, free_ref, blocked_ref) = (&map, &free_key, &blocked_key);
    thread::scope(|s| {
        let hold = map_ref.lock_segment(blocked_segment);

        let (free_tx, free_rx) = channel::bounded(1);
        s.spawn(move || {
            map_ref.insert(free_ref, b"free").unwrap();
            free_tx.send(()).unwrap();
        });
        assert!(free_rx.recv_timeout(Duration::from_secs(5)).is_ok());

        let (blocked_tx, blocked_rx) = channel::bounded(1);
        s.spawn(move || {
            map_ref.insert(blocked_ref, b"blocked").unwrap();
            blocked_tx.send(()).unwrap();
        });
        assert!(blocked_rx.recv_timeout(Duration::from_millis(100)).is_err());

        drop(hold);
        assert!(blocked_rx.recv_timeout(Duration::from_secs(5)).is_ok());
    });

    assert_eq!(map.get(&blocked_key).unwrap(), Some(b"blocked".to_vec()));
    assert_eq!(map.get(&free_key).unwrap(), Some(b"free".to_vec()));
}

#[test]
fn test_concurrent_writers_unfair_and_fair() {
    for fair in [false, true] {
        let config = Config::builder()
            .concurrency_level(4)
            .lock_fairness(fair)
            .cache_mode(CacheMode::Lru)
            .cache_size(256)
            .build();
        let db = Db::memory(config).unwrap();
        let hash = db.hash_map("h").unwrap();
        let tree = db.tree_map("t").unwrap();

        thread::scope(|s| {
            for t in 0..4u32 {
                let (hash, tree) = (&hash, &tree);
                s.spawn(move || {
                    for i in 0..100 {
                        let n = t * 1000 + i;
                        hash.insert(&key(n), &value(n)).unwrap();
                        tree.insert(&key(n), &value(n)).unwrap();
                    }
                });
            }
        });

        assert_eq!(hash.len().unwrap(), 400);
        assert_eq!(tree.len().unwrap(), 400);
        let keys = tree.keys().unwrap();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        db.commit().unwrap();
        db.check_consistency().unwrap();
    }
}

// =============================================================================
// Catalog
// =============================================================================

#[test]
fn test_catalog_persists_maps() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder().volume_page_size(4096).build();

    {
        let db = Db::open(Location::directory(temp_dir.path()), config.clone()).unwrap();
        db.tree_map("zeta").unwrap().insert(b"z", b"26").unwrap();
        db.hash_map("alpha").unwrap().insert(b"a", b"1").unwrap();
        db.commit().unwrap();
        db.close().unwrap();
    }

    let db = Db::open(Location::directory(temp_dir.path()), config).unwrap();
    assert_eq!(
        db.maps().unwrap(),
        vec![
            ("alpha".to_string(), MapKind::Hash),
            ("zeta".to_string(), MapKind::Tree)
        ]
    );
    assert_eq!(db.tree_map("zeta").unwrap().get(b"z").unwrap(), Some(b"26".to_vec()));
    assert_eq!(db.hash_map("alpha").unwrap().get(b"a").unwrap(), Some(b"1".to_vec()));
}

#[test]
fn test_map_kind_mismatch_is_rejected() {
    let db = memory_db(2);
    db.hash_map("shared").unwrap();
    assert!(matches!(db.tree_map("shared"), Err(EmberError::Storage(_))));
}

#[test]
fn test_rollback_restores_map_contents() {
    let db = memory_db(2);
    let map = db.hash_map("txn").unwrap();
    map.insert(b"kept", b"1").unwrap();
    db.commit().unwrap();

    map.insert(b"dropped", b"2").unwrap();
    map.insert(b"kept", b"changed").unwrap();
    db.rollback().unwrap();

    assert_eq!(map.get(b"dropped").unwrap(), None);
    assert_eq!(map.get(b"kept").unwrap(), Some(b"1".to_vec()));
    assert_eq!(map.len().unwrap(), 1);
}

#[test]
fn test_map_created_in_rolled_back_transaction() {
    let db = memory_db(2);
    db.hash_map("ephemeral").unwrap().insert(b"k", b"v").unwrap();
    db.rollback().unwrap();

    assert!(db.maps().unwrap().is_empty());

    // Reopening by name creates a fresh, empty map
    let map = db.hash_map("ephemeral").unwrap();
    assert!(map.is_empty().unwrap());
    map.insert(b"k", b"v2").unwrap();
    db.commit().unwrap();
    assert_eq!(db.maps().unwrap(), vec![("ephemeral".to_string(), MapKind::Hash)]);
}

#[test]
fn test_handle_from_rolled_back_hash_map_is_stale() {
    let db = memory_db(2);
    let stale = db.hash_map("a").unwrap();
    stale.insert(b"k", b"v").unwrap();
    db.rollback().unwrap();

    // The rolled-back map's records are gone
    assert!(matches!(stale.get(b"k"), Err(EmberError::StaleMap(_))));

    // A new map takes over the released recids
    let fresh = db.hash_map("b").unwrap();
    assert!(matches!(stale.get(b"k"), Err(EmberError::StaleMap(_))));
    assert!(matches!(stale.insert(b"k", b"x"), Err(EmberError::StaleMap(_))));
    assert!(matches!(stale.remove(b"k"), Err(EmberError::StaleMap(_))));
    assert!(matches!(stale.len(), Err(EmberError::StaleMap(_))));

    assert!(fresh.is_empty().unwrap());
    fresh.insert(b"k", b"b").unwrap();
    db.commit().unwrap();
    assert_eq!(fresh.get(b"k").unwrap(), Some(b"b".to_vec()));
    assert_eq!(fresh.len().unwrap(), 1);
}

#[test]
fn test_handle_from_rolled_back_tree_map_is_stale() {
    let db = memory_db(2);
    let stale = db.tree_map("a").unwrap();
    stale.insert(b"k", b"v").unwrap();
    db.rollback().unwrap();

    let fresh = db.tree_map("b").unwrap();
    assert!(matches!(stale.get(b"k"), Err(EmberError::StaleMap(_))));
    assert!(matches!(stale.insert(b"k", b"x"), Err(EmberError::StaleMap(_))));

    assert!(fresh.is_empty().unwrap());
    fresh.insert(b"k", b"b").unwrap();
    assert_eq!(fresh.entries().unwrap(), vec![(b"k".to_vec(), b"b".to_vec())]);
}

// =============================================================================
// Diagnostics
// =============================================================================

#[test]
fn test_maps_work_with_every_log_switch_on() {
    let config = Config::builder()
        .concurrency_level(2)
        .cache_mode(CacheMode::Lru)
        .cache_size(32)
        .async_write(true)
        .diagnostics(Diagnostics {
            log_store: true,
            log_store_records: true,
            log_engine_wrappers: true,
            log_maps: true,
            ..Diagnostics::default()
        })
        .build();
    let db = Db::memory(config).unwrap();

    let hash = db.hash_map("logged").unwrap();
    let tree = db.tree_map("ordered").unwrap();
    for i in 0..300 {
        hash.insert(&key(i), &value(i)).unwrap();
        tree.insert(&key(i), &value(i)).unwrap();
    }
    hash.remove(&key(0)).unwrap();
    db.commit().unwrap();

    assert_eq!(hash.len().unwrap(), 299);
    assert_eq!(tree.get(&key(150)).unwrap(), Some(value(150)));
    db.close().unwrap();
}
