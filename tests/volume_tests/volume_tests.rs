//! Tests for the Volume backends
//!
//! These tests verify:
//! - Identical read/write/grow semantics for memory and file volumes
//! - Writes spanning page boundaries
//! - Address errors outside the allocated range
//! - Persistence of the file backend across reopen
//! - Directory lock file and retry helpers

use std::path::PathBuf;
use std::time::Duration;

use emberkv::volume::{
    remove_with_retry, rename_with_retry, FileLock, FileVolume, MemoryVolume, Volume,
    VolumeOptions,
};
use emberkv::EmberError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

/// 512-byte pages so tests cross boundaries cheaply
fn small_pages() -> VolumeOptions {
    VolumeOptions {
        page_shift: 9,
        zero_out: true,
        print_stack_at_offset: None,
    }
}

fn setup_temp_file() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("data.ember");
    (temp_dir, path)
}

/// Run the same scenario against both backends
fn for_each_backend(test: impl Fn(&dyn Volume)) {
    let memory = MemoryVolume::new(small_pages());
    test(&memory);

    let (_dir, path) = setup_temp_file();
    let file = FileVolume::open(&path, small_pages()).unwrap();
    test(&file);
}

// =============================================================================
// Shared Semantics
// =============================================================================

#[test]
fn test_new_volume_is_empty() {
    for_each_backend(|volume| {
        assert_eq!(volume.length(), 0);
        assert_eq!(volume.page_size(), 512);
    });
}

#[test]
fn test_ensure_available_rounds_to_pages() {
    for_each_backend(|volume| {
        volume.ensure_available(1).unwrap();
        assert_eq!(volume.length(), 512);

        volume.ensure_available(513).unwrap();
        assert_eq!(volume.length(), 1024);

        // Never shrinks
        volume.ensure_available(10).unwrap();
        assert_eq!(volume.length(), 1024);
    });
}

#[test]
fn test_grown_space_reads_as_zero() {
    for_each_backend(|volume| {
        volume.ensure_available(2048).unwrap();
        let bytes = volume.read(0, 2048).unwrap();
        assert!(bytes.iter().all(|&b| b == 0));
    });
}

#[test]
fn test_write_read_across_page_boundary() {
    for_each_backend(|volume| {
        volume.ensure_available(2048).unwrap();
        let data: Vec<u8> = (0..1200).map(|i| (i % 251) as u8).collect();

        volume.write(300, &data).unwrap();

        assert_eq!(volume.read(300, data.len()).unwrap(), data);
        assert_eq!(volume.read(0, 300).unwrap(), vec![0u8; 300]);
    });
}

#[test]
fn test_u64_helpers() {
    for_each_backend(|volume| {
        volume.ensure_available(512).unwrap();
        volume.write_u64(504, 0xDEAD_BEEF_CAFE_F00D).unwrap();
        assert_eq!(volume.read_u64(504).unwrap(), 0xDEAD_BEEF_CAFE_F00D);
    });
}

#[test]
fn test_clear_zeroes_region() {
    for_each_backend(|volume| {
        volume.ensure_available(1536).unwrap();
        volume.write(0, &[0xAB; 1536]).unwrap();

        volume.clear(100, 1000).unwrap();

        let bytes = volume.read(0, 1536).unwrap();
        assert!(bytes[..100].iter().all(|&b| b == 0xAB));
        assert!(bytes[100..1100].iter().all(|&b| b == 0));
        assert!(bytes[1100..].iter().all(|&b| b == 0xAB));
    });
}

#[test]
fn test_access_past_end_is_address_error() {
    for_each_backend(|volume| {
        volume.ensure_available(512).unwrap();

        let write = volume.write(510, &[1, 2, 3, 4]);
        assert!(matches!(
            write,
            Err(EmberError::Address {
                offset: 510,
                len: 4,
                size: 512
            })
        ));

        let read = volume.read(512, 1);
        assert!(matches!(read, Err(EmberError::Address { .. })));
    });
}

#[test]
fn test_closed_volume_rejects_access() {
    for_each_backend(|volume| {
        volume.ensure_available(512).unwrap();
        volume.close().unwrap();

        assert!(volume.is_closed());
        assert!(matches!(volume.read(0, 1), Err(EmberError::Closed)));
        assert!(matches!(volume.write(0, &[1]), Err(EmberError::Closed)));
    });
}

// =============================================================================
// File Backend
// =============================================================================

#[test]
fn test_file_volume_persists_across_reopen() {
    let (_dir, path) = setup_temp_file();

    {
        let volume = FileVolume::open(&path, small_pages()).unwrap();
        volume.ensure_available(1024).unwrap();
        volume.write(700, b"persisted").unwrap();
        volume.sync().unwrap();
        volume.close().unwrap();
    }

    let volume = FileVolume::open(&path, small_pages()).unwrap();
    assert_eq!(volume.length(), 1024);
    assert_eq!(volume.read(700, 9).unwrap(), b"persisted");
}

#[test]
fn test_file_volume_extends_partial_trailing_page() {
    let (_dir, path) = setup_temp_file();
    std::fs::write(&path, vec![7u8; 700]).unwrap();

    let volume = FileVolume::open(&path, small_pages()).unwrap();
    assert_eq!(volume.length(), 1024);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 1024);

    // Existing bytes stay readable, the padding reads as zeroes
    assert_eq!(volume.read(690, 10).unwrap(), vec![7u8; 10]);
    assert_eq!(volume.read(700, 324).unwrap(), vec![0u8; 324]);
}

#[test]
fn test_file_volume_opened_with_larger_pages_keeps_data() {
    let (_dir, path) = setup_temp_file();
    {
        let volume = FileVolume::open(&path, small_pages()).unwrap();
        volume.ensure_available(512).unwrap();
        volume.write(100, b"small page data").unwrap();
        volume.close().unwrap();
    }

    let large = VolumeOptions {
        page_shift: 12,
        ..small_pages()
    };
    let volume = FileVolume::open(&path, large).unwrap();
    assert_eq!(volume.length(), 4096);
    assert_eq!(volume.read(100, 15).unwrap(), b"small page data");
}

#[test]
fn test_file_volume_without_zero_out_still_grows() {
    let (_dir, path) = setup_temp_file();
    let options = VolumeOptions {
        zero_out: false,
        ..small_pages()
    };

    let volume = FileVolume::open(&path, options).unwrap();
    volume.ensure_available(4096).unwrap();

    assert_eq!(volume.length(), 4096);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
}

#[test]
fn test_file_volume_without_zero_out_round_trips() {
    let (_dir, path) = setup_temp_file();
    let options = VolumeOptions {
        zero_out: false,
        ..small_pages()
    };

    {
        let volume = FileVolume::open(&path, options.clone()).unwrap();
        volume.ensure_available(1500).unwrap();
        assert_eq!(volume.length(), 1536);

        // Spans two pages of the sparse extension
        volume.write(500, &[0xAB; 100]).unwrap();
        assert_eq!(volume.read(500, 100).unwrap(), vec![0xAB; 100]);
        // Never-written bytes of a fresh extension read as zeroes
        assert_eq!(volume.read(1200, 16).unwrap(), vec![0u8; 16]);
        volume.close().unwrap();
    }

    let volume = FileVolume::open(&path, options).unwrap();
    assert_eq!(volume.length(), 1536);
    assert_eq!(volume.read(500, 100).unwrap(), vec![0xAB; 100]);

    volume.ensure_available(3000).unwrap();
    assert_eq!(volume.length(), 3072);
    assert_eq!(volume.read(500, 100).unwrap(), vec![0xAB; 100]);
}

// =============================================================================
// Lock File and Retry Helpers
// =============================================================================

#[test]
fn test_second_lock_is_refused() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("data.lock");

    let lock = FileLock::acquire(&path, Duration::from_millis(50), 4).unwrap();
    let second = FileLock::acquire(&path, Duration::from_millis(50), 4);
    assert!(matches!(second, Err(EmberError::Locked(_))));

    drop(lock);
    assert!(FileLock::acquire(&path, Duration::from_millis(50), 4).is_ok());
}

#[test]
fn test_lock_file_removed_on_release() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("data.lock");

    let lock = FileLock::acquire(&path, Duration::from_millis(50), 4).unwrap();
    assert!(path.exists());
    drop(lock);
    assert!(!path.exists());
}

#[test]
fn test_heartbeat_recreates_deleted_lock_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("data.lock");

    let _lock = FileLock::acquire(&path, Duration::from_millis(10), 4).unwrap();
    std::fs::remove_file(&path).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !path.exists() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(path.exists());
}

#[test]
fn test_rename_and_remove_with_retry() {
    let temp_dir = TempDir::new().unwrap();
    let from = temp_dir.path().join("a");
    let to = temp_dir.path().join("b");
    std::fs::write(&from, b"x").unwrap();
    std::fs::write(&to, b"old").unwrap();

    rename_with_retry(&from, &to, 3).unwrap();
    assert!(!from.exists());
    assert_eq!(std::fs::read(&to).unwrap(), b"x");

    remove_with_retry(&to, 3).unwrap();
    assert!(!to.exists());
    // Missing file is not an error
    remove_with_retry(&to, 3).unwrap();
}

#[test]
fn test_rename_missing_file_fails_after_retries() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("missing");
    let target = temp_dir.path().join("target");

    assert!(rename_with_retry(&missing, &target, 2).is_err());
}
