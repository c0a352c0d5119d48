//! Retry loop for file rename/delete
//!
//! Some platforms refuse to rename or delete a file while another handle
//! (indexer, virus scanner, a handle not yet closed) has it open. Waiting a
//! little usually clears it. Only these two operations are retried.

use std::fs;
use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;

const BASE_DELAY_MS: u64 = 5;
const MAX_DELAY_MS: u64 = 100;

fn retry_io<T>(attempts: u32, what: &str, path: &Path, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                tracing::debug!(path = %path.display(), attempt, error = %e, "{} failed, retrying", what);
                let delay = (BASE_DELAY_MS * attempt as u64).min(MAX_DELAY_MS);
                thread::sleep(Duration::from_millis(delay));
                attempt += 1;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), attempts, error = %e, "{} failed", what);
                return Err(e);
            }
        }
    }
}

/// Rename `from` to `to`, replacing `to`
pub fn rename_with_retry(from: &Path, to: &Path, attempts: u32) -> io::Result<()> {
    retry_io(attempts, "rename", from, || fs::rename(from, to))
}

/// Delete `path`; a missing file counts as success
pub fn remove_with_retry(path: &Path, attempts: u32) -> io::Result<()> {
    retry_io(attempts, "delete", path, || match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    })
}
