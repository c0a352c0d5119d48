//! Data directory lock file
//!
//! Signals exclusive ownership of a data directory by a running process.
//! The lock is an OS advisory lock (`flock` / `LockFileEx`) on `data.lock`,
//! released automatically if the process dies. A heartbeat thread polls the
//! file every `heartbeat` and re-creates it if something removed it.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use fs2::FileExt;

use crate::error::{EmberError, Result};

use super::retry::remove_with_retry;

/// Exclusive lock on a data directory, released on drop
pub struct FileLock {
    path: PathBuf,
    file: File,
    retry_count: u32,
    stop: Option<Sender<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl FileLock {
    /// Acquire the lock at `path` without blocking
    ///
    /// Fails with `EmberError::Locked` if another process holds it.
    pub fn acquire(path: &Path, heartbeat: Duration, retry_count: u32) -> Result<Self> {
        let file = open_lock_file(path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if is_contended(&e) => {
                tracing::error!(path = %path.display(), "Lock file held by another process");
                return Err(EmberError::Locked(path.to_path_buf()));
            }
            Err(e) => return Err(EmberError::Io(e)),
        }

        write_owner(&file)?;
        tracing::info!(path = %path.display(), "Acquired data directory lock");

        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let watched = path.to_path_buf();
        let heartbeat = thread::Builder::new()
            .name("emberkv-lock-heartbeat".to_string())
            .spawn(move || {
                // Replacement handle if the original file was unlinked
                let mut replacement: Option<File> = None;
                loop {
                    match stop_rx.recv_timeout(heartbeat) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if watched.exists() {
                        continue;
                    }
                    tracing::warn!(path = %watched.display(), "Lock file disappeared, re-creating");
                    match open_lock_file(&watched).and_then(|f| {
                        f.try_lock_exclusive()?;
                        write_owner(&f)?;
                        Ok(f)
                    }) {
                        Ok(f) => replacement = Some(f),
                        Err(e) => {
                            tracing::error!(path = %watched.display(), error = %e, "Failed to re-create lock file")
                        }
                    }
                }
                drop(replacement);
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            retry_count,
            stop: Some(stop_tx),
            heartbeat: Some(heartbeat),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Dropping the sender wakes the heartbeat with Disconnected
        self.stop.take();
        if let Some(handle) = self.heartbeat.take() {
            let _ = handle.join();
        }

        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::error!(path = %self.path.display(), error = %e, "Failed to release lock");
        }
        if let Err(e) = remove_with_retry(&self.path, self.retry_count) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove lock file");
        } else {
            tracing::info!(path = %self.path.display(), "Released data directory lock");
        }
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn write_owner(file: &File) -> io::Result<()> {
    let mut file = file;
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_data()
}

fn is_contended(e: &io::Error) -> bool {
    // EWOULDBLOCK / EAGAIN: 11 on Linux, 35 on macOS
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == Some(11)
        || e.raw_os_error() == Some(35)
        || e.raw_os_error() == Some(33) // ERROR_LOCK_VIOLATION on Windows
}
