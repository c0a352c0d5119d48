//! File-backed volume
//!
//! Random-access file with page-granular growth. I/O failures surface as
//! `EmberError::Io` and are not retried.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{EmberError, Result};

use super::{check_bounds, page_spans, Volume, VolumeOptions};

/// Volume stored in a single random-access file
pub struct FileVolume {
    path: PathBuf,
    /// Seek + read/write must be atomic as a pair
    file: Mutex<File>,
    /// Addressable size; the file may be longer after a crash mid-grow
    size: AtomicU64,
    options: VolumeOptions,
    closed: AtomicBool,
}

impl FileVolume {
    /// Open or create the file at `path`
    ///
    /// A trailing partial page (crash during growth, or a file written with
    /// a smaller page size) is zero-extended to a whole page, so every byte
    /// already in the file stays addressable.
    pub fn open(path: &Path, options: VolumeOptions) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let file_len = file.metadata()?.len();
        let size = options.round_to_page(file_len);
        if size != file_len {
            file.set_len(size)?;
        }

        tracing::debug!(
            path = %path.display(),
            file_len,
            addressable = size,
            "Opened file volume"
        );

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            size: AtomicU64::new(size),
            options,
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EmberError::Closed);
        }
        Ok(())
    }
}

impl Volume for FileVolume {
    fn ensure_available(&self, offset: u64) -> Result<()> {
        self.check_open()?;
        let target = self.options.round_to_page(offset);
        if target <= self.size.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut file = self.file.lock();
        // Re-check under the lock; another thread may have grown it
        let current = self.size.load(Ordering::Acquire);
        if target <= current {
            return Ok(());
        }

        if self.options.zero_out {
            let zeros = vec![0u8; self.options.page_size()];
            file.seek(SeekFrom::Start(current))?;
            let mut pos = current;
            while pos < target {
                let n = ((target - pos) as usize).min(zeros.len());
                file.write_all(&zeros[..n])?;
                pos += n as u64;
            }
        } else {
            file.set_len(target)?;
        }

        self.size.store(target, Ordering::Release);
        tracing::trace!(path = %self.path.display(), from = current, to = target, "Grew file volume");
        Ok(())
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_open()?;
        check_bounds(offset, data.len(), self.size.load(Ordering::Acquire))?;
        self.options.trace_write(offset, data.len());

        let mut file = self.file.lock();
        for span in page_spans(offset, data.len(), self.options.page_shift) {
            let pos = ((span.page as u64) << self.options.page_shift) + span.in_page as u64;
            file.seek(SeekFrom::Start(pos))?;
            file.write_all(&data[span.buf_pos..span.buf_pos + span.len])?;
        }
        Ok(())
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_open()?;
        check_bounds(offset, buf.len(), self.size.load(Ordering::Acquire))?;

        let mut file = self.file.lock();
        for span in page_spans(offset, buf.len(), self.options.page_shift) {
            let pos = ((span.page as u64) << self.options.page_shift) + span.in_page as u64;
            file.seek(SeekFrom::Start(pos))?;
            file.read_exact(&mut buf[span.buf_pos..span.buf_pos + span.len])?;
        }
        Ok(())
    }

    fn length(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    fn page_size(&self) -> usize {
        self.options.page_size()
    }

    fn sync(&self) -> Result<()> {
        self.check_open()?;
        self.file.lock().sync_data()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let file = self.file.lock();
        file.sync_all()?;
        tracing::debug!(path = %self.path.display(), "Closed file volume");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
