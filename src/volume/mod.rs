//! Volume Module
//!
//! Paged, byte-addressable storage. Every byte the engine persists goes
//! through a `Volume`; the store never touches files directly.
//!
//! ## Responsibilities
//! - Present a logically infinite address space split into fixed pages
//! - Split reads/writes that straddle page boundaries
//! - Grow on demand, zero-filling newly exposed pages
//! - Force durability on `sync()`
//!
//! ## Address Decomposition
//! ```text
//!   offset (u64)
//! ┌──────────────────────────────┬───────────────────────┐
//! │ page index (offset >> shift) │ in-page (offset&mask) │
//! └──────────────────────────────┴───────────────────────┘
//! ```
//!
//! Two interchangeable backends: [`MemoryVolume`] (growable page array) and
//! [`FileVolume`] (random-access file). Both satisfy the same bounds and grow
//! semantics, so the store is backend-agnostic.

mod file;
mod lockfile;
mod memory;
mod retry;

use crate::config::Config;
use crate::error::{EmberError, Result};

pub use file::FileVolume;
pub use lockfile::FileLock;
pub use memory::MemoryVolume;
pub use retry::{remove_with_retry, rename_with_retry};

/// Settings shared by all volume backends
#[derive(Debug, Clone)]
pub struct VolumeOptions {
    /// log2 of the page size
    pub page_shift: u32,

    /// Zero-fill pages exposed by `ensure_available`
    pub zero_out: bool,

    /// Log a backtrace for writes covering this offset
    pub print_stack_at_offset: Option<u64>,
}

impl VolumeOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            page_shift: config.page_shift(),
            zero_out: config.zero_unused_space,
            print_stack_at_offset: config.diagnostics.print_stack_at_offset,
        }
    }

    pub fn page_size(&self) -> usize {
        1usize << self.page_shift
    }

    /// Round `offset` up to the next page boundary
    pub fn round_to_page(&self, offset: u64) -> u64 {
        let mask = (1u64 << self.page_shift) - 1;
        (offset + mask) & !mask
    }

    /// Emit the diagnostic backtrace if this write covers the watched offset
    pub(crate) fn trace_write(&self, offset: u64, len: usize) {
        if let Some(watch) = self.print_stack_at_offset {
            if watch >= offset && watch < offset + len as u64 {
                tracing::warn!(
                    offset,
                    len,
                    watch,
                    backtrace = %std::backtrace::Backtrace::force_capture(),
                    "Volume write covers watched offset"
                );
            }
        }
    }
}

impl Default for VolumeOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Byte-addressable paged storage
///
/// All methods take `&self`; backends synchronize internally. Callers must
/// still arbitrate which offsets they write (the store does this).
pub trait Volume: Send + Sync {
    /// Grow the backing storage so that `[0, offset)` is addressable
    fn ensure_available(&self, offset: u64) -> Result<()>;

    /// Write `data` at `offset`; the whole range must be addressable
    fn write(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Fill `buf` from `offset`; the whole range must be addressable
    fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Addressable size in bytes (always a whole number of pages)
    fn length(&self) -> u64;

    /// Page granularity in bytes
    fn page_size(&self) -> usize;

    /// Force all prior writes to durable storage
    fn sync(&self) -> Result<()>;

    /// Flush and release the backing medium; further access fails
    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    /// Read `len` bytes at `offset`
    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(offset, &mut buf)?;
        Ok(buf)
    }

    /// Overwrite `[offset, offset + len)` with zeroes
    fn clear(&self, offset: u64, len: u64) -> Result<()> {
        let chunk = self.page_size() as u64;
        let zeros = vec![0u8; chunk as usize];
        let mut pos = offset;
        let end = offset + len;
        while pos < end {
            let n = (end - pos).min(chunk);
            self.write(pos, &zeros[..n as usize])?;
            pos += n;
        }
        Ok(())
    }

    fn read_u64(&self, offset: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_into(offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u64(&self, offset: u64, value: u64) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }
}

/// One page-local piece of a larger access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageSpan {
    pub page: usize,
    pub in_page: usize,
    pub len: usize,
    /// Position of this piece within the caller's buffer
    pub buf_pos: usize,
}

/// Split `[offset, offset + len)` at page boundaries
pub(crate) fn page_spans(offset: u64, len: usize, page_shift: u32) -> impl Iterator<Item = PageSpan> {
    let page_size = 1usize << page_shift;
    let mask = (page_size as u64) - 1;
    let mut pos = 0usize;
    std::iter::from_fn(move || {
        if pos >= len {
            return None;
        }
        let abs = offset + pos as u64;
        let in_page = (abs & mask) as usize;
        let n = (page_size - in_page).min(len - pos);
        let span = PageSpan {
            page: (abs >> page_shift) as usize,
            in_page,
            len: n,
            buf_pos: pos,
        };
        pos += n;
        Some(span)
    })
}

/// Fail with `Address` unless `[offset, offset + len)` fits in `size`
pub(crate) fn check_bounds(offset: u64, len: usize, size: u64) -> Result<()> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(EmberError::Address {
            offset,
            len: len as u64,
            size,
        }),
    }
}
