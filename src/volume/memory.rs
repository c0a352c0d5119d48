//! In-memory volume
//!
//! Growable array of heap pages behind a RwLock.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::error::{EmberError, Result};

use super::{check_bounds, page_spans, Volume, VolumeOptions};

/// Heap-backed volume
///
/// Pages are allocated zeroed, so `zero_out` has nothing extra to do here.
pub struct MemoryVolume {
    pages: RwLock<Vec<Box<[u8]>>>,
    options: VolumeOptions,
    closed: AtomicBool,
}

impl MemoryVolume {
    pub fn new(options: VolumeOptions) -> Self {
        Self {
            pages: RwLock::new(Vec::new()),
            options,
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EmberError::Closed);
        }
        Ok(())
    }
}

impl Volume for MemoryVolume {
    fn ensure_available(&self, offset: u64) -> Result<()> {
        self.check_open()?;
        let page_size = self.options.page_size();
        let needed = (self.options.round_to_page(offset) >> self.options.page_shift) as usize;

        let mut pages = self.pages.write();
        while pages.len() < needed {
            pages.push(vec![0u8; page_size].into_boxed_slice());
        }
        Ok(())
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_open()?;
        self.options.trace_write(offset, data.len());

        let mut pages = self.pages.write();
        let size = (pages.len() as u64) << self.options.page_shift;
        check_bounds(offset, data.len(), size)?;

        for span in page_spans(offset, data.len(), self.options.page_shift) {
            pages[span.page][span.in_page..span.in_page + span.len]
                .copy_from_slice(&data[span.buf_pos..span.buf_pos + span.len]);
        }
        Ok(())
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_open()?;

        let pages = self.pages.read();
        let size = (pages.len() as u64) << self.options.page_shift;
        check_bounds(offset, buf.len(), size)?;

        for span in page_spans(offset, buf.len(), self.options.page_shift) {
            buf[span.buf_pos..span.buf_pos + span.len]
                .copy_from_slice(&pages[span.page][span.in_page..span.in_page + span.len]);
        }
        Ok(())
    }

    fn length(&self) -> u64 {
        (self.pages.read().len() as u64) << self.options.page_shift
    }

    fn page_size(&self) -> usize {
        self.options.page_size()
    }

    fn sync(&self) -> Result<()> {
        self.check_open()
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.pages.write().clear();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
