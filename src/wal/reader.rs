//! WAL Reader
//!
//! Handles reading entries from the WAL file. Reading stops at the first
//! frame that is incomplete (torn write) or fails its checksum.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::Result;

use super::entry::{FrameHeader, HEADER_SIZE, MAX_ENTRY_SIZE};
use super::WalEntry;

/// How the readable part of the log ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailState {
    /// Every byte belonged to a valid entry
    Clean,

    /// Partial entry at the end (crash mid-append)
    Torn,

    /// A complete frame failed its checksum or could not be decoded
    Corrupt,
}

/// Reads entries from the WAL file
pub struct WalReader {
    reader: BufReader<File>,
    file_len: u64,
    /// End of the last valid entry
    position: u64,
    tail: Option<TailState>,
}

impl WalReader {
    /// Open a WAL file for reading
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        Ok(Self {
            reader: BufReader::new(file),
            file_len,
            position: 0,
            tail: None,
        })
    }

    /// Read the next entry from the WAL
    ///
    /// Returns `Ok(None)` at the end of the valid prefix; `tail()` then tells
    /// whether the end was clean.
    pub fn next_entry(&mut self) -> Result<Option<WalEntry>> {
        if self.tail.is_some() {
            return Ok(None);
        }

        let remaining = self.file_len - self.position;
        if remaining == 0 {
            self.tail = Some(TailState::Clean);
            return Ok(None);
        }
        if remaining < HEADER_SIZE as u64 {
            self.tail = Some(TailState::Torn);
            return Ok(None);
        }

        let mut header_bytes = [0u8; HEADER_SIZE];
        self.reader.read_exact(&mut header_bytes)?;
        let header = match FrameHeader::parse(&header_bytes) {
            Some(h) => h,
            None => {
                self.tail = Some(TailState::Torn);
                return Ok(None);
            }
        };

        if header.len > MAX_ENTRY_SIZE {
            self.tail = Some(TailState::Corrupt);
            return Ok(None);
        }
        if remaining - (HEADER_SIZE as u64) < header.len as u64 {
            self.tail = Some(TailState::Torn);
            return Ok(None);
        }

        let mut body = vec![0u8; header.len as usize];
        self.reader.read_exact(&mut body)?;

        match header.decode_body(&body) {
            Ok(entry) => {
                self.position += (HEADER_SIZE + body.len()) as u64;
                Ok(Some(entry))
            }
            Err(e) => {
                tracing::warn!(position = self.position, error = %e, "Invalid WAL entry");
                self.tail = Some(TailState::Corrupt);
                Ok(None)
            }
        }
    }

    /// Byte length of the valid prefix read so far
    pub fn valid_len(&self) -> u64 {
        self.position
    }

    /// Total file length
    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// How reading ended, once it has
    pub fn tail(&self) -> Option<TailState> {
        self.tail
    }

    /// Iterate over all valid entries
    pub fn entries(self) -> WalIterator {
        WalIterator { reader: self }
    }
}

/// Iterator over WAL entries
pub struct WalIterator {
    reader: WalReader,
}

impl WalIterator {
    /// The underlying reader (to inspect `tail()` after iteration)
    pub fn reader(&self) -> &WalReader {
        &self.reader
    }
}

impl Iterator for WalIterator {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.reader.next_entry().transpose()
    }
}
