//! WAL Entry definitions
//!
//! Defines the structure of individual WAL log entries and their framing.

use serde::{Deserialize, Serialize};

use crate::error::{EmberError, Result};

/// Frame header: LSN (8) + CRC (4) + Len (4)
pub const HEADER_SIZE: usize = 16;

/// Upper bound on a single entry body; larger lengths mean a garbage header
pub const MAX_ENTRY_SIZE: u32 = 256 * 1024 * 1024;

/// A single entry in the WAL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Log Sequence Number - monotonically increasing
    pub lsn: u64,

    /// Transaction this entry belongs to
    pub txn: u64,

    /// The operation to perform
    pub operation: Operation,
}

/// Operations that can be logged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Start of a transaction
    Begin,

    /// Whole-region overwrite of volume bytes
    Write { offset: u64, data: Vec<u8> },

    /// Zero-fill of a volume region
    Clear { offset: u64, len: u64 },

    /// Transaction is durable once this marker is on disk
    Commit,

    /// Transaction abandoned
    Rollback,
}

impl Operation {
    /// Bytes of volume this operation touches, if any
    pub fn region(&self) -> Option<(u64, u64)> {
        match self {
            Operation::Write { offset, data } => Some((*offset, data.len() as u64)),
            Operation::Clear { offset, len } => Some((*offset, *len)),
            _ => None,
        }
    }
}

impl WalEntry {
    pub fn new(lsn: u64, txn: u64, operation: Operation) -> Self {
        Self { lsn, txn, operation }
    }

    /// Encode as `[lsn][crc][len][body]`
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(&(self.txn, &self.operation))?;
        if body.len() > MAX_ENTRY_SIZE as usize {
            return Err(EmberError::WalCorruption(format!(
                "entry of {} bytes exceeds limit of {}",
                body.len(),
                MAX_ENTRY_SIZE
            )));
        }

        let len = body.len() as u32;
        let crc = Self::compute_crc(self.lsn, len, &body);

        let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
        frame.extend_from_slice(&self.lsn.to_le_bytes());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode one complete frame from the start of `bytes`
    ///
    /// Returns the entry and the number of bytes consumed.
    pub fn deserialize(bytes: &[u8]) -> Result<(Self, usize)> {
        let header = FrameHeader::parse(bytes).ok_or_else(|| {
            EmberError::WalCorruption(format!("frame header truncated at {} bytes", bytes.len()))
        })?;
        let end = HEADER_SIZE + header.len as usize;
        if header.len > MAX_ENTRY_SIZE || bytes.len() < end {
            return Err(EmberError::WalCorruption(format!(
                "frame body truncated: need {} bytes, have {}",
                end,
                bytes.len()
            )));
        }
        let entry = header.decode_body(&bytes[HEADER_SIZE..end])?;
        Ok((entry, end))
    }

    /// CRC over LSN, length and body, so a torn header is caught too
    pub fn compute_crc(lsn: u64, len: u32, body: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&lsn.to_le_bytes());
        hasher.update(&len.to_le_bytes());
        hasher.update(body);
        hasher.finalize()
    }
}

/// Parsed fixed-size frame header
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameHeader {
    pub lsn: u64,
    pub crc: u32,
    pub len: u32,
}

impl FrameHeader {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            lsn: u64::from_le_bytes(bytes[0..8].try_into().ok()?),
            crc: u32::from_le_bytes(bytes[8..12].try_into().ok()?),
            len: u32::from_le_bytes(bytes[12..16].try_into().ok()?),
        })
    }

    /// Verify the checksum and decode the body
    pub fn decode_body(&self, body: &[u8]) -> Result<WalEntry> {
        let computed = WalEntry::compute_crc(self.lsn, self.len, body);
        if computed != self.crc {
            return Err(EmberError::WalCorruption(format!(
                "CRC mismatch at lsn {}: stored {:#010x}, computed {:#010x}",
                self.lsn, self.crc, computed
            )));
        }
        let (txn, operation): (u64, Operation) = bincode::deserialize(body)?;
        Ok(WalEntry::new(self.lsn, txn, operation))
    }
}
