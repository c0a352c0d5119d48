//! On-volume layout of the record store
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Store Header (64 bytes, offset 0)                            │
//! │   Magic "EMBR" (4) | Version u16 (2) | PageShift u8 (1) | (1)│
//! │   Tail u64 (8) | MaxRecid u64 (8) | FirstChunk u64 (8)       │
//! │   CRC32 u32 (4) | reserved (28)                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Index chunks and records, interleaved, 16-byte aligned       │
//! │                                                              │
//! │ Index chunk (8192 bytes)                                     │
//! │   Next u64 (8) | Slot u64 × 1023                             │
//! │   slot: 0 = free, 1 = preallocated, else record offset       │
//! │                                                              │
//! │ Record (capacity bytes)                                      │
//! │   Capacity u32 (4) | Len u32 (4) | CRC32 u32 (4) | Payload   │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use crate::error::{EmberError, Result};
use crate::wal::MAX_ENTRY_SIZE;

use super::Recid;

/// Magic bytes identifying an emberkv volume
pub const MAGIC: &[u8; 4] = b"EMBR";

/// Current store format version
pub const FORMAT_VERSION: u16 = 1;

pub const HEADER_SIZE: u64 = 64;

/// Allocation granularity
pub const ALIGN: u64 = 16;

pub const RECORD_HEADER_SIZE: u64 = 12;

pub const SLOTS_PER_CHUNK: u64 = 1023;

/// Next pointer + slots
pub const CHUNK_SIZE: u64 = 8 + SLOTS_PER_CHUNK * 8;

pub const SLOT_FREE: u64 = 0;
pub const SLOT_PREALLOCATED: u64 = 1;

/// WAL body bytes around a record write: txn id, operation tag, offset and
/// the data length prefix, rounded up
const WAL_WRITE_OVERHEAD: u64 = 64;

/// Largest payload whose record still fits a single WAL entry
pub const MAX_PAYLOAD_SIZE: usize =
    (MAX_ENTRY_SIZE as u64 - WAL_WRITE_OVERHEAD - RECORD_HEADER_SIZE) as usize;

const CRC_OFFSET: usize = 32;

pub fn align_up(n: u64) -> u64 {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

/// Bytes allocated for a payload of `len` bytes
pub fn record_size(len: usize) -> u64 {
    align_up(RECORD_HEADER_SIZE + len as u64)
}

/// Index chunk number and slot index for a recid (recids start at 1)
pub fn slot_position(recid: Recid) -> (usize, u64) {
    let zero_based = recid - 1;
    ((zero_based / SLOTS_PER_CHUNK) as usize, zero_based % SLOTS_PER_CHUNK)
}

/// Volume offset of the slot within its chunk
pub fn slot_offset(chunk_offset: u64, slot_index: u64) -> u64 {
    chunk_offset + 8 + slot_index * 8
}

/// Store header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreHeader {
    pub page_shift: u8,
    /// End of allocated space; everything past it is unallocated
    pub tail: u64,
    pub max_recid: Recid,
    /// Offset of the first index chunk, 0 if none yet
    pub first_chunk: u64,
}

impl StoreHeader {
    pub fn new(page_shift: u8) -> Self {
        Self {
            page_shift,
            tail: HEADER_SIZE,
            max_recid: 0,
            first_chunk: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[6] = self.page_shift;
        buf[8..16].copy_from_slice(&self.tail.to_le_bytes());
        buf[16..24].copy_from_slice(&self.max_recid.to_le_bytes());
        buf[24..32].copy_from_slice(&self.first_chunk.to_le_bytes());
        let crc = crc32fast::hash(&buf[..CRC_OFFSET]);
        buf[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE as usize {
            return Err(EmberError::Storage(format!(
                "store header truncated: {} bytes",
                buf.len()
            )));
        }
        if &buf[0..4] != MAGIC {
            return Err(EmberError::Storage(format!(
                "invalid store magic: expected EMBR, got {:?}",
                &buf[0..4]
            )));
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != FORMAT_VERSION {
            return Err(EmberError::Storage(format!(
                "unsupported store format version: {}",
                version
            )));
        }
        let stored_crc = read_u32(buf, CRC_OFFSET);
        let computed = crc32fast::hash(&buf[..CRC_OFFSET]);
        if stored_crc != computed {
            return Err(EmberError::Storage(format!(
                "store header checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored_crc, computed
            )));
        }

        Ok(Self {
            page_shift: buf[6],
            tail: read_u64(buf, 8),
            max_recid: read_u64(buf, 16),
            first_chunk: read_u64(buf, 24),
        })
    }
}

/// Fixed prefix of every record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Allocated bytes including this header
    pub capacity: u32,
    pub len: u32,
    pub crc: u32,
}

impl RecordHeader {
    pub fn parse(buf: &[u8]) -> Self {
        Self {
            capacity: read_u32(buf, 0),
            len: read_u32(buf, 4),
            crc: read_u32(buf, 8),
        }
    }

    /// Structural checks that do not need the payload
    pub fn validate(&self, recid: Recid, offset: u64, tail: u64) -> Result<()> {
        let capacity = self.capacity as u64;
        if capacity < RECORD_HEADER_SIZE || capacity % ALIGN != 0 {
            return Err(corrupt(recid, format!("invalid capacity {} at offset {}", capacity, offset)));
        }
        if RECORD_HEADER_SIZE + self.len as u64 > capacity {
            return Err(corrupt(
                recid,
                format!("length {} exceeds capacity {}", self.len, capacity),
            ));
        }
        if offset + capacity > tail {
            return Err(corrupt(
                recid,
                format!("record [{}, {}) extends past tail {}", offset, offset + capacity, tail),
            ));
        }
        Ok(())
    }

    pub fn verify_payload(&self, recid: Recid, payload: &[u8]) -> Result<()> {
        let computed = crc32fast::hash(payload);
        if computed != self.crc {
            return Err(corrupt(
                recid,
                format!("checksum mismatch: stored {:#010x}, computed {:#010x}", self.crc, computed),
            ));
        }
        Ok(())
    }
}

/// Header + payload; bytes past it up to `capacity` are left untouched
pub fn encode_record(payload: &[u8], capacity: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE as usize + payload.len());
    buf.extend_from_slice(&(capacity as u32).to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn corrupt(recid: Recid, reason: String) -> EmberError {
    EmberError::CorruptRecord { recid, reason }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}
