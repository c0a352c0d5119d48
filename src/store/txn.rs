//! Pending (uncommitted) store transaction
//!
//! Every mutation lands here first. Nothing reaches the volume until
//! `commit` has logged the whole batch, so rolling back is just dropping
//! this buffer and returning borrowed space.

use std::collections::{BTreeMap, HashMap};

use crate::wal::Operation;

use super::layout::{slot_offset, slot_position, StoreHeader, CHUNK_SIZE};
use super::Recid;

#[derive(Debug, Default)]
pub(super) struct PendingTxn {
    /// Slot overrides: recid → slot value
    pub slots: HashMap<Recid, u64>,

    /// Encoded records awaiting their volume write, by offset
    pub records: BTreeMap<u64, Vec<u8>>,

    /// Index chunks allocated in this transaction
    pub new_chunks: Vec<u64>,

    /// (chunk offset, next chunk offset) pointers to rewrite
    pub chunk_links: Vec<(u64, u64)>,

    /// Ranges taken from the free-space queue; returned on rollback
    pub allocated: Vec<(u64, u64)>,

    /// Ranges freed by this transaction; queued only after commit
    pub released: Vec<(u64, u64)>,

    /// Recids reused from the free pool; returned on rollback
    pub taken_recids: Vec<Recid>,

    /// Recids deleted by this transaction
    pub released_recids: Vec<Recid>,

    pub dirty: bool,
}

impl PendingTxn {
    /// Region operations that make this transaction durable, in apply order
    ///
    /// `chunks` must hold the committed chunk offsets followed by
    /// `new_chunks`.
    pub fn operations(
        &self,
        header: &StoreHeader,
        chunks: &[u64],
        zero_released: bool,
    ) -> Vec<Operation> {
        let mut ops = Vec::new();

        for &chunk in &self.new_chunks {
            ops.push(Operation::Clear {
                offset: chunk,
                len: CHUNK_SIZE,
            });
        }

        for (&offset, bytes) in &self.records {
            ops.push(Operation::Write {
                offset,
                data: bytes.clone(),
            });
        }

        if zero_released {
            for &(offset, len) in &self.released {
                ops.push(Operation::Clear { offset, len });
            }
        }

        for &(chunk, next) in &self.chunk_links {
            ops.push(Operation::Write {
                offset: chunk,
                data: next.to_le_bytes().to_vec(),
            });
        }

        let mut slots: Vec<(Recid, u64)> = self.slots.iter().map(|(&r, &v)| (r, v)).collect();
        slots.sort_unstable();
        for (recid, value) in slots {
            let (chunk_index, slot_index) = slot_position(recid);
            ops.push(Operation::Write {
                offset: slot_offset(chunks[chunk_index], slot_index),
                data: value.to_le_bytes().to_vec(),
            });
        }

        ops.push(Operation::Write {
            offset: 0,
            data: header.encode().to_vec(),
        });

        ops
    }
}
