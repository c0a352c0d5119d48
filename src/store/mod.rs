//! Store Module
//!
//! Record allocator and index on top of a [`Volume`]. Maps recids to
//! volume offsets, places records with a best-fit free-space queue, and
//! makes every batch of mutations atomic through the WAL.
//!
//! ## Responsibilities
//! - `put` / `get` / `update` / `delete` / `preallocate` of records
//! - Best-fit allocation from the free-space queue before growing the tail
//! - Relocation of records that outgrow their capacity
//! - Redo-only transactions: buffer, log, force, then apply
//! - Rebuild of the index and free space at open, compaction on demand
//!
//! ## Commit Protocol
//! ```text
//!   put/update/delete ──► PendingTxn (memory only)
//!                              │ commit()
//!                              ▼
//!   WAL: Begin, Write/Clear..., Commit ──► fsync
//!                              │
//!                              ▼
//!   Volume: apply the same region operations
//! ```
//!
//! A crash before the WAL fsync loses the whole batch; a crash after it is
//! repaired by replay at the next open.

mod free_space;
mod layout;
mod txn;

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::{Config, Location};
use crate::error::{EmberError, Result};
use crate::volume::{
    remove_with_retry, rename_with_retry, FileLock, FileVolume, MemoryVolume, Volume,
    VolumeOptions,
};
use crate::wal::{self, Operation, WriteAheadLog};

pub use free_space::FreeSpace;
pub use layout::{MAX_PAYLOAD_SIZE, RECORD_HEADER_SIZE, SLOTS_PER_CHUNK};

use layout::{
    encode_record, record_size, RecordHeader, StoreHeader, CHUNK_SIZE, HEADER_SIZE, SLOT_FREE,
    SLOT_PREALLOCATED,
};
use txn::PendingTxn;

/// Logical record identifier; stable for the life of the record
pub type Recid = u64;

/// Reserved at creation for the map catalog
pub const CATALOG_RECID: Recid = 1;

// =========================================================================
// File Names
// =========================================================================
pub const DATA_FILE: &str = "data.ember";
pub const WAL_FILE: &str = "data.wal";
pub const LOCK_FILE: &str = "data.lock";
const COMPACT_FILE: &str = "data.ember.compact";

/// Point-in-time store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Live recids (including preallocated ones)
    pub records: u64,
    pub max_recid: Recid,
    pub volume_bytes: u64,
    /// End of allocated space
    pub tail: u64,
    pub free_bytes: u64,
    pub free_entries: u64,
    pub wal_bytes: u64,
    pub commits: u64,
    pub checkpoints: u64,
    pub compactions: u64,
    pub uncommitted: bool,
}

/// The record store
///
/// ## Concurrency Model
///
/// - **Reads** (`get`): shared lock on the state, concurrent
/// - **Mutations**: exclusive lock; allocation decisions are serialized
///   here, which is what makes disjoint volume writes safe
/// - **Commit**: holds the exclusive lock across the WAL fsync
pub struct Store {
    location: Location,
    config: Config,

    /// None for memory stores; nothing there survives the process anyway
    wal: Option<WriteAheadLog>,

    state: RwLock<StoreState>,

    /// Directory ownership, released on close or drop
    lock: Mutex<Option<FileLock>>,

    closed: AtomicBool,
    commits: AtomicU64,
    checkpoints: AtomicU64,
    compactions: AtomicU64,
}

struct StoreState {
    volume: Box<dyn Volume>,

    /// Working header, includes pending allocations
    header: StoreHeader,

    /// Header as of the last commit
    committed: StoreHeader,

    /// Committed index chunk offsets, in chain order
    chunks: Vec<u64>,

    /// Committed slot values, `slots[recid - 1]`
    slots: Vec<u64>,

    free_space: FreeSpace,
    free_recids: BTreeSet<Recid>,
    txn: PendingTxn,

    reclaim_classes: usize,
    log_allocations: bool,
    log_store: bool,
}

/// Result of rewriting live data into a fresh volume
struct CompactLayout {
    header: StoreHeader,
    chunks: Vec<u64>,
    slots: Vec<u64>,
}

impl Store {
    /// Open or create a store
    ///
    /// On startup:
    /// 1. Take the directory lock
    /// 2. Open the volume
    /// 3. Replay committed WAL transactions and truncate the log
    /// 4. Load the header and index, or initialize a fresh store
    /// 5. Rebuild free space from the gaps between live regions
    pub fn open(location: &Location, config: &Config) -> Result<Self> {
        config.validate()?;
        let mut config = config.clone();

        let (volume, wal, lock): (Box<dyn Volume>, Option<WriteAheadLog>, Option<FileLock>) =
            match location {
                Location::Memory => (
                    Box::new(MemoryVolume::new(VolumeOptions::from_config(&config))),
                    None,
                    None,
                ),
                Location::Directory(dir) => {
                    // Step 1: Create data directory and take ownership
                    fs::create_dir_all(dir)?;
                    let lock = FileLock::acquire(
                        &dir.join(LOCK_FILE),
                        Duration::from_millis(config.file_lock_heartbeat_ms),
                        config.file_retry_count,
                    )?;

                    // Step 2: Open the volume with the page size it was created with
                    let data_path = dir.join(DATA_FILE);
                    adopt_stored_page_size(&data_path, &mut config)?;
                    let volume =
                        FileVolume::open(&data_path, VolumeOptions::from_config(&config))?;

                    // Step 3: Redo committed work the volume may have missed
                    let wal = WriteAheadLog::open(
                        &dir.join(WAL_FILE),
                        config.wal_sync_strategy,
                        config.diagnostics.log_wal_content,
                    )?;
                    wal.recover(&volume)?;

                    (Box::new(volume), Some(wal), Some(lock))
                }
            };

        // Step 4: Load or initialize
        let fresh = is_blank(volume.as_ref())?;
        let state = if fresh {
            StoreState::create(volume, &config)
        } else {
            StoreState::load(volume, &config)?
        };

        let store = Self {
            location: location.clone(),
            config,
            wal,
            state: RwLock::new(state),
            lock: Mutex::new(lock),
            closed: AtomicBool::new(false),
            commits: AtomicU64::new(0),
            checkpoints: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
        };

        if fresh {
            let catalog = store.preallocate()?;
            debug_assert_eq!(catalog, CATALOG_RECID);
            store.commit()?;
            tracing::info!(location = ?location, "Created new store");
        } else {
            let state = store.state.read();
            tracing::info!(
                location = ?location,
                max_recid = state.committed.max_recid,
                tail = state.committed.tail,
                free_bytes = state.free_space.total_bytes(),
                "Opened store"
            );
        }

        Ok(store)
    }

    // =========================================================================
    // Record Operations
    // =========================================================================

    /// Store a new record, returning its recid
    pub fn put(&self, payload: &[u8]) -> Result<Recid> {
        let mut state = self.write_state()?;
        let recid = state.put(payload)?;
        if self.config.diagnostics.log_store_records {
            tracing::trace!(recid, len = payload.len(), "store put");
        }
        Ok(recid)
    }

    /// Reserve a recid whose payload reads as empty until updated
    pub fn preallocate(&self) -> Result<Recid> {
        let mut state = self.write_state()?;
        Ok(state.preallocate())
    }

    /// Read a record, including uncommitted changes
    pub fn get(&self, recid: Recid) -> Result<Bytes> {
        let state = self.read_state()?;
        if self.config.diagnostics.log_store_records {
            tracing::trace!(recid, "store get");
        }
        state.read(recid)
    }

    /// Replace a record's payload, relocating it if it no longer fits
    pub fn update(&self, recid: Recid, payload: &[u8]) -> Result<()> {
        let mut state = self.write_state()?;
        if self.config.diagnostics.log_store_records {
            tracing::trace!(recid, len = payload.len(), "store update");
        }
        state.update(recid, payload)
    }

    pub fn delete(&self, recid: Recid) -> Result<()> {
        let mut state = self.write_state()?;
        if self.config.diagnostics.log_store_records {
            tracing::trace!(recid, "store delete");
        }
        state.delete(recid)
    }

    /// Whether `recid` is live, without reading its payload
    pub fn contains(&self, recid: Recid) -> Result<bool> {
        Ok(self.read_state()?.slot(recid) != SLOT_FREE)
    }

    /// Volume offset of a record; `None` if preallocated
    pub fn locate(&self, recid: Recid) -> Result<Option<u64>> {
        let state = self.read_state()?;
        match state.slot(recid) {
            SLOT_FREE => Err(EmberError::RecordNotFound(recid)),
            SLOT_PREALLOCATED => Ok(None),
            offset => Ok(Some(offset)),
        }
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Make all pending changes durable
    pub fn commit(&self) -> Result<()> {
        let mut state = self.write_state()?;
        if !state.txn.dirty {
            return Ok(());
        }

        let chunks = state.all_chunks();
        let ops = state
            .txn
            .operations(&state.header, &chunks, self.config.zero_unused_space);

        // Step 1: Log the batch and force it to disk
        if let Some(wal) = &self.wal {
            let txn = wal.begin_transaction()?;
            let logged = ops.iter().try_for_each(|op| match op {
                Operation::Write { offset, data } => wal.log_write(&txn, *offset, data),
                Operation::Clear { offset, len } => wal.log_clear(&txn, *offset, *len),
                Operation::Begin | Operation::Commit | Operation::Rollback => Ok(()),
            });
            if let Err(e) = logged {
                // Close the log transaction; the pending batch stays for a retry or rollback
                if let Err(abort) = wal.rollback(txn) {
                    tracing::warn!(error = %abort, "Failed to log WAL rollback");
                }
                return Err(e);
            }
            wal.commit(txn)?;
        }

        // Step 2: Apply to the volume
        state.volume.ensure_available(state.header.tail)?;
        for op in &ops {
            wal::apply(state.volume.as_ref(), op)?;
        }
        state.finish_commit();
        self.commits.fetch_add(1, Ordering::Relaxed);

        if self.config.diagnostics.log_store {
            tracing::debug!(
                operations = ops.len(),
                tail = state.committed.tail,
                max_recid = state.committed.max_recid,
                "Store commit"
            );
        }

        if cfg!(debug_assertions) && self.config.diagnostics.paranoid {
            state.check_consistency()?;
        }

        // Step 3: Checkpoint once the log has grown past the threshold
        if let Some(wal) = &self.wal {
            if wal.size() >= self.config.wal_checkpoint_bytes {
                wal.checkpoint(state.volume.as_ref())?;
                self.checkpoints.fetch_add(1, Ordering::Relaxed);
            }
        }

        Ok(())
    }

    /// Discard all pending changes
    pub fn rollback(&self) -> Result<()> {
        let mut state = self.write_state()?;
        if state.txn.dirty {
            state.rollback();
            if self.config.diagnostics.log_store {
                tracing::debug!("Store rollback");
            }
        }
        Ok(())
    }

    pub fn has_uncommitted_changes(&self) -> bool {
        self.state.read().txn.dirty
    }

    /// Sync the volume and truncate the WAL
    pub fn checkpoint(&self) -> Result<()> {
        let state = self.write_state()?;
        match &self.wal {
            Some(wal) => wal.checkpoint(state.volume.as_ref())?,
            None => state.volume.sync()?,
        }
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Rewrite live records contiguously, discarding free space
    ///
    /// Recids are preserved. File stores build `data.ember.compact` and
    /// rename it over the data file.
    pub fn compact(&self) -> Result<()> {
        let mut state = self.write_state()?;
        if state.txn.dirty {
            return Err(EmberError::UncommittedChanges);
        }

        let before = state.committed.tail;
        if let Some(wal) = &self.wal {
            wal.checkpoint(state.volume.as_ref())?;
            self.checkpoints.fetch_add(1, Ordering::Relaxed);
        }

        let options = VolumeOptions::from_config(&self.config);
        match &self.location {
            Location::Memory => {
                let target = MemoryVolume::new(options);
                let layout = state.copy_live(&target)?;
                state.install(Box::new(target), layout);
            }
            Location::Directory(dir) => {
                let retries = self.config.file_retry_count;
                let temp_path = dir.join(COMPACT_FILE);
                let data_path = dir.join(DATA_FILE);
                remove_with_retry(&temp_path, retries)?;

                let target = FileVolume::open(&temp_path, options.clone())?;
                let layout = match state.copy_live(&target) {
                    Ok(layout) => layout,
                    Err(e) => {
                        drop(target);
                        if let Err(cleanup) = remove_with_retry(&temp_path, retries) {
                            tracing::warn!(error = %cleanup, "Failed to remove compaction file");
                        }
                        return Err(e);
                    }
                };
                target.close()?;
                drop(target);

                // Release the old file handle before swapping files
                let old = std::mem::replace(
                    &mut state.volume,
                    Box::new(MemoryVolume::new(options.clone())),
                );
                old.close()?;
                drop(old);

                if let Err(e) = rename_with_retry(&temp_path, &data_path, retries) {
                    state.volume = Box::new(FileVolume::open(&data_path, options)?);
                    return Err(e.into());
                }
                let volume = FileVolume::open(&data_path, options)?;
                state.install(Box::new(volume), layout);
            }
        }

        self.compactions.fetch_add(1, Ordering::Relaxed);
        tracing::info!(before, after = state.committed.tail, "Compaction complete");
        Ok(())
    }

    /// Verify that live records, index chunks and free space never overlap
    pub fn check_consistency(&self) -> Result<()> {
        self.read_state()?.check_consistency()
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.state.read();
        StoreStats {
            records: state.slots.iter().filter(|&&s| s != SLOT_FREE).count() as u64,
            max_recid: state.committed.max_recid,
            volume_bytes: state.volume.length(),
            tail: state.committed.tail,
            free_bytes: state.free_space.total_bytes(),
            free_entries: state.free_space.len() as u64,
            wal_bytes: self.wal.as_ref().map(WriteAheadLog::size).unwrap_or(0),
            commits: self.commits.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
            uncommitted: state.txn.dirty,
        }
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Effective configuration; the page size is the one the volume was created with
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Discard uncommitted work, checkpoint, and release the directory
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if state.txn.dirty {
            tracing::warn!("Discarding uncommitted changes on close");
            state.rollback();
        }
        if let Some(wal) = &self.wal {
            wal.checkpoint(state.volume.as_ref())?;
        }
        state.volume.close()?;
        drop(state);

        self.lock.lock().take();
        tracing::info!(location = ?self.location, "Store closed");
        Ok(())
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, StoreState>> {
        let state = self.state.read();
        if self.closed.load(Ordering::Acquire) {
            return Err(EmberError::Closed);
        }
        Ok(state)
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, StoreState>> {
        let state = self.state.write();
        if self.closed.load(Ordering::Acquire) {
            return Err(EmberError::Closed);
        }
        Ok(state)
    }
}

/// No header has ever been committed
///
/// A volume with any bytes at all is addressable from offset 0, since file
/// volumes round a trailing partial page up.
fn is_blank(volume: &dyn Volume) -> Result<bool> {
    if volume.length() == 0 {
        return Ok(true);
    }
    let len = volume.length().min(HEADER_SIZE) as usize;
    let header = volume.read(0, len)?;
    Ok(header.iter().all(|&b| b == 0))
}

/// Switch `config` to the page size recorded in an existing data file
///
/// Page-rounded sizes differ between page sizes, so opening with the wrong
/// one would misjudge how much of the file is addressable. A header that
/// does not decode is left for `StoreState::load` to report after replay.
fn adopt_stored_page_size(path: &Path, config: &mut Config) -> Result<()> {
    let mut buf = Vec::with_capacity(HEADER_SIZE as usize);
    match fs::File::open(path) {
        Ok(file) => {
            file.take(HEADER_SIZE).read_to_end(&mut buf)?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    }
    if buf.iter().all(|&b| b == 0) {
        return Ok(());
    }
    let Ok(header) = StoreHeader::decode(&buf) else {
        return Ok(());
    };

    let stored = header.page_shift as u32;
    if stored == config.page_shift() {
        return Ok(());
    }
    let adopted = match 1usize.checked_shl(stored) {
        Some(size) => Config {
            volume_page_size: size,
            ..config.clone()
        },
        None => {
            return Err(EmberError::Config(format!(
                "data file records invalid page shift {}",
                stored
            )))
        }
    };
    adopted.validate()?;

    tracing::warn!(
        path = %path.display(),
        stored = adopted.volume_page_size,
        configured = config.volume_page_size,
        "Using the volume page size the store was created with"
    );
    *config = adopted;
    Ok(())
}

impl StoreState {
    fn create(volume: Box<dyn Volume>, config: &Config) -> Self {
        let header = StoreHeader::new(config.page_shift() as u8);
        Self {
            volume,
            header,
            committed: header,
            chunks: Vec::new(),
            slots: Vec::new(),
            free_space: FreeSpace::new(config.free_space_reclaim_classes),
            free_recids: BTreeSet::new(),
            txn: PendingTxn::default(),
            reclaim_classes: config.free_space_reclaim_classes,
            log_allocations: config.diagnostics.log_allocations,
            log_store: config.diagnostics.log_store,
        }
    }

    fn load(volume: Box<dyn Volume>, config: &Config) -> Result<Self> {
        let header = StoreHeader::decode(&volume.read(0, HEADER_SIZE as usize)?)?;
        if header.page_shift as u32 != config.page_shift() {
            return Err(EmberError::Config(format!(
                "volume was created with page shift {}, opened with {}",
                header.page_shift,
                config.page_shift()
            )));
        }
        if header.tail > volume.length() {
            return Err(EmberError::Storage(format!(
                "store tail {} beyond volume length {}",
                header.tail,
                volume.length()
            )));
        }

        // Walk the index chunk chain
        let mut chunks = Vec::new();
        let mut slots = Vec::new();
        let mut next = header.first_chunk;
        while next != 0 {
            if next + CHUNK_SIZE > header.tail || chunks.len() as u64 * CHUNK_SIZE > header.tail {
                return Err(EmberError::Storage(format!(
                    "index chunk chain broken at offset {}",
                    next
                )));
            }
            let buf = volume.read(next, CHUNK_SIZE as usize)?;
            chunks.push(next);
            slots.extend(
                buf[8..]
                    .chunks_exact(8)
                    .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])),
            );
            next = u64::from_le_bytes([buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7]]);
        }
        if (slots.len() as u64) < header.max_recid {
            return Err(EmberError::Storage(format!(
                "index holds {} slots but max recid is {}",
                slots.len(),
                header.max_recid
            )));
        }
        slots.truncate(header.max_recid as usize);

        let free_recids = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| **slot == SLOT_FREE)
            .map(|(i, _)| i as Recid + 1)
            .collect();

        let mut state = Self {
            volume,
            header,
            committed: header,
            chunks,
            slots,
            free_space: FreeSpace::new(config.free_space_reclaim_classes),
            free_recids,
            txn: PendingTxn::default(),
            reclaim_classes: config.free_space_reclaim_classes,
            log_allocations: config.diagnostics.log_allocations,
            log_store: config.diagnostics.log_store,
        };
        state.rebuild_free_space()?;
        Ok(state)
    }

    /// Everything below the tail not covered by the header, a chunk or a
    /// live record is free
    fn rebuild_free_space(&mut self) -> Result<()> {
        let tail = self.committed.tail;
        let mut regions: Vec<(u64, Option<u64>)> = vec![(0, Some(HEADER_SIZE))];
        regions.extend(self.chunks.iter().map(|&c| (c, Some(CHUNK_SIZE))));

        for (i, &slot) in self.slots.iter().enumerate() {
            if slot <= SLOT_PREALLOCATED {
                continue;
            }
            let recid = i as Recid + 1;
            match self.record_header(recid, slot) {
                Ok(header) => regions.push((slot, Some(header.capacity as u64))),
                Err(e) => {
                    // Unknown extent: keep everything up to the next region
                    tracing::warn!(recid, offset = slot, error = %e, "Unreadable record header");
                    regions.push((slot, None));
                }
            }
        }
        regions.sort_unstable_by_key(|&(offset, _)| offset);

        let mut cursor = 0u64;
        for (idx, &(offset, size)) in regions.iter().enumerate() {
            if offset < cursor {
                return Err(EmberError::Storage(format!(
                    "overlapping regions at offset {} (previous ends at {})",
                    offset, cursor
                )));
            }
            if offset > cursor {
                self.free_space.release(cursor, offset - cursor);
            }
            cursor = match size {
                Some(size) => offset + size,
                None => regions.get(idx + 1).map(|&(o, _)| o).unwrap_or(tail),
            };
        }
        if cursor > tail {
            return Err(EmberError::Storage(format!(
                "live data ends at {} beyond tail {}",
                cursor, tail
            )));
        }
        if cursor < tail {
            self.free_space.release(cursor, tail - cursor);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Index
    // -------------------------------------------------------------------------

    fn slot(&self, recid: Recid) -> u64 {
        if recid == 0 {
            return SLOT_FREE;
        }
        if let Some(&value) = self.txn.slots.get(&recid) {
            return value;
        }
        self.slots
            .get((recid - 1) as usize)
            .copied()
            .unwrap_or(SLOT_FREE)
    }

    fn chunk_count(&self) -> usize {
        self.chunks.len() + self.txn.new_chunks.len()
    }

    fn all_chunks(&self) -> Vec<u64> {
        let mut chunks = self.chunks.clone();
        chunks.extend_from_slice(&self.txn.new_chunks);
        chunks
    }

    fn next_recid(&mut self) -> Recid {
        if let Some(recid) = self.free_recids.pop_first() {
            self.txn.taken_recids.push(recid);
            return recid;
        }
        let recid = self.header.max_recid + 1;
        self.header.max_recid = recid;
        if recid > self.chunk_count() as u64 * SLOTS_PER_CHUNK {
            self.add_chunk();
        }
        recid
    }

    fn add_chunk(&mut self) {
        let offset = self.allocate(CHUNK_SIZE);
        match self.chunk_count() {
            0 => self.header.first_chunk = offset,
            n => {
                let previous = self.all_chunks()[n - 1];
                self.txn.chunk_links.push((previous, offset));
            }
        }
        self.txn.new_chunks.push(offset);
        if self.log_store {
            tracing::debug!(offset, chunks = self.chunk_count(), "Index chunk added");
        }
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    fn allocate(&mut self, size: u64) -> u64 {
        let offset = match self.free_space.take(size) {
            Some(offset) => {
                self.txn.allocated.push((offset, size));
                offset
            }
            None => {
                let offset = self.header.tail;
                self.header.tail += size;
                offset
            }
        };
        if self.log_allocations {
            tracing::trace!(offset, size, tail = self.header.tail, "allocate");
        }
        offset
    }

    /// Free space becomes reusable only once the release is committed
    fn release(&mut self, offset: u64, size: u64) {
        self.txn.records.remove(&offset);
        self.txn.released.push((offset, size));
        if self.log_allocations {
            tracing::trace!(offset, size, "release");
        }
    }

    // -------------------------------------------------------------------------
    // Records
    // -------------------------------------------------------------------------

    fn record_header(&self, recid: Recid, offset: u64) -> Result<RecordHeader> {
        if let Some(bytes) = self.txn.records.get(&offset) {
            return Ok(RecordHeader::parse(bytes));
        }
        if offset + RECORD_HEADER_SIZE > self.committed.tail {
            return Err(EmberError::CorruptRecord {
                recid,
                reason: format!("offset {} beyond tail {}", offset, self.committed.tail),
            });
        }
        let buf = self.volume.read(offset, RECORD_HEADER_SIZE as usize)?;
        let header = RecordHeader::parse(&buf);
        header.validate(recid, offset, self.committed.tail)?;
        Ok(header)
    }

    fn read(&self, recid: Recid) -> Result<Bytes> {
        match self.slot(recid) {
            SLOT_FREE => Err(EmberError::RecordNotFound(recid)),
            SLOT_PREALLOCATED => Ok(Bytes::new()),
            offset => {
                if let Some(bytes) = self.txn.records.get(&offset) {
                    return Ok(Bytes::copy_from_slice(&bytes[RECORD_HEADER_SIZE as usize..]));
                }
                let header = self.record_header(recid, offset)?;
                let payload = self
                    .volume
                    .read(offset + RECORD_HEADER_SIZE, header.len as usize)?;
                header.verify_payload(recid, &payload)?;
                Ok(Bytes::from(payload))
            }
        }
    }

    fn put(&mut self, payload: &[u8]) -> Result<Recid> {
        check_payload(payload)?;
        let recid = self.next_recid();
        let size = record_size(payload.len());
        let offset = self.allocate(size);
        self.txn.records.insert(offset, encode_record(payload, size));
        self.txn.slots.insert(recid, offset);
        self.txn.dirty = true;
        Ok(recid)
    }

    fn preallocate(&mut self) -> Recid {
        let recid = self.next_recid();
        self.txn.slots.insert(recid, SLOT_PREALLOCATED);
        self.txn.dirty = true;
        recid
    }

    fn update(&mut self, recid: Recid, payload: &[u8]) -> Result<()> {
        check_payload(payload)?;
        let size = record_size(payload.len());
        match self.slot(recid) {
            SLOT_FREE => return Err(EmberError::RecordNotFound(recid)),
            SLOT_PREALLOCATED => {
                let offset = self.allocate(size);
                self.txn.records.insert(offset, encode_record(payload, size));
                self.txn.slots.insert(recid, offset);
            }
            offset => {
                let capacity = self.record_header(recid, offset)?.capacity as u64;
                if size <= capacity {
                    self.txn.records.insert(offset, encode_record(payload, capacity));
                } else {
                    // Relocate: new copy, repoint, free the old one
                    let new_offset = self.allocate(size);
                    self.txn.records.insert(new_offset, encode_record(payload, size));
                    self.txn.slots.insert(recid, new_offset);
                    self.release(offset, capacity);
                }
            }
        }
        self.txn.dirty = true;
        Ok(())
    }

    fn delete(&mut self, recid: Recid) -> Result<()> {
        match self.slot(recid) {
            SLOT_FREE => return Err(EmberError::RecordNotFound(recid)),
            SLOT_PREALLOCATED => {}
            offset => match self.record_header(recid, offset) {
                Ok(header) => self.release(offset, header.capacity as u64),
                Err(EmberError::CorruptRecord { reason, .. }) => {
                    // Extent unknown, leave the space to compaction
                    tracing::warn!(recid, offset, reason = %reason, "Deleting corrupt record");
                }
                Err(e) => return Err(e),
            },
        }
        self.txn.slots.insert(recid, SLOT_FREE);
        self.txn.released_recids.push(recid);
        self.txn.dirty = true;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Transaction Bookkeeping
    // -------------------------------------------------------------------------

    fn finish_commit(&mut self) {
        let txn = std::mem::take(&mut self.txn);
        self.chunks.extend(txn.new_chunks);
        self.slots.resize(self.header.max_recid as usize, SLOT_FREE);
        for (recid, value) in txn.slots {
            self.slots[(recid - 1) as usize] = value;
        }
        for (offset, size) in txn.released {
            self.free_space.release(offset, size);
        }
        self.free_recids.extend(txn.released_recids);
        self.committed = self.header;
    }

    fn rollback(&mut self) {
        let txn = std::mem::take(&mut self.txn);
        for (offset, size) in txn.allocated {
            self.free_space.release(offset, size);
        }
        self.free_recids.extend(txn.taken_recids);
        self.header = self.committed;
    }

    // -------------------------------------------------------------------------
    // Compaction
    // -------------------------------------------------------------------------

    /// Write every live record and a fresh index into `target`
    fn copy_live(&self, target: &dyn Volume) -> Result<CompactLayout> {
        let max_recid = self.committed.max_recid;
        let chunk_count = (max_recid + SLOTS_PER_CHUNK - 1) / SLOTS_PER_CHUNK;
        let chunks: Vec<u64> = (0..chunk_count)
            .map(|i| HEADER_SIZE + i * CHUNK_SIZE)
            .collect();
        let mut tail = HEADER_SIZE + chunk_count * CHUNK_SIZE;
        target.ensure_available(tail)?;

        let mut slots = Vec::with_capacity(self.slots.len());
        for (i, &slot) in self.slots.iter().enumerate() {
            if slot <= SLOT_PREALLOCATED {
                slots.push(slot);
                continue;
            }
            let payload = self.read(i as Recid + 1)?;
            let size = record_size(payload.len());
            target.ensure_available(tail + size)?;
            target.write(tail, &encode_record(&payload, size))?;
            slots.push(tail);
            tail += size;
        }

        for (i, &chunk) in chunks.iter().enumerate() {
            let mut buf = Vec::with_capacity(CHUNK_SIZE as usize);
            let next = chunks.get(i + 1).copied().unwrap_or(0);
            buf.extend_from_slice(&next.to_le_bytes());
            let start = i * SLOTS_PER_CHUNK as usize;
            let end = (start + SLOTS_PER_CHUNK as usize).min(slots.len());
            for slot in &slots[start..end] {
                buf.extend_from_slice(&slot.to_le_bytes());
            }
            buf.resize(CHUNK_SIZE as usize, 0);
            target.write(chunk, &buf)?;
        }

        let header = StoreHeader {
            page_shift: self.committed.page_shift,
            tail,
            max_recid,
            first_chunk: chunks.first().copied().unwrap_or(0),
        };
        target.write(0, &header.encode())?;
        target.sync()?;

        Ok(CompactLayout {
            header,
            chunks,
            slots,
        })
    }

    fn install(&mut self, volume: Box<dyn Volume>, layout: CompactLayout) {
        self.volume = volume;
        self.header = layout.header;
        self.committed = layout.header;
        self.chunks = layout.chunks;
        self.slots = layout.slots;
        self.free_space = FreeSpace::new(self.reclaim_classes);
    }

    // -------------------------------------------------------------------------
    // Diagnostics
    // -------------------------------------------------------------------------

    fn check_consistency(&self) -> Result<()> {
        let mut regions: Vec<(u64, u64, &'static str)> = vec![(0, HEADER_SIZE, "header")];
        regions.extend(self.all_chunks().into_iter().map(|c| (c, CHUNK_SIZE, "index chunk")));
        for recid in 1..=self.header.max_recid {
            let slot = self.slot(recid);
            if slot > SLOT_PREALLOCATED {
                let header = self.record_header(recid, slot)?;
                regions.push((slot, header.capacity as u64, "record"));
            }
        }
        regions.extend(self.free_space.entries().map(|(o, s)| (o, s, "free range")));
        regions.extend(self.txn.released.iter().map(|&(o, s)| (o, s, "released range")));
        regions.sort_unstable_by_key(|&(offset, _, _)| offset);

        let mut end = 0u64;
        let mut previous = "start";
        for &(offset, size, kind) in &regions {
            if offset < end {
                return Err(EmberError::Storage(format!(
                    "{} [{}, {}) overlaps {} ending at {}",
                    kind,
                    offset,
                    offset + size,
                    previous,
                    end
                )));
            }
            end = offset + size;
            previous = kind;
        }
        if end > self.header.tail {
            return Err(EmberError::Storage(format!(
                "{} ends at {} beyond tail {}",
                previous, end, self.header.tail
            )));
        }
        if !self.free_space.is_consistent() {
            return Err(EmberError::Storage("free-space queue bookkeeping mismatch".into()));
        }
        if let Some(&recid) = self.free_recids.iter().find(|&&r| self.slot(r) != SLOT_FREE) {
            return Err(EmberError::Storage(format!("free recid {} is in use", recid)));
        }
        Ok(())
    }
}

fn check_payload(payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(EmberError::Storage(format!(
            "payload of {} bytes exceeds maximum of {}",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }
    Ok(())
}
