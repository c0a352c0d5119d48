//! Segmented ordered map
//!
//! Each segment keeps its keys sorted in a chain of leaf records, indexed
//! by a fence list (lowest key of every leaf) stored in the segment record.
//! Leaves split once they exceed `LEAF_CAPACITY`. Ordered scans merge the
//! per-segment runs.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::Recid;

use super::{
    create_root, encode, hash_key, load, open_segments, Access, MapOptions, SegmentHold,
    SegmentRecord, SegmentTable, SharedEngine,
};

const LEAF_CAPACITY: usize = 32;

type Entry = (Vec<u8>, Vec<u8>);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Fence {
    /// Lowest key routed to `leaf`; empty for the first leaf
    low: Vec<u8>,
    leaf: Recid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SegmentIndex {
    map_id: u64,
    count: u64,
    fences: Vec<Fence>,
}

impl SegmentRecord for SegmentIndex {
    fn map_id(&self) -> u64 {
        self.map_id
    }
}

impl SegmentIndex {
    /// Position of the fence covering `key`
    fn leaf_for(&self, key: &[u8]) -> usize {
        self.fences
            .partition_point(|fence| fence.low.as_slice() <= key)
            .saturating_sub(1)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Leaf {
    entries: Vec<Entry>,
}

impl Leaf {
    fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.entries
            .binary_search_by(|(candidate, _)| candidate.as_slice().cmp(key))
    }
}

/// What the shared phase of an insert found
struct InsertPoint {
    index: SegmentIndex,
    fence: usize,
    leaf: Leaf,
    position: usize,
}

pub struct TreeMap {
    engine: SharedEngine,
    segments: SegmentTable,
}

impl TreeMap {
    /// Write an empty map with `segments` segments, returning its root
    pub(crate) fn create(engine: &SharedEngine, segments: usize) -> Result<Recid> {
        create_root(engine.as_ref(), segments, |map_id| {
            let leaf = engine.put(&encode(&Leaf::default())?)?;
            encode(&SegmentIndex {
                map_id,
                count: 0,
                fences: vec![Fence {
                    low: Vec::new(),
                    leaf,
                }],
            })
        })
    }

    pub(crate) fn open(engine: SharedEngine, root: Recid, options: MapOptions) -> Result<Self> {
        let segments = open_segments(engine.as_ref(), root, &options)?;
        Ok(Self { engine, segments })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let hash = hash_key(key);
        if self.segments.log {
            tracing::trace!(segment = self.segments.index_of(hash), key_len = key.len(), "tree get");
        }
        self.segments
            .for_hash(hash)
            .read(|&index_recid| -> Result<Option<Vec<u8>>> {
                let index: SegmentIndex = self.segments.load(self.engine.as_ref(), index_recid)?;
                let fence = &index.fences[index.leaf_for(key)];
                let mut leaf: Leaf = load(self.engine.as_ref(), fence.leaf)?;
                Ok(match leaf.search(key) {
                    Ok(pos) => Some(leaf.entries.swap_remove(pos).1),
                    Err(_) => None,
                })
            })
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn find_insert_point(&self, index_recid: Recid, key: &[u8]) -> Result<InsertPoint> {
        let index: SegmentIndex = self.segments.load(self.engine.as_ref(), index_recid)?;
        let fence = index.leaf_for(key);
        let leaf: Leaf = load(self.engine.as_ref(), index.fences[fence].leaf)?;
        let position = match leaf.search(key) {
            Ok(pos) | Err(pos) => pos,
        };
        Ok(InsertPoint {
            index,
            fence,
            leaf,
            position,
        })
    }

    /// Insert or replace, returning the previous value
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        let hash = hash_key(key);
        if self.segments.log {
            tracing::trace!(
                segment = self.segments.index_of(hash),
                key_len = key.len(),
                value_len = value.len(),
                "tree insert"
            );
        }
        self.segments.for_hash(hash).upgradable(
            |&index_recid| {
                let mut point = match self.find_insert_point(index_recid, key) {
                    Ok(point) => point,
                    Err(e) => return Access::Done(Err(e)),
                };
                let existing = point
                    .leaf
                    .entries
                    .get_mut(point.position)
                    .filter(|(candidate, _)| candidate.as_slice() == key);
                match existing {
                    Some((_, slot)) => {
                        // Key set unchanged: rewrite the leaf under the shared phase
                        let old = std::mem::replace(slot, value.to_vec());
                        let leaf_recid = point.index.fences[point.fence].leaf;
                        let result = encode(&point.leaf)
                            .and_then(|bytes| self.engine.update(leaf_recid, &bytes))
                            .map(|_| Some(old));
                        Access::Done(result)
                    }
                    None => Access::Upgrade(point),
                }
            },
            |&mut index_recid, mut point| -> Result<Option<Vec<u8>>> {
                point
                    .leaf
                    .entries
                    .insert(point.position, (key.to_vec(), value.to_vec()));
                point.index.count += 1;
                let leaf_recid = point.index.fences[point.fence].leaf;

                if point.leaf.entries.len() > LEAF_CAPACITY {
                    let right = Leaf {
                        entries: point.leaf.entries.split_off(LEAF_CAPACITY / 2),
                    };
                    let low = right.entries[0].0.clone();
                    let right_recid = self.engine.put(&encode(&right)?)?;
                    point.index.fences.insert(
                        point.fence + 1,
                        Fence {
                            low,
                            leaf: right_recid,
                        },
                    );
                    if self.segments.log {
                        tracing::trace!(leaf = leaf_recid, right = right_recid, "Tree leaf split");
                    }
                }

                self.engine.update(leaf_recid, &encode(&point.leaf)?)?;
                self.engine.update(index_recid, &encode(&point.index)?)?;
                Ok(None)
            },
        )
    }

    pub fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let hash = hash_key(key);
        if self.segments.log {
            tracing::trace!(segment = self.segments.index_of(hash), key_len = key.len(), "tree remove");
        }
        self.segments
            .for_hash(hash)
            .write(|&mut index_recid| -> Result<Option<Vec<u8>>> {
                let mut index: SegmentIndex = self.segments.load(self.engine.as_ref(), index_recid)?;
                let fence = index.leaf_for(key);
                let leaf_recid = index.fences[fence].leaf;
                let mut leaf: Leaf = load(self.engine.as_ref(), leaf_recid)?;

                let Ok(pos) = leaf.search(key) else {
                    return Ok(None);
                };
                let (_, old) = leaf.entries.remove(pos);
                index.count -= 1;

                if leaf.entries.is_empty() && index.fences.len() > 1 {
                    self.engine.delete(leaf_recid)?;
                    index.fences.remove(fence);
                    if fence == 0 {
                        index.fences[0].low.clear();
                    }
                } else {
                    self.engine.update(leaf_recid, &encode(&leaf)?)?;
                }
                self.engine.update(index_recid, &encode(&index)?)?;
                Ok(Some(old))
            })
    }

    pub fn len(&self) -> Result<u64> {
        let mut total = 0;
        for segment in &self.segments.segments {
            total += segment.read(|&index_recid| {
                self.segments
                    .load::<SegmentIndex>(self.engine.as_ref(), index_recid)
                    .map(|index| index.count)
            })?;
        }
        Ok(total)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Entries with keys inside the bounds, in key order
    ///
    /// Segments are read one at a time, so concurrent writers may be
    /// observed in some segments and not others.
    pub fn range(&self, start: Bound<&[u8]>, end: Bound<&[u8]>) -> Result<Vec<Entry>> {
        let mut runs = Vec::with_capacity(self.segments.len());
        for segment in &self.segments.segments {
            runs.push(segment.read(|&index_recid| self.segment_range(index_recid, start, end))?);
        }
        Ok(merge_runs(runs))
    }

    /// All entries in key order
    pub fn entries(&self) -> Result<Vec<Entry>> {
        self.range(Bound::Unbounded, Bound::Unbounded)
    }

    pub fn keys(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.entries()?.into_iter().map(|(key, _)| key).collect())
    }

    fn segment_range(
        &self,
        index_recid: Recid,
        start: Bound<&[u8]>,
        end: Bound<&[u8]>,
    ) -> Result<Vec<Entry>> {
        let index: SegmentIndex = self.segments.load(self.engine.as_ref(), index_recid)?;
        let first = match start {
            Bound::Included(key) | Bound::Excluded(key) => index.leaf_for(key),
            Bound::Unbounded => 0,
        };

        let mut run = Vec::new();
        for fence in &index.fences[first..] {
            let leaf: Leaf = load(self.engine.as_ref(), fence.leaf)?;
            for (key, value) in leaf.entries {
                if !past_start(&key, start) {
                    continue;
                }
                if !before_end(&key, end) {
                    return Ok(run);
                }
                run.push((key, value));
            }
        }
        Ok(run)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segment_of(&self, key: &[u8]) -> usize {
        self.segments.index_of(hash_key(key))
    }

    pub fn lock_segment(&self, index: usize) -> SegmentHold<'_> {
        self.segments.hold(index)
    }
}

fn past_start(key: &[u8], start: Bound<&[u8]>) -> bool {
    match start {
        Bound::Included(s) => key >= s,
        Bound::Excluded(s) => key > s,
        Bound::Unbounded => true,
    }
}

fn before_end(key: &[u8], end: Bound<&[u8]>) -> bool {
    match end {
        Bound::Included(e) => key <= e,
        Bound::Excluded(e) => key < e,
        Bound::Unbounded => true,
    }
}

/// K-way merge of sorted runs with disjoint keys
fn merge_runs(runs: Vec<Vec<Entry>>) -> Vec<Entry> {
    let total = runs.iter().map(Vec::len).sum();
    let mut merged = Vec::with_capacity(total);
    let mut iters: Vec<_> = runs.into_iter().map(Vec::into_iter).collect();

    let mut heap = BinaryHeap::new();
    for (i, iter) in iters.iter_mut().enumerate() {
        if let Some(entry) = iter.next() {
            heap.push(Reverse((entry, i)));
        }
    }
    while let Some(Reverse((entry, i))) = heap.pop() {
        if let Some(next) = iters[i].next() {
            heap.push(Reverse((next, i)));
        }
        merged.push(entry);
    }
    merged
}
