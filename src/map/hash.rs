//! Segmented hash map
//!
//! Each segment owns a directory record (entry count + bucket heads) and
//! singly linked chains of node records. A segment doubles its bucket count
//! once the average chain grows past `MAX_LOAD`.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::Recid;

use super::{
    create_root, encode, hash_key, load, open_segments, Access, MapOptions, SegmentHold,
    SegmentRecord, SegmentTable, SharedEngine,
};

const INITIAL_BUCKETS: usize = 64;
const MAX_LOAD: u64 = 4;
const NIL: Recid = 0;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Directory {
    map_id: u64,
    count: u64,
    buckets: Vec<Recid>,
}

impl SegmentRecord for Directory {
    fn map_id(&self) -> u64 {
        self.map_id
    }
}

impl Directory {
    fn new(map_id: u64, buckets: usize) -> Self {
        Self {
            map_id,
            count: 0,
            buckets: vec![NIL; buckets],
        }
    }

    fn bucket_of(&self, hash: u64) -> usize {
        bucket_index(hash, self.buckets.len())
    }
}

/// High hash bits pick the bucket; low bits already picked the segment
fn bucket_index(hash: u64, buckets: usize) -> usize {
    ((hash >> 32) as usize) & (buckets - 1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    hash: u64,
    key: Vec<u8>,
    value: Vec<u8>,
    next: Recid,
}

type Found = (Directory, Option<(Recid, Node)>);

pub struct HashMap {
    engine: SharedEngine,
    segments: SegmentTable,
}

impl HashMap {
    /// Write an empty map with `segments` segments, returning its root
    pub(crate) fn create(engine: &SharedEngine, segments: usize) -> Result<Recid> {
        create_root(engine.as_ref(), segments, |map_id| {
            encode(&Directory::new(map_id, INITIAL_BUCKETS))
        })
    }

    pub(crate) fn open(engine: SharedEngine, root: Recid, options: MapOptions) -> Result<Self> {
        let segments = open_segments(engine.as_ref(), root, &options)?;
        Ok(Self { engine, segments })
    }

    /// Directory plus the node holding `key`, if any
    fn locate(&self, dir_recid: Recid, hash: u64, key: &[u8]) -> Result<Found> {
        let dir: Directory = self.segments.load(self.engine.as_ref(), dir_recid)?;
        let mut cursor = dir.buckets[dir.bucket_of(hash)];
        while cursor != NIL {
            let node: Node = load(self.engine.as_ref(), cursor)?;
            if node.hash == hash && node.key == key {
                return Ok((dir, Some((cursor, node))));
            }
            cursor = node.next;
        }
        Ok((dir, None))
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let hash = hash_key(key);
        if self.segments.log {
            tracing::trace!(segment = self.segments.index_of(hash), key_len = key.len(), "hash get");
        }
        self.segments.for_hash(hash).read(|&dir_recid| -> Result<Option<Vec<u8>>> {
            let (_, found) = self.locate(dir_recid, hash, key)?;
            Ok(found.map(|(_, node)| node.value))
        })
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Insert or replace, returning the previous value
    ///
    /// Replacing a value rewrites one node and keeps the segment shared;
    /// adding a key takes it exclusively.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        let hash = hash_key(key);
        if self.segments.log {
            tracing::trace!(
                segment = self.segments.index_of(hash),
                key_len = key.len(),
                value_len = value.len(),
                "hash insert"
            );
        }
        self.segments.for_hash(hash).upgradable(
            |&dir_recid| match self.locate(dir_recid, hash, key) {
                Err(e) => Access::Done(Err(e)),
                Ok((_, Some((recid, mut node)))) => {
                    let old = std::mem::replace(&mut node.value, value.to_vec());
                    let result = encode(&node)
                        .and_then(|bytes| self.engine.update(recid, &bytes))
                        .map(|_| Some(old));
                    Access::Done(result)
                }
                Ok((dir, None)) => Access::Upgrade(dir),
            },
            |&mut dir_recid, mut dir| -> Result<Option<Vec<u8>>> {
                let bucket = dir.bucket_of(hash);
                let node = Node {
                    hash,
                    key: key.to_vec(),
                    value: value.to_vec(),
                    next: dir.buckets[bucket],
                };
                dir.buckets[bucket] = self.engine.put(&encode(&node)?)?;
                dir.count += 1;
                if dir.count > dir.buckets.len() as u64 * MAX_LOAD {
                    self.grow(&mut dir)?;
                }
                self.engine.update(dir_recid, &encode(&dir)?)?;
                Ok(None)
            },
        )
    }

    /// Double the bucket count, relinking every node of the segment
    fn grow(&self, dir: &mut Directory) -> Result<()> {
        let len = dir.buckets.len() * 2;
        let mut buckets = vec![NIL; len];
        for &head in &dir.buckets {
            let mut cursor = head;
            while cursor != NIL {
                let mut node: Node = load(self.engine.as_ref(), cursor)?;
                let next = node.next;
                let bucket = bucket_index(node.hash, len);
                node.next = buckets[bucket];
                self.engine.update(cursor, &encode(&node)?)?;
                buckets[bucket] = cursor;
                cursor = next;
            }
        }
        dir.buckets = buckets;
        if self.segments.log {
            tracing::debug!(buckets = len, entries = dir.count, "Hash segment grown");
        }
        Ok(())
    }

    pub fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let hash = hash_key(key);
        if self.segments.log {
            tracing::trace!(segment = self.segments.index_of(hash), key_len = key.len(), "hash remove");
        }
        self.segments.for_hash(hash).write(|&mut dir_recid| -> Result<Option<Vec<u8>>> {
            let mut dir: Directory = self.segments.load(self.engine.as_ref(), dir_recid)?;
            let bucket = dir.bucket_of(hash);
            let mut previous: Option<(Recid, Node)> = None;
            let mut cursor = dir.buckets[bucket];

            while cursor != NIL {
                let node: Node = load(self.engine.as_ref(), cursor)?;
                if node.hash == hash && node.key == key {
                    match previous {
                        None => dir.buckets[bucket] = node.next,
                        Some((prev_recid, mut prev)) => {
                            prev.next = node.next;
                            self.engine.update(prev_recid, &encode(&prev)?)?;
                        }
                    }
                    self.engine.delete(cursor)?;
                    dir.count -= 1;
                    self.engine.update(dir_recid, &encode(&dir)?)?;
                    return Ok(Some(node.value));
                }
                let next = node.next;
                previous = Some((cursor, node));
                cursor = next;
            }
            Ok(None)
        })
    }

    /// Entry count, summed segment by segment
    pub fn len(&self) -> Result<u64> {
        let mut total = 0;
        for segment in &self.segments.segments {
            total += segment.read(|&dir_recid| {
                self.segments
                    .load::<Directory>(self.engine.as_ref(), dir_recid)
                    .map(|dir| dir.count)
            })?;
        }
        Ok(total)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Snapshot of all entries, one segment at a time (unordered)
    pub fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut entries = Vec::new();
        for segment in &self.segments.segments {
            segment.read(|&dir_recid| -> Result<()> {
                let dir: Directory = self.segments.load(self.engine.as_ref(), dir_recid)?;
                for &head in &dir.buckets {
                    let mut cursor = head;
                    while cursor != NIL {
                        let node: Node = load(self.engine.as_ref(), cursor)?;
                        cursor = node.next;
                        entries.push((node.key, node.value));
                    }
                }
                Ok(())
            })?;
        }
        Ok(entries)
    }

    pub fn keys(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.entries()?.into_iter().map(|(key, _)| key).collect())
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Segment a key routes to
    pub fn segment_of(&self, key: &[u8]) -> usize {
        self.segments.index_of(hash_key(key))
    }

    /// Block every operation on one segment until the hold drops
    pub fn lock_segment(&self, index: usize) -> SegmentHold<'_> {
        self.segments.hold(index)
    }
}
