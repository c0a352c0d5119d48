//! Free-space reclamation queue
//!
//! Freed byte ranges, bucketed into a small number of size classes so an
//! allocation inspects at most `classes` ordered sets instead of the whole
//! free list. Adjacent ranges are coalesced on release.
//!
//! ## Size Classes (default 5)
//! ```text
//! class 0: [16, 64)   class 1: [64, 256)   class 2: [256, 1024)
//! class 3: [1024, 4096)                    class 4: [4096, ∞)
//! ```

use std::collections::{BTreeMap, BTreeSet};

const BASE_CLASS_LIMIT: u64 = 64;

#[derive(Debug, Clone)]
pub struct FreeSpace {
    /// Exclusive upper bound of every class but the last
    class_limits: Vec<u64>,
    /// Per class: (size, offset), ordered for best-fit
    classes: Vec<BTreeSet<(u64, u64)>>,
    /// offset → size, for coalescing
    by_offset: BTreeMap<u64, u64>,
    total: u64,
}

impl FreeSpace {
    pub fn new(class_count: usize) -> Self {
        let class_count = class_count.max(1);
        let class_limits = (0..class_count - 1)
            .map(|i| BASE_CLASS_LIMIT << (2 * i))
            .collect();
        Self {
            class_limits,
            classes: vec![BTreeSet::new(); class_count],
            by_offset: BTreeMap::new(),
            total: 0,
        }
    }

    fn class_of(&self, size: u64) -> usize {
        self.class_limits
            .iter()
            .position(|&limit| size < limit)
            .unwrap_or(self.class_limits.len())
    }

    fn insert(&mut self, offset: u64, size: u64) {
        let class = self.class_of(size);
        self.classes[class].insert((size, offset));
        self.by_offset.insert(offset, size);
        self.total += size;
    }

    fn remove(&mut self, offset: u64, size: u64) {
        let class = self.class_of(size);
        self.classes[class].remove(&(size, offset));
        self.by_offset.remove(&offset);
        self.total -= size;
    }

    /// Return `[offset, offset + size)` to the queue, merging with neighbors
    pub fn release(&mut self, offset: u64, size: u64) {
        if size == 0 {
            return;
        }
        let mut start = offset;
        let mut len = size;

        if let Some((&prev_offset, &prev_size)) = self.by_offset.range(..offset).next_back() {
            debug_assert!(prev_offset + prev_size <= offset, "double free at {}", offset);
            if prev_offset + prev_size == offset {
                self.remove(prev_offset, prev_size);
                start = prev_offset;
                len += prev_size;
            }
        }
        if let Some(&next_size) = self.by_offset.get(&(offset + size)) {
            self.remove(offset + size, next_size);
            len += next_size;
        }
        debug_assert!(
            self.by_offset
                .range(start..start + len)
                .next()
                .is_none(),
            "double free at {}",
            offset
        );

        self.insert(start, len);
    }

    /// Best fit: smallest free range >= `size`, searching from its size
    /// class upward. The unused remainder stays in the queue.
    pub fn take(&mut self, size: u64) -> Option<u64> {
        for class in self.class_of(size)..self.classes.len() {
            let found = self.classes[class].range((size, 0)..).next().copied();
            if let Some((found_size, offset)) = found {
                self.remove(offset, found_size);
                if found_size > size {
                    self.insert(offset + size, found_size - size);
                }
                return Some(offset);
            }
        }
        None
    }

    /// Free ranges in offset order
    pub fn entries(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.by_offset.iter().map(|(&offset, &size)| (offset, size))
    }

    pub fn len(&self) -> usize {
        self.by_offset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_offset.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Internal bookkeeping agrees with itself
    pub fn is_consistent(&self) -> bool {
        let class_entries: usize = self.classes.iter().map(BTreeSet::len).sum();
        if class_entries != self.by_offset.len() {
            return false;
        }
        let mut end = 0u64;
        let mut total = 0u64;
        for (&offset, &size) in &self.by_offset {
            // Overlapping or un-merged neighbors
            if offset < end || (offset == end && end != 0) {
                return false;
            }
            if !self.classes[self.class_of(size)].contains(&(size, offset)) {
                return false;
            }
            end = offset + size;
            total += size;
        }
        total == self.total
    }
}
