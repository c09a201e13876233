//
// cache.rs -- the bucket cache
//
// This file is part of the gdbm-core software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

use std::collections::HashMap;

use crate::bucket::Bucket;

/// One key/value pair remembered alongside a cached bucket, so the
/// fetch that customarily follows a key-iteration step is served
/// without touching the file.
#[derive(Debug, Clone)]
pub struct CachedDatum {
    pub hash: u32,
    pub elem_loc: usize,
    pub key: Vec<u8>,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct CacheSlot {
    offset: u64,
    bucket: Bucket,
    dirty: bool,
    hits: u64,
    datum: Option<CachedDatum>,
    // recency list links: arena indices, MRU towards `head`
    prev: Option<usize>,
    next: Option<usize>,
}

/// Cache hit statistics for one open database.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub accesses: u64,
    pub hits: u64,
}

/// In-memory images of recently used buckets.
///
/// Slots live in an arena indexed by small integers; the recency list
/// and free pool link slots by index, and a hash map keyed on file
/// offset finds them.  The entry the database is currently operating
/// on is pinned and never chosen for eviction.
#[derive(Debug)]
pub struct BucketCache {
    slots: Vec<Option<CacheSlot>>,
    index: HashMap<u64, usize>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    current: Option<usize>,
    cachesize: usize,
    auto_sized: bool,
    stats: CacheStats,
}

impl BucketCache {
    pub fn new(cachesize: usize, auto_sized: bool, initial: Option<(u64, Bucket)>) -> BucketCache {
        let mut cache = BucketCache {
            slots: Vec::new(),
            index: HashMap::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            current: None,
            cachesize: cachesize.max(1),
            auto_sized,
            stats: CacheStats::default(),
        };

        if let Some((offset, bucket)) = initial {
            let _ = cache.insert(offset, bucket, true);
            cache.set_current(offset);
        }

        cache
    }

    pub fn cachesize(&self) -> usize {
        self.cachesize
    }

    pub fn auto_sized(&self) -> bool {
        self.auto_sized
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.index.contains_key(&offset)
    }

    fn slot(&self, idx: usize) -> &CacheSlot {
        self.slots[idx].as_ref().unwrap()
    }

    fn slot_mut(&mut self, idx: usize) -> &mut CacheSlot {
        self.slots[idx].as_mut().unwrap()
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = self.slot(idx);
            (slot.prev, slot.next)
        };

        match prev {
            Some(p) => self.slot_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slot_mut(n).prev = prev,
            None => self.tail = prev,
        }

        let slot = self.slot_mut(idx);
        slot.prev = None;
        slot.next = None;
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let slot = self.slot_mut(idx);
            slot.prev = None;
            slot.next = old_head;
        }
        if let Some(h) = old_head {
            self.slot_mut(h).prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn touch(&mut self, idx: usize) {
        if self.head != Some(idx) {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    /// Count one lookup against the hit statistics.  The caller decides
    /// what a hit was, since insertion happens between the lookup and
    /// [`set_current`](BucketCache::set_current).
    pub fn record_access(&mut self, hit: bool) {
        self.stats.accesses += 1;
        if hit {
            self.stats.hits += 1;
        }
    }

    /// Make the bucket at `offset` current, splicing it to the head of
    /// the recency list.  Returns false if the bucket is not cached.
    pub fn set_current(&mut self, offset: u64) -> bool {
        match self.index.get(&offset).copied() {
            Some(idx) => {
                self.slot_mut(idx).hits += 1;
                self.touch(idx);
                self.current = Some(idx);
                true
            }
            None => false,
        }
    }

    pub fn current_offset(&self) -> Option<u64> {
        self.current.map(|idx| self.slot(idx).offset)
    }

    pub fn current_bucket(&self) -> Option<&Bucket> {
        match self.current {
            Some(idx) => Some(&self.slot(idx).bucket),
            None => None,
        }
    }

    /// Mutable access to the current bucket.  The entry is marked dirty
    /// and its remembered datum discarded, since the caller is about to
    /// change the image.
    pub fn current_bucket_mut(&mut self) -> Option<&mut Bucket> {
        match self.current {
            Some(idx) => {
                let slot = self.slots[idx].as_mut().unwrap();
                slot.dirty = true;
                slot.datum = None;
                Some(&mut slot.bucket)
            }
            None => None,
        }
    }

    pub fn current_datum(&self) -> Option<&CachedDatum> {
        match self.current {
            Some(idx) => self.slot(idx).datum.as_ref(),
            None => None,
        }
    }

    pub fn set_current_datum(&mut self, datum: CachedDatum) {
        if let Some(idx) = self.current {
            self.slot_mut(idx).datum = Some(datum);
        }
    }

    pub fn clear_current_datum(&mut self) {
        if let Some(idx) = self.current {
            self.slot_mut(idx).datum = None;
        }
    }

    // Least recently used slot that is not pinned as current.
    fn evictable(&self) -> Option<usize> {
        let mut cursor = self.tail;
        while let Some(idx) = cursor {
            if self.current != Some(idx) {
                return Some(idx);
            }
            cursor = self.slot(idx).prev;
        }
        None
    }

    // Drop a slot from the cache; the image comes back if it was dirty.
    fn evict(&mut self, idx: usize) -> Option<(u64, Bucket)> {
        self.unlink(idx);
        let slot = self.slots[idx].take().unwrap();
        self.index.remove(&slot.offset);
        self.free.push(idx);

        slot.dirty.then_some((slot.offset, slot.bucket))
    }

    /// Insert (or replace) the bucket image for `offset` and splice it
    /// to the recency head.  If the cache was full, the least recently
    /// used unpinned entry is evicted first; its image is returned when
    /// it still needs writing back.
    pub fn insert(&mut self, offset: u64, bucket: Bucket, dirty: bool) -> Option<(u64, Bucket)> {
        if let Some(idx) = self.index.get(&offset).copied() {
            let slot = self.slot_mut(idx);
            slot.bucket = bucket;
            slot.dirty = slot.dirty || dirty;
            slot.datum = None;
            self.touch(idx);
            return None;
        }

        let displaced = if self.index.len() >= self.cachesize {
            self.evictable().and_then(|victim| self.evict(victim))
        } else {
            None
        };

        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };

        self.slots[idx] = Some(CacheSlot {
            offset,
            bucket,
            dirty,
            hits: 0,
            datum: None,
            prev: None,
            next: None,
        });
        self.index.insert(offset, idx);
        self.push_front(idx);

        displaced
    }

    /// Resize the cache.  Shrinking evicts least recently used entries
    /// (the current bucket stays); the returned images need writing
    /// back.  An explicit resize leaves automatic sizing behind.
    pub fn set_cachesize(&mut self, cachesize: usize, auto_sized: bool) -> Vec<(u64, Bucket)> {
        self.cachesize = cachesize.max(1);
        self.auto_sized = auto_sized;

        let mut displaced = Vec::new();
        while self.index.len() > self.cachesize {
            match self.evictable() {
                Some(victim) => displaced.extend(self.evict(victim)),
                None => break,
            }
        }

        displaced
    }

    pub fn dirty_list(&self) -> Vec<(u64, &Bucket)> {
        let mut list: Vec<(u64, &Bucket)> = self
            .slots
            .iter()
            .flatten()
            .filter(|slot| slot.dirty)
            .map(|slot| (slot.offset, &slot.bucket))
            .collect();
        list.sort_by_key(|(offset, _)| *offset);

        list
    }

    pub fn clear_dirty(&mut self) {
        self.slots
            .iter_mut()
            .flatten()
            .for_each(|slot| slot.dirty = false);
    }

    /// Offsets currently cached, most recently used first.
    pub fn cached_offsets(&self) -> Vec<u64> {
        let mut offsets = Vec::with_capacity(self.index.len());
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            offsets.push(self.slot(idx).offset);
            cursor = self.slot(idx).next;
        }

        offsets
    }
}
