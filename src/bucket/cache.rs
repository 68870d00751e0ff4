//! Bucket cache
//!
//! Decoded buckets keyed by file offset. Readers share buckets through
//! `Arc`; a writer replaces the cached bucket and marks it dirty until the
//! end of the update writes it out. Dirty buckets are never evicted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::page::Bucket;

#[derive(Debug)]
struct Slot {
    bucket: Arc<Bucket>,
    last_used: u64,
}

#[derive(Debug)]
pub struct BucketCache {
    capacity: usize,
    slots: HashMap<u64, Slot>,
    dirty: HashSet<u64>,
    tick: u64,
}

impl BucketCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: HashMap::new(),
            dirty: HashSet::new(),
            tick: 0,
        }
    }

    pub fn get(&mut self, offset: u64) -> Option<Arc<Bucket>> {
        self.tick += 1;
        let tick = self.tick;
        self.slots.get_mut(&offset).map(|slot| {
            slot.last_used = tick;
            Arc::clone(&slot.bucket)
        })
    }

    /// Cache a bucket just read from disk
    pub fn insert(&mut self, offset: u64, bucket: Arc<Bucket>) {
        self.tick += 1;
        self.slots.insert(
            offset,
            Slot {
                bucket,
                last_used: self.tick,
            },
        );
        self.evict();
    }

    /// Cache a modified bucket; it stays pinned until `mark_clean`
    pub fn put_dirty(&mut self, offset: u64, bucket: Bucket) {
        self.dirty.insert(offset);
        self.insert(offset, Arc::new(bucket));
    }

    /// Drop a bucket whose block is no longer referenced
    pub fn remove(&mut self, offset: u64) {
        self.slots.remove(&offset);
        self.dirty.remove(&offset);
    }

    /// Dirty buckets in offset order; they stay dirty until written
    pub fn dirty(&self) -> Vec<(u64, Arc<Bucket>)> {
        let mut out: Vec<(u64, Arc<Bucket>)> = self
            .dirty
            .iter()
            .filter_map(|offset| {
                self.slots
                    .get(offset)
                    .map(|slot| (*offset, Arc::clone(&slot.bucket)))
            })
            .collect();
        out.sort_by_key(|(offset, _)| *offset);
        out
    }

    /// The bucket at `offset` is on disk
    pub fn mark_clean(&mut self, offset: u64) {
        if self.dirty.remove(&offset) {
            self.evict();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.len()
    }

    fn evict(&mut self) {
        while self.slots.len() > self.capacity {
            let victim = self
                .slots
                .iter()
                .filter(|(offset, _)| !self.dirty.contains(offset))
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(offset, _)| *offset);
            match victim {
                Some(offset) => {
                    self.slots.remove(&offset);
                }
                None => break,
            }
        }
    }
}
