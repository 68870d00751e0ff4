//! Bucket directory
//!
//! `2^bits` bucket offsets indexed by the top `bits` bits of a key hash. A
//! bucket of local depth `b` is referenced by a contiguous, aligned run of
//! `2^(bits - b)` entries.

use std::collections::HashSet;
use std::ops::Range;

use bytes::{Buf, BufMut};

use crate::error::{Capacity, Corruption};
use crate::hash::{dir_index, HASH_BITS};
use crate::storage::header::DIR_ENTRY_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    bits: u32,
    entries: Vec<u64>,
}

impl Directory {
    /// Directory whose every entry points at `bucket`
    pub fn new(bits: u32, bucket: u64) -> Self {
        Self {
            bits,
            entries: vec![bucket; 1usize << bits],
        }
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Size of the encoded directory in bytes
    pub fn byte_len(&self) -> u64 {
        (self.entries.len() * DIR_ENTRY_SIZE) as u64
    }

    pub fn entries(&self) -> &[u64] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<u64> {
        self.entries.get(index).copied()
    }

    /// Directory slot for a key hash
    pub fn index(&self, hash: u32) -> usize {
        dir_index(hash, self.bits)
    }

    /// Bucket offset for a key hash
    pub fn locate(&self, hash: u32) -> u64 {
        self.entries[self.index(hash)]
    }

    /// The run of entries that a bucket of depth `bucket_bits` referenced
    /// from `index` occupies
    pub fn bucket_range(&self, index: usize, bucket_bits: u32) -> Range<usize> {
        let span = 1usize << (self.bits - bucket_bits.min(self.bits));
        let start = index & !(span - 1);
        start..start + span
    }

    /// Point every entry in `range` at `bucket`
    pub fn set_range(&mut self, range: Range<usize>, bucket: u64) {
        for entry in &mut self.entries[range] {
            *entry = bucket;
        }
    }

    /// A directory one bit deeper, each entry duplicated in place
    pub fn doubled(&self) -> Result<Directory, Capacity> {
        if self.bits >= HASH_BITS {
            return Err(Capacity::DirOverflow);
        }
        let len = self
            .entries
            .len()
            .checked_mul(2)
            .filter(|n| n.checked_mul(DIR_ENTRY_SIZE).is_some())
            .ok_or(Capacity::DirOverflow)?;

        let mut entries = Vec::with_capacity(len);
        for &bucket in &self.entries {
            entries.push(bucket);
            entries.push(bucket);
        }
        Ok(Directory {
            bits: self.bits + 1,
            entries,
        })
    }

    /// First index after `index` that names a different bucket
    pub fn next_distinct(&self, index: usize) -> usize {
        let Some(&current) = self.entries.get(index) else {
            return self.entries.len();
        };
        let mut next = index + 1;
        while next < self.entries.len() && self.entries[next] == current {
            next += 1;
        }
        next
    }

    /// Distinct bucket offsets in directory order
    pub fn buckets(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        let mut index = 0;
        std::iter::from_fn(move || {
            let bucket = *self.entries.get(index)?;
            let at = index;
            index = self.next_distinct(index);
            Some((at, bucket))
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.entries.len() * DIR_ENTRY_SIZE);
        for &entry in &self.entries {
            buf.put_u64_le(entry);
        }
        buf
    }

    pub fn decode(mut buf: &[u8], bits: u32) -> Result<Self, Corruption> {
        let len = 1usize << bits;
        if buf.len() < len * DIR_ENTRY_SIZE {
            return Err(Corruption::BadHashTable(format!(
                "directory of {} bytes, need {}",
                buf.len(),
                len * DIR_ENTRY_SIZE
            )));
        }
        let entries = (0..len).map(|_| buf.get_u64_le()).collect();
        Ok(Self { bits, entries })
    }

    /// Every entry must name a whole block inside the allocated area, and
    /// the entries naming one bucket must be contiguous
    pub fn validate(&self, block_size: u32, next_block: u64) -> Result<(), Corruption> {
        let block = block_size as u64;
        let mut seen = HashSet::new();
        let mut previous = None;
        for (index, &offset) in self.entries.iter().enumerate() {
            if offset < block || offset.saturating_add(block) > next_block {
                return Err(Corruption::BadDirEntry { index, offset });
            }
            if previous != Some(offset) && !seen.insert(offset) {
                return Err(Corruption::BadDirEntry { index, offset });
            }
            previous = Some(offset);
        }
        Ok(())
    }
}
