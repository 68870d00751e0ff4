//! Bucket pages
//!
//! A bucket is one block holding a fixed number of entry slots, addressed by
//! open addressing with linear probing from `hash % elems`. Each entry caches
//! the hash, the first key bytes and the location of the record, so most
//! mismatches are rejected without touching the record itself.
//!
//! ## Encoding
//! ```text
//! ┌──────────┬───────────┬──────────────┬─────────┬──────────────────────┐
//! │ Bits (4) │ Count (4) │ AvCount (4)  │ Rsv (4) │ Avail [6] × 16 bytes │
//! ├──────────┴───────────┴──────────────┴─────────┴──────────────────────┤
//! │ Slots: [Hash (4) KeyStart (4) Offset (8) KeySize (4) DataSize (4)]   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

use bytes::{Buf, BufMut};

use crate::error::Corruption;
use crate::hash::{self, split_bit, HASH_BITS, KEY_START};
use crate::storage::avail::{AvailElem, AVAIL_ELEM_SIZE};

/// Slots in the bucket-local avail table
pub const BUCKET_AVAIL: usize = 6;

/// Bytes before the first entry slot
pub const BUCKET_HEADER_SIZE: usize = 16 + BUCKET_AVAIL * AVAIL_ELEM_SIZE;

/// Encoded size of one entry slot
pub const BUCKET_ENTRY_SIZE: usize = 24;

/// Hash value marking an unused slot
pub const EMPTY_HASH: u32 = u32::MAX;

/// Entry slots in a bucket of `block_size` bytes
pub fn elems_for(block_size: u32) -> u32 {
    ((block_size as usize).saturating_sub(BUCKET_HEADER_SIZE) / BUCKET_ENTRY_SIZE) as u32
}

/// One slot of a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketEntry {
    pub hash: u32,
    pub key_start: [u8; KEY_START],
    pub data_offset: u64,
    pub key_size: u32,
    pub data_size: u32,
}

impl BucketEntry {
    pub const EMPTY: BucketEntry = BucketEntry {
        hash: EMPTY_HASH,
        key_start: [0; KEY_START],
        data_offset: 0,
        key_size: 0,
        data_size: 0,
    };

    pub fn is_empty(&self) -> bool {
        self.hash == EMPTY_HASH
    }

    /// Bytes taken by the record (key followed by value)
    pub fn record_len(&self) -> u64 {
        self.key_size as u64 + self.data_size as u64
    }

    pub fn record_end(&self) -> u64 {
        self.data_offset.saturating_add(self.record_len())
    }

    /// Cheap pre-check before comparing the full key
    pub fn may_hold(&self, hash: u32, key: &[u8]) -> bool {
        self.hash == hash
            && self.key_size as usize == key.len()
            && self.key_start == hash::key_start(key)
    }
}

/// Decoded bucket page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    /// Local depth: number of hash bits shared by every key in the bucket
    pub bits: u32,
    pub count: u32,
    /// Small freed ranges, sorted by size
    pub avail: Vec<AvailElem>,
    pub slots: Vec<BucketEntry>,
}

impl Bucket {
    pub fn new(bits: u32, elems: u32) -> Self {
        Self {
            bits,
            count: 0,
            avail: Vec::with_capacity(BUCKET_AVAIL),
            slots: vec![BucketEntry::EMPTY; elems as usize],
        }
    }

    pub fn elems(&self) -> usize {
        self.slots.len()
    }

    pub fn is_full(&self) -> bool {
        self.count as usize >= self.slots.len()
    }

    fn home(&self, hash: u32) -> usize {
        hash as usize % self.slots.len()
    }

    /// Slots whose cached hash and key prefix match, in probe order
    pub fn candidates<'a>(&'a self, hash: u32, key: &'a [u8]) -> impl Iterator<Item = usize> + 'a {
        let n = self.slots.len();
        let home = if n == 0 { 0 } else { self.home(hash) };
        (0..n)
            .map(move |i| (home + i) % n)
            .take_while(move |&slot| !self.slots[slot].is_empty())
            .filter(move |&slot| self.slots[slot].may_hold(hash, key))
    }

    /// Place an entry in the first free slot of its probe sequence
    ///
    /// Returns `None` if the bucket is full.
    pub fn insert(&mut self, entry: BucketEntry) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        let n = self.slots.len();
        let home = self.home(entry.hash);
        let slot = (0..n)
            .map(|i| (home + i) % n)
            .find(|&slot| self.slots[slot].is_empty())?;
        self.slots[slot] = entry;
        self.count += 1;
        Some(slot)
    }

    /// Remove the entry at `slot`, shifting later entries of the same probe
    /// run back so lookups never stop at the hole
    pub fn remove(&mut self, slot: usize) -> BucketEntry {
        let n = self.slots.len();
        let removed = self.slots[slot];
        if removed.is_empty() {
            return removed;
        }
        self.slots[slot] = BucketEntry::EMPTY;
        self.count -= 1;

        let mut hole = slot;
        let mut i = (slot + 1) % n;
        while !self.slots[i].is_empty() {
            let home = self.home(self.slots[i].hash);
            // Move the entry unless its home lies cyclically in (hole, i]
            let stays = if hole <= i {
                hole < home && home <= i
            } else {
                hole < home || home <= i
            };
            if !stays {
                self.slots[hole] = self.slots[i];
                self.slots[i] = BucketEntry::EMPTY;
                hole = i;
            }
            i = (i + 1) % n;
        }
        removed
    }

    /// Occupied slots with their index
    pub fn entries(&self) -> impl Iterator<Item = (usize, &BucketEntry)> {
        self.slots.iter().enumerate().filter(|(_, e)| !e.is_empty())
    }

    /// Track a freed range locally; returns it back if the table is full
    pub fn avail_put(&mut self, elem: AvailElem) -> Option<AvailElem> {
        if self.avail.len() >= BUCKET_AVAIL {
            return Some(elem);
        }
        let pos = self.avail.binary_search(&elem).unwrap_or_else(|e| e);
        self.avail.insert(pos, elem);
        None
    }

    /// Smallest local free range of at least `size` bytes
    pub fn avail_take(&mut self, size: u32) -> Option<AvailElem> {
        let pos = self.avail.partition_point(|e| e.size < size);
        (pos < self.avail.len()).then(|| self.avail.remove(pos))
    }

    /// Distribute the entries over two buckets of depth `new_bits`, by the
    /// hash bit that the deeper directory range adds
    pub fn split(&self, new_bits: u32) -> (Bucket, Bucket) {
        let elems = self.slots.len() as u32;
        let mut low = Bucket::new(new_bits, elems);
        let mut high = Bucket::new(new_bits, elems);

        for (_, entry) in self.entries() {
            let target = if split_bit(entry.hash, new_bits) == 0 {
                &mut low
            } else {
                &mut high
            };
            // Cannot fail: each half has as many slots as the original
            let _ = target.insert(*entry);
        }

        for (i, elem) in self.avail.iter().enumerate() {
            let target = if i % 2 == 0 { &mut low } else { &mut high };
            let _ = target.avail_put(*elem);
        }

        (low, high)
    }

    /// Encode into a full block
    pub fn encode(&self, block_size: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(block_size as usize);
        buf.put_u32_le(self.bits);
        buf.put_u32_le(self.count);
        buf.put_u32_le(self.avail.len() as u32);
        buf.put_u32_le(0);
        for elem in &self.avail {
            buf.put_u64_le(elem.offset);
            buf.put_u32_le(elem.size);
            buf.put_u32_le(0);
        }
        buf.put_bytes(0, (BUCKET_AVAIL - self.avail.len()) * AVAIL_ELEM_SIZE);
        for entry in &self.slots {
            buf.put_u32_le(entry.hash);
            buf.put_slice(&entry.key_start);
            buf.put_u64_le(entry.data_offset);
            buf.put_u32_le(entry.key_size);
            buf.put_u32_le(entry.data_size);
        }
        buf.resize(block_size as usize, 0);
        buf
    }

    /// Decode a bucket read from `offset`, checking its structure
    pub fn decode(block: &[u8], offset: u64, elems: u32) -> Result<Self, Corruption> {
        let bad = |reason: String| Corruption::BadBucket { offset, reason };

        let needed = BUCKET_HEADER_SIZE + elems as usize * BUCKET_ENTRY_SIZE;
        if block.len() < needed {
            return Err(bad(format!("{} bytes, need {}", block.len(), needed)));
        }

        let mut buf = block;
        let bits = buf.get_u32_le();
        let count = buf.get_u32_le();
        let av_count = buf.get_u32_le() as usize;
        let _reserved = buf.get_u32_le();

        if bits > HASH_BITS {
            return Err(bad(format!("depth {} exceeds {} bits", bits, HASH_BITS)));
        }
        if count > elems {
            return Err(bad(format!("count {} exceeds capacity {}", count, elems)));
        }
        if av_count > BUCKET_AVAIL {
            return Err(bad(format!("avail count {} exceeds {}", av_count, BUCKET_AVAIL)));
        }

        let mut avail = Vec::with_capacity(BUCKET_AVAIL);
        for i in 0..BUCKET_AVAIL {
            let off = buf.get_u64_le();
            let size = buf.get_u32_le();
            let _reserved = buf.get_u32_le();
            if i < av_count {
                avail.push(AvailElem::new(off, size));
            }
        }

        let mut slots = Vec::with_capacity(elems as usize);
        let mut occupied = 0u32;
        for _ in 0..elems {
            let hash = buf.get_u32_le();
            let mut key_start = [0u8; KEY_START];
            buf.copy_to_slice(&mut key_start);
            let entry = BucketEntry {
                hash,
                key_start,
                data_offset: buf.get_u64_le(),
                key_size: buf.get_u32_le(),
                data_size: buf.get_u32_le(),
            };
            if !entry.is_empty() {
                if entry.hash > 0x7FFF_FFFF {
                    return Err(Corruption::BadHashEntry {
                        offset,
                        reason: format!("hash {:#x} out of range", entry.hash),
                    });
                }
                occupied += 1;
            }
            slots.push(entry);
        }

        if occupied != count {
            return Err(bad(format!(
                "count {} but {} occupied slots",
                count, occupied
            )));
        }

        Ok(Self {
            bits,
            count,
            avail,
            slots,
        })
    }

    /// Check every record extent and local free range against the
    /// allocated end of the file
    pub fn validate_extents(&self, offset: u64, lower: u64, upper: u64) -> Result<(), Corruption> {
        for (slot, entry) in self.entries() {
            if entry.data_offset < lower || entry.record_end() > upper {
                return Err(Corruption::BadHashEntry {
                    offset,
                    reason: format!(
                        "slot {} record {}+{} outside file",
                        slot,
                        entry.data_offset,
                        entry.record_len()
                    ),
                });
            }
        }
        for elem in &self.avail {
            if elem.offset < lower || elem.end() > upper {
                return Err(Corruption::BadBucket {
                    offset,
                    reason: format!("avail range {}+{} outside file", elem.offset, elem.size),
                });
            }
        }
        Ok(())
    }
}
