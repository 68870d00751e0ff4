//! Avail (free space) tables
//!
//! A table of reclaimed file ranges kept sorted by size, so an allocation
//! takes the smallest range that fits. The header holds one table; when it
//! fills up, half of it is pushed into an overflow block chained from the
//! header.
//!
//! ## Encoding
//! ```text
//! ┌──────────────┬───────────┬──────────┬──────────────────────────────┐
//! │ Capacity (4) │ Count (4) │ Next (8) │ [Offset (8) Size (4) Rsv (4)]│
//! └──────────────┴───────────┴──────────┴──────────────────────────────┘
//! ```

use bytes::{Buf, BufMut};

use crate::error::Corruption;

/// Encoded size of one element
pub const AVAIL_ELEM_SIZE: usize = 16;

/// Encoded size of the table prefix (capacity, count, next)
pub const AVAIL_HEADER_SIZE: usize = 16;

/// Ranges this small are not worth tracking
pub const IGNORE_SMALL: u32 = 4;

/// A free range of the file
///
/// Ordering is by size first, so a sorted table is a size-class index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AvailElem {
    pub size: u32,
    pub offset: u64,
}

impl AvailElem {
    pub fn new(offset: u64, size: u32) -> Self {
        Self { size, offset }
    }

    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size as u64)
    }
}

/// A size-sorted table of free ranges
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailBlock {
    pub capacity: u32,
    /// File offset of the next overflow block, 0 if none
    pub next: u64,
    pub elems: Vec<AvailElem>,
}

impl AvailBlock {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            next: 0,
            elems: Vec::with_capacity(capacity as usize),
        }
    }

    /// Encoded size of a table with `capacity` slots
    pub fn encoded_len(capacity: u32) -> usize {
        AVAIL_HEADER_SIZE + capacity as usize * AVAIL_ELEM_SIZE
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.elems.len() >= self.capacity as usize
    }

    /// Insert keeping size order; the caller makes room first
    pub fn insert(&mut self, elem: AvailElem) {
        debug_assert!(!self.is_full());
        let pos = self.elems.binary_search(&elem).unwrap_or_else(|e| e);
        self.elems.insert(pos, elem);
    }

    /// Remove and return the smallest range of at least `size` bytes
    pub fn take(&mut self, size: u32) -> Option<AvailElem> {
        let pos = self.elems.partition_point(|e| e.size < size);
        if pos < self.elems.len() {
            Some(self.elems.remove(pos))
        } else {
            None
        }
    }

    /// Split the table in two, alternating elements so both halves keep a
    /// spread of sizes. `self` keeps the even positions.
    pub fn split_half(&mut self) -> AvailBlock {
        let mut other = AvailBlock::new(self.capacity);
        let mut keep = Vec::with_capacity(self.capacity as usize);
        for (i, elem) in self.elems.drain(..).enumerate() {
            if i % 2 == 0 {
                keep.push(elem);
            } else {
                other.elems.push(elem);
            }
        }
        self.elems = keep;
        other
    }

    /// Append the encoded table (always `encoded_len(capacity)` bytes)
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.put_u32_le(self.capacity);
        buf.put_u32_le(self.elems.len() as u32);
        buf.put_u64_le(self.next);
        for elem in &self.elems {
            buf.put_u64_le(elem.offset);
            buf.put_u32_le(elem.size);
            buf.put_u32_le(0);
        }
        let unused = self.capacity as usize - self.elems.len();
        buf.put_bytes(0, unused * AVAIL_ELEM_SIZE);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::encoded_len(self.capacity));
        self.encode_into(&mut buf);
        buf
    }

    /// Decode a table, checking its shape (not its ranges)
    pub fn decode(mut buf: &[u8]) -> Result<Self, Corruption> {
        if buf.len() < AVAIL_HEADER_SIZE {
            return Err(Corruption::BadAvail("truncated avail table".to_string()));
        }
        let capacity = buf.get_u32_le();
        let count = buf.get_u32_le();
        let next = buf.get_u64_le();

        if count > capacity {
            return Err(Corruption::BadAvail(format!(
                "count {} exceeds capacity {}",
                count, capacity
            )));
        }
        if buf.len() < count as usize * AVAIL_ELEM_SIZE {
            return Err(Corruption::BadAvail("truncated avail table".to_string()));
        }

        let mut elems = Vec::with_capacity(capacity as usize);
        for _ in 0..count {
            let offset = buf.get_u64_le();
            let size = buf.get_u32_le();
            let _reserved = buf.get_u32_le();
            elems.push(AvailElem { size, offset });
        }

        if elems.windows(2).any(|w| w[0] > w[1]) {
            return Err(Corruption::BadAvail("avail table is not sorted".to_string()));
        }

        Ok(Self {
            capacity,
            next,
            elems,
        })
    }

    /// Check that every range lies inside `[lower, upper)` of the file
    pub fn validate(&self, lower: u64, upper: u64) -> Result<(), Corruption> {
        for elem in &self.elems {
            if elem.offset < lower || elem.end() > upper {
                return Err(Corruption::BadAvail(format!(
                    "range {}+{} outside file",
                    elem.offset, elem.size
                )));
            }
        }
        if self.next != 0 && (self.next < lower || self.next >= upper) {
            return Err(Corruption::BadAvail(format!(
                "overflow block pointer {} outside file",
                self.next
            )));
        }
        Ok(())
    }
}
