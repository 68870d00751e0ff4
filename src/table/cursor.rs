//! Iteration cursor
//!
//! A cursor is a plain position (directory index, slot). Every step
//! re-reads the directory and bucket under the caller's lock and checks the
//! position against their current bounds, so a cursor left over from before
//! a mutation can skip or repeat entries but never read out of bounds.

use crate::bucket::BucketEntry;
use crate::error::Result;

use super::HashTable;

/// Position of the next entry to visit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    pub dir_index: usize,
    pub slot: usize,
}

impl Cursor {
    pub fn start() -> Self {
        Self::default()
    }
}

impl HashTable {
    /// First occupied entry at or after `cursor`, with the position after it
    fn next_entry(&self, cursor: Cursor) -> Result<Option<(u64, BucketEntry, Cursor)>> {
        let mut index = cursor.dir_index;
        let mut slot = cursor.slot;

        while let Some(offset) = self.dir.get(index) {
            let bucket = self.bucket_at(offset)?;
            while slot < bucket.elems() {
                let entry = bucket.slots[slot];
                slot += 1;
                if !entry.is_empty() {
                    let next = Cursor {
                        dir_index: index,
                        slot,
                    };
                    return Ok(Some((offset, entry, next)));
                }
            }
            // Other entries of the same run name the same bucket
            index = self.dir.next_distinct(index);
            slot = 0;
        }
        Ok(None)
    }

    /// Next key, or `None` once every bucket has been visited
    pub fn next_key(&self, cursor: Cursor) -> Result<Option<(Vec<u8>, Cursor)>> {
        let Some((offset, entry, next)) = self.next_entry(cursor)? else {
            return Ok(None);
        };
        let mut record = self.read_record(offset, &entry)?;
        record.truncate(entry.key_size as usize);
        Ok(Some((record, next)))
    }

    /// Next key and value
    pub fn next_record(&self, cursor: Cursor) -> Result<Option<(Vec<u8>, Vec<u8>, Cursor)>> {
        let Some((offset, entry, next)) = self.next_entry(cursor)? else {
            return Ok(None);
        };
        let mut key = self.read_record(offset, &entry)?;
        let value = key.split_off(entry.key_size as usize);
        Ok(Some((key, value, next)))
    }
}
