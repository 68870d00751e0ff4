//! Bucket splitting and directory growth

use crate::bucket::Bucket;
use crate::error::{Capacity, Result};
use crate::storage::AvailElem;

use super::HashTable;

impl HashTable {
    /// Split the bucket that `hash` maps to until it has a free slot
    pub(super) fn ensure_room(&mut self, hash: u32) -> Result<()> {
        loop {
            let index = self.dir.index(hash);
            let offset = self.dir.locate(hash);
            let bucket = self.bucket_at(offset)?;
            if !bucket.is_full() {
                return Ok(());
            }

            if bucket.bits >= self.dir.bits() {
                self.grow_directory()?;
                continue;
            }
            self.split_bucket(index, offset, &bucket)?;
        }
    }

    /// Replace a full bucket by two new buckets one bit deeper
    ///
    /// The old block is released only after the directory that no longer
    /// names it reaches the disk.
    fn split_bucket(&mut self, index: usize, offset: u64, bucket: &Bucket) -> Result<()> {
        // Step 1: Redistribute entries
        let new_bits = bucket.bits + 1;
        let (low, high) = bucket.split(new_bits);

        // Step 2: Two new blocks
        let low_offset = self.alloc_block()?;
        let high_offset = self.alloc_block()?;

        // Step 3: Repoint the old directory run, half and half
        let range = self.dir.bucket_range(index, bucket.bits);
        let mid = range.start + range.len() / 2;
        self.dir.set_range(range.start..mid, low_offset);
        self.dir.set_range(mid..range.end, high_offset);
        self.dir_dirty = true;

        // Step 4: Cache the halves, retire the old bucket
        let cache = self.cache.get_mut();
        cache.remove(offset);
        cache.put_dirty(low_offset, low);
        cache.put_dirty(high_offset, high);
        self.defer_free(AvailElem::new(offset, self.header.block_size));

        tracing::trace!(
            "Split bucket {} (bits={}) into {} and {}",
            offset,
            bucket.bits,
            low_offset,
            high_offset
        );
        Ok(())
    }

    /// Double the directory into a new region
    ///
    /// The old region stays intact until the header naming the new one has
    /// been written; a failed allocation leaves the current directory as is.
    fn grow_directory(&mut self) -> Result<()> {
        let doubled = self.dir.doubled()?;
        let new_len = doubled.byte_len();
        if new_len > (u32::MAX - self.header.block_size) as u64 {
            return Err(Capacity::DirOverflow.into());
        }

        let new_offset = self.extend(new_len as u32)?;
        let old = AvailElem::new(self.header.dir_offset, self.dir.byte_len() as u32);

        self.dir = doubled;
        self.header.dir_offset = new_offset;
        self.header.dir_bits = self.dir.bits();
        self.header_dirty = true;
        self.dir_dirty = true;
        if let Some(cow) = self.cow.as_mut() {
            cow.dir_fresh = true;
        }
        self.defer_free(old);

        tracing::trace!(
            "Directory doubled to {} bits at offset {}",
            self.dir.bits(),
            new_offset
        );
        Ok(())
    }
}
