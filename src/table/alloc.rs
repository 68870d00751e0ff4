//! Space allocation
//!
//! Records come from the bucket's own free list first, then from the header
//! avail table (smallest range that fits), then from the end of the file in
//! whole blocks. Whatever is left over from a range is returned to the free
//! lists unless it is too small to track.

use std::mem;

use crate::bucket::Bucket;
use crate::error::{Capacity, Corruption, DbmError, IoOp, Result};
use crate::failpoint;
use crate::storage::avail::IGNORE_SMALL;
use crate::storage::{AvailBlock, AvailElem};

use super::HashTable;

impl HashTable {
    /// Space for a record of `size` bytes
    pub(super) fn alloc_record(&mut self, bucket: &mut Bucket, size: u32) -> Result<u64> {
        if let Some(elem) = bucket.avail_take(size) {
            self.release_leftover(elem, size)?;
            return Ok(elem.offset);
        }
        self.alloc(size)
    }

    /// One block for a bucket; in copy-on-write mode it may be rewritten
    /// freely until the next commit
    pub(super) fn alloc_block(&mut self) -> Result<u64> {
        let offset = self.alloc(self.header.block_size)?;
        if let Some(cow) = self.cow.as_mut() {
            cow.fresh.insert(offset);
        }
        Ok(offset)
    }

    /// Space from the header avail table, or from the end of the file
    pub(super) fn alloc(&mut self, size: u32) -> Result<u64> {
        // Step 1: Refill an empty table from the overflow chain
        if self.header.avail.is_empty() && self.header.avail.next != 0 {
            self.pop_avail_block()?;
        }

        // Step 2: Smallest free range that fits
        if let Some(elem) = self.header.avail.take(size) {
            self.header_dirty = true;
            self.release_leftover(elem, size)?;
            return Ok(elem.offset);
        }

        // Step 3: Grow the file
        self.extend(size)
    }

    /// Allocate whole blocks at the end of the file
    ///
    /// The returned offset is always block aligned.
    pub(super) fn extend(&mut self, size: u32) -> Result<u64> {
        let block = self.header.block_size as u64;
        let len = (size as u64).div_ceil(block).max(1) * block;
        let offset = self.header.next_block;
        let end = offset
            .checked_add(len)
            .ok_or(Capacity::RecordTooLarge(size as usize))?;

        // The header never names space the file does not have
        if self.file.len()? < end {
            failpoint::check(failpoint::FILE_GROW).map_err(DbmError::io(IoOp::Truncate))?;
            self.file.set_len(end)?;
        }
        self.header.next_block = end;
        self.header_dirty = true;

        if len > size as u64 {
            self.release(AvailElem::new(offset + size as u64, (len - size as u64) as u32))?;
        }
        Ok(offset)
    }

    fn release_leftover(&mut self, elem: AvailElem, used: u32) -> Result<()> {
        let rest = elem.size - used;
        if rest > IGNORE_SMALL {
            self.release(AvailElem::new(elem.offset + used as u64, rest))?;
        }
        Ok(())
    }

    /// Make a range reusable right away (header avail table)
    pub(super) fn release(&mut self, elem: AvailElem) -> Result<()> {
        if elem.size <= IGNORE_SMALL {
            return Ok(());
        }
        if self.header.avail.is_full() {
            self.push_avail_block()?;
        }
        self.header.avail.insert(elem);
        self.header_dirty = true;
        Ok(())
    }

    /// Give back the space of a dropped record
    ///
    /// Small ranges stay with the bucket; in copy-on-write mode the range
    /// still belongs to the last commit and waits for the next one.
    pub(super) fn free_record(&mut self, bucket: &mut Bucket, elem: AvailElem) -> Result<()> {
        if self.cow.is_some() {
            self.defer_free(elem);
            return Ok(());
        }
        if elem.size <= IGNORE_SMALL {
            return Ok(());
        }
        if elem.size < self.header.block_size {
            match bucket.avail_put(elem) {
                None => Ok(()),
                Some(elem) => self.release(elem),
            }
        } else {
            self.release(elem)
        }
    }

    pub(super) fn defer_free(&mut self, elem: AvailElem) {
        self.pending_free.push(elem);
    }

    pub(super) fn release_pending(&mut self) -> Result<()> {
        for elem in mem::take(&mut self.pending_free) {
            self.release(elem)?;
        }
        Ok(())
    }

    /// Move half of the full header table into a new overflow block
    fn push_avail_block(&mut self) -> Result<()> {
        let mut overflow = self.header.avail.split_half();
        let len = AvailBlock::encoded_len(overflow.capacity) as u32;

        // From the end of the file: the header table must not be consulted
        let offset = self.extend(len)?;
        overflow.next = self.header.avail.next;
        self.file.write_at(offset, &overflow.encode())?;

        self.header.avail.next = offset;
        self.header_dirty = true;
        tracing::trace!(
            "Pushed {} free ranges to overflow block at {}",
            overflow.len(),
            offset
        );
        Ok(())
    }

    /// Refill the empty header table from the first overflow block
    fn pop_avail_block(&mut self) -> Result<()> {
        let offset = self.header.avail.next;
        let capacity = self.header.avail.capacity;
        let len = AvailBlock::encoded_len(capacity);
        let block_size = self.header.block_size as u64;

        if offset < block_size || offset.saturating_add(len as u64) > self.header.next_block {
            return Err(Corruption::BadAvail(format!(
                "overflow block at {} outside allocated space",
                offset
            ))
            .into());
        }
        let overflow = AvailBlock::decode(&self.file.read_vec(offset, len)?)?;
        if overflow.capacity != capacity {
            return Err(Corruption::BadAvail(format!(
                "overflow block at {} has capacity {}, expected {}",
                offset, overflow.capacity, capacity
            ))
            .into());
        }
        overflow.validate(block_size, self.header.next_block)?;

        self.header.avail.elems = overflow.elems;
        self.header.avail.next = overflow.next;
        self.header_dirty = true;

        // The block itself is free now
        let own = AvailElem::new(offset, len as u32);
        if self.cow.is_some() {
            self.defer_free(own);
        } else if !self.header.avail.is_full() {
            self.release(own)?;
        }
        tracing::trace!("Popped overflow block at {}", offset);
        Ok(())
    }
}
