//! Hash Table Engine
//!
//! The on-disk extendible hash table: lookups, inserts, deletes, counting
//! and iteration over one database file.
//!
//! ## Responsibilities
//! - Create and validate database files
//! - fetch / exists / store / delete / count
//! - Write dirty buckets, directory and header at the end of every update
//! - Copy-on-write operation and commits when crash tolerance is enabled
//!
//! ## Update Model
//!
//! Reads take `&self`: buckets are shared through the cache (behind a
//! `Mutex`) and the file is read with positional I/O. Mutations take
//! `&mut self` and end with `end_update`, which writes
//! buckets → directory → header in that order so the header never names
//! structures that are not on disk yet. Blocks that stop being referenced
//! during an update are released only after the header has been written.
//!
//! With crash tolerance the header is rewritten only by `commit`, and
//! nothing referenced by the last commit is overwritten before the next
//! one: buckets and the directory move to new blocks on their first change,
//! records always go to new space, and every release waits for the commit.

mod alloc;
mod cursor;
mod split;

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bucket::{Bucket, BucketCache, BucketEntry, Directory};
use crate::config::SyncStrategy;
use crate::error::{Capacity, Corruption, DbmError, IoOp, Result};
use crate::failpoint;
use crate::hash::{self, hash_key};
use crate::snapshot::SnapshotPair;
use crate::storage::{AvailElem, BlockFile, Format, Header};

pub use cursor::Cursor;

/// Engine settings taken from the open configuration
#[derive(Debug, Clone, Copy)]
pub struct TableOptions {
    pub writable: bool,
    pub xverify: bool,
    pub sync_strategy: SyncStrategy,
    pub cache_size: usize,
}

/// Copy-on-write bookkeeping between two commits
#[derive(Debug)]
struct CowState {
    snapshots: SnapshotPair,
    /// Bucket blocks allocated since the last commit
    fresh: HashSet<u64>,
    /// The directory already lives outside the committed region
    dir_fresh: bool,
}

/// A located entry
#[derive(Debug, Clone)]
struct Found {
    index: usize,
    slot: usize,
    entry: BucketEntry,
    /// Key bytes followed by value bytes
    record: Vec<u8>,
}

/// An open database file
pub struct HashTable {
    file: BlockFile,
    header: Header,
    dir: Directory,
    cache: Mutex<BucketCache>,
    opts: TableOptions,
    header_dirty: bool,
    dir_dirty: bool,
    /// Space that stops being referenced once the current update (or, in
    /// copy-on-write mode, the next commit) is on disk
    pending_free: Vec<AvailElem>,
    cow: Option<CowState>,
}

impl HashTable {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Initialize an empty file: header, one directory block, one bucket
    pub fn create(file: BlockFile, format: Format, block_size: u32, opts: TableOptions) -> Result<Self> {
        // Step 1: Geometry
        let header = Header::new(format, block_size);
        let bucket_offset = header.dir_offset + header.dir_size();
        let dir = Directory::new(header.dir_bits, bucket_offset);
        let bucket = Bucket::new(0, header.bucket_elems);

        // Step 2: Structures before the header that names them
        file.set_len(header.next_block)?;
        file.write_at(bucket_offset, &bucket.encode(block_size))?;
        file.write_at(header.dir_offset, &dir.encode())?;
        file.write_at(0, &header.encode())?;
        file.sync()?;

        tracing::debug!(
            "Created {} (block_size={}, format={:?})",
            file.path().display(),
            block_size,
            format
        );

        Ok(Self::from_parts(file, header, dir, opts))
    }

    /// Read and validate the header and directory of an existing file
    pub fn open(file: BlockFile, opts: TableOptions) -> Result<Self> {
        // Step 1: Non-empty file
        let file_len = file.len()?;
        if file_len == 0 {
            return Err(Corruption::EmptyDatabase.into());
        }

        // Step 2: Header
        let prefix = file.read_vec(0, file_len.min(12) as usize)?;
        let block_size = Header::peek_block_size(&prefix)?;
        let block = file.read_vec(0, block_size as usize)?;
        let header = Header::decode(&block)?;
        header.validate(file_len)?;

        // Step 3: Directory
        let dir_bytes = file.read_vec(header.dir_offset, header.dir_size() as usize)?;
        let dir = Directory::decode(&dir_bytes, header.dir_bits)?;
        dir.validate(header.block_size, header.next_block)?;

        tracing::debug!(
            "Opened {} (block_size={}, dir_bits={}, format={:?})",
            file.path().display(),
            header.block_size,
            header.dir_bits,
            header.format
        );

        Ok(Self::from_parts(file, header, dir, opts))
    }

    fn from_parts(file: BlockFile, header: Header, dir: Directory, opts: TableOptions) -> Self {
        Self {
            file,
            header,
            dir,
            cache: Mutex::new(BucketCache::new(opts.cache_size)),
            opts,
            header_dirty: false,
            dir_dirty: false,
            pending_free: Vec::new(),
            cow: None,
        }
    }

    /// Switch to copy-on-write operation and take the first snapshot
    pub fn enable_crash_tolerance(&mut self, snapshots: SnapshotPair) -> Result<()> {
        if !self.header.is_numsync() {
            return Err(DbmError::NotImplemented(
                "crash tolerance requires the extended (numsync) format",
            ));
        }
        self.end_update()?;
        self.cow = Some(CowState {
            snapshots,
            fresh: HashSet::new(),
            dir_fresh: false,
        });
        self.commit()
    }

    pub fn crash_tolerant(&self) -> bool {
        self.cow.is_some()
    }

    /// Flush everything and release the file
    ///
    /// In crash-tolerant mode this is a final commit after which the
    /// snapshots are no longer needed.
    pub fn close(mut self) -> Result<()> {
        self.end_update()?;
        if let Some(snapshots) = self.cow.as_ref().map(|cow| cow.snapshots.clone()) {
            self.commit()?;
            snapshots.remove()?;
        } else if self.opts.writable {
            self.file.sync()?;
        }
        self.file.unlock()?;
        tracing::debug!("Closed {}", self.file.path().display());
        Ok(())
    }

    /// Release the file without writing anything
    ///
    /// Unwritten changes are lost and snapshots are left for `restore`.
    pub fn abandon(mut self) -> Result<()> {
        tracing::warn!(
            "Released {} without flushing ({} pending bucket writes)",
            self.file.path().display(),
            self.cache.lock().dirty().len()
        );
        self.file.unlock()
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    pub fn fetch(&self, key: &[u8]) -> Result<Vec<u8>> {
        match self.find(key)? {
            Some(found) => Ok(found.record[key.len()..].to_vec()),
            None => Err(DbmError::NotFound),
        }
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.find(key)?.is_some())
    }

    /// Number of live records
    ///
    /// The extended format keeps a counter in the header; the standard
    /// format walks every bucket.
    pub fn count(&self) -> Result<u64> {
        if self.header.is_numsync() {
            Ok(self.header.record_count)
        } else {
            self.traverse_count()
        }
    }

    fn traverse_count(&self) -> Result<u64> {
        let mut total = 0u64;
        for (_, offset) in self.dir.buckets() {
            total += self.bucket_at(offset)?.count as u64;
        }
        Ok(total)
    }

    fn find(&self, key: &[u8]) -> Result<Option<Found>> {
        let hash = hash_key(key);
        let index = self.dir.index(hash);
        let offset = self.dir.locate(hash);
        let bucket = self.bucket_at(offset)?;

        for slot in bucket.candidates(hash, key) {
            let entry = bucket.slots[slot];
            let record = self.read_record(offset, &entry)?;
            if &record[..key.len()] == key {
                return Ok(Some(Found {
                    index,
                    slot,
                    entry,
                    record,
                }));
            }
        }
        Ok(None)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Insert or replace a record
    ///
    /// Steps:
    /// 1. Look for the key; an existing key needs `replace`
    /// 2. Split buckets until the target has a free slot
    /// 3. Write the record, then insert the entry
    /// 4. End the update
    pub fn store(&mut self, key: &[u8], value: &[u8], replace: bool) -> Result<()> {
        let size = record_size(key, value, self.header.block_size)?;

        // Step 1: Existing key
        if let Some(found) = self.find(key)? {
            if !replace {
                return Err(DbmError::CannotReplace);
            }
            return self.replace_value(found, key, value, size);
        }

        // Step 2: Room in the target bucket
        let hash = hash_key(key);
        self.ensure_room(hash)?;

        // Step 3: Record, then entry
        let index = self.dir.index(hash);
        let (offset, mut bucket) = self.bucket_for_update(index)?;
        let data_offset = self.alloc_record(&mut bucket, size)?;
        self.write_record(data_offset, key, value)?;

        let entry = BucketEntry {
            hash,
            key_start: hash::key_start(key),
            data_offset,
            key_size: key.len() as u32,
            data_size: value.len() as u32,
        };
        if bucket.insert(entry).is_none() {
            return Err(Corruption::BadBucket {
                offset,
                reason: "no free slot after split".to_string(),
            }
            .into());
        }
        self.put_bucket(offset, bucket);
        self.header.record_count += 1;
        self.header_dirty = true;

        // Step 4: Persist
        self.end_update()
    }

    fn replace_value(&mut self, found: Found, key: &[u8], value: &[u8], size: u32) -> Result<()> {
        let old = found.entry;

        // Same size and no committed state to protect: overwrite in place
        if self.cow.is_none() && old.record_len() == size as u64 {
            self.file.write_at(old.data_offset + key.len() as u64, value)?;
            return self.end_update();
        }

        let (offset, mut bucket) = self.bucket_for_update(found.index)?;
        let data_offset = self.alloc_record(&mut bucket, size)?;
        self.write_record(data_offset, key, value)?;

        let slot = &mut bucket.slots[found.slot];
        slot.data_offset = data_offset;
        slot.data_size = value.len() as u32;

        self.free_record(&mut bucket, AvailElem::new(old.data_offset, old.record_len() as u32))?;
        self.put_bucket(offset, bucket);
        self.end_update()
    }

    /// Remove a record; its space goes back to the free lists
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        let found = self.find(key)?.ok_or(DbmError::NotFound)?;

        let (offset, mut bucket) = self.bucket_for_update(found.index)?;
        let entry = bucket.remove(found.slot);
        self.free_record(&mut bucket, AvailElem::new(entry.data_offset, entry.record_len() as u32))?;
        self.put_bucket(offset, bucket);

        self.header.record_count = self.header.record_count.saturating_sub(1);
        self.header_dirty = true;
        self.end_update()
    }

    /// Switch between the standard and extended formats in place
    pub fn convert(&mut self, numsync: bool) -> Result<()> {
        let target = if numsync { Format::Numsync } else { Format::Standard };
        if self.header.format == target {
            return Ok(());
        }
        if self.cow.is_some() {
            return Err(DbmError::Usage(
                "crash tolerance requires the extended format".to_string(),
            ));
        }
        if target == Format::Numsync {
            self.header.record_count = self.traverse_count()?;
        }
        self.header.format = target;
        self.header_dirty = true;
        tracing::debug!("Converted {} to {:?} format", self.file.path().display(), target);
        self.end_update()
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Write dirty buckets and the directory
    fn flush_pages(&mut self) -> Result<()> {
        let block_size = self.header.block_size;

        // Step 1: Buckets
        for (offset, bucket) in self.cache.get_mut().dirty() {
            self.file.write_at(offset, &bucket.encode(block_size))?;
            self.cache.get_mut().mark_clean(offset);
        }

        // Step 2: Directory, moved out of the committed region first
        if self.dir_dirty {
            let relocate = self.cow.as_ref().is_some_and(|cow| !cow.dir_fresh);
            if relocate {
                let old = AvailElem::new(self.header.dir_offset, self.dir.byte_len() as u32);
                self.header.dir_offset = self.extend(self.dir.byte_len() as u32)?;
                self.defer_free(old);
                if let Some(cow) = self.cow.as_mut() {
                    cow.dir_fresh = true;
                }
                self.header_dirty = true;
            }
            self.file.write_at(self.header.dir_offset, &self.dir.encode())?;
            self.dir_dirty = false;
        }
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        if self.header_dirty {
            self.file.write_at(0, &self.header.encode())?;
            self.header_dirty = false;
        }
        Ok(())
    }

    /// Bring the file in line with the in-memory state after a mutation
    pub(crate) fn end_update(&mut self) -> Result<()> {
        self.flush_pages()?;

        // In copy-on-write mode only a commit rewrites the header
        if self.cow.is_some() {
            if self.opts.sync_strategy == SyncStrategy::EveryWrite {
                self.commit()?;
            }
            return Ok(());
        }

        self.write_header()?;
        if self.opts.sync_strategy == SyncStrategy::EveryWrite {
            self.file.sync()?;
        }

        // Space dropped by this update is no longer named by the header
        if !self.pending_free.is_empty() {
            self.release_pending()?;
            self.write_header()?;
        }
        Ok(())
    }

    /// Make all changes durable
    pub fn sync(&mut self) -> Result<()> {
        if self.cow.is_some() {
            return self.commit();
        }
        self.end_update()?;
        if self.header.is_numsync() {
            self.header.numsync += 1;
            self.header_dirty = true;
            self.write_header()?;
        }
        self.file.sync()
    }

    /// Crash-tolerant commit
    ///
    /// Steps:
    /// 1. Write and fsync everything the new header refers to
    /// 2. Advance the sync sequence number
    /// 3. Capture header + directory in the stale snapshot slot
    /// 4. Write the header in place and fsync
    /// 5. Release the blocks the previous state referenced
    fn commit(&mut self) -> Result<()> {
        // Step 1: Pages
        self.flush_pages()?;
        self.file.sync()?;

        // Step 2: Sequence number
        self.header.numsync += 1;
        self.header_dirty = true;

        // Step 3: Snapshot
        if let Some(cow) = &self.cow {
            cow.snapshots.write(&self.header, &self.dir)?;
        }

        // Step 4: Header
        failpoint::check(failpoint::COMMIT_BEFORE_HEADER)
            .map_err(DbmError::io(IoOp::Write))?;
        self.write_header()?;
        self.file.sync()?;

        // Step 5: Previous state is superseded
        if let Some(cow) = self.cow.as_mut() {
            cow.fresh.clear();
            cow.dir_fresh = false;
        }
        self.release_pending()?;
        self.write_header()?;

        tracing::debug!(
            "Committed {} (numsync={})",
            self.file.path().display(),
            self.header.numsync
        );
        Ok(())
    }

    // =========================================================================
    // Buckets and records
    // =========================================================================

    /// Bucket at `offset`, through the cache
    pub(crate) fn bucket_at(&self, offset: u64) -> Result<Arc<Bucket>> {
        if let Some(bucket) = self.cache.lock().get(offset) {
            return Ok(bucket);
        }
        let bucket = Arc::new(self.read_bucket(offset)?);
        self.cache.lock().insert(offset, Arc::clone(&bucket));
        Ok(bucket)
    }

    /// Read and check a bucket straight from the file
    pub(crate) fn read_bucket(&self, offset: u64) -> Result<Bucket> {
        let block_size = self.header.block_size;
        if offset < block_size as u64
            || offset.saturating_add(block_size as u64) > self.header.next_block
        {
            return Err(Corruption::BadBucket {
                offset,
                reason: "outside allocated space".to_string(),
            }
            .into());
        }

        let block = self.file.read_vec(offset, block_size as usize)?;
        let bucket = Bucket::decode(&block, offset, self.header.bucket_elems)?;
        if bucket.bits > self.dir.bits() {
            return Err(Corruption::BadBucket {
                offset,
                reason: format!(
                    "depth {} exceeds directory depth {}",
                    bucket.bits,
                    self.dir.bits()
                ),
            }
            .into());
        }
        if self.opts.xverify {
            bucket.validate_extents(offset, block_size as u64, self.header.next_block)?;
        }
        Ok(bucket)
    }

    /// Key and value bytes of an entry
    pub(crate) fn read_record(&self, bucket_offset: u64, entry: &BucketEntry) -> Result<Vec<u8>> {
        if entry.data_offset < self.header.block_size as u64
            || entry.record_end() > self.header.next_block
        {
            return Err(Corruption::BadHashEntry {
                offset: bucket_offset,
                reason: format!(
                    "record {}+{} outside allocated space",
                    entry.data_offset,
                    entry.record_len()
                ),
            }
            .into());
        }
        self.file.read_vec(entry.data_offset, entry.record_len() as usize)
    }

    fn write_record(&self, offset: u64, key: &[u8], value: &[u8]) -> Result<()> {
        let mut record = Vec::with_capacity(key.len() + value.len());
        record.extend_from_slice(key);
        record.extend_from_slice(value);
        self.file.write_at(offset, &record)
    }

    /// A private copy of the bucket at directory `index`, ready to modify
    ///
    /// In copy-on-write mode a bucket from the last commit moves to a new
    /// block first and the directory is repointed.
    fn bucket_for_update(&mut self, index: usize) -> Result<(u64, Bucket)> {
        let offset = self.dir.entries()[index];
        let bucket = (*self.bucket_at(offset)?).clone();

        let relocate = self
            .cow
            .as_ref()
            .is_some_and(|cow| !cow.fresh.contains(&offset));
        if !relocate {
            return Ok((offset, bucket));
        }

        let new_offset = self.alloc_block()?;
        let range = self.dir.bucket_range(index, bucket.bits);
        self.dir.set_range(range, new_offset);
        self.dir_dirty = true;
        self.cache.get_mut().remove(offset);
        self.defer_free(AvailElem::new(offset, self.header.block_size));
        Ok((new_offset, bucket))
    }

    fn put_bucket(&mut self, offset: u64, bucket: Bucket) {
        self.cache.get_mut().put_dirty(offset, bucket);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn directory(&self) -> &Directory {
        &self.dir
    }

    pub fn block_size(&self) -> u32 {
        self.header.block_size
    }

    pub fn format(&self) -> Format {
        self.header.format
    }

    pub fn is_numsync(&self) -> bool {
        self.header.is_numsync()
    }

    pub fn is_writable(&self) -> bool {
        self.opts.writable
    }

    pub fn options(&self) -> TableOptions {
        self.opts
    }

    pub(crate) fn set_sync_strategy(&mut self, strategy: SyncStrategy) {
        self.opts.sync_strategy = strategy;
    }

    pub fn file(&self) -> &BlockFile {
        &self.file
    }

    pub(crate) fn file_mut(&mut self) -> &mut BlockFile {
        &mut self.file
    }
}

/// Size of the record for `key` and `value`, if it can be stored
fn record_size(key: &[u8], value: &[u8], block_size: u32) -> Result<u32> {
    let total = key.len() + value.len();
    let limit = (u32::MAX - block_size) as usize;
    if total > limit {
        return Err(Capacity::RecordTooLarge(total).into());
    }
    Ok(total as u32)
}
