//! Database file header (block 0)
//!
//! The header names the geometry of the file (block size, directory location
//! and depth, bucket capacity), the end of allocated space, and the primary
//! avail table. Extended ("numsync") files also maintain a sync sequence
//! number and a live record count.
//!
//! ## Encoding
//! ```text
//! ┌───────────┬─────────┬────────────────┬─────────────┬──────────────────┐
//! │ Magic (4) │ CRC (4) │ BlockSize (4)  │ Version (2) │ Flags (2)        │
//! ├───────────┴─────────┴────────────────┴─────────────┴──────────────────┤
//! │ DirOffset (8) │ DirBits (4) │ BucketElems (4) │ NextBlock (8)         │
//! ├───────────────┴─────────────┴─────────────────┴───────────────────────┤
//! │ Numsync (8)   │ RecordCount (8)                                       │
//! ├───────────────────────────────────────────────────────────────────────┤
//! │ Avail table (rest of the block)                                       │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//! The CRC covers bytes `8..block_size`.

use bytes::{Buf, BufMut};

use crate::bucket::page::elems_for;
use crate::error::{Capacity, Corruption};
use crate::hash::HASH_BITS;
use crate::storage::avail::{AvailBlock, AVAIL_ELEM_SIZE, AVAIL_HEADER_SIZE};

/// Magic number of a standard-format file
pub const MAGIC_STANDARD: u32 = 0x4844_4D53;

/// Magic number of an extended (numsync) file
pub const MAGIC_NUMSYNC: u32 = 0x4844_4D58;

/// On-disk layout version
pub const FORMAT_VERSION: u16 = 1;

/// Bytes before the avail table
pub const HEADER_FIXED_SIZE: usize = 56;

pub const MIN_BLOCK_SIZE: u32 = 512;
pub const MAX_BLOCK_SIZE: u32 = 1 << 20;
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Size of one directory entry
pub const DIR_ENTRY_SIZE: usize = 8;

/// On-disk format family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Standard,
    Numsync,
}

impl Format {
    pub fn magic(self) -> u32 {
        match self {
            Format::Standard => MAGIC_STANDARD,
            Format::Numsync => MAGIC_NUMSYNC,
        }
    }

    pub fn from_magic(magic: u32) -> Option<Self> {
        match magic {
            MAGIC_STANDARD => Some(Format::Standard),
            MAGIC_NUMSYNC => Some(Format::Numsync),
            _ => None,
        }
    }
}

/// Decoded header block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub format: Format,
    pub block_size: u32,
    pub dir_offset: u64,
    pub dir_bits: u32,
    pub bucket_elems: u32,
    /// First byte past the allocated part of the file
    pub next_block: u64,
    /// Sync sequence number (extended format)
    pub numsync: u64,
    /// Live records (extended format)
    pub record_count: u64,
    pub avail: AvailBlock,
}

impl Header {
    /// Header for a fresh file: the directory sits in block 1 and fills
    /// exactly one block, the single empty bucket in block 2
    pub fn new(format: Format, block_size: u32) -> Self {
        let entries = block_size as usize / DIR_ENTRY_SIZE;
        Self {
            format,
            block_size,
            dir_offset: block_size as u64,
            dir_bits: entries.trailing_zeros(),
            bucket_elems: elems_for(block_size),
            next_block: 3 * block_size as u64,
            numsync: 0,
            record_count: 0,
            avail: AvailBlock::new(Self::avail_capacity(block_size)),
        }
    }

    /// Slots in the header avail table for a given block size
    pub fn avail_capacity(block_size: u32) -> u32 {
        ((block_size as usize - HEADER_FIXED_SIZE - AVAIL_HEADER_SIZE) / AVAIL_ELEM_SIZE) as u32
    }

    /// Number of directory entries
    pub fn dir_entries(&self) -> usize {
        1usize << self.dir_bits
    }

    /// Directory size in bytes
    pub fn dir_size(&self) -> u64 {
        (self.dir_entries() * DIR_ENTRY_SIZE) as u64
    }

    pub fn is_numsync(&self) -> bool {
        self.format == Format::Numsync
    }

    /// Encode into a full block with the checksum filled in
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.block_size as usize);
        buf.put_u32_le(self.format.magic());
        buf.put_u32_le(0); // crc, patched below
        buf.put_u32_le(self.block_size);
        buf.put_u16_le(FORMAT_VERSION);
        buf.put_u16_le(0);
        buf.put_u64_le(self.dir_offset);
        buf.put_u32_le(self.dir_bits);
        buf.put_u32_le(self.bucket_elems);
        buf.put_u64_le(self.next_block);
        buf.put_u64_le(self.numsync);
        buf.put_u64_le(self.record_count);
        self.avail.encode_into(&mut buf);
        buf.resize(self.block_size as usize, 0);

        let crc = crc32fast::hash(&buf[8..]);
        buf[4..8].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Read the block size out of the first bytes of a file, after checking
    /// the magic number
    pub fn peek_block_size(prefix: &[u8]) -> Result<u32, Corruption> {
        if prefix.len() < 12 {
            return Err(Corruption::BadHeader("truncated header".to_string()));
        }
        let mut buf = prefix;
        let magic = buf.get_u32_le();
        if Format::from_magic(magic).is_none() {
            return Err(Corruption::BadMagic(magic));
        }
        let _crc = buf.get_u32_le();
        let block_size = buf.get_u32_le();
        if !is_valid_block_size(block_size) {
            return Err(Corruption::BadHeader(format!(
                "invalid block size {}",
                block_size
            )));
        }
        Ok(block_size)
    }

    /// Decode a full header block, verifying magic, checksum and geometry
    pub fn decode(block: &[u8]) -> Result<Self, Corruption> {
        let block_size = Self::peek_block_size(block)?;
        if block.len() < block_size as usize {
            return Err(Corruption::BadHeader("truncated header".to_string()));
        }
        let block = &block[..block_size as usize];

        let mut buf = block;
        let magic = buf.get_u32_le();
        let stored_crc = buf.get_u32_le();
        let computed_crc = crc32fast::hash(&block[8..]);
        if stored_crc != computed_crc {
            return Err(Corruption::BadHeader(format!(
                "checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored_crc, computed_crc
            )));
        }

        let format = Format::from_magic(magic).ok_or(Corruption::BadMagic(magic))?;
        let _block_size = buf.get_u32_le();
        let version = buf.get_u16_le();
        let _flags = buf.get_u16_le();
        if version != FORMAT_VERSION {
            return Err(Corruption::BadHeader(format!(
                "unsupported layout version {}",
                version
            )));
        }

        let dir_offset = buf.get_u64_le();
        let dir_bits = buf.get_u32_le();
        let bucket_elems = buf.get_u32_le();
        let next_block = buf.get_u64_le();
        let numsync = buf.get_u64_le();
        let record_count = buf.get_u64_le();
        let avail = AvailBlock::decode(buf)?;

        let header = Self {
            format,
            block_size,
            dir_offset,
            dir_bits,
            bucket_elems,
            next_block,
            numsync,
            record_count,
            avail,
        };
        header.check_geometry()?;
        Ok(header)
    }

    /// Internal consistency of the header fields
    fn check_geometry(&self) -> Result<(), Corruption> {
        if self.bucket_elems != elems_for(self.block_size) {
            return Err(Corruption::BadHeader(format!(
                "bucket capacity {} does not match block size {}",
                self.bucket_elems, self.block_size
            )));
        }
        if self.dir_bits > HASH_BITS {
            return Err(Corruption::BadHeader(format!(
                "directory depth {} exceeds {} bits",
                self.dir_bits, HASH_BITS
            )));
        }
        if self.avail.capacity != Self::avail_capacity(self.block_size) {
            return Err(Corruption::BadHeader("avail table capacity mismatch".to_string()));
        }
        let block = self.block_size as u64;
        if self.dir_offset < block
            || self.dir_offset % block != 0
            || self.dir_offset.saturating_add(self.dir_size()) > self.next_block
        {
            return Err(Corruption::BadHeader(format!(
                "directory at {} ({} bytes) outside allocated space",
                self.dir_offset,
                self.dir_size()
            )));
        }
        self.avail.validate(block, self.next_block)
    }

    /// Check the header against the actual file length
    pub fn validate(&self, file_len: u64) -> Result<(), Corruption> {
        self.check_geometry()?;
        if self.next_block > file_len {
            return Err(Corruption::BadHeader(format!(
                "allocated end {} beyond file length {}",
                self.next_block, file_len
            )));
        }
        Ok(())
    }
}

pub fn is_valid_block_size(size: u32) -> bool {
    size.is_power_of_two() && (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&size)
}

/// Block size to create a new file with
///
/// Without `exact`, the request is rounded up to a power of two and clamped
/// into the supported range.
pub fn resolve_block_size(requested: Option<u32>, exact: bool) -> Result<u32, Capacity> {
    let Some(size) = requested else {
        return Ok(DEFAULT_BLOCK_SIZE);
    };
    if is_valid_block_size(size) {
        return Ok(size);
    }
    if exact {
        return Err(Capacity::BlockSize(size));
    }
    let adjusted = size
        .clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE)
        .checked_next_power_of_two()
        .unwrap_or(MAX_BLOCK_SIZE)
        .min(MAX_BLOCK_SIZE);
    Ok(adjusted)
}
