//! Snapshot record files
//!
//! One committed state (header block + directory) preceded by a small
//! bincode-encoded record header that carries the state marker, the sync
//! sequence number and checksums.
//!
//! ## File Format
//! ```text
//! ┌─────────┬──────────────────────────┬─────────┬─────────┐
//! │ Len (4) │ bincode(SnapshotHeader)  │ CRC (4) │ padding │  PREFIX_SIZE bytes
//! ├─────────┴──────────────────────────┴─────────┴─────────┤
//! │ Header block (block_size bytes)                        │
//! ├────────────────────────────────────────────────────────┤
//! │ Directory (dir_size bytes)                             │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! The record is written with state `Writing`, synced, and only then
//! rewritten with state `Complete`. A snapshot left in `Writing` is never
//! trusted.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bucket::Directory;
use crate::error::{Corruption, DbmError, IoOp, Result};
use crate::failpoint;
use crate::storage::Header;

/// Magic number identifying a snapshot file
pub const SNAPSHOT_MAGIC: u32 = 0x4844_534E;

/// Snapshot record layout version
pub const SNAPSHOT_VERSION: u16 = 1;

/// Bytes reserved for the record header; the image starts here
pub const PREFIX_SIZE: usize = 64;

/// Write progress marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotState {
    Writing,
    Complete,
}

/// Record header stored at the start of a snapshot file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub magic: u32,
    pub version: u16,
    pub state: SnapshotState,
    /// Sync sequence number of the captured state
    pub numsync: u64,
    /// Length of the header block inside the image
    pub header_len: u32,
    /// Length of the whole image (header block + directory)
    pub image_len: u64,
    pub image_crc: u32,
}

/// A snapshot file as read from disk
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub path: PathBuf,
    pub record: SnapshotHeader,
    pub image: Vec<u8>,
}

impl Snapshot {
    pub fn numsync(&self) -> u64 {
        self.record.numsync
    }

    pub fn header_block(&self) -> &[u8] {
        &self.image[..self.record.header_len as usize]
    }

    pub fn directory_bytes(&self) -> &[u8] {
        &self.image[self.record.header_len as usize..]
    }

    /// Check that this snapshot can be restored: complete, and carrying a
    /// decodable header whose sync number and directory match the record
    pub fn verify(&self) -> std::result::Result<Header, Corruption> {
        if self.record.state != SnapshotState::Complete {
            return Err(self.defect("snapshot was not completed"));
        }
        let header = Header::decode(self.header_block())?;
        if header.numsync != self.record.numsync {
            return Err(self.defect(&format!(
                "header sync number {} differs from record {}",
                header.numsync, self.record.numsync
            )));
        }
        if self.directory_bytes().len() as u64 != header.dir_size() {
            return Err(self.defect("directory length does not match header"));
        }
        Directory::decode(self.directory_bytes(), header.dir_bits)?;
        Ok(header)
    }

    fn defect(&self, reason: &str) -> Corruption {
        Corruption::BadHeader(format!("snapshot {}: {}", self.path.display(), reason))
    }
}

fn encode_prefix(record: &SnapshotHeader) -> Result<Vec<u8>> {
    let body = bincode::serialize(record).map_err(|e| DbmError::StorageIo {
        op: IoOp::Write,
        source: io::Error::other(e),
    })?;

    let mut prefix = Vec::with_capacity(PREFIX_SIZE);
    prefix.extend_from_slice(&(body.len() as u32).to_le_bytes());
    prefix.extend_from_slice(&body);
    prefix.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    prefix.resize(PREFIX_SIZE, 0);
    Ok(prefix)
}

fn sync_file(file: &File) -> Result<()> {
    file.sync_all().map_err(DbmError::io(IoOp::Sync))
}

/// Write a snapshot of one committed state to `path`
pub fn write(path: &Path, numsync: u64, header_block: &[u8], directory: &[u8]) -> Result<()> {
    let mut image = Vec::with_capacity(header_block.len() + directory.len());
    image.extend_from_slice(header_block);
    image.extend_from_slice(directory);

    let mut record = SnapshotHeader {
        magic: SNAPSHOT_MAGIC,
        version: SNAPSHOT_VERSION,
        state: SnapshotState::Writing,
        numsync,
        header_len: header_block.len() as u32,
        image_len: image.len() as u64,
        image_crc: crc32fast::hash(&image),
    };

    // Step 1: Body with the marker still at `Writing`
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(DbmError::io(IoOp::Open))?;
    file.write_all(&encode_prefix(&record)?)
        .and_then(|_| file.write_all(&image))
        .map_err(DbmError::io(IoOp::Write))?;
    sync_file(&file)?;

    failpoint::check(failpoint::SNAPSHOT_BEFORE_FLIP).map_err(DbmError::io(IoOp::Write))?;

    // Step 2: Flip the marker
    record.state = SnapshotState::Complete;
    let prefix = encode_prefix(&record)?;
    write_prefix(&file, &prefix)?;
    sync_file(&file)?;

    tracing::trace!("Snapshot {} written (numsync={})", path.display(), numsync);
    Ok(())
}

#[cfg(unix)]
fn write_prefix(file: &File, prefix: &[u8]) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(prefix, 0).map_err(DbmError::io(IoOp::Write))
}

#[cfg(not(unix))]
fn write_prefix(file: &File, prefix: &[u8]) -> Result<()> {
    use std::io::{Seek, SeekFrom};
    let mut file = file;
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.write_all(prefix))
        .map_err(DbmError::io(IoOp::Write))
}

/// Read a snapshot file; `Ok(None)` if it does not exist
///
/// Damage to the record header or image is reported as corruption.
pub fn read(path: &Path) -> Result<Option<Snapshot>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(DbmError::StorageIo {
                op: IoOp::Read,
                source: e,
            })
        }
    };

    let bad = |reason: &str| {
        DbmError::Corruption(Corruption::BadHeader(format!(
            "snapshot {}: {}",
            path.display(),
            reason
        )))
    };

    if data.len() < PREFIX_SIZE {
        return Err(bad("truncated record header"));
    }

    // Step 1: Record header and its checksum
    let body_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if 4 + body_len + 4 > PREFIX_SIZE {
        return Err(bad("record header too long"));
    }
    let body = &data[4..4 + body_len];
    let stored_crc = u32::from_le_bytes([
        data[4 + body_len],
        data[5 + body_len],
        data[6 + body_len],
        data[7 + body_len],
    ]);
    if crc32fast::hash(body) != stored_crc {
        return Err(bad("record header checksum mismatch"));
    }
    let record: SnapshotHeader =
        bincode::deserialize(body).map_err(|_| bad("undecodable record header"))?;
    if record.magic != SNAPSHOT_MAGIC || record.version != SNAPSHOT_VERSION {
        return Err(bad("not a snapshot record"));
    }

    // Step 2: Image and its checksum
    let image = data[PREFIX_SIZE..].to_vec();
    if image.len() as u64 != record.image_len || record.header_len as u64 > record.image_len {
        return Err(bad("truncated image"));
    }
    if crc32fast::hash(&image) != record.image_crc {
        return Err(bad("image checksum mismatch"));
    }

    Ok(Some(Snapshot {
        path: path.to_path_buf(),
        record,
        image,
    }))
}
