//! Block File
//!
//! Positional reads and writes on the database file, plus the advisory lock.
//!
//! All I/O goes through `read_at`/`write_at` so that concurrent readers
//! holding `&BlockFile` never race on a shared file cursor.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{Corruption, DbmError, IoOp, LockKind, Result};

/// How to open the underlying file
#[derive(Debug, Clone, Copy)]
pub struct FileOptions {
    pub writable: bool,
    pub create: bool,
    /// Truncate after the lock has been acquired
    pub truncate: bool,
    pub file_mode: u32,
    pub lock: bool,
}

/// The database file
#[derive(Debug)]
pub struct BlockFile {
    file: File,
    path: PathBuf,
    locked: bool,
}

impl BlockFile {
    /// Open (or create) the file, take the advisory lock, then truncate if asked
    ///
    /// Truncation happens only after the lock is held, so a `CreateNew` open
    /// can never wipe a file another writer is using.
    pub fn open(path: &Path, opts: FileOptions) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(opts.writable).create(opts.create && opts.writable);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(opts.file_mode);
        }

        let file = options.open(path).map_err(DbmError::io(IoOp::Open))?;
        let mut block_file = Self::from_file(file, path);

        if opts.lock {
            let kind = if opts.writable {
                LockKind::Exclusive
            } else {
                LockKind::Shared
            };
            block_file.lock(kind)?;
        }

        if opts.truncate {
            block_file.set_len(0)?;
        }

        Ok(block_file)
    }

    /// Wrap an already open file (used for rebuild temporaries)
    pub fn from_file(file: File, path: &Path) -> Self {
        Self {
            file,
            path: path.to_path_buf(),
            locked: false,
        }
    }

    /// Take the advisory lock without blocking
    pub fn lock(&mut self, kind: LockKind) -> Result<()> {
        let res = match kind {
            LockKind::Shared => FileExt::try_lock_shared(&self.file),
            LockKind::Exclusive => FileExt::try_lock_exclusive(&self.file),
        };

        match res {
            Ok(()) => {
                self.locked = true;
                Ok(())
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(DbmError::Locked(kind))
            }
            Err(e) => Err(DbmError::StorageIo {
                op: IoOp::Open,
                source: e,
            }),
        }
    }

    /// Release the advisory lock (also released when the file is dropped)
    pub fn unlock(&mut self) -> Result<()> {
        if self.locked {
            FileExt::unlock(&self.file).map_err(DbmError::io(IoOp::Open))?;
            self.locked = false;
        }
        Ok(())
    }

    /// Read exactly `buf.len()` bytes at `offset`
    ///
    /// A short read means the file ends inside a structure the header claims
    /// exists, which is reported as corruption rather than as an I/O failure.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match read_exact_at(&self.file, buf, offset) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(DbmError::Corruption(Corruption::FileEof {
                    offset,
                    len: buf.len(),
                }))
            }
            Err(e) => Err(DbmError::StorageIo {
                op: IoOp::Read,
                source: e,
            }),
        }
    }

    /// Read `len` bytes at `offset` into a fresh buffer
    pub fn read_vec(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Write all of `data` at `offset`
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        write_all_at(&self.file, data, offset).map_err(DbmError::io(IoOp::Write))
    }

    /// Flush file contents and metadata to stable storage
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().map_err(DbmError::io(IoOp::Sync))
    }

    /// Current file length in bytes
    pub fn len(&self) -> Result<u64> {
        Ok(self
            .file
            .metadata()
            .map_err(DbmError::io(IoOp::Stat))?
            .len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn set_len(&self, len: u64) -> Result<()> {
        self.file.set_len(len).map_err(DbmError::io(IoOp::Truncate))
    }

    /// Path the file was opened with
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the new name after the file was renamed
    pub(crate) fn set_path(&mut self, path: &Path) {
        self.path = path.to_path_buf();
    }

    /// Underlying file handle
    pub fn file(&self) -> &File {
        &self.file
    }
}

// =============================================================================
// Platform positional I/O
// =============================================================================

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::read_exact_at(file, buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::write_all_at(file, data, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt as _;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut std::mem::take(&mut buf)[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut data: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt as _;
    while !data.is_empty() {
        match file.seek_write(data, offset) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                data = &data[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
