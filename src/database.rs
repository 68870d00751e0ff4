//! Database Module
//!
//! The public handle over one database file.
//!
//! ## Responsibilities
//! - Open/create files in the requested mode, with locking and crash tolerance
//! - Reject writes on read-only handles
//! - Serialize mutations, allow concurrent lookups
//! - Track the needs-recovery state after corruption is detected
//! - Dump/load, reorganize and recover

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::config::{Config, DumpConfig, DumpFormat, OpenMode, RecoveryConfig};
use crate::dump;
use crate::error::{Corruption, DbmError, IoOp, Result, WriteOp};
use crate::rebuild::{self, RecoveryStats};
use crate::snapshot::SnapshotPair;
use crate::storage::header::resolve_block_size;
use crate::storage::{BlockFile, FileOptions, Format};
use crate::table::{Cursor, HashTable, TableOptions};

/// An open database
///
/// ## Concurrency Model: Single-Writer / Multiple-Reader
///
/// - **Reads** (fetch/exists/count/iteration/dump): shared `RwLock` read
///   guard, any number at once
/// - **Writes** (store/delete/sync/reorganize/recover/load/close):
///   exclusive write guard
///
/// Between processes the advisory file lock gives the same guarantee:
/// one writer, or any number of readers.
pub struct Database {
    /// `None` once closed
    handle: RwLock<Option<HashTable>>,

    /// Database file
    path: PathBuf,

    /// Mode the handle was opened with
    mode: OpenMode,

    /// Advisory locking disabled
    no_lock: bool,

    /// Set when an operation detected on-disk damage
    needs_recovery: AtomicBool,
}

impl Database {
    /// Open a database file in the given mode with default settings
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        if mode == OpenMode::LoadFromDump {
            return Err(DbmError::Usage(
                "LoadFromDump requires Database::open_with".to_string(),
            ));
        }
        Self::open_with(Config::builder().path(path.as_ref()).mode(mode).build())
    }

    /// Open with a full configuration
    ///
    /// Steps:
    /// 1. Check crash tolerance preconditions
    /// 2. Open the file and take the advisory lock
    /// 3. Initialize an empty file, or validate an existing one
    /// 4. Enable crash tolerance (first commit)
    pub fn open_with(config: Config) -> Result<Self> {
        if config.mode == OpenMode::LoadFromDump {
            return Self::open_from_dump(config);
        }
        let writer = config.mode.is_writer();

        // Step 1: Crash tolerance
        let snapshots = if config.crash_tolerance {
            if !writer {
                return Err(DbmError::Usage(
                    "crash tolerance requires a writable handle".to_string(),
                ));
            }
            let pair = SnapshotPair::for_database(&config.path);
            if pair.exist() {
                return Err(DbmError::SnapshotExists);
            }
            Some(pair)
        } else {
            None
        };

        // Step 2: File and lock
        let file = BlockFile::open(
            &config.path,
            FileOptions {
                writable: writer,
                create: matches!(config.mode, OpenMode::ReadWriteCreate | OpenMode::CreateNew),
                truncate: config.mode == OpenMode::CreateNew,
                file_mode: config.file_mode,
                lock: !config.flags.no_lock,
            },
        )?;

        // Step 3: Table
        let opts = TableOptions {
            writable: writer,
            xverify: config.flags.xverify,
            sync_strategy: config.sync_strategy,
            cache_size: config.cache_size,
        };
        let mut table = if file.is_empty()? {
            if !writer {
                return Err(Corruption::EmptyDatabase.into());
            }
            let format = if config.flags.numsync || config.crash_tolerance {
                Format::Numsync
            } else {
                Format::Standard
            };
            let block_size = resolve_block_size(config.block_size, config.flags.bs_exact)?;
            HashTable::create(file, format, block_size, opts)?
        } else {
            HashTable::open(file, opts)?
        };

        // Step 4: Crash tolerance
        if let Some(pair) = snapshots {
            table.enable_crash_tolerance(pair)?;
        }

        tracing::debug!(
            "Database {} open ({:?}, crash_tolerance={})",
            config.path.display(),
            config.mode,
            config.crash_tolerance
        );

        Ok(Self {
            handle: RwLock::new(Some(table)),
            path: config.path,
            mode: config.mode,
            no_lock: config.flags.no_lock,
            needs_recovery: AtomicBool::new(false),
        })
    }

    /// Create the database an ASCII dump describes and load the dump into it
    fn open_from_dump(config: Config) -> Result<Self> {
        let header = dump::read_header(&config.path)?;

        // Only the final component: the database lands next to the dump
        let name = header
            .file
            .as_deref()
            .and_then(|file| Path::new(file).file_name())
            .ok_or_else(|| DbmError::Usage("dump does not name a database file".to_string()))?;
        let db_path = config
            .path
            .parent()
            .map(|dir| dir.join(name))
            .unwrap_or_else(|| PathBuf::from(name));

        let mut flags = config.flags;
        flags.numsync = flags.numsync || header.format == Some(Format::Numsync);
        let db = Self::open_with(Config {
            path: db_path,
            mode: OpenMode::CreateNew,
            flags,
            ..config.clone()
        })?;
        db.load(&config.path, true)?;

        #[cfg(unix)]
        if let Some(mode) = header.mode {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&db.path, std::fs::Permissions::from_mode(mode))
                .map_err(DbmError::io(IoOp::Open))?;
        }

        tracing::info!(
            "Created {} from dump {}",
            db.path.display(),
            config.path.display()
        );
        Ok(db)
    }

    /// Flush and release the file; later calls fail with `NotOpen`
    ///
    /// A handle that needs recovery is released without writing anything,
    /// and its snapshots stay in place for `restore`.
    pub fn close(&self) -> Result<()> {
        let table = self.handle.write().take().ok_or(DbmError::NotOpen)?;
        if self.needs_recovery() {
            return table.abandon();
        }
        table.close()
    }

    pub fn is_open(&self) -> bool {
        self.handle.read().is_some()
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Value stored under `key`
    pub fn fetch(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.read_op(|table| table.fetch(key))
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        self.read_op(|table| table.exists(key))
    }

    /// Number of records
    pub fn count(&self) -> Result<u64> {
        self.read_op(|table| table.count())
    }

    /// Iterate over all keys in storage order
    ///
    /// Each step takes the read lock on its own. Mutations between steps
    /// may cause keys to be skipped or repeated, never a failure.
    pub fn keys(&self) -> Keys<'_> {
        Keys {
            db: self,
            cursor: Some(Cursor::start()),
        }
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Store `value` under `key`; an existing key needs `replace`
    pub fn store(&self, key: &[u8], value: &[u8], replace: bool) -> Result<()> {
        self.write_op(WriteOp::Store, |table| table.store(key, value, replace))
    }

    /// Store a new key (`CannotReplace` if it exists)
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.store(key, value, false)
    }

    /// Store a key, replacing any existing value
    pub fn replace(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.store(key, value, true)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.write_op(WriteOp::Delete, |table| table.delete(key))
    }

    /// Make all changes durable (a commit in crash-tolerant mode)
    ///
    /// A no-op on read-only handles.
    pub fn sync(&self) -> Result<()> {
        let mut guard = self.handle.write();
        let table = guard.as_mut().ok_or(DbmError::NotOpen)?;
        if !table.is_writable() {
            return Ok(());
        }
        self.check_health()?;
        self.track_write(table.sync())
    }

    /// Switch between the standard and extended (numsync) formats
    pub fn convert(&self, numsync: bool) -> Result<()> {
        self.write_op(WriteOp::Convert, |table| table.convert(numsync))
    }

    /// Rebuild the file so it holds only live records
    pub fn reorganize(&self) -> Result<()> {
        let lock = !self.no_lock;
        self.write_op(WriteOp::Reorganize, |table| {
            let rebuilt = rebuild::reorganize(table, lock)?;
            Self::swap_table(table, rebuilt)
        })
    }

    /// Salvage a damaged database
    ///
    /// Runs only when the handle needs recovery or `config.force` is set.
    /// On success the handle is usable again.
    pub fn recover(&self, config: &RecoveryConfig) -> Result<RecoveryStats> {
        let mut guard = self.handle.write();
        let table = guard.as_mut().ok_or(DbmError::NotOpen)?;
        if !table.is_writable() {
            return Err(DbmError::ReaderCannotWrite(WriteOp::Recover));
        }
        if !config.force && !self.needs_recovery() {
            return Ok(RecoveryStats::default());
        }

        let (rebuilt, stats) = rebuild::recover(table, config, !self.no_lock)?;
        Self::swap_table(table, rebuilt)?;
        self.needs_recovery.store(false, Ordering::Release);
        Ok(stats)
    }

    /// Put a rebuilt table in place of the current one
    ///
    /// The snapshots described the old file; crash tolerance restarts from
    /// a fresh commit of the new one.
    fn swap_table(table: &mut HashTable, mut rebuilt: HashTable) -> Result<()> {
        let snapshots = table
            .crash_tolerant()
            .then(|| SnapshotPair::for_database(table.file().path()));
        if let Some(pair) = snapshots {
            pair.remove()?;
            rebuilt.enable_crash_tolerance(pair)?;
        }
        // The old handle refers to the replaced file
        drop(std::mem::replace(table, rebuilt));
        Ok(())
    }

    // =========================================================================
    // Dump / Load
    // =========================================================================

    /// Write all records to the file described by `config`
    pub fn dump(&self, config: &DumpConfig) -> Result<u64> {
        self.read_op(|table| dump::dump(table, config))
    }

    /// Write all records to an open writer
    pub fn dump_to_file<W: Write>(&self, out: W, format: DumpFormat) -> Result<u64> {
        self.read_op(|table| dump::dump_to(table, out, format))
    }

    /// Store every record of the dump file at `path`
    ///
    /// Without `overwrite`, an existing key stops the load with `CannotReplace`.
    pub fn load(&self, path: impl AsRef<Path>, overwrite: bool) -> Result<u64> {
        let path = path.as_ref();
        self.write_op(WriteOp::Load, |table| dump::load(table, path, overwrite))
    }

    /// Store every record read from an open reader
    pub fn load_from_file<R: BufRead>(&self, input: R, overwrite: bool) -> Result<u64> {
        self.write_op(WriteOp::Load, |table| dump::load_from(table, input, overwrite))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Name of the database file
    pub fn file_name(&self) -> Result<PathBuf> {
        self.read_any(|_| Ok(self.path.clone()))
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// True if the file uses the extended (numsync) format
    pub fn is_numsync(&self) -> Result<bool> {
        self.read_any(|table| Ok(table.is_numsync()))
    }

    pub fn block_size(&self) -> Result<u32> {
        self.read_any(|table| Ok(table.block_size()))
    }

    pub fn crash_tolerant(&self) -> Result<bool> {
        self.read_any(|table| Ok(table.crash_tolerant()))
    }

    /// True once corruption was detected; cleared by a successful `recover`
    pub fn needs_recovery(&self) -> bool {
        self.needs_recovery.load(Ordering::Acquire)
    }

    // =========================================================================
    // Internal
    // =========================================================================

    /// Run `f` under the read lock, without the health check
    fn read_any<T>(&self, f: impl FnOnce(&HashTable) -> Result<T>) -> Result<T> {
        let guard = self.handle.read();
        let table = guard.as_ref().ok_or(DbmError::NotOpen)?;
        f(table)
    }

    fn read_op<T>(&self, f: impl FnOnce(&HashTable) -> Result<T>) -> Result<T> {
        let guard = self.handle.read();
        let table = guard.as_ref().ok_or(DbmError::NotOpen)?;
        self.check_health()?;
        self.track(f(table))
    }

    fn write_op<T>(&self, op: WriteOp, f: impl FnOnce(&mut HashTable) -> Result<T>) -> Result<T> {
        let mut guard = self.handle.write();
        let table = guard.as_mut().ok_or(DbmError::NotOpen)?;
        if !table.is_writable() {
            return Err(DbmError::ReaderCannotWrite(op));
        }
        self.check_health()?;
        self.track_write(f(table))
    }

    fn check_health(&self) -> Result<()> {
        if self.needs_recovery() {
            return Err(Corruption::NeedRecovery.into());
        }
        Ok(())
    }

    /// Flag the handle when `result` reports damage to the database file
    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(DbmError::Corruption(corruption)) = &result {
            let damage = !matches!(
                corruption,
                Corruption::NeedRecovery | Corruption::MalformedData { .. }
            );
            if damage {
                self.flag(corruption);
            }
        }
        result
    }

    /// Like `track`, and a failed write also flags the handle: the file may
    /// hold part of the update while memory holds all of it
    fn track_write<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err @ DbmError::StorageIo { op, .. }) = &result {
            if matches!(op, IoOp::Write | IoOp::Sync | IoOp::Truncate) {
                self.flag(err);
            }
        }
        self.track(result)
    }

    fn flag(&self, cause: &dyn std::fmt::Display) {
        if !self.needs_recovery.swap(true, Ordering::AcqRel) {
            tracing::warn!("{} needs recovery: {}", self.path.display(), cause);
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Some(table) = self.handle.get_mut().take() {
            tracing::warn!("Database {} dropped without close", self.path.display());
            let result = if self.needs_recovery() {
                table.abandon()
            } else {
                table.close()
            };
            if let Err(e) = result {
                tracing::warn!("Closing {} on drop failed: {}", self.path.display(), e);
            }
        }
    }
}

/// Iterator over the keys of a database
///
/// Ends after the last key or after the first error.
pub struct Keys<'a> {
    db: &'a Database,
    /// `None` once exhausted
    cursor: Option<Cursor>,
}

impl Iterator for Keys<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let cursor = self.cursor?;
        match self.db.read_op(|table| table.next_key(cursor)) {
            Ok(Some((key, next))) => {
                self.cursor = Some(next);
                Some(Ok(key))
            }
            Ok(None) => {
                self.cursor = None;
                None
            }
            Err(e) => {
                self.cursor = None;
                Some(Err(e))
            }
        }
    }
}
