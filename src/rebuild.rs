//! Rebuild Module
//!
//! Offline rebuilds that write every live record into a fresh file and
//! rename it over the database.
//!
//! ## Responsibilities
//! - `reorganize`: compact a healthy database to minimal size
//! - `recover`: salvage what is readable from a damaged database, within
//!   configurable failure limits, optionally after writing a backup
//!
//! The original file is never modified: a rebuild that fails or aborts
//! leaves it exactly as it was, and the temporary file is removed.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::config::{RecoveryConfig, SyncStrategy};
use crate::error::{Corruption, DbmError, IoOp, LockKind, Result};
use crate::failpoint;
use crate::hash::{self, hash_key};
use crate::storage::BlockFile;
use crate::table::{Cursor, HashTable, TableOptions};

/// Outcome of a recovery run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Backup written before the database was replaced
    pub backup_name: Option<PathBuf>,
    pub recovered_keys: usize,
    pub recovered_buckets: usize,
    pub failed_keys: usize,
    pub failed_buckets: usize,
    pub duplicate_keys: usize,
}

impl RecoveryStats {
    pub fn failures(&self) -> usize {
        self.failed_keys + self.failed_buckets
    }
}

/// A fresh table in a temporary file next to the database
struct Rebuild {
    temp: NamedTempFile,
    table: HashTable,
    opts: TableOptions,
}

impl Rebuild {
    fn begin(source: &HashTable) -> Result<Self> {
        let path = source.file().path();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let temp = tempfile::Builder::new()
            .prefix(".hashdbm-rebuild-")
            .tempfile_in(dir)
            .map_err(DbmError::io(IoOp::Open))?;
        let file = temp.as_file().try_clone().map_err(DbmError::io(IoOp::Open))?;

        // Per-record fsync is pointless for a file nobody can see yet
        let opts = source.options();
        let build_opts = TableOptions {
            sync_strategy: SyncStrategy::OnSync,
            ..opts
        };
        let table = HashTable::create(
            BlockFile::from_file(file, temp.path()),
            source.format(),
            source.block_size(),
            build_opts,
        )?;

        Ok(Self { temp, table, opts })
    }

    /// Put the rebuilt file in place of `target`
    ///
    /// Steps:
    /// 1. Sync the rebuilt file
    /// 2. Copy the permissions of the original
    /// 3. Lock it, so it is never visible unlocked
    /// 4. Rename it over the original
    fn finish(self, target: &Path, lock: bool) -> Result<HashTable> {
        let Rebuild {
            temp,
            mut table,
            opts,
        } = self;

        // Step 1: Durable contents
        table.sync()?;

        // Step 2: Permissions
        let permissions = fs::metadata(target)
            .map_err(DbmError::io(IoOp::Stat))?
            .permissions();
        fs::set_permissions(temp.path(), permissions).map_err(DbmError::io(IoOp::Open))?;

        // Step 3: Lock
        if lock {
            table.file_mut().lock(LockKind::Exclusive)?;
        }

        failpoint::check(failpoint::REBUILD_BEFORE_RENAME)
            .map_err(DbmError::io(IoOp::Rename))?;

        // Step 4: Rename
        temp.persist(target).map_err(|e| DbmError::StorageIo {
            op: IoOp::Rename,
            source: e.error,
        })?;
        table.file_mut().set_path(target);
        table.set_sync_strategy(opts.sync_strategy);
        Ok(table)
    }
}

/// Rewrite all live records into a minimal file
pub fn reorganize(source: &HashTable, lock: bool) -> Result<HashTable> {
    let target = source.file().path().to_path_buf();
    tracing::info!("Reorganizing {}", target.display());

    let mut rebuild = Rebuild::begin(source)?;
    let mut cursor = Cursor::start();
    let mut records = 0u64;
    while let Some((key, value, next)) = source.next_record(cursor)? {
        rebuild.table.store(&key, &value, false)?;
        records += 1;
        cursor = next;
    }

    let table = rebuild.finish(&target, lock)?;
    tracing::info!(
        "Reorganized {}: {} records, {} bytes",
        target.display(),
        records,
        table.header().next_block
    );
    Ok(table)
}

/// Salvage readable buckets and records into a fresh file
///
/// Every distinct bucket named by the directory is read directly from the
/// file. Unreadable buckets and records are counted and skipped; once a
/// configured limit is exceeded the run aborts with the statistics so far.
pub fn recover(
    source: &HashTable,
    config: &RecoveryConfig,
    lock: bool,
) -> Result<(HashTable, RecoveryStats)> {
    let target = source.file().path().to_path_buf();
    tracing::info!("Recovering {}", target.display());

    let mut stats = RecoveryStats::default();
    let mut rebuild = Rebuild::begin(source)?;

    // Step 1: Salvage
    for (index, offset) in source.directory().buckets() {
        let bucket = match source.read_bucket(offset) {
            Ok(bucket) => bucket,
            Err(e) if e.is_structural() => {
                tracing::warn!("Directory entry {}: unreadable bucket: {}", index, e);
                stats.failed_buckets += 1;
                check_limits(config, &stats)?;
                continue;
            }
            Err(e) => return Err(e),
        };
        stats.recovered_buckets += 1;

        for (_, entry) in bucket.entries() {
            let record = source.read_record(offset, entry).and_then(|mut key| {
                let value = key.split_off(entry.key_size as usize);
                if hash_key(&key) != entry.hash || hash::key_start(&key) != entry.key_start {
                    return Err(Corruption::BadHashEntry {
                        offset,
                        reason: "stored key does not match entry".to_string(),
                    }
                    .into());
                }
                Ok((key, value))
            });

            match record {
                Ok((key, value)) => match rebuild.table.store(&key, &value, false) {
                    Ok(()) => stats.recovered_keys += 1,
                    Err(DbmError::CannotReplace) => stats.duplicate_keys += 1,
                    Err(e) => return Err(e),
                },
                Err(e) if e.is_structural() => {
                    tracing::warn!("Bucket {}: unreadable record: {}", offset, e);
                    stats.failed_keys += 1;
                    check_limits(config, &stats)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // Step 2: Backup, complete before the original is replaced
    if config.backup {
        stats.backup_name = Some(write_backup(&target)?);
    }

    // Step 3: Swap
    let table = rebuild.finish(&target, lock)?;
    tracing::info!(
        "Recovered {}: {} keys from {} buckets ({} failed keys, {} failed buckets, {} duplicates)",
        target.display(),
        stats.recovered_keys,
        stats.recovered_buckets,
        stats.failed_keys,
        stats.failed_buckets,
        stats.duplicate_keys
    );
    Ok((table, stats))
}

fn check_limits(config: &RecoveryConfig, stats: &RecoveryStats) -> Result<()> {
    let exceeded = |limit: usize, value: usize| limit != 0 && value > limit;

    let reason = if exceeded(config.max_failed_keys, stats.failed_keys) {
        format!("failed keys exceed limit of {}", config.max_failed_keys)
    } else if exceeded(config.max_failed_buckets, stats.failed_buckets) {
        format!("failed buckets exceed limit of {}", config.max_failed_buckets)
    } else if exceeded(config.max_failures, stats.failures()) {
        format!("failures exceed limit of {}", config.max_failures)
    } else {
        return Ok(());
    };

    tracing::warn!("Recovery aborted: {}", reason);
    Err(DbmError::RecoveryFailed {
        reason,
        stats: stats.clone(),
    })
}

/// Copy the database to the first free `<name>.~N~` and sync the copy
fn write_backup(path: &Path) -> Result<PathBuf> {
    let backup = (1u32..)
        .map(|n| {
            let mut name = path.as_os_str().to_os_string();
            name.push(format!(".~{}~", n));
            PathBuf::from(name)
        })
        .find(|candidate| !candidate.exists())
        .ok_or_else(|| DbmError::BackupFailed(std::io::Error::other("no free backup name")))?;

    fs::copy(path, &backup).map_err(DbmError::BackupFailed)?;
    fs::File::open(&backup)
        .and_then(|f| f.sync_all())
        .map_err(DbmError::BackupFailed)?;

    tracing::info!("Backup of {} written to {}", path.display(), backup.display());
    Ok(backup)
}
