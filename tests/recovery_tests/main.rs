//! Tests for damage detection and recovery
//!
//! These tests verify:
//! - Corruption marks the handle as needing recovery
//! - Recover salvages the intact part and clears the mark
//! - Failed writes mark the handle and leave the file openable
//! - Failure limits abort without touching the original file
//! - Backups

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use hashdbm::failpoint;
use hashdbm::hash::hash_key;
use hashdbm::storage::{BlockFile, FileOptions};
use hashdbm::table::{HashTable, TableOptions};
use hashdbm::{
    Config, Corruption, Database, DbmError, ErrorKind, OpenMode, RecoveryConfig, SyncStrategy,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const KEYS: u32 = 300;

fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("test.db")
}

fn key(i: u32) -> Vec<u8> {
    format!("key{}", i).into_bytes()
}

fn value(i: u32) -> Vec<u8> {
    format!("value-{}", i).into_bytes()
}

fn create_populated(path: &Path) {
    let db = Database::open_with(
        Config::builder()
            .path(path)
            .mode(OpenMode::CreateNew)
            .block_size(512)
            .build(),
    )
    .unwrap();
    for i in 0..KEYS {
        db.store(&key(i), &value(i), false).unwrap();
    }
    db.close().unwrap();
}

/// Bucket block holding `key`, read through the engine
fn bucket_of(path: &Path, key: &[u8]) -> u64 {
    let file = BlockFile::open(
        path,
        FileOptions {
            writable: false,
            create: false,
            truncate: false,
            file_mode: 0o644,
            lock: false,
        },
    )
    .unwrap();
    let table = HashTable::open(
        file,
        TableOptions {
            writable: false,
            xverify: false,
            sync_strategy: SyncStrategy::OnSync,
            cache_size: 4,
        },
    )
    .unwrap();
    table.directory().locate(hash_key(key))
}

/// Overwrite the bucket header so it can no longer be decoded
fn smash(path: &Path, offset: u64) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&[0xFF; 4]).unwrap();
    file.sync_all().unwrap();
}

// =============================================================================
// Needs-Recovery State Tests
// =============================================================================

#[test]
fn test_corruption_flags_handle() {
    let temp = TempDir::new().unwrap();
    let path = db_path(&temp);
    create_populated(&path);
    smash(&path, bucket_of(&path, &key(0)));

    let db = Database::open(&path, OpenMode::ReadWrite).unwrap();
    let err = db.fetch(&key(0)).unwrap_err();
    assert!(err.is(ErrorKind::Corruption));
    assert!(db.needs_recovery());

    // Everything else is refused until recovery
    let flagged = |result: hashdbm::Result<()>| {
        assert!(matches!(
            result,
            Err(DbmError::Corruption(Corruption::NeedRecovery))
        ))
    };
    flagged(db.fetch(&key(1)).map(|_| ()));
    flagged(db.store(b"new", b"value", false));
    flagged(db.delete(&key(2)));
    flagged(db.count().map(|_| ()));

    // Close still works
    db.close().unwrap();
}

#[test]
fn test_recover_salvages_intact_buckets() {
    let temp = TempDir::new().unwrap();
    let path = db_path(&temp);
    create_populated(&path);
    smash(&path, bucket_of(&path, &key(0)));

    let db = Database::open(&path, OpenMode::ReadWrite).unwrap();
    assert!(db.fetch(&key(0)).is_err());

    let stats = db
        .recover(&RecoveryConfig {
            backup: true,
            ..Default::default()
        })
        .unwrap();

    assert_eq!(stats.failed_buckets, 1);
    assert_eq!(stats.failed_keys, 0);
    assert!(stats.recovered_keys > 0 && stats.recovered_keys < KEYS as usize);
    assert!(!db.needs_recovery());

    // Intact records are back, lost ones are simply absent
    assert_eq!(db.count().unwrap() as usize, stats.recovered_keys);
    assert!(db.fetch(&key(0)).unwrap_err().is(ErrorKind::NotFound));
    let mut found = 0;
    for i in 0..KEYS {
        if let Ok(v) = db.fetch(&key(i)) {
            assert_eq!(v, value(i));
            found += 1;
        }
    }
    assert_eq!(found, stats.recovered_keys);

    // Backup is a copy of the damaged file
    let backup = stats.backup_name.unwrap();
    assert_eq!(backup, temp.path().join("test.db.~1~"));
    assert!(backup.exists());

    db.store(b"after", b"recovery", false).unwrap();
    db.close().unwrap();
}

#[test]
fn test_recover_is_noop_when_healthy() {
    let temp = TempDir::new().unwrap();
    let path = db_path(&temp);
    create_populated(&path);
    let before = fs::read(&path).unwrap();

    let db = Database::open(&path, OpenMode::ReadWrite).unwrap();
    let stats = db.recover(&RecoveryConfig::default()).unwrap();
    db.close().unwrap();

    assert_eq!(stats.recovered_keys, 0);
    assert_eq!(fs::read(&path).unwrap(), before);
}

#[test]
fn test_forced_recover_of_healthy_file() {
    let temp = TempDir::new().unwrap();
    let path = db_path(&temp);
    create_populated(&path);

    let db = Database::open(&path, OpenMode::ReadWrite).unwrap();
    let stats = db
        .recover(&RecoveryConfig {
            force: true,
            ..Default::default()
        })
        .unwrap();

    assert_eq!(stats.recovered_keys, KEYS as usize);
    assert_eq!(stats.failures(), 0);
    assert_eq!(stats.duplicate_keys, 0);
    assert!(stats.backup_name.is_none());
    assert_eq!(db.fetch(&key(123)).unwrap(), value(123));
    db.close().unwrap();
}

// =============================================================================
// Write Failure Tests
// =============================================================================

/// Five committed keys, then a store that fails while growing the file
fn fail_growth(path: &Path) -> Database {
    let db = Database::open_with(
        Config::builder()
            .path(path)
            .mode(OpenMode::CreateNew)
            .block_size(512)
            .build(),
    )
    .unwrap();
    for i in 0..5 {
        db.store(&key(i), &value(i), false).unwrap();
    }

    failpoint::enable(failpoint::FILE_GROW);
    let err = db.store(b"big", &vec![7u8; 200_000], false).unwrap_err();
    failpoint::clear();

    assert!(err.is(ErrorKind::StorageIo));
    db
}

#[test]
fn test_failed_growth_keeps_file_openable() {
    let temp = TempDir::new().unwrap();
    let path = db_path(&temp);
    let size = {
        let db = fail_growth(&path);
        assert!(db.needs_recovery());

        // Nothing else reaches the file
        assert!(matches!(
            db.delete(&key(0)),
            Err(DbmError::Corruption(Corruption::NeedRecovery))
        ));
        assert!(matches!(
            db.sync(),
            Err(DbmError::Corruption(Corruption::NeedRecovery))
        ));
        let size = fs::metadata(&path).unwrap().len();
        db.close().unwrap();
        size
    };
    assert_eq!(fs::metadata(&path).unwrap().len(), size);

    let db = Database::open(&path, OpenMode::ReadOnly).unwrap();
    assert_eq!(db.count().unwrap(), 5);
    assert_eq!(db.fetch(&key(0)).unwrap(), value(0));
    assert!(db.fetch(b"big").unwrap_err().is(ErrorKind::NotFound));
    db.close().unwrap();
}

#[test]
fn test_recover_after_failed_write() {
    let temp = TempDir::new().unwrap();
    let path = db_path(&temp);
    let db = fail_growth(&path);

    let stats = db.recover(&RecoveryConfig::default()).unwrap();

    assert_eq!(stats.recovered_keys, 5);
    assert!(!db.needs_recovery());
    db.store(b"big", &vec![7u8; 200_000], false).unwrap();
    assert_eq!(db.fetch(b"big").unwrap().len(), 200_000);
    db.close().unwrap();
}

#[test]
fn test_failed_rename_leaves_database_usable() {
    let temp = TempDir::new().unwrap();
    let path = db_path(&temp);
    create_populated(&path);
    let before = fs::read(&path).unwrap();

    let db = Database::open(&path, OpenMode::ReadWrite).unwrap();
    failpoint::enable(failpoint::REBUILD_BEFORE_RENAME);
    let err = db.reorganize().unwrap_err();
    failpoint::clear();

    assert!(err.is(ErrorKind::StorageIo));
    assert!(!db.needs_recovery());
    assert_eq!(fs::read(&path).unwrap(), before);
    assert_eq!(db.fetch(&key(9)).unwrap(), value(9));

    db.reorganize().unwrap();
    assert_eq!(db.count().unwrap(), KEYS as u64);
    db.close().unwrap();
}

// =============================================================================
// Failure Limit Tests
// =============================================================================

#[test]
fn test_failure_limit_aborts_and_keeps_original() {
    let temp = TempDir::new().unwrap();
    let path = db_path(&temp);
    create_populated(&path);

    let first = bucket_of(&path, &key(0));
    let second = (1..KEYS)
        .map(|i| bucket_of(&path, &key(i)))
        .find(|&offset| offset != first)
        .unwrap();
    smash(&path, first);
    smash(&path, second);
    let damaged = fs::read(&path).unwrap();

    let db = Database::open(&path, OpenMode::ReadWrite).unwrap();
    let err = db
        .recover(&RecoveryConfig {
            force: true,
            backup: true,
            max_failed_buckets: 1,
            ..Default::default()
        })
        .unwrap_err();

    match err {
        DbmError::RecoveryFailed { stats, .. } => assert_eq!(stats.failed_buckets, 2),
        other => panic!("expected RecoveryFailed, got {:?}", other),
    }
    db.close().unwrap();

    // Original untouched, no backup, no temporary left behind
    assert_eq!(fs::read(&path).unwrap(), damaged);
    let names: Vec<_> = fs::read_dir(temp.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(names, vec![std::ffi::OsString::from("test.db")]);
}

#[test]
fn test_backups_get_increasing_numbers() {
    let temp = TempDir::new().unwrap();
    let path = db_path(&temp);
    create_populated(&path);

    let db = Database::open(&path, OpenMode::ReadWrite).unwrap();
    let config = RecoveryConfig {
        force: true,
        backup: true,
        ..Default::default()
    };
    let first = db.recover(&config).unwrap().backup_name.unwrap();
    let second = db.recover(&config).unwrap().backup_name.unwrap();
    db.close().unwrap();

    assert_eq!(first, temp.path().join("test.db.~1~"));
    assert_eq!(second, temp.path().join("test.db.~2~"));
}
