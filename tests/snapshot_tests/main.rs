//! Tests for crash tolerance
//!
//! These tests verify:
//! - Snapshot pair lifecycle (created on open, removed on close)
//! - Restoring after a crash at each step of the commit protocol
//! - Snapshot selection with damaged, incomplete or duplicated snapshots
//! - Recovery after restore
//! - A damaged database keeps its snapshots through close
//!
//! A crash is simulated by failing the commit at a failpoint and then
//! leaking the handle, so nothing runs that a dead process would not run.
//! Those handles are opened without the advisory lock, since a leaked
//! descriptor would keep holding it.

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use hashdbm::error::SnapshotStatus;
use hashdbm::failpoint;
use hashdbm::hash::hash_key;
use hashdbm::storage::{BlockFile, FileOptions};
use hashdbm::table::{HashTable, TableOptions};
use hashdbm::{
    Config, Database, DbmError, ErrorKind, OpenMode, RecoveryConfig, SnapshotPair, SyncStrategy,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("test.db")
}

fn open_tolerant(path: &Path, mode: OpenMode) -> hashdbm::Result<Database> {
    Database::open_with(
        Config::builder()
            .path(path)
            .mode(mode)
            .block_size(512)
            .crash_tolerance(true)
            .no_lock(true)
            .build(),
    )
}

/// Fail the next commit at `point`, then abandon the handle
fn crash_at(db: Database, point: &'static str) {
    failpoint::enable(point);
    let err = db.sync().unwrap_err();
    failpoint::clear();
    assert!(err.is(ErrorKind::StorageIo));
    std::mem::forget(db);
}

/// Overwrite the start of the bucket holding `key` in a closed database
fn smash_bucket_of(path: &Path, key: &[u8]) {
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
    let offset = table.directory().locate(hash_key(key));
    drop(table);

    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&[0xFF; 4]).unwrap();
    file.sync_all().unwrap();
}

/// Database with `committed` keys synced and `pending` keys stored after the
/// last commit
fn populate(path: &Path, committed: u32, pending: u32) -> Database {
    let db = open_tolerant(path, OpenMode::CreateNew).unwrap();
    for i in 0..committed {
        db.store(format!("c{}", i).as_bytes(), b"committed", false)
            .unwrap();
    }
    db.sync().unwrap();
    for i in 0..pending {
        db.store(format!("p{}", i).as_bytes(), b"pending", false)
            .unwrap();
    }
    db
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_snapshots_exist_only_while_open() {
    let temp = TempDir::new().unwrap();
    let pair = SnapshotPair::for_database(&db_path(&temp));

    let db = open_tolerant(&db_path(&temp), OpenMode::CreateNew).unwrap();
    assert!(db.crash_tolerant().unwrap());
    assert!(db.is_numsync().unwrap());
    assert!(pair.exist());

    db.store(b"k", b"v", false).unwrap();
    db.close().unwrap();
    assert!(!pair.exist());

    let db = open_tolerant(&db_path(&temp), OpenMode::ReadWrite).unwrap();
    assert_eq!(db.fetch(b"k").unwrap(), b"v");
    db.close().unwrap();
}

#[test]
fn test_leftover_snapshots_block_open() {
    let temp = TempDir::new().unwrap();
    let db = populate(&db_path(&temp), 5, 0);
    std::mem::forget(db);

    let err = open_tolerant(&db_path(&temp), OpenMode::ReadWrite)
        .err()
        .unwrap();
    assert!(matches!(err, DbmError::SnapshotExists));
}

#[test]
fn test_tolerant_mode_on_existing_numsync_file() {
    let temp = TempDir::new().unwrap();
    let config = Config::builder()
        .path(db_path(&temp))
        .mode(OpenMode::CreateNew)
        .numsync(true)
        .build();
    let db = Database::open_with(config).unwrap();
    db.store(b"before", b"1", false).unwrap();
    db.close().unwrap();

    let db = open_tolerant(&db_path(&temp), OpenMode::ReadWrite).unwrap();
    db.store(b"after", b"2", false).unwrap();
    assert_eq!(db.count().unwrap(), 2);
    db.close().unwrap();
}

#[test]
fn test_many_updates_between_commits() {
    let temp = TempDir::new().unwrap();
    let db = open_tolerant(&db_path(&temp), OpenMode::CreateNew).unwrap();

    for round in 0..5u32 {
        for i in 0..200u32 {
            let key = format!("k{}", i);
            db.store(key.as_bytes(), format!("{}-{}", round, i).as_bytes(), true)
                .unwrap();
        }
        for i in (0..200u32).step_by(7) {
            db.delete(format!("k{}", i).as_bytes()).unwrap();
        }
        db.sync().unwrap();
    }

    assert_eq!(db.fetch(b"k1").unwrap(), b"4-1");
    assert!(db.fetch(b"k7").unwrap_err().is(ErrorKind::NotFound));
    db.close().unwrap();
}

// =============================================================================
// Crash Simulation Tests
// =============================================================================

#[test]
fn test_crash_before_header_restores_completed_snapshot() {
    let temp = TempDir::new().unwrap();
    let db = populate(&db_path(&temp), 50, 50);

    // The snapshot of the failed commit is complete, only the header is missing
    crash_at(db, failpoint::COMMIT_BEFORE_HEADER);
    hashdbm::restore(&db_path(&temp)).unwrap();

    let db = open_tolerant(&db_path(&temp), OpenMode::ReadWrite).unwrap();
    assert_eq!(db.count().unwrap(), 100);
    assert_eq!(db.fetch(b"c0").unwrap(), b"committed");
    assert_eq!(db.fetch(b"p49").unwrap(), b"pending");
    db.close().unwrap();
}

#[test]
fn test_crash_before_flip_falls_back_to_previous_commit() {
    let temp = TempDir::new().unwrap();
    let db = populate(&db_path(&temp), 50, 50);

    // The new snapshot never reached `Complete`
    crash_at(db, failpoint::SNAPSHOT_BEFORE_FLIP);
    hashdbm::restore(&db_path(&temp)).unwrap();

    let db = open_tolerant(&db_path(&temp), OpenMode::ReadWrite).unwrap();
    assert_eq!(db.count().unwrap(), 50);
    for i in 0..50u32 {
        assert_eq!(db.fetch(format!("c{}", i).as_bytes()).unwrap(), b"committed");
    }
    assert!(db.fetch(b"p0").unwrap_err().is(ErrorKind::NotFound));

    // Usable for new commits
    db.store(b"new", b"value", false).unwrap();
    db.sync().unwrap();
    db.close().unwrap();
}

#[test]
fn test_truncated_snapshot_then_recover() {
    let temp = TempDir::new().unwrap();
    let path = db_path(&temp);
    let db = populate(&path, 40, 10);
    crash_at(db, failpoint::COMMIT_BEFORE_HEADER);

    // Damage the newest snapshot
    let pair = SnapshotPair::for_database(&path);
    let newest = pair.select().unwrap().snapshot.path;
    let data = fs::read(&newest).unwrap();
    fs::write(&newest, &data[..40]).unwrap();

    let restored = hashdbm::restore(&path).unwrap();
    assert!(!pair.exist());

    let db = open_tolerant(&path, OpenMode::ReadWrite).unwrap();
    let stats = db
        .recover(&RecoveryConfig {
            force: true,
            ..Default::default()
        })
        .unwrap();

    assert_eq!(stats.failed_keys, 0);
    assert_eq!(stats.failed_buckets, 0);
    assert!(stats.recovered_keys >= 40);
    for i in 0..40u32 {
        assert_eq!(db.fetch(format!("c{}", i).as_bytes()).unwrap(), b"committed");
    }
    assert!(db.crash_tolerant().unwrap());
    db.close().unwrap();
    assert!(restored > 0);
}

#[test]
fn test_every_write_commits_each_update() {
    let temp = TempDir::new().unwrap();
    let db = Database::open_with(
        Config::builder()
            .path(db_path(&temp))
            .mode(OpenMode::CreateNew)
            .crash_tolerance(true)
            .no_lock(true)
            .sync_strategy(SyncStrategy::EveryWrite)
            .build(),
    )
    .unwrap();
    for i in 0..20u32 {
        db.store(&i.to_le_bytes(), b"v", false).unwrap();
    }
    std::mem::forget(db);

    hashdbm::restore(&db_path(&temp)).unwrap();
    let db = Database::open(db_path(&temp), OpenMode::ReadOnly).unwrap();
    assert_eq!(db.count().unwrap(), 20);
    db.close().unwrap();
}

// =============================================================================
// Snapshot Selection Tests
// =============================================================================

#[test]
fn test_equal_sequence_numbers_fail_closed() {
    let temp = TempDir::new().unwrap();
    let path = db_path(&temp);
    let db = populate(&path, 10, 0);
    std::mem::forget(db);

    let pair = SnapshotPair::for_database(&path);
    let newest = pair.select().unwrap().snapshot.path;
    let other = if newest == pair.first {
        &pair.second
    } else {
        &pair.first
    };
    fs::copy(&newest, other).unwrap();

    let err = hashdbm::restore(&path).unwrap_err();
    assert!(matches!(err, DbmError::Snapshot(SnapshotStatus::Same)));
    // Nothing was touched
    assert!(pair.exist());
}

#[test]
fn test_no_usable_snapshot_is_bad() {
    let temp = TempDir::new().unwrap();
    let path = db_path(&temp);
    let db = populate(&path, 10, 0);
    std::mem::forget(db);

    let pair = SnapshotPair::for_database(&path);
    for snapshot in [&pair.first, &pair.second] {
        fs::write(snapshot, b"garbage").unwrap();
    }

    let err = hashdbm::restore(&path).unwrap_err();
    assert!(matches!(err, DbmError::Snapshot(SnapshotStatus::Bad)));
}

#[test]
fn test_close_after_corruption_keeps_snapshots() {
    let temp = TempDir::new().unwrap();
    let path = db_path(&temp);
    populate(&path, 5, 0).close().unwrap();
    smash_bucket_of(&path, b"c0");

    let db = open_tolerant(&path, OpenMode::ReadWrite).unwrap();
    let pair = SnapshotPair::for_database(&path);
    assert!(db.fetch(b"c0").unwrap_err().is(ErrorKind::Corruption));
    assert!(db.needs_recovery());

    let before = fs::read(&path).unwrap();
    db.close().unwrap();

    assert!(pair.exist());
    assert_eq!(fs::read(&path).unwrap(), before);
    let err = open_tolerant(&path, OpenMode::ReadWrite).err().unwrap();
    assert!(matches!(err, DbmError::SnapshotExists));
}

#[test]
fn test_restore_without_snapshots() {
    let temp = TempDir::new().unwrap();

    let err = hashdbm::restore(&db_path(&temp)).unwrap_err();

    assert!(err.is(ErrorKind::Snapshot));
}
