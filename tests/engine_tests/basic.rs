use std::collections::HashSet;

use hashdbm::{Database, ErrorKind, OpenMode};

use super::{db_path, setup_small_block_db, setup_temp_db};

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_store_then_fetch() {
    let (_temp, db) = setup_temp_db();

    db.store(b"hello", b"world", true).unwrap();

    assert_eq!(db.fetch(b"hello").unwrap(), b"world");
    assert!(db.exists(b"hello").unwrap());
    db.close().unwrap();
}

#[test]
fn test_fetch_missing_key() {
    let (_temp, db) = setup_temp_db();

    let err = db.fetch(b"nonexistent").unwrap_err();

    assert!(err.is(ErrorKind::NotFound));
    assert!(!db.exists(b"nonexistent").unwrap());
    db.close().unwrap();
}

#[test]
fn test_store_without_replace_keeps_old_value() {
    let (_temp, db) = setup_temp_db();
    db.insert(b"key", b"first").unwrap();

    let err = db.insert(b"key", b"second").unwrap_err();

    assert_eq!(err.kind(), ErrorKind::CannotReplace);
    assert_eq!(db.fetch(b"key").unwrap(), b"first");
    db.close().unwrap();
}

#[test]
fn test_replace_with_different_sizes() {
    let (_temp, db) = setup_temp_db();

    db.replace(b"key", b"short").unwrap();
    db.replace(b"key", &[b'x'; 3000]).unwrap();
    assert_eq!(db.fetch(b"key").unwrap(), vec![b'x'; 3000]);

    db.replace(b"key", b"tiny").unwrap();
    assert_eq!(db.fetch(b"key").unwrap(), b"tiny");
    assert_eq!(db.count().unwrap(), 1);
    db.close().unwrap();
}

#[test]
fn test_delete_then_fetch_not_found() {
    let (_temp, db) = setup_temp_db();
    db.store(b"key", b"value", false).unwrap();

    db.delete(b"key").unwrap();

    assert!(db.fetch(b"key").unwrap_err().is(ErrorKind::NotFound));
    assert!(db.delete(b"key").unwrap_err().is(ErrorKind::NotFound));
    db.close().unwrap();
}

#[test]
fn test_empty_key_and_value() {
    let (_temp, db) = setup_temp_db();

    db.store(b"", b"empty key", false).unwrap();
    db.store(b"empty value", b"", false).unwrap();

    assert_eq!(db.fetch(b"").unwrap(), b"empty key");
    assert_eq!(db.fetch(b"empty value").unwrap(), b"");
    db.close().unwrap();
}

#[test]
fn test_keys_sharing_a_prefix() {
    let (_temp, db) = setup_temp_db();

    db.store(b"abcd1", b"1", false).unwrap();
    db.store(b"abcd2", b"2", false).unwrap();
    db.store(b"abc", b"3", false).unwrap();

    assert_eq!(db.fetch(b"abcd1").unwrap(), b"1");
    assert_eq!(db.fetch(b"abcd2").unwrap(), b"2");
    assert_eq!(db.fetch(b"abc").unwrap(), b"3");
    assert!(db.fetch(b"abcd").unwrap_err().is(ErrorKind::NotFound));
    db.close().unwrap();
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_values_survive_reopen() {
    let (temp, db) = setup_small_block_db();
    for i in 0..1000u32 {
        db.store(format!("key{}", i).as_bytes(), format!("value{}", i).as_bytes(), true)
            .unwrap();
    }
    db.close().unwrap();

    let db = Database::open(db_path(&temp), OpenMode::ReadOnly).unwrap();
    for i in 0..1000u32 {
        assert_eq!(
            db.fetch(format!("key{}", i).as_bytes()).unwrap(),
            format!("value{}", i).as_bytes()
        );
    }
    assert_eq!(db.count().unwrap(), 1000);
    db.close().unwrap();
}

#[test]
fn test_deletes_survive_reopen() {
    let (temp, db) = setup_small_block_db();
    for i in 0..300u32 {
        db.store(&i.to_be_bytes(), b"v", false).unwrap();
    }
    for i in (0..300u32).filter(|i| i % 3 == 0) {
        db.delete(&i.to_be_bytes()).unwrap();
    }
    db.close().unwrap();

    let db = Database::open(db_path(&temp), OpenMode::ReadWrite).unwrap();
    assert_eq!(db.count().unwrap(), 200);
    assert!(db.fetch(&3u32.to_be_bytes()).unwrap_err().is(ErrorKind::NotFound));
    assert_eq!(db.fetch(&4u32.to_be_bytes()).unwrap(), b"v");
    db.close().unwrap();
}

#[test]
fn test_ten_keys_scenario() {
    let names = [
        "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten",
    ];
    let (temp, db) = setup_temp_db();
    for (i, name) in names.iter().enumerate() {
        db.store(name.as_bytes(), i.to_string().as_bytes(), false)
            .unwrap();
    }
    db.delete(b"seven").unwrap();
    db.store(b"eleven", b"ELEVEN", false).unwrap();
    db.close().unwrap();

    let db = Database::open(db_path(&temp), OpenMode::ReadOnly).unwrap();
    let keys: HashSet<Vec<u8>> = db.keys().map(|k| k.unwrap()).collect();

    assert_eq!(keys.len(), 10);
    assert!(!keys.contains(&b"seven".to_vec()));
    assert!(keys.contains(&b"eleven".to_vec()));
    assert_eq!(db.fetch(b"eleven").unwrap(), b"ELEVEN");
    assert_eq!(db.fetch(b"ten").unwrap(), b"9");
    db.close().unwrap();
}

// =============================================================================
// Iteration Tests
// =============================================================================

#[test]
fn test_iteration_yields_every_key_once() {
    let (_temp, db) = setup_small_block_db();
    for i in 0..750u32 {
        db.store(format!("k{}", i).as_bytes(), b"x", false).unwrap();
    }

    let keys: Vec<Vec<u8>> = db.keys().map(|k| k.unwrap()).collect();
    let distinct: HashSet<_> = keys.iter().cloned().collect();

    assert_eq!(keys.len(), 750);
    assert_eq!(distinct.len(), 750);
    db.close().unwrap();
}

#[test]
fn test_fresh_iterator_restarts() {
    let (_temp, db) = setup_temp_db();
    for i in 0..50u32 {
        db.store(&i.to_le_bytes(), b"x", false).unwrap();
    }

    let first: HashSet<Vec<u8>> = db.keys().map(|k| k.unwrap()).collect();
    let second: HashSet<Vec<u8>> = db.keys().map(|k| k.unwrap()).collect();

    assert_eq!(first.len(), 50);
    assert_eq!(first, second);
    db.close().unwrap();
}

#[test]
fn test_iteration_of_empty_database() {
    let (_temp, db) = setup_temp_db();

    assert_eq!(db.keys().count(), 0);
    assert_eq!(db.count().unwrap(), 0);
    db.close().unwrap();
}

#[test]
fn test_exhausted_iterator_stays_exhausted() {
    let (_temp, db) = setup_temp_db();
    db.store(b"only", b"1", false).unwrap();

    let mut keys = db.keys();
    assert_eq!(keys.next().unwrap().unwrap(), b"only");
    assert!(keys.next().is_none());
    assert!(keys.next().is_none());
    drop(keys);
    db.close().unwrap();
}

#[test]
fn test_deleting_while_iterating_never_fails() {
    let (_temp, db) = setup_small_block_db();
    for i in 0..400u32 {
        db.store(&i.to_le_bytes(), b"payload", false).unwrap();
    }

    let mut seen = 0;
    for key in db.keys() {
        let key = key.unwrap();
        // Deleting the visited key shifts later entries of the same bucket
        let _ = db.delete(&key);
        seen += 1;
    }

    assert!(seen > 0 && seen <= 400);
    db.close().unwrap();
}

// =============================================================================
// Reorganize / Convert Tests
// =============================================================================

#[test]
fn test_reorganize_shrinks_file_and_keeps_records() {
    let (temp, db) = setup_small_block_db();
    for i in 0..400u32 {
        db.store(&i.to_le_bytes(), &[7u8; 200], false).unwrap();
    }
    for i in 0..350u32 {
        db.delete(&i.to_le_bytes()).unwrap();
    }
    let before = std::fs::metadata(db_path(&temp)).unwrap().len();

    db.reorganize().unwrap();

    let after = std::fs::metadata(db_path(&temp)).unwrap().len();
    assert!(after < before, "{} should be below {}", after, before);
    assert_eq!(db.count().unwrap(), 50);
    for i in 350..400u32 {
        assert_eq!(db.fetch(&i.to_le_bytes()).unwrap(), vec![7u8; 200]);
    }

    // Still writable, still there after reopen
    db.store(b"after", b"reorganize", false).unwrap();
    db.close().unwrap();
    let db = Database::open(db_path(&temp), OpenMode::ReadOnly).unwrap();
    assert_eq!(db.count().unwrap(), 51);
    db.close().unwrap();
}

#[test]
fn test_reorganize_leaves_no_temporary_files() {
    let (temp, db) = setup_temp_db();
    db.store(b"k", b"v", false).unwrap();

    db.reorganize().unwrap();
    db.close().unwrap();

    let names: Vec<_> = std::fs::read_dir(temp.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(names, vec![std::ffi::OsString::from("test.db")]);
}

#[test]
fn test_convert_between_formats() {
    let (temp, db) = setup_temp_db();
    for i in 0..20u32 {
        db.store(&i.to_le_bytes(), b"x", false).unwrap();
    }
    assert!(!db.is_numsync().unwrap());

    db.convert(true).unwrap();
    assert!(db.is_numsync().unwrap());
    assert_eq!(db.count().unwrap(), 20);
    db.close().unwrap();

    let db = Database::open(db_path(&temp), OpenMode::ReadWrite).unwrap();
    assert!(db.is_numsync().unwrap());
    db.delete(&0u32.to_le_bytes()).unwrap();
    assert_eq!(db.count().unwrap(), 19);

    db.convert(false).unwrap();
    assert!(!db.is_numsync().unwrap());
    assert_eq!(db.count().unwrap(), 19);
    db.close().unwrap();
}
