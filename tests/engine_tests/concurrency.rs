use std::sync::Arc;
use std::thread;

use hashdbm::{Database, OpenMode};

use super::{db_path, setup_small_block_db};

// =============================================================================
// Concurrent Access Tests
// =============================================================================

#[test]
fn test_concurrent_fetches_on_reader() {
    let (temp, db) = setup_small_block_db();
    for i in 0..500u32 {
        db.store(format!("key{}", i).as_bytes(), &i.to_le_bytes(), false)
            .unwrap();
    }
    db.close().unwrap();

    let reader = Arc::new(Database::open(db_path(&temp), OpenMode::ReadOnly).unwrap());
    let mut handles = vec![];

    for t in 0..8u32 {
        let reader = Arc::clone(&reader);
        handles.push(thread::spawn(move || {
            for round in 0..3u32 {
                for i in 0..500u32 {
                    let i = (i + t * 61 + round * 17) % 500;
                    let value = reader.fetch(format!("key{}", i).as_bytes()).unwrap();
                    assert_eq!(value, i.to_le_bytes());
                }
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }
    reader.close().unwrap();
}

#[test]
fn test_concurrent_readers_and_writer_in_process() {
    let (_temp, db) = setup_small_block_db();
    let db = Arc::new(db);
    for i in 0..100u32 {
        db.store(&i.to_le_bytes(), b"base", false).unwrap();
    }

    let writer = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            for i in 100..600u32 {
                db.store(&i.to_le_bytes(), b"more", false).unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for _ in 0..20 {
                    for i in 0..100u32 {
                        assert_eq!(db.fetch(&i.to_le_bytes()).unwrap(), b"base");
                    }
                    // Iteration during writes never errors
                    for key in db.keys() {
                        key.unwrap();
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(db.count().unwrap(), 600);
    db.close().unwrap();
}

#[test]
fn test_concurrent_writers_are_serialized() {
    let (_temp, db) = setup_small_block_db();
    let db = Arc::new(db);

    let handles: Vec<_> = (0..4u32)
        .map(|t| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for i in 0..150u32 {
                    let key = format!("t{}-{}", t, i);
                    db.store(key.as_bytes(), key.as_bytes(), false).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(db.keys().count(), 600);
    assert_eq!(db.fetch(b"t3-149").unwrap(), b"t3-149");
    db.close().unwrap();
}
