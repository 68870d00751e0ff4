//! Tests for the Database facade
//!
//! These tests verify:
//! - Basic fetch/store/delete operations and persistence
//! - Iteration
//! - Access modes, locking and handle lifecycle
//! - Concurrent readers
//! - Reorganize and format conversion

mod basic;
mod concurrency;

use std::path::PathBuf;

use hashdbm::{Config, Database, OpenMode};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

pub fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("test.db")
}

pub fn setup_temp_db() -> (TempDir, Database) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::open(db_path(&temp_dir), OpenMode::CreateNew).unwrap();
    (temp_dir, db)
}

/// Small blocks so that a few hundred keys already split buckets
pub fn setup_small_block_db() -> (TempDir, Database) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .path(db_path(&temp_dir))
        .mode(OpenMode::CreateNew)
        .block_size(512)
        .build();
    let db = Database::open_with(config).unwrap();
    (temp_dir, db)
}
