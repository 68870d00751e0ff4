//! # hashdbm
//!
//! A disk-backed key-value store built on an extendible hash table, with:
//! - Single-writer/multi-reader access (in process and across processes)
//! - Optional crash tolerance through copy-on-write commits and a snapshot pair
//! - Offline reorganize and recover
//! - ASCII and binary dump formats
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Database (facade)                        │
//! │        RwLock · access modes · needs-recovery state          │
//! └──────┬──────────────────┬──────────────────┬────────────────┘
//!        │                  │                  │
//!        ▼                  ▼                  ▼
//!  ┌───────────┐     ┌─────────────┐    ┌─────────────┐
//!  │   dump    │     │  HashTable  │    │   rebuild   │
//!  │ ascii/bin │     │   (table)   │    │ reorg/recov │
//!  └───────────┘     └──────┬──────┘    └─────────────┘
//!                           │
//!          ┌────────────────┼────────────────┐
//!          ▼                ▼                ▼
//!   ┌─────────────┐  ┌─────────────┐  ┌─────────────┐
//!   │   bucket    │  │   storage   │  │  snapshot   │
//!   │ dir · cache │  │ header·avail│  │  .s1 / .s2  │
//!   └─────────────┘  └─────────────┘  └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use hashdbm::{Database, OpenMode};
//!
//! let db = Database::open("users.db", OpenMode::ReadWriteCreate)?;
//! db.store(b"alice", b"34", false)?;
//! assert_eq!(db.fetch(b"alice")?, b"34");
//! db.close()?;
//! # Ok::<(), hashdbm::DbmError>(())
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;
pub mod failpoint;
pub mod hash;

pub mod bucket;
pub mod database;
pub mod dump;
pub mod rebuild;
pub mod snapshot;
pub mod storage;
pub mod table;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{
    Config, ConfigBuilder, DumpConfig, DumpFormat, OpenFlags, OpenMode, RecoveryConfig,
    SyncStrategy,
};
pub use database::{Database, Keys};
pub use error::{Corruption, DbmError, ErrorKind, Result, SnapshotStatus};
pub use rebuild::RecoveryStats;
pub use snapshot::{restore, SnapshotPair};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of hashdbm
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library version as (major, minor, patch)
pub fn version() -> (u32, u32, u32) {
    let parse = |s: &str| s.parse().unwrap_or(0);
    (
        parse(env!("CARGO_PKG_VERSION_MAJOR")),
        parse(env!("CARGO_PKG_VERSION_MINOR")),
        parse(env!("CARGO_PKG_VERSION_PATCH")),
    )
}

/// Human-readable version line
pub fn version_string() -> String {
    format!("hashdbm {}", VERSION)
}
