//! Snapshot Module
//!
//! Crash tolerance through a pair of snapshot files kept next to the
//! database.
//!
//! ## Responsibilities
//! - Capture header + directory of every commit into the stale slot
//! - Choose the newest trustworthy snapshot after a crash
//! - Write the chosen state back into the database file
//!
//! ## Commit Protocol
//! ```text
//!  dirty pages ──► fsync ──► numsync += 1
//!                               │
//!              ┌────────────────▼────────────────┐
//!              │ stale slot (.s1 odd / .s2 even) │  state = Writing, fsync
//!              │                                 │  state = Complete, fsync
//!              └────────────────┬────────────────┘
//!                               ▼
//!                  header in place ──► fsync ──► release deferred blocks
//! ```
//!
//! Slots alternate, so one slot always holds the previous commit while the
//! other is being rewritten.

pub mod record;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::bucket::Directory;
use crate::error::{DbmError, IoOp, Result, SnapshotStatus};
use crate::storage::{BlockFile, FileOptions, Header};

pub use record::{Snapshot, SnapshotHeader, SnapshotState};

/// Extensions of the two snapshot slots
pub const FIRST_EXTENSION: &str = "s1";
pub const SECOND_EXTENSION: &str = "s2";

/// The two snapshot files belonging to one database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPair {
    pub first: PathBuf,
    pub second: PathBuf,
}

/// Result of snapshot selection
#[derive(Debug, Clone)]
pub struct Selected {
    pub snapshot: Snapshot,
    pub header: Header,
}

impl SnapshotPair {
    /// Snapshot names for a database: its extension replaced by `s1`/`s2`
    pub fn for_database(path: &Path) -> Self {
        Self {
            first: path.with_extension(FIRST_EXTENSION),
            second: path.with_extension(SECOND_EXTENSION),
        }
    }

    /// True if either snapshot file is present
    pub fn exist(&self) -> bool {
        self.first.exists() || self.second.exists()
    }

    /// Remove both files; missing files are not an error
    pub fn remove(&self) -> Result<()> {
        for path in [&self.first, &self.second] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(DbmError::StorageIo {
                        op: IoOp::Remove,
                        source: e,
                    })
                }
            }
        }
        Ok(())
    }

    /// Slot that a commit with sequence number `numsync` goes to
    pub fn slot_for(&self, numsync: u64) -> &Path {
        if numsync % 2 == 1 {
            &self.first
        } else {
            &self.second
        }
    }

    /// Capture a committed state into its slot
    pub fn write(&self, header: &Header, directory: &Directory) -> Result<()> {
        record::write(
            self.slot_for(header.numsync),
            header.numsync,
            &header.encode(),
            &directory.encode(),
        )
    }

    /// Pick the snapshot to restore from
    ///
    /// Only complete snapshots with intact checksums and a consistent header
    /// are considered. With two candidates the newer wins when they are one
    /// commit apart; equal or distant sequence numbers fail closed.
    pub fn select(&self) -> Result<Selected> {
        let first = Self::candidate(&self.first)?;
        let second = Self::candidate(&self.second)?;

        match (first, second) {
            (None, None) => Err(DbmError::Snapshot(SnapshotStatus::Bad)),
            (Some(only), None) | (None, Some(only)) => Ok(only),
            (Some(a), Some(b)) => {
                let (older, newer) = if a.header.numsync <= b.header.numsync {
                    (a, b)
                } else {
                    (b, a)
                };
                match newer.header.numsync - older.header.numsync {
                    0 => Err(DbmError::Snapshot(SnapshotStatus::Same)),
                    1 => Ok(newer),
                    gap => {
                        tracing::warn!(
                            "Snapshot sync numbers {} and {} are {} commits apart",
                            older.header.numsync,
                            newer.header.numsync,
                            gap
                        );
                        Err(DbmError::Snapshot(SnapshotStatus::Suspicious))
                    }
                }
            }
        }
    }

    fn candidate(path: &Path) -> Result<Option<Selected>> {
        let snapshot = match record::read(path) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return Ok(None),
            Err(e) if e.is_structural() => {
                tracing::warn!("Ignoring damaged snapshot: {}", e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        match snapshot.verify() {
            Ok(header) => Ok(Some(Selected { snapshot, header })),
            Err(reason) => {
                tracing::warn!("Ignoring untrustworthy snapshot: {}", reason);
                Ok(None)
            }
        }
    }
}

/// Restore a database from its snapshot pair
///
/// Writes the selected directory and header back into the database file,
/// syncs it, then removes both snapshots. Returns the restored sync number.
pub fn restore(path: &Path) -> Result<u64> {
    let pair = SnapshotPair::for_database(path);
    let selected = pair.select()?;

    // Step 1: Open the database exclusively
    let file = BlockFile::open(
        path,
        FileOptions {
            writable: true,
            create: false,
            truncate: false,
            file_mode: 0o644,
            lock: true,
        },
    )?;

    // Step 2: Directory first, then the header that names it
    file.write_at(selected.header.dir_offset, selected.snapshot.directory_bytes())?;
    file.write_at(0, selected.snapshot.header_block())?;
    file.sync()?;

    // Step 3: The database now matches the snapshot
    pair.remove()?;

    tracing::info!(
        "Restored {} from {} (numsync={})",
        path.display(),
        selected.snapshot.path.display(),
        selected.header.numsync
    );
    Ok(selected.header.numsync)
}
