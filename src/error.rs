//! Error types for hashdbm
//!
//! Provides a unified error type for all operations.
//!
//! Every fallible call returns a [`DbmError`]. Callers classify errors with
//! [`DbmError::kind`], which compares by taxonomy only and ignores any wrapped
//! system error or detail string.

use std::io;

use thiserror::Error;

use crate::rebuild::RecoveryStats;

/// Result type alias using DbmError
pub type Result<T> = std::result::Result<T, DbmError>;

/// Unified error type for hashdbm operations
#[derive(Debug, Error)]
pub enum DbmError {
    // -------------------------------------------------------------------------
    // Lookup Errors
    // -------------------------------------------------------------------------
    #[error("Item not found")]
    NotFound,

    #[error("Cannot replace existing item")]
    CannotReplace,

    // -------------------------------------------------------------------------
    // Access Mode Errors
    // -------------------------------------------------------------------------
    #[error("Reader can't {0}")]
    ReaderCannotWrite(WriteOp),

    #[error("Database is locked by another handle ({0})")]
    Locked(LockKind),

    #[error("Database not open")]
    NotOpen,

    // -------------------------------------------------------------------------
    // Structural Errors
    // -------------------------------------------------------------------------
    #[error("Corruption detected: {0}")]
    Corruption(#[from] Corruption),

    #[error("Capacity exceeded: {0}")]
    Capacity(#[from] Capacity),

    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("File {op} error: {source}")]
    StorageIo {
        op: IoOp,
        #[source]
        source: io::Error,
    },

    // -------------------------------------------------------------------------
    // Capability / Usage Errors
    // -------------------------------------------------------------------------
    #[error("Function not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("Usage error: {0}")]
    Usage(String),

    // -------------------------------------------------------------------------
    // Crash Tolerance / Recovery Errors
    // -------------------------------------------------------------------------
    #[error("Snapshots exist")]
    SnapshotExists,

    #[error("Snapshot selection failed: {0}")]
    Snapshot(SnapshotStatus),

    #[error("Recovery aborted: {reason}")]
    RecoveryFailed {
        reason: String,
        stats: RecoveryStats,
    },

    #[error("Failed to create backup: {0}")]
    BackupFailed(#[source] io::Error),
}

/// Classification of a [`DbmError`], used for kind-only comparisons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    CannotReplace,
    ReaderCannotWrite,
    Locked,
    NotOpen,
    Corruption,
    Capacity,
    StorageIo,
    NotImplemented,
    Usage,
    SnapshotExists,
    Snapshot,
    RecoveryFailed,
    BackupFailed,
}

/// Write operation rejected on a read-only handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WriteOp {
    #[error("store")]
    Store,
    #[error("delete")]
    Delete,
    #[error("reorganize")]
    Reorganize,
    #[error("load")]
    Load,
    #[error("recover")]
    Recover,
    #[error("convert")]
    Convert,
}

/// Which lock could not be acquired at open time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LockKind {
    /// A reader could not get a shared lock (a writer holds the file)
    #[error("can't be reader")]
    Shared,
    /// A writer could not get an exclusive lock
    #[error("can't be writer")]
    Exclusive,
}

/// Detail of a structural corruption error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Corruption {
    #[error("bad magic number {0:#010x}")]
    BadMagic(u32),

    #[error("bad file header: {0}")]
    BadHeader(String),

    #[error("malformed bucket at {offset}: {reason}")]
    BadBucket { offset: u64, reason: String },

    #[error("malformed hash table: {0}")]
    BadHashTable(String),

    #[error("invalid directory entry {index} -> {offset}")]
    BadDirEntry { index: usize, offset: u64 },

    #[error("malformed avail table: {0}")]
    BadAvail(String),

    #[error("malformed bucket entry in bucket {offset}: {reason}")]
    BadHashEntry { offset: u64, reason: String },

    #[error("unexpected end of file reading {len} bytes at {offset}")]
    FileEof { offset: u64, len: usize },

    #[error("database file is empty")]
    EmptyDatabase,

    #[error("malformed data at line {line}: {reason}")]
    MalformedData { line: usize, reason: String },

    #[error("database needs recovery")]
    NeedRecovery,
}

/// Detail of a capacity error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Capacity {
    #[error("block size {0} is not usable")]
    BlockSize(u32),

    #[error("bucket directory overflow")]
    DirOverflow,

    #[error("record of {0} bytes is too large")]
    RecordTooLarge(usize),
}

/// The file operation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IoOp {
    #[error("open")]
    Open,
    #[error("read")]
    Read,
    #[error("write")]
    Write,
    #[error("stat")]
    Stat,
    #[error("sync")]
    Sync,
    #[error("truncate")]
    Truncate,
    #[error("rename")]
    Rename,
    #[error("remove")]
    Remove,
}

/// Outcome of choosing between the two snapshots of a database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SnapshotStatus {
    /// Neither snapshot is readable and complete
    #[error("neither snapshot is readable")]
    Bad,
    /// Both snapshots carry the same sync sequence number
    #[error("snapshot sync numbers are the same")]
    Same,
    /// The sequence numbers are more than one commit apart
    #[error("selected snapshot is unreliable")]
    Suspicious,
}

impl DbmError {
    /// Kind of this error; wrapped data is not part of the comparison
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbmError::NotFound => ErrorKind::NotFound,
            DbmError::CannotReplace => ErrorKind::CannotReplace,
            DbmError::ReaderCannotWrite(_) => ErrorKind::ReaderCannotWrite,
            DbmError::Locked(_) => ErrorKind::Locked,
            DbmError::NotOpen => ErrorKind::NotOpen,
            DbmError::Corruption(_) => ErrorKind::Corruption,
            DbmError::Capacity(_) => ErrorKind::Capacity,
            DbmError::StorageIo { .. } => ErrorKind::StorageIo,
            DbmError::NotImplemented(_) => ErrorKind::NotImplemented,
            DbmError::Usage(_) => ErrorKind::Usage,
            DbmError::SnapshotExists => ErrorKind::SnapshotExists,
            DbmError::Snapshot(_) => ErrorKind::Snapshot,
            DbmError::RecoveryFailed { .. } => ErrorKind::RecoveryFailed,
            DbmError::BackupFailed(_) => ErrorKind::BackupFailed,
        }
    }

    /// True if this error is of the given kind
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind() == kind
    }

    /// The system error that caused the failure, if any
    pub fn sys_error(&self) -> Option<&io::Error> {
        match self {
            DbmError::StorageIo { source, .. } => Some(source),
            DbmError::BackupFailed(source) => Some(source),
            _ => None,
        }
    }

    /// True for errors that indicate on-disk structural damage
    pub fn is_structural(&self) -> bool {
        matches!(self, DbmError::Corruption(_))
    }

    pub(crate) fn io(op: IoOp) -> impl FnOnce(io::Error) -> DbmError {
        move |source| DbmError::StorageIo { op, source }
    }
}

impl PartialEq<ErrorKind> for DbmError {
    fn eq(&self, other: &ErrorKind) -> bool {
        self.kind() == *other
    }
}
