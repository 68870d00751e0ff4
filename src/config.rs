//! Configuration for hashdbm
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

/// How a database file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open an existing database for reading only
    ReadOnly,

    /// Open an existing database for reading and writing
    ReadWrite,

    /// Open for reading and writing, creating the file if needed
    ReadWriteCreate,

    /// Create a new empty database, overwriting any existing file
    CreateNew,

    /// Create a new database and populate it from the ASCII dump named by
    /// `Config::path`; the database file name comes from the dump header
    LoadFromDump,
}

impl OpenMode {
    /// True for every mode that yields a writable handle
    pub fn is_writer(self) -> bool {
        !matches!(self, OpenMode::ReadOnly)
    }
}

/// Additional open flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    /// Don't take the advisory file lock
    pub no_lock: bool,

    /// Fail with a block size error instead of adjusting the requested size
    /// (used only when creating a new database)
    pub bs_exact: bool,

    /// Create the database in the extended (numsync) format
    /// (used only when creating a new database)
    pub numsync: bool,

    /// Validate every bucket entry's extent when a bucket is read
    pub xverify: bool,
}

/// When changes are forced to stable storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// fsync only on explicit `sync()` and on close (default)
    OnSync,

    /// fsync at the end of every store/delete (safest, slowest)
    EveryWrite,
}

/// Main configuration for opening a database
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // File Configuration
    // -------------------------------------------------------------------------
    /// Database file (or dump file for `OpenMode::LoadFromDump`)
    pub path: PathBuf,

    /// Open mode
    pub mode: OpenMode,

    /// Open flags
    pub flags: OpenFlags,

    /// Requested block size for a new database; `None` uses the default
    pub block_size: Option<u32>,

    /// Permission bits for a newly created file (unix only)
    pub file_mode: u32,

    // -------------------------------------------------------------------------
    // Engine Configuration
    // -------------------------------------------------------------------------
    /// Sync strategy: how often to fsync the database file
    pub sync_strategy: SyncStrategy,

    /// Max number of buckets kept in the in-memory bucket cache
    pub cache_size: usize,

    // -------------------------------------------------------------------------
    // Crash Tolerance
    // -------------------------------------------------------------------------
    /// Maintain the snapshot pair next to the database file
    pub crash_tolerance: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./hashdbm.db"),
            mode: OpenMode::ReadWriteCreate,
            flags: OpenFlags::default(),
            block_size: None,
            file_mode: 0o644,
            sync_strategy: SyncStrategy::OnSync,
            cache_size: 128,
            crash_tolerance: false,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the database (or dump) file path
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.path = path.into();
        self
    }

    /// Set the open mode
    pub fn mode(mut self, mode: OpenMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Set all open flags at once
    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.config.flags = flags;
        self
    }

    /// Disable advisory locking
    pub fn no_lock(mut self, yes: bool) -> Self {
        self.config.flags.no_lock = yes;
        self
    }

    /// Create new databases in the extended (numsync) format
    pub fn numsync(mut self, yes: bool) -> Self {
        self.config.flags.numsync = yes;
        self
    }

    /// Enable extra consistency checks on bucket reads
    pub fn xverify(mut self, yes: bool) -> Self {
        self.config.flags.xverify = yes;
        self
    }

    /// Set the block size for new databases
    pub fn block_size(mut self, size: u32) -> Self {
        self.config.block_size = Some(size);
        self
    }

    /// Require the block size to be used exactly as given
    pub fn bs_exact(mut self, yes: bool) -> Self {
        self.config.flags.bs_exact = yes;
        self
    }

    /// Set the permission bits for a newly created file
    pub fn file_mode(mut self, mode: u32) -> Self {
        self.config.file_mode = mode;
        self
    }

    /// Set the sync strategy
    pub fn sync_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.config.sync_strategy = strategy;
        self
    }

    /// Set the bucket cache size (in buckets)
    pub fn cache_size(mut self, buckets: usize) -> Self {
        self.config.cache_size = buckets;
        self
    }

    /// Enable crash tolerance (snapshot pair)
    pub fn crash_tolerance(mut self, yes: bool) -> Self {
        self.config.crash_tolerance = yes;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

/// Dump file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpFormat {
    /// Length-prefixed binary records
    Binary,

    /// Text format with base64-encoded keys and values
    Ascii,
}

/// Controls dumping a database to a file
#[derive(Debug, Clone)]
pub struct DumpConfig {
    /// Name of the dump file
    pub path: PathBuf,

    /// Dump file format
    pub format: DumpFormat,

    /// Silently overwrite an existing dump file
    pub overwrite: bool,

    /// Permission bits for the dump file (unix only)
    pub file_mode: u32,
}

impl DumpConfig {
    /// ASCII dump to `path`, overwriting any existing file
    pub fn ascii(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            format: DumpFormat::Ascii,
            overwrite: true,
            file_mode: 0o644,
        }
    }

    /// Binary dump to `path`, overwriting any existing file
    pub fn binary(path: impl Into<PathBuf>) -> Self {
        Self {
            format: DumpFormat::Binary,
            ..Self::ascii(path)
        }
    }
}

/// Controls database recovery
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryConfig {
    /// Write a complete backup of the original file before rewriting it
    pub backup: bool,

    /// Recover even if the handle was not flagged as needing recovery
    pub force: bool,

    /// Abort after this many unrecoverable keys (0 = unlimited)
    pub max_failed_keys: usize,

    /// Abort after this many unrecoverable buckets (0 = unlimited)
    pub max_failed_buckets: usize,

    /// Abort after this many failures of either kind (0 = unlimited)
    pub max_failures: usize,
}
