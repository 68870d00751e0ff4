//! Storage Module
//!
//! Block-level persistence for a single database file.
//!
//! ## Responsibilities
//! - Positional block reads and writes, fsync, advisory locking
//! - Encoding and validating the header block
//! - Tracking reclaimed space (avail tables) for reuse
//!
//! ## File Layout
//! ```text
//! ┌────────────────────────────────────────┐
//! │ Block 0: Header                        │
//! │ ┌──────────┬──────────┬──────────────┐ │
//! │ │Magic/CRC │ Geometry │ Avail table  │ │
//! │ └──────────┴──────────┴──────────────┘ │
//! ├────────────────────────────────────────┤
//! │ Directory (2^dir_bits × u64 offsets)   │
//! ├────────────────────────────────────────┤
//! │ Buckets, records, avail overflow       │
//! │ blocks, in allocation order            │
//! └────────────────────────────────────────┘
//! ```

pub mod avail;
pub mod file;
pub mod header;

pub use avail::{AvailBlock, AvailElem};
pub use file::{BlockFile, FileOptions};
pub use header::{Format, Header};
