//! Bucket Module
//!
//! Maps key hashes to bucket pages and manages the pages themselves.
//!
//! ## Responsibilities
//! - Directory lookup (top hash bits → bucket offset)
//! - Bucket page encoding, probing, insertion and removal
//! - Splitting a full bucket by one more hash bit
//! - Caching decoded buckets between operations
//!
//! ## Lookup Path
//! ```text
//!   key ──hash──► 31-bit hash
//!                   │
//!        top dir_bits bits
//!                   ▼
//!   ┌──────────────────────────┐
//!   │ Directory [u64; 2^bits]  │──► bucket offset
//!   └──────────────────────────┘          │
//!                         hash % elems    ▼
//!                         ┌──────────────────────────────┐
//!                         │ Bucket: linear probe slots   │──► record
//!                         └──────────────────────────────┘
//! ```

pub mod cache;
pub mod directory;
pub mod page;

pub use cache::BucketCache;
pub use directory::Directory;
pub use page::{Bucket, BucketEntry};
