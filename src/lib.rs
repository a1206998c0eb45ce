//! halfdisk - A disk-backed hash map from byte keys to `i64` values
//!
//! Entries are grouped into buckets by the low bits of their hash code. The
//! buckets live in append-only data files; only a dense bucket index (one
//! `u64` location per bucket) is kept in memory, or optionally in a file.
//!
//! # Features
//!
//! - Lock-free reads concurrent with writes
//! - Batched write sessions with per-key mutation collapsing
//! - Parallel read-update, serial append flush pipeline on a shared executor
//! - Snapshots by hard-linking immutable data files
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use halfdisk::{hash_key, HalfDiskHashMap, HalfDiskHashMapConfig};
//!
//! # fn main() -> halfdisk::Result<()> {
//! let config = HalfDiskHashMapConfig::new("/tmp/halfdisk", "accounts").with_map_size(1 << 20);
//! let map = HalfDiskHashMap::open(config)?;
//!
//! map.start_writing()?;
//! map.put(b"alice", hash_key(b"alice"), 100)?;
//! map.put_if_equal(b"alice", hash_key(b"alice"), 100, 101)?;
//! map.end_writing()?;
//!
//! assert_eq!(map.get(b"alice", hash_key(b"alice"), -1)?, 101);
//! map.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod bucket;
pub mod config;
pub mod device;
pub mod error;
pub mod files;
pub mod hash;
pub mod index;
pub mod map;
pub mod mutation;

// Re-exports for convenience
pub use bucket::{Bucket, BucketEntry, ParsedBucket, RawBucket, ReusableBucketPool, INVALID_VALUE};
pub use config::{ConfigError, ConfigFile, HalfDiskHashMapConfig};
pub use error::{Error, Result};
pub use files::{DataFileCollection, DataFileReader, DataLocation, FileStatistics};
pub use hash::hash_key;
pub use index::{DiskLongList, LongList, MemoryLongList};
pub use map::{FlushExecutor, HalfDiskHashMap, SessionState};
pub use mutation::BucketMutation;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::bucket::INVALID_VALUE;
    pub use crate::config::HalfDiskHashMapConfig;
    pub use crate::error::{Error, Result};
    pub use crate::hash::hash_key;
    pub use crate::map::{FlushExecutor, HalfDiskHashMap, SessionState};
}
