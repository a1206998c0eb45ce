//! Bucket index: a dense array of `u64` data locations keyed by bucket index
//!
//! The map keeps one location per bucket slot. `0` is reserved to mean "no
//! location", so every stored value is nonzero. Reads are lock-free and may
//! run concurrently with the single writer.
//!
//! Both implementations persist the same file format, so an index written by
//! one can be loaded by the other:
//!
//! ```text
//! magic      [u8; 8]   "HDHMLL01"
//! version    u32 LE    1
//! capacity   u64 LE
//! min_valid  i64 LE
//! max_valid  i64 LE
//! values     capacity x u64 LE
//! ```

mod disk;
mod memory;


use std::path::Path;

use crate::error::{Error, Result};

pub use disk::DiskLongList;
pub use memory::MemoryLongList;

/// The value meaning "absent". It can never be stored.
pub const IMPERMISSIBLE_VALUE: u64 = 0;

/// A fixed-capacity concurrent array of nonzero `u64` values.
pub trait LongList: Send + Sync {
    /// Value at `index`, or `None` if absent or outside the valid range.
    fn get(&self, index: u64) -> Result<Option<u64>>;

    /// Store `value` at `index`.
    ///
    /// Storing [`IMPERMISSIBLE_VALUE`] or writing past the capacity is an
    /// invalid-argument error.
    fn put(&self, index: u64, value: u64) -> Result<()>;

    /// Clear the value at `index`.
    fn remove(&self, index: u64) -> Result<()>;

    /// Restrict the valid range to `min..=max`, clearing everything outside.
    fn update_valid_range(&self, min: u64, max: u64) -> Result<()>;

    /// Maximum number of values.
    fn capacity(&self) -> u64;

    /// One past the highest index ever written.
    fn size(&self) -> u64;

    /// Current valid range as `(min, max)`, inclusive.
    fn valid_range(&self) -> (u64, u64);

    /// Persist the list to `path` in the shared index format.
    fn write_to_file(&self, path: &Path) -> Result<()>;

    /// Release resources. Further use is undefined but memory safe.
    fn close(&self) -> Result<()>;

    /// Heap memory held by the list.
    fn memory_bytes(&self) -> u64;
}

/// Header of a persisted index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LongListHeader {
    pub capacity: u64,
    pub min_valid: i64,
    pub max_valid: i64,
}

impl LongListHeader {
    pub const MAGIC: [u8; 8] = *b"HDHMLL01";
    pub const VERSION: u32 = 1;
    pub const ENCODED_SIZE: usize = 36;

    pub fn new(capacity: u64, (min, max): (u64, u64)) -> Self {
        Self {
            capacity,
            min_valid: min as i64,
            max_valid: max as i64,
        }
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut buf = [0u8; Self::ENCODED_SIZE];
        buf[0..8].copy_from_slice(&Self::MAGIC);
        buf[8..12].copy_from_slice(&Self::VERSION.to_le_bytes());
        buf[12..20].copy_from_slice(&self.capacity.to_le_bytes());
        buf[20..28].copy_from_slice(&self.min_valid.to_le_bytes());
        buf[28..36].copy_from_slice(&self.max_valid.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::ENCODED_SIZE {
            return Err(Error::corruption("index header truncated"));
        }
        if buf[0..8] != Self::MAGIC {
            return Err(Error::corruption("index file magic mismatch"));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&buf[8..12]);
        let version = u32::from_le_bytes(version);
        if version != Self::VERSION {
            return Err(Error::IncompatibleFormat {
                what: "index",
                found: i64::from(version),
                expected: i64::from(Self::VERSION),
            });
        }
        let read_u64 = |at: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(bytes)
        };
        let header = Self {
            capacity: read_u64(12),
            min_valid: read_u64(20) as i64,
            max_valid: read_u64(28) as i64,
        };
        if header.min_valid < 0 || header.max_valid < header.min_valid {
            return Err(Error::corruption(format!(
                "index valid range {}..={} is malformed",
                header.min_valid, header.max_valid
            )));
        }
        Ok(header)
    }

    pub fn valid_range(&self) -> (u64, u64) {
        (self.min_valid as u64, self.max_valid as u64)
    }
}

fn check_put(index: u64, value: u64, capacity: u64) -> Result<()> {
    if value == IMPERMISSIBLE_VALUE {
        return Err(Error::invalid_argument(format!(
            "cannot store the impermissible value at index {index}"
        )));
    }
    if index >= capacity {
        return Err(Error::invalid_argument(format!(
            "index {index} is beyond capacity {capacity}"
        )));
    }
    Ok(())
}

fn check_range(min: u64, max: u64) -> Result<()> {
    if min > max || max > i64::MAX as u64 {
        return Err(Error::invalid_argument(format!(
            "invalid valid range {min}..={max}"
        )));
    }
    Ok(())
}
