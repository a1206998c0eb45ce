//! Map metadata and file naming
//!
//! The metadata file holds three big-endian `i32` values: the format
//! version, a reserved word always written as 0, and the bucket count.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const METADATA_SUFFIX: &str = "_metadata.hdhm";
const INDEX_SUFFIX: &str = "_bucket_index.ll";
const WORKING_INDEX_SUFFIX: &str = "_bucket_index_working.ll";

/// Path of the metadata file of `store_name` in `dir`
pub fn metadata_path(dir: &Path, store_name: &str) -> PathBuf {
    dir.join(format!("{store_name}{METADATA_SUFFIX}"))
}

/// Path of the persisted bucket index of `store_name` in `dir`
pub fn index_path(dir: &Path, store_name: &str) -> PathBuf {
    dir.join(format!("{store_name}{INDEX_SUFFIX}"))
}

/// Path of the live file of a disk-backed index
pub(crate) fn working_index_path(dir: &Path, store_name: &str) -> PathBuf {
    dir.join(format!("{store_name}{WORKING_INDEX_SUFFIX}"))
}

/// Persisted map metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapMetadata {
    /// Number of buckets; a power of two, at least 2
    pub num_of_buckets: u32,
}

impl MapMetadata {
    /// Supported format version
    pub const FORMAT_VERSION: i32 = 1;
    const ENCODED_SIZE: usize = 12;

    /// Read and validate a metadata file
    pub fn read(path: &Path) -> Result<Self> {
        let buf = fs::read(path)?;
        if buf.len() < Self::ENCODED_SIZE {
            return Err(Error::corruption(format!(
                "metadata file {} is truncated",
                path.display()
            )));
        }
        let word = |at: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&buf[at..at + 4]);
            i32::from_be_bytes(bytes)
        };

        let version = word(0);
        if version != Self::FORMAT_VERSION {
            return Err(Error::IncompatibleFormat {
                what: "metadata",
                found: i64::from(version),
                expected: i64::from(Self::FORMAT_VERSION),
            });
        }
        // word(4) is reserved
        let num_of_buckets = word(8);
        if num_of_buckets < 2 || (num_of_buckets & (num_of_buckets - 1)) != 0 {
            return Err(Error::corruption(format!(
                "metadata file {} has invalid bucket count {num_of_buckets}",
                path.display()
            )));
        }
        Ok(Self {
            num_of_buckets: num_of_buckets as u32,
        })
    }

    /// Write the metadata file, replacing any existing one
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut buf = [0u8; Self::ENCODED_SIZE];
        buf[0..4].copy_from_slice(&Self::FORMAT_VERSION.to_be_bytes());
        buf[8..12].copy_from_slice(&(self.num_of_buckets as i32).to_be_bytes());
        fs::write(path, buf)?;
        Ok(())
    }
}

/// Remove a file, treating "already gone" as success.
pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
