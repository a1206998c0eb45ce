//! Buckets: the on-disk unit holding every entry routed to one slot
//!
//! A bucket stores `(hash_code, value, key)` entries, unique by key. Two
//! representations implement the same [`Bucket`] contract:
//!
//! - [`RawBucket`] keeps the serialized bytes and edits them in place. It
//!   avoids a full decode on the flush hot path and is what the map uses.
//! - [`ParsedBucket`] decodes eagerly into a list of [`BucketEntry`] values
//!   and re-serializes on write.
//!
//! Both decode and encode the format described in [`wire`].

mod parsed;
mod pool;
mod raw;
pub mod wire;

#[cfg(test)]
mod tests;

use bytes::{Buf, BufMut};

use crate::error::Result;

pub use parsed::ParsedBucket;
pub use pool::{PooledBucket, ReusableBucketPool};
pub use raw::RawBucket;

/// Sentinel value: as a new value it means "delete the key".
pub const INVALID_VALUE: i64 = i64::MIN;

/// A decoded bucket entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketEntry {
    /// Hash code of the key, cached for fast rejection
    pub hash_code: i32,
    /// Stored value
    pub value: i64,
    /// Key bytes
    pub key: Vec<u8>,
}

impl BucketEntry {
    /// Create a new entry
    pub fn new(hash_code: i32, value: i64, key: impl Into<Vec<u8>>) -> Self {
        Self {
            hash_code,
            value,
            key: key.into(),
        }
    }

    /// Serialized size of this entry, including its outer tag and length
    pub fn size_in_bytes(&self) -> usize {
        wire::entry_field_size(self.key.len())
    }

    #[inline]
    pub(crate) fn matches(&self, hash_code: i32, key: &[u8]) -> bool {
        self.hash_code == hash_code && self.key == key
    }
}

/// Contract shared by every bucket representation.
///
/// A bucket is exclusively owned between borrow and release; nothing here is
/// synchronized.
pub trait Bucket: Default + Send + 'static {
    /// Reset to an empty bucket with index 0.
    fn clear(&mut self);

    /// The slot number of this bucket.
    fn bucket_index(&self) -> u32;

    /// Set the slot number of this bucket.
    fn set_bucket_index(&mut self, index: u32);

    /// Number of entries.
    fn entry_count(&self) -> usize;

    /// Whether the bucket holds no entries.
    fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    /// Serialized size in bytes.
    fn size_in_bytes(&self) -> usize;

    /// Find the value stored for `key`, or `not_found` if absent.
    ///
    /// Entries are scanned linearly; the full key is compared only when the
    /// cached hash code matches.
    fn find_value(&self, hash_code: i32, key: &[u8], not_found: i64) -> Result<i64>;

    /// Apply one mutation.
    ///
    /// `value == INVALID_VALUE` deletes the key. When `expected` is `Some`,
    /// the update or delete only happens if the key is present with exactly
    /// that value; a conditional write against an absent key is a no-op.
    fn put_value(
        &mut self,
        key: &[u8],
        hash_code: i32,
        expected: Option<i64>,
        value: i64,
    ) -> Result<()>;

    /// Replace the contents with a bucket decoded from `buf`.
    fn read_from<B: Buf>(&mut self, buf: &mut B) -> Result<()>;

    /// Serialize into `buf`; exactly [`Bucket::size_in_bytes`] bytes are written.
    fn write_to<B: BufMut>(&self, buf: &mut B);

    /// Decoded copy of all entries, in storage order.
    fn entries(&self) -> Result<Vec<BucketEntry>>;

    /// Serialize into a new vector.
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size_in_bytes());
        self.write_to(&mut out);
        out
    }
}
