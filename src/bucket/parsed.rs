//! Fully decoded bucket representation

use bytes::{Buf, BufMut};

use super::wire::{
    self, expect_wire_type, read_delimited, read_entry_fields, read_fixed32, read_tag,
    BUCKET_INDEX_FIELD_SIZE, FIELD_BUCKET_ENTRIES, FIELD_BUCKET_INDEX,
};
use super::{Bucket, BucketEntry, INVALID_VALUE};
use crate::error::{Error, Result};

/// A bucket holding its entries as a list, in insertion/update order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedBucket {
    bucket_index: u32,
    entries: Vec<BucketEntry>,
}

impl ParsedBucket {
    /// Create an empty bucket for the given slot
    pub fn new(bucket_index: u32) -> Self {
        Self {
            bucket_index,
            entries: Vec::new(),
        }
    }

    /// Decode a bucket from a byte slice
    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self> {
        let mut bucket = Self::default();
        bucket.read_from(&mut bytes)?;
        Ok(bucket)
    }

    /// Borrow the entries
    pub fn entry_list(&self) -> &[BucketEntry] {
        &self.entries
    }

    fn position(&self, hash_code: i32, key: &[u8]) -> Option<usize> {
        self.entries.iter().position(|e| e.matches(hash_code, key))
    }
}

impl Bucket for ParsedBucket {
    fn clear(&mut self) {
        self.bucket_index = 0;
        self.entries.clear();
    }

    fn bucket_index(&self) -> u32 {
        self.bucket_index
    }

    fn set_bucket_index(&mut self, index: u32) {
        self.bucket_index = index;
    }

    fn entry_count(&self) -> usize {
        self.entries.len()
    }

    fn size_in_bytes(&self) -> usize {
        BUCKET_INDEX_FIELD_SIZE
            + self
                .entries
                .iter()
                .map(BucketEntry::size_in_bytes)
                .sum::<usize>()
    }

    fn find_value(&self, hash_code: i32, key: &[u8], not_found: i64) -> Result<i64> {
        Ok(self
            .position(hash_code, key)
            .map_or(not_found, |i| self.entries[i].value))
    }

    fn put_value(
        &mut self,
        key: &[u8],
        hash_code: i32,
        expected: Option<i64>,
        value: i64,
    ) -> Result<()> {
        let position = self.position(hash_code, key);
        let allowed = |current: i64| expected.map_or(true, |old| old == current);

        match position {
            Some(i) if value == INVALID_VALUE => {
                if allowed(self.entries[i].value) {
                    self.entries.remove(i);
                }
            }
            Some(i) => {
                if allowed(self.entries[i].value) {
                    self.entries[i].value = value;
                }
            }
            None if value == INVALID_VALUE || expected.is_some() => {}
            None => self.entries.push(BucketEntry::new(hash_code, value, key)),
        }
        Ok(())
    }

    fn read_from<B: Buf>(&mut self, buf: &mut B) -> Result<()> {
        let data = buf.copy_to_bytes(buf.remaining());
        let mut pos = 0;
        let mut bucket_index = 0;
        let mut entries = Vec::new();

        while pos < data.len() {
            let (number, wire_type) = read_tag(&data, &mut pos)?;
            if number == FIELD_BUCKET_INDEX.number {
                expect_wire_type(FIELD_BUCKET_INDEX, wire_type)?;
                bucket_index = read_fixed32(&data, &mut pos)?;
            } else if number == FIELD_BUCKET_ENTRIES.number {
                expect_wire_type(FIELD_BUCKET_ENTRIES, wire_type)?;
                let body = read_delimited(&data, &mut pos)?;
                let fields = read_entry_fields(&data, body)?;
                let (Some(key), Some((value, _))) = (fields.key, fields.value) else {
                    return Err(Error::corruption(format!(
                        "bucket {bucket_index} has an entry without key or value"
                    )));
                };
                entries.push(BucketEntry::new(
                    fields.hash_code.unwrap_or(0),
                    value,
                    &data[key],
                ));
            } else {
                return Err(Error::corruption(format!("unknown bucket field {number}")));
            }
        }

        self.bucket_index = bucket_index;
        self.entries = entries;
        Ok(())
    }

    fn write_to<B: BufMut>(&self, buf: &mut B) {
        wire::write_bucket_index(buf, self.bucket_index);
        for entry in &self.entries {
            wire::write_entry(buf, entry.hash_code, entry.value, &entry.key);
        }
    }

    fn entries(&self) -> Result<Vec<BucketEntry>> {
        Ok(self.entries.clone())
    }
}
