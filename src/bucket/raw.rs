//! In-place bucket representation
//!
//! The bucket is kept as one contiguous serialized buffer. Lookups decode
//! entries on the fly; mutations are byte-level edits:
//!
//! - update: overwrite the 8-byte value payload in place
//! - delete: shift every byte after the entry left by the entry size
//! - insert: grow the buffer if needed and append the encoded entry
//!
//! The buffer is normalized on decode so that the bucket index field always
//! occupies the first [`BUCKET_INDEX_FIELD_SIZE`] bytes. All offset
//! arithmetic lives in this file.

use std::ops::Range;

use bytes::{Buf, BufMut};
use tracing::warn;

use super::wire::{
    self, expect_wire_type, read_delimited, read_entry_fields, read_fixed32, read_tag,
    BUCKET_INDEX_FIELD_SIZE, FIELD_BUCKET_ENTRIES, FIELD_BUCKET_INDEX,
};
use super::{Bucket, BucketEntry, INVALID_VALUE};
use crate::error::{Error, Result};

/// Offset of the fixed32 bucket index payload inside the buffer.
const INDEX_PAYLOAD: Range<usize> = FIELD_BUCKET_INDEX.tag_size()..BUCKET_INDEX_FIELD_SIZE;

/// Initial buffer capacity of a fresh bucket.
const INITIAL_CAPACITY: usize = 64;

/// An entry located inside the buffer.
#[derive(Debug, Clone)]
struct EntrySlot {
    /// Whole entry field, outer tag included
    field: Range<usize>,
    value: i64,
    value_pos: usize,
}

/// A bucket edited directly in its serialized form.
#[derive(Debug, Clone)]
pub struct RawBucket {
    data: Vec<u8>,
    bucket_index: u32,
    entry_count: usize,
}

impl Default for RawBucket {
    fn default() -> Self {
        Self::new()
    }
}

impl RawBucket {
    /// Create an empty bucket with index 0
    pub fn new() -> Self {
        let mut data = Vec::with_capacity(INITIAL_CAPACITY);
        wire::write_bucket_index(&mut data, 0);
        Self {
            data,
            bucket_index: 0,
            entry_count: 0,
        }
    }

    /// Decode a bucket from a byte slice
    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self> {
        let mut bucket = Self::new();
        bucket.read_from(&mut bytes)?;
        Ok(bucket)
    }

    /// The serialized bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Allocated buffer capacity
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    fn ensure_capacity(&mut self, needed: usize) {
        if needed > self.data.capacity() {
            let new_capacity = needed.max(self.data.capacity() * 2);
            self.data.reserve_exact(new_capacity - self.data.len());
        }
    }

    /// Validate the freshly loaded buffer, count entries and move the index
    /// field to the front if a foreign writer placed it elsewhere.
    fn reindex(&mut self) -> Result<()> {
        let mut pos = 0;
        let mut index_field: Option<(u32, Range<usize>)> = None;
        let mut entry_count = 0;

        while pos < self.data.len() {
            let field_start = pos;
            let (number, wire_type) = read_tag(&self.data, &mut pos)?;
            if number == FIELD_BUCKET_INDEX.number {
                expect_wire_type(FIELD_BUCKET_INDEX, wire_type)?;
                let index = read_fixed32(&self.data, &mut pos)?;
                if index_field.is_some() {
                    return Err(Error::corruption("bucket index field appears twice"));
                }
                index_field = Some((index, field_start..pos));
            } else if number == FIELD_BUCKET_ENTRIES.number {
                expect_wire_type(FIELD_BUCKET_ENTRIES, wire_type)?;
                let body = read_delimited(&self.data, &mut pos)?;
                read_entry_fields(&self.data, body)?;
                entry_count += 1;
            } else {
                return Err(Error::corruption(format!("unknown bucket field {number}")));
            }
        }

        let bucket_index = index_field.as_ref().map_or(0, |(index, _)| *index);
        let canonical = matches!(&index_field, Some((_, range)) if *range == (0..BUCKET_INDEX_FIELD_SIZE));
        if !canonical {
            let mut normalized = Vec::with_capacity(self.data.len() + BUCKET_INDEX_FIELD_SIZE);
            wire::write_bucket_index(&mut normalized, bucket_index);
            match &index_field {
                Some((_, range)) => {
                    normalized.extend_from_slice(&self.data[..range.start]);
                    normalized.extend_from_slice(&self.data[range.end..]);
                }
                None => normalized.extend_from_slice(&self.data),
            }
            self.data = normalized;
        }

        self.bucket_index = bucket_index;
        self.entry_count = entry_count;
        Ok(())
    }

    /// Visit every entry field after the index header.
    fn scan<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(Range<usize>, wire::EntryFields) -> Result<bool>,
    {
        let data = &self.data;
        let mut pos = BUCKET_INDEX_FIELD_SIZE;
        while pos < data.len() {
            let field_start = pos;
            let (number, wire_type) = read_tag(data, &mut pos)?;
            if number != FIELD_BUCKET_ENTRIES.number {
                return Err(Error::corruption(format!("unknown bucket field {number}")));
            }
            expect_wire_type(FIELD_BUCKET_ENTRIES, wire_type)?;
            let body = read_delimited(data, &mut pos)?;
            let fields = read_entry_fields(data, body)?;
            if !visit(field_start..pos, fields)? {
                break;
            }
        }
        Ok(())
    }

    fn find_entry(&self, hash_code: i32, key: &[u8]) -> Result<Option<EntrySlot>> {
        let mut found = None;
        self.scan(|field, fields| {
            if fields.hash_code.unwrap_or(0) != hash_code {
                return Ok(true);
            }
            match (fields.key, fields.value) {
                (Some(key_range), Some((value, value_pos))) => {
                    if &self.data[key_range] == key {
                        found = Some(EntrySlot {
                            field,
                            value,
                            value_pos,
                        });
                        return Ok(false);
                    }
                }
                _ => {
                    warn!(
                        bucket_index = self.bucket_index,
                        offset = field.start,
                        "bucket entry matches hash code but is missing its key or value"
                    );
                }
            }
            Ok(true)
        })?;
        Ok(found)
    }
}

impl Bucket for RawBucket {
    fn clear(&mut self) {
        self.data.clear();
        wire::write_bucket_index(&mut self.data, 0);
        self.bucket_index = 0;
        self.entry_count = 0;
    }

    fn bucket_index(&self) -> u32 {
        self.bucket_index
    }

    fn set_bucket_index(&mut self, index: u32) {
        self.data[INDEX_PAYLOAD].copy_from_slice(&index.to_le_bytes());
        self.bucket_index = index;
    }

    fn entry_count(&self) -> usize {
        self.entry_count
    }

    fn size_in_bytes(&self) -> usize {
        self.data.len()
    }

    fn find_value(&self, hash_code: i32, key: &[u8], not_found: i64) -> Result<i64> {
        Ok(self
            .find_entry(hash_code, key)?
            .map_or(not_found, |slot| slot.value))
    }

    fn put_value(
        &mut self,
        key: &[u8],
        hash_code: i32,
        expected: Option<i64>,
        value: i64,
    ) -> Result<()> {
        let slot = self.find_entry(hash_code, key)?;

        if value == INVALID_VALUE {
            if let Some(slot) = slot {
                if expected.map_or(true, |old| old == slot.value) {
                    self.data.drain(slot.field);
                    self.entry_count -= 1;
                }
            }
            return Ok(());
        }

        match slot {
            Some(slot) => {
                if expected.map_or(true, |old| old == slot.value) {
                    self.data[slot.value_pos..slot.value_pos + 8]
                        .copy_from_slice(&value.to_le_bytes());
                }
            }
            None if expected.is_some() => {}
            None => {
                let needed = self.data.len() + wire::entry_field_size(key.len());
                self.ensure_capacity(needed);
                wire::write_entry(&mut self.data, hash_code, value, key);
                self.entry_count += 1;
            }
        }
        Ok(())
    }

    fn read_from<B: Buf>(&mut self, buf: &mut B) -> Result<()> {
        let len = buf.remaining();
        self.data.clear();
        self.data.resize(len, 0);
        buf.copy_to_slice(&mut self.data);
        if let Err(e) = self.reindex() {
            self.clear();
            return Err(e);
        }
        Ok(())
    }

    fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.data);
    }

    fn entries(&self) -> Result<Vec<BucketEntry>> {
        let mut entries = Vec::with_capacity(self.entry_count);
        self.scan(|field, fields| match (fields.key, fields.value) {
            (Some(key), Some((value, _))) => {
                entries.push(BucketEntry::new(
                    fields.hash_code.unwrap_or(0),
                    value,
                    &self.data[key],
                ));
                Ok(true)
            }
            _ => Err(Error::corruption(format!(
                "bucket {} entry at offset {} is missing its key or value",
                self.bucket_index, field.start
            ))),
        })?;
        Ok(entries)
    }
}
