//! Tag / length-delimited primitives for the bucket wire format.
//!
//! ```text
//! Bucket       := index_field (bucket_index: fixed32) , entry_field*
//! entry_field  := tag(11, length-delimited) , length(varint) , BucketEntry
//! BucketEntry  := hash_field(1, fixed32) , value_field(2, fixed64) , key_field(3, length-delimited bytes)
//! ```
//!
//! A tag is `(field_number << 3) | wire_type`, encoded as a varint. Fixed
//! width values are little-endian. Readers here work on plain slices with an
//! explicit cursor so that the in-place bucket can keep byte offsets of the
//! fields it later patches.

use bytes::BufMut;

use crate::error::{Error, Result};

/// Protobuf-style wire types used by the bucket format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireType {
    /// Base-128 varint
    Varint = 0,
    /// Little-endian 8 bytes
    Fixed64 = 1,
    /// Varint length followed by that many bytes
    Delimited = 2,
    /// Little-endian 4 bytes
    Fixed32 = 5,
}

impl WireType {
    fn from_bits(bits: u64) -> Option<Self> {
        match bits {
            0 => Some(WireType::Varint),
            1 => Some(WireType::Fixed64),
            2 => Some(WireType::Delimited),
            5 => Some(WireType::Fixed32),
            _ => None,
        }
    }
}

/// A field number plus its wire type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    /// Field number
    pub number: u32,
    /// Wire type
    pub wire_type: WireType,
}

impl Field {
    /// Create a field definition
    pub const fn new(number: u32, wire_type: WireType) -> Self {
        Self { number, wire_type }
    }

    /// The encoded tag value
    #[inline]
    pub const fn tag(&self) -> u64 {
        ((self.number as u64) << 3) | self.wire_type as u64
    }

    /// Number of bytes the encoded tag occupies
    #[inline]
    pub const fn tag_size(&self) -> usize {
        varint_size(self.tag())
    }
}

/// Bucket index field of a bucket.
pub const FIELD_BUCKET_INDEX: Field = Field::new(1, WireType::Fixed32);
/// Repeated entry field of a bucket.
pub const FIELD_BUCKET_ENTRIES: Field = Field::new(11, WireType::Delimited);
/// Hash code field of an entry.
pub const FIELD_ENTRY_HASH_CODE: Field = Field::new(1, WireType::Fixed32);
/// Value field of an entry.
pub const FIELD_ENTRY_VALUE: Field = Field::new(2, WireType::Fixed64);
/// Key bytes field of an entry.
pub const FIELD_ENTRY_KEY: Field = Field::new(3, WireType::Delimited);

/// Size of the bucket index field (tag + fixed32).
pub const BUCKET_INDEX_FIELD_SIZE: usize = FIELD_BUCKET_INDEX.tag_size() + 4;

/// Number of bytes needed to encode `value` as a varint.
#[inline]
pub const fn varint_size(mut value: u64) -> usize {
    let mut size = 1;
    while value >= 0x80 {
        value >>= 7;
        size += 1;
    }
    size
}

/// Append `value` as a varint.
#[inline]
pub fn write_varint<B: BufMut>(buf: &mut B, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Append a field tag.
#[inline]
pub fn write_tag<B: BufMut>(buf: &mut B, field: Field) {
    write_varint(buf, field.tag());
}

/// Size of the entry body (without the outer tag and length).
#[inline]
pub const fn entry_body_size(key_len: usize) -> usize {
    FIELD_ENTRY_HASH_CODE.tag_size()
        + 4
        + FIELD_ENTRY_VALUE.tag_size()
        + 8
        + FIELD_ENTRY_KEY.tag_size()
        + varint_size(key_len as u64)
        + key_len
}

/// Size of a complete entry field, including the outer tag and length.
#[inline]
pub const fn entry_field_size(key_len: usize) -> usize {
    let body = entry_body_size(key_len);
    FIELD_BUCKET_ENTRIES.tag_size() + varint_size(body as u64) + body
}

/// Append the bucket index field.
pub fn write_bucket_index<B: BufMut>(buf: &mut B, bucket_index: u32) {
    write_tag(buf, FIELD_BUCKET_INDEX);
    buf.put_u32_le(bucket_index);
}

/// Append a complete entry field.
pub fn write_entry<B: BufMut>(buf: &mut B, hash_code: i32, value: i64, key: &[u8]) {
    write_tag(buf, FIELD_BUCKET_ENTRIES);
    write_varint(buf, entry_body_size(key.len()) as u64);
    write_tag(buf, FIELD_ENTRY_HASH_CODE);
    buf.put_i32_le(hash_code);
    write_tag(buf, FIELD_ENTRY_VALUE);
    buf.put_i64_le(value);
    write_tag(buf, FIELD_ENTRY_KEY);
    write_varint(buf, key.len() as u64);
    buf.put_slice(key);
}

/// Read a varint at `*pos`, advancing the cursor.
pub fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let Some(&byte) = data.get(*pos) else {
            return Err(Error::corruption(format!(
                "truncated varint at offset {}",
                *pos
            )));
        };
        *pos += 1;
        if shift >= 64 {
            return Err(Error::corruption("varint is longer than 10 bytes"));
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Read a field tag at `*pos`, returning `(field_number, wire_type)`.
pub fn read_tag(data: &[u8], pos: &mut usize) -> Result<(u32, WireType)> {
    let start = *pos;
    let tag = read_varint(data, pos)?;
    let wire_type = WireType::from_bits(tag & 0x7).ok_or_else(|| {
        Error::corruption(format!(
            "unsupported wire type {} at offset {start}",
            tag & 0x7
        ))
    })?;
    let number = u32::try_from(tag >> 3)
        .map_err(|_| Error::corruption(format!("field number overflow at offset {start}")))?;
    Ok((number, wire_type))
}

/// Read a little-endian u32 at `*pos`.
pub fn read_fixed32(data: &[u8], pos: &mut usize) -> Result<u32> {
    let bytes = take(data, pos, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read a little-endian u64 at `*pos`.
pub fn read_fixed64(data: &[u8], pos: &mut usize) -> Result<u64> {
    let bytes = take(data, pos, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(raw))
}

/// Read a varint length and return the delimited range `start..end`.
pub fn read_delimited(data: &[u8], pos: &mut usize) -> Result<std::ops::Range<usize>> {
    let len = read_varint(data, pos)?;
    let len = usize::try_from(len)
        .map_err(|_| Error::corruption(format!("delimited length {len} too large")))?;
    let start = *pos;
    take(data, pos, len)?;
    Ok(start..start + len)
}

fn take<'a>(data: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = pos
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| {
            Error::corruption(format!(
                "truncated field: need {len} bytes at offset {}, have {}",
                *pos,
                data.len().saturating_sub(*pos)
            ))
        })?;
    let slice = &data[*pos..end];
    *pos = end;
    Ok(slice)
}

/// Fail unless `actual` is the wire type declared for `field`.
pub fn expect_wire_type(field: Field, actual: WireType) -> Result<()> {
    if field.wire_type == actual {
        Ok(())
    } else {
        Err(Error::corruption(format!(
            "field {} has wire type {:?}, expected {:?}",
            field.number, actual, field.wire_type
        )))
    }
}

/// Fields of one decoded entry body. Missing fields stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryFields {
    /// Cached hash code
    pub hash_code: Option<i32>,
    /// Value and the byte offset of its 8-byte payload
    pub value: Option<(i64, usize)>,
    /// Byte range of the key
    pub key: Option<std::ops::Range<usize>>,
}

/// Decode the entry body `data[range]`. Offsets returned are absolute
/// offsets into `data`. Unknown field numbers are fatal.
pub fn read_entry_fields(data: &[u8], range: std::ops::Range<usize>) -> Result<EntryFields> {
    let body = &data[..range.end];
    let mut pos = range.start;
    let mut fields = EntryFields::default();
    while pos < range.end {
        let (number, wire_type) = read_tag(body, &mut pos)?;
        match number {
            n if n == FIELD_ENTRY_HASH_CODE.number => {
                expect_wire_type(FIELD_ENTRY_HASH_CODE, wire_type)?;
                fields.hash_code = Some(read_fixed32(body, &mut pos)? as i32);
            }
            n if n == FIELD_ENTRY_VALUE.number => {
                expect_wire_type(FIELD_ENTRY_VALUE, wire_type)?;
                let value_pos = pos;
                fields.value = Some((read_fixed64(body, &mut pos)? as i64, value_pos));
            }
            n if n == FIELD_ENTRY_KEY.number => {
                expect_wire_type(FIELD_ENTRY_KEY, wire_type)?;
                fields.key = Some(read_delimited(body, &mut pos)?);
            }
            other => {
                return Err(Error::corruption(format!(
                    "unknown bucket entry field {other}"
                )));
            }
        }
    }
    Ok(fields)
}
