//! Packed data file locations

use std::fmt;

/// Bits of a location holding the byte offset.
pub const OFFSET_BITS: u32 = 40;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

/// Largest file index a location can address.
pub const MAX_FILE_INDEX: u32 = (1 << (64 - OFFSET_BITS)) - 2;

/// Largest byte offset a location can address.
pub const MAX_OFFSET: u64 = OFFSET_MASK;

/// Where an item lives: `(file_index + 1) << 40 | byte_offset`.
///
/// The `+ 1` keeps every location nonzero, so a location can be stored in an
/// index that reserves `0` for "absent".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataLocation(u64);

impl DataLocation {
    /// Pack a file index and byte offset
    #[inline]
    pub const fn new(file_index: u32, offset: u64) -> Self {
        debug_assert!(file_index <= MAX_FILE_INDEX);
        debug_assert!(offset <= MAX_OFFSET);
        Self(((file_index as u64 + 1) << OFFSET_BITS) | (offset & OFFSET_MASK))
    }

    /// Unpack a raw location; `0` means absent
    #[inline]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// The packed value, never zero
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Index of the data file
    #[inline]
    pub const fn file_index(self) -> u32 {
        ((self.0 >> OFFSET_BITS) - 1) as u32
    }

    /// Byte offset of the item inside its file
    #[inline]
    pub const fn offset(self) -> u64 {
        self.0 & OFFSET_MASK
    }
}

impl fmt::Debug for DataLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataLocation")
            .field("file_index", &self.file_index())
            .field("offset", &self.offset())
            .finish()
    }
}

impl fmt::Display for DataLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.file_index(), self.offset())
    }
}
