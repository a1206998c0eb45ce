//! Heap-resident index

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{check_put, check_range, LongList, LongListHeader, IMPERMISSIBLE_VALUE};
use crate::error::Result;

const IO_BUFFER_SIZE: usize = 1 << 20;

/// An index held in a boxed slice of atomics.
pub struct MemoryLongList {
    values: Box<[AtomicU64]>,
    size: AtomicU64,
    /// `(min, max)`; changes only with the writer, readers take a snapshot
    valid_range: Mutex<(u64, u64)>,
}

impl MemoryLongList {
    /// Create an empty list
    pub fn new(capacity: u64) -> Self {
        let values = (0..capacity).map(|_| AtomicU64::new(IMPERMISSIBLE_VALUE)).collect();
        Self {
            values,
            size: AtomicU64::new(0),
            valid_range: Mutex::new((0, capacity.saturating_sub(1))),
        }
    }

    /// Load a persisted list.
    ///
    /// The result has at least `min_capacity` slots; slots beyond those in the
    /// file start empty.
    pub fn load(path: &Path, min_capacity: u64) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::with_capacity(IO_BUFFER_SIZE, file);

        let mut header = [0u8; LongListHeader::ENCODED_SIZE];
        reader.read_exact(&mut header)?;
        let header = LongListHeader::decode(&header)?;

        let list = Self::new(header.capacity.max(min_capacity));
        let mut value = [0u8; 8];
        let mut size = 0;
        for index in 0..header.capacity {
            reader.read_exact(&mut value)?;
            let value = u64::from_le_bytes(value);
            if value != IMPERMISSIBLE_VALUE {
                list.values[index as usize].store(value, Ordering::Relaxed);
                size = index + 1;
            }
        }
        list.size.store(size, Ordering::Release);
        *list.valid_range.lock() = header.valid_range();
        Ok(list)
    }

    fn slot(&self, index: u64) -> Option<&AtomicU64> {
        usize::try_from(index).ok().and_then(|i| self.values.get(i))
    }
}

impl LongList for MemoryLongList {
    fn get(&self, index: u64) -> Result<Option<u64>> {
        let value = self
            .slot(index)
            .map_or(IMPERMISSIBLE_VALUE, |slot| slot.load(Ordering::Acquire));
        Ok((value != IMPERMISSIBLE_VALUE).then_some(value))
    }

    fn put(&self, index: u64, value: u64) -> Result<()> {
        check_put(index, value, self.capacity())?;
        self.values[index as usize].store(value, Ordering::Release);
        self.size.fetch_max(index + 1, Ordering::AcqRel);
        Ok(())
    }

    fn remove(&self, index: u64) -> Result<()> {
        if let Some(slot) = self.slot(index) {
            slot.store(IMPERMISSIBLE_VALUE, Ordering::Release);
        }
        Ok(())
    }

    fn update_valid_range(&self, min: u64, max: u64) -> Result<()> {
        check_range(min, max)?;
        let mut range = self.valid_range.lock();
        let capacity = self.capacity();
        for index in (0..min.min(capacity)).chain(max.saturating_add(1).min(capacity)..capacity) {
            self.values[index as usize].store(IMPERMISSIBLE_VALUE, Ordering::Release);
        }
        *range = (min, max);
        Ok(())
    }

    fn capacity(&self) -> u64 {
        self.values.len() as u64
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    fn valid_range(&self) -> (u64, u64) {
        *self.valid_range.lock()
    }

    fn write_to_file(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::with_capacity(IO_BUFFER_SIZE, file);
        let header = LongListHeader::new(self.capacity(), self.valid_range());
        writer.write_all(&header.encode())?;
        for slot in self.values.iter() {
            writer.write_all(&slot.load(Ordering::Acquire).to_le_bytes())?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn memory_bytes(&self) -> u64 {
        (self.values.len() * std::mem::size_of::<AtomicU64>()) as u64
    }
}
