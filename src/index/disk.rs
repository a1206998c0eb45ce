//! File-resident index
//!
//! Values live in a working file laid out exactly like a persisted index, so
//! value `i` sits at `ENCODED_SIZE + 8 * i`. Only the header counters are
//! kept in memory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use super::{check_put, check_range, LongList, LongListHeader, IMPERMISSIBLE_VALUE};
use crate::device::{FileSystemFile, SyncStorageDevice};
use crate::error::{Error, Result};

const COPY_CHUNK: usize = 1 << 20;

/// An index whose values are read and written with positional file I/O.
pub struct DiskLongList {
    file: FileSystemFile,
    capacity: u64,
    size: AtomicU64,
    valid_range: Mutex<(u64, u64)>,
    closed: AtomicBool,
}

impl DiskLongList {
    /// Create an empty list backed by a new working file at `path`.
    ///
    /// An existing file at `path` is replaced.
    pub fn create(path: impl AsRef<Path>, capacity: u64) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            fs::remove_file(path)?;
        }
        let file = FileSystemFile::create_new(path)?;
        file.truncate_sync(value_offset(capacity))?;
        let list = Self {
            file,
            capacity,
            size: AtomicU64::new(0),
            valid_range: Mutex::new((0, capacity.saturating_sub(1))),
            closed: AtomicBool::new(false),
        };
        list.write_header()?;
        debug!(path = %path.display(), capacity, "created disk index");
        Ok(list)
    }

    /// Load a persisted list from `source` into a new working file at `path`.
    ///
    /// The result has at least `min_capacity` slots.
    pub fn load(source: &Path, path: impl AsRef<Path>, min_capacity: u64) -> Result<Self> {
        let source_file = FileSystemFile::open_read_only(source)?;
        let mut header = [0u8; LongListHeader::ENCODED_SIZE];
        source_file.read_exact_sync(0, &mut header)?;
        let header = LongListHeader::decode(&header)?;

        let list = Self::create(path, header.capacity.max(min_capacity))?;
        let mut size = 0;
        let mut chunk = vec![0u8; COPY_CHUNK];
        let end = value_offset(header.capacity);
        let mut offset = value_offset(0);
        while offset < end {
            let len = ((end - offset) as usize).min(COPY_CHUNK);
            source_file.read_exact_sync(offset, &mut chunk[..len])?;
            list.file.write_all_sync(offset, &chunk[..len])?;
            for (i, value) in chunk[..len].chunks_exact(8).enumerate() {
                if value.iter().any(|b| *b != 0) {
                    size = index_of(offset) + i as u64 + 1;
                }
            }
            offset += len as u64;
        }
        list.size.store(size, Ordering::Release);
        *list.valid_range.lock() = header.valid_range();
        list.write_header()?;
        Ok(list)
    }

    /// Path of the working file
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    fn write_header(&self) -> Result<()> {
        let header = LongListHeader::new(self.capacity, *self.valid_range.lock());
        self.file.write_all_sync(0, &header.encode())?;
        Ok(())
    }

    fn write_value(&self, index: u64, value: u64) -> Result<()> {
        self.file
            .write_all_sync(value_offset(index), &value.to_le_bytes())?;
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::invalid_state("disk index is closed"));
        }
        Ok(())
    }
}

fn value_offset(index: u64) -> u64 {
    LongListHeader::ENCODED_SIZE as u64 + index * 8
}

fn index_of(offset: u64) -> u64 {
    (offset - LongListHeader::ENCODED_SIZE as u64) / 8
}

impl LongList for DiskLongList {
    fn get(&self, index: u64) -> Result<Option<u64>> {
        self.check_open()?;
        if index >= self.capacity {
            return Ok(None);
        }
        let mut value = [0u8; 8];
        self.file.read_exact_sync(value_offset(index), &mut value)?;
        let value = u64::from_le_bytes(value);
        Ok((value != IMPERMISSIBLE_VALUE).then_some(value))
    }

    fn put(&self, index: u64, value: u64) -> Result<()> {
        self.check_open()?;
        check_put(index, value, self.capacity)?;
        self.write_value(index, value)?;
        self.size.fetch_max(index + 1, Ordering::AcqRel);
        Ok(())
    }

    fn remove(&self, index: u64) -> Result<()> {
        self.check_open()?;
        if index < self.capacity {
            self.write_value(index, IMPERMISSIBLE_VALUE)?;
        }
        Ok(())
    }

    fn update_valid_range(&self, min: u64, max: u64) -> Result<()> {
        self.check_open()?;
        check_range(min, max)?;
        let zeros = vec![0u8; COPY_CHUNK];
        let clear = |from: u64, to: u64| -> Result<()> {
            let mut offset = value_offset(from);
            let end = value_offset(to);
            while offset < end {
                let len = ((end - offset) as usize).min(COPY_CHUNK);
                self.file.write_all_sync(offset, &zeros[..len])?;
                offset += len as u64;
            }
            Ok(())
        };
        clear(0, min.min(self.capacity))?;
        clear(max.saturating_add(1).min(self.capacity), self.capacity)?;
        *self.valid_range.lock() = (min, max);
        self.write_header()
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    fn valid_range(&self) -> (u64, u64) {
        *self.valid_range.lock()
    }

    fn write_to_file(&self, path: &Path) -> Result<()> {
        self.check_open()?;
        self.write_header()?;
        self.file.flush_sync()?;
        if path != self.file.path() {
            let target = FileSystemFile::open(path, true)?;
            target.truncate_sync(0)?;
            let mut chunk = vec![0u8; COPY_CHUNK];
            let end = value_offset(self.capacity);
            let mut offset = 0;
            while offset < end {
                let len = ((end - offset) as usize).min(COPY_CHUNK);
                self.file.read_exact_sync(offset, &mut chunk[..len])?;
                target.write_all_sync(offset, &chunk[..len])?;
                offset += len as u64;
            }
            target.flush_sync()?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let path: PathBuf = self.file.path().to_path_buf();
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(path = %path.display(), "closed disk index");
        Ok(())
    }

    fn memory_bytes(&self) -> u64 {
        std::mem::size_of::<Self>() as u64
    }
}
