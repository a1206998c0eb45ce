//! A single append-only data file
//!
//! ```text
//! header   magic "HDHMDAT1" | version u32 LE | file_index u32 LE | creation_millis u64 LE
//! items    (len u32 LE | bytes)*
//! ```
//!
//! Items are written with positional writes straight to the file, so readers
//! sharing the handle see an item as soon as `store_data_item` returns.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use super::location::{DataLocation, MAX_OFFSET};
use crate::device::{FileSystemFile, SyncStorageDevice};
use crate::error::{Error, Result};

/// Extension of data files.
pub const DATA_FILE_EXTENSION: &str = "hdf";

/// Size of the per-item length prefix.
const ITEM_HEADER_SIZE: u64 = 4;

const SCAN_BUFFER_SIZE: usize = 1 << 20;

/// Name of data file `file_index` of store `store_name`
pub fn data_file_name(store_name: &str, file_index: u32) -> String {
    format!("{store_name}_{file_index:06}.{DATA_FILE_EXTENSION}")
}

/// Parse the index out of a data file name with the given prefix.
pub fn parse_data_file_name(file_name: &str, store_name: &str) -> Option<u32> {
    let rest = file_name.strip_prefix(store_name)?.strip_prefix('_')?;
    let digits = rest.strip_suffix(DATA_FILE_EXTENSION)?.strip_suffix('.')?;
    if digits.len() < 6 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Header at the start of every data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFileHeader {
    /// Index of the file within its collection
    pub file_index: u32,
    /// Wall-clock creation time in milliseconds since the epoch
    pub creation_millis: u64,
}

impl DataFileHeader {
    /// File magic
    pub const MAGIC: [u8; 8] = *b"HDHMDAT1";
    /// Supported format version
    pub const VERSION: u32 = 1;
    /// Encoded size in bytes
    pub const ENCODED_SIZE: usize = 24;

    fn now(file_index: u32) -> Self {
        let creation_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        Self {
            file_index,
            creation_millis,
        }
    }

    fn encode(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut buf = [0u8; Self::ENCODED_SIZE];
        buf[0..8].copy_from_slice(&Self::MAGIC);
        buf[8..12].copy_from_slice(&Self::VERSION.to_le_bytes());
        buf[12..16].copy_from_slice(&self.file_index.to_le_bytes());
        buf[16..24].copy_from_slice(&self.creation_millis.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; Self::ENCODED_SIZE], path: &Path) -> Result<Self> {
        if buf[0..8] != Self::MAGIC {
            return Err(Error::corruption(format!(
                "{} is not a data file",
                path.display()
            )));
        }
        let mut word = [0u8; 4];
        word.copy_from_slice(&buf[8..12]);
        let version = u32::from_le_bytes(word);
        if version != Self::VERSION {
            return Err(Error::IncompatibleFormat {
                what: "data file",
                found: i64::from(version),
                expected: i64::from(Self::VERSION),
            });
        }
        word.copy_from_slice(&buf[12..16]);
        let mut millis = [0u8; 8];
        millis.copy_from_slice(&buf[16..24]);
        Ok(Self {
            file_index: u32::from_le_bytes(word),
            creation_millis: u64::from_le_bytes(millis),
        })
    }
}

/// Read access to one data file, completed or still being written.
#[derive(Debug)]
pub struct DataFileReader {
    file: Arc<FileSystemFile>,
    header: DataFileHeader,
    completed: AtomicBool,
    size: AtomicU64,
}

impl DataFileReader {
    /// Open a completed data file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = FileSystemFile::open_read_only(path)?;
        let mut header = [0u8; DataFileHeader::ENCODED_SIZE];
        file.read_exact_sync(0, &mut header).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::corruption(format!("{} has no header", file.path().display()))
            } else {
                Error::Io(e)
            }
        })?;
        let header = DataFileHeader::decode(&header, file.path())?;
        let size = file.size_sync()?;
        Ok(Self {
            file: Arc::new(file),
            header,
            completed: AtomicBool::new(true),
            size: AtomicU64::new(size),
        })
    }

    /// Index of this file
    pub fn file_index(&self) -> u32 {
        self.header.file_index
    }

    /// Header of this file
    pub fn header(&self) -> DataFileHeader {
        self.header
    }

    /// Path on disk
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Size in bytes, header included
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Whether the writer has finished this file
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Read the item stored at `offset`.
    pub fn read_data_item(&self, offset: u64) -> Result<Bytes> {
        let mut len = [0u8; ITEM_HEADER_SIZE as usize];
        self.file.read_exact_sync(offset, &mut len)?;
        let len = u32::from_le_bytes(len) as usize;
        let mut item = BytesMut::zeroed(len);
        self.file
            .read_exact_sync(offset + ITEM_HEADER_SIZE, &mut item)?;
        Ok(item.freeze())
    }

    /// Visit every item in storage order.
    ///
    /// A torn item at the end of the file (a crash mid-append) ends the scan
    /// with a warning.
    pub fn for_each_item<F>(&self, mut visit: F) -> Result<u64>
    where
        F: FnMut(DataLocation, &[u8]) -> Result<()>,
    {
        let file = File::open(self.path())?;
        let end = file.metadata()?.len();
        let mut reader = BufReader::with_capacity(SCAN_BUFFER_SIZE, file);
        let mut header = [0u8; DataFileHeader::ENCODED_SIZE];
        reader.read_exact(&mut header)?;

        let mut offset = DataFileHeader::ENCODED_SIZE as u64;
        let mut count = 0;
        let mut item = Vec::new();
        while offset < end {
            let mut len = [0u8; ITEM_HEADER_SIZE as usize];
            if end - offset < ITEM_HEADER_SIZE {
                warn!(path = %self.path().display(), offset, "torn item length at end of data file");
                break;
            }
            reader.read_exact(&mut len)?;
            let len = u64::from(u32::from_le_bytes(len));
            if end - offset - ITEM_HEADER_SIZE < len {
                warn!(path = %self.path().display(), offset, len, "torn item at end of data file");
                break;
            }
            item.resize(len as usize, 0);
            reader.read_exact(&mut item)?;
            visit(DataLocation::new(self.file_index(), offset), &item)?;
            offset += ITEM_HEADER_SIZE + len;
            count += 1;
        }
        Ok(count)
    }
}

/// Appends items to a new data file.
#[derive(Debug)]
pub struct DataFileWriter {
    reader: Arc<DataFileReader>,
    position: u64,
    items: u64,
    scratch: BytesMut,
}

impl DataFileWriter {
    /// Create file `file_index` in `dir`, failing if it exists.
    pub fn create(dir: &Path, store_name: &str, file_index: u32) -> Result<Self> {
        let path: PathBuf = dir.join(data_file_name(store_name, file_index));
        let file = FileSystemFile::create_new(&path)?;
        let header = DataFileHeader::now(file_index);
        file.write_all_sync(0, &header.encode())?;
        let position = DataFileHeader::ENCODED_SIZE as u64;
        debug!(path = %path.display(), file_index, "created data file");
        Ok(Self {
            reader: Arc::new(DataFileReader {
                file: Arc::new(file),
                header,
                completed: AtomicBool::new(false),
                size: AtomicU64::new(position),
            }),
            position,
            items: 0,
            scratch: BytesMut::new(),
        })
    }

    /// Reader sharing this writer's file handle
    pub fn reader(&self) -> Arc<DataFileReader> {
        Arc::clone(&self.reader)
    }

    /// Index of the file being written
    pub fn file_index(&self) -> u32 {
        self.reader.file_index()
    }

    /// Number of items written so far
    pub fn item_count(&self) -> u64 {
        self.items
    }

    /// Append one item and return its location.
    pub fn store_data_item(&mut self, item: &[u8]) -> Result<DataLocation> {
        let len = u32::try_from(item.len()).map_err(|_| {
            Error::invalid_argument(format!("data item of {} bytes is too large", item.len()))
        })?;
        let offset = self.position;
        let next = offset + ITEM_HEADER_SIZE + u64::from(len);
        if next > MAX_OFFSET {
            return Err(Error::invalid_state(format!(
                "data file {} is full",
                self.file_index()
            )));
        }

        self.scratch.clear();
        self.scratch.reserve(ITEM_HEADER_SIZE as usize + item.len());
        self.scratch.put_u32_le(len);
        self.scratch.put_slice(item);
        self.reader.file.write_all_sync(offset, &self.scratch)?;

        self.position = next;
        self.items += 1;
        self.reader.size.store(next, Ordering::Release);
        Ok(DataLocation::new(self.file_index(), offset))
    }

    /// Sync the file to disk and mark it completed.
    pub fn finish(self) -> Result<Arc<DataFileReader>> {
        self.reader.file.flush_sync()?;
        self.reader.completed.store(true, Ordering::Release);
        debug!(
            path = %self.reader.path().display(),
            items = self.items,
            bytes = self.position,
            "finished data file"
        );
        Ok(self.reader)
    }
}
