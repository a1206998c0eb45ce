//! The set of data files of one store

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::file::{data_file_name, parse_data_file_name, DataFileReader, DataFileWriter};
use super::location::{DataLocation, MAX_FILE_INDEX};
use crate::error::{Error, Result};
use crate::index::LongList;

/// Attempts made by [`DataFileCollection::read_data_item_using_index`].
pub const READ_RETRIES: usize = 5;

/// Callback receiving every item found while loading existing files.
pub type LoadedDataCallback<'a> = &'a mut dyn FnMut(DataLocation, &[u8]) -> Result<()>;

/// Size statistics over completed data files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStatistics {
    /// Number of completed files
    pub count: usize,
    /// Smallest file size in bytes
    pub min: u64,
    /// Largest file size in bytes
    pub max: u64,
    /// Total size in bytes
    pub sum: u64,
}

impl FileStatistics {
    /// Mean file size, or 0 with no files
    pub fn average(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.sum / self.count as u64
        }
    }
}

/// Valid key range persisted next to the data files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CollectionMetadata {
    min_valid: i64,
    max_valid: i64,
}

impl CollectionMetadata {
    const MAGIC: [u8; 8] = *b"HDHMDFC1";
    const VERSION: u32 = 1;
    const ENCODED_SIZE: usize = 28;

    fn file_name(store_name: &str) -> String {
        format!("{store_name}_metadata.dfc")
    }

    fn write(&self, path: &Path) -> Result<()> {
        let mut buf = [0u8; Self::ENCODED_SIZE];
        buf[0..8].copy_from_slice(&Self::MAGIC);
        buf[8..12].copy_from_slice(&Self::VERSION.to_le_bytes());
        buf[12..20].copy_from_slice(&self.min_valid.to_le_bytes());
        buf[20..28].copy_from_slice(&self.max_valid.to_le_bytes());
        fs::write(path, buf)?;
        Ok(())
    }

    fn read(path: &Path) -> Result<Option<Self>> {
        let buf = match fs::read(path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if buf.len() != Self::ENCODED_SIZE || buf[0..8] != Self::MAGIC {
            return Err(Error::corruption(format!(
                "{} is not a data collection metadata file",
                path.display()
            )));
        }
        let mut word = [0u8; 4];
        word.copy_from_slice(&buf[8..12]);
        let version = u32::from_le_bytes(word);
        if version != Self::VERSION {
            return Err(Error::IncompatibleFormat {
                what: "data collection metadata",
                found: i64::from(version),
                expected: i64::from(Self::VERSION),
            });
        }
        let mut long = [0u8; 8];
        long.copy_from_slice(&buf[12..20]);
        let min_valid = i64::from_le_bytes(long);
        long.copy_from_slice(&buf[20..28]);
        let max_valid = i64::from_le_bytes(long);
        Ok(Some(Self {
            min_valid,
            max_valid,
        }))
    }
}

/// Append-only storage for serialized items, spread over numbered files.
///
/// One writer at a time appends to a new file between
/// [`start_writing`](Self::start_writing) and
/// [`end_writing`](Self::end_writing). Readers may read any stored item,
/// including items of the file being written, concurrently.
pub struct DataFileCollection {
    dir: PathBuf,
    store_name: String,
    files: RwLock<BTreeMap<u32, Arc<DataFileReader>>>,
    writer: Mutex<Option<DataFileWriter>>,
    next_file_index: Mutex<u32>,
    valid_range: Mutex<Option<(i64, i64)>>,
}

impl DataFileCollection {
    /// Open the collection in `dir`, loading files named after `store_name`
    /// or, if given, `legacy_store_name`.
    ///
    /// `on_load` receives every stored item, file by file in index order.
    pub fn open(
        dir: impl AsRef<Path>,
        store_name: &str,
        legacy_store_name: Option<&str>,
        mut on_load: Option<LoadedDataCallback<'_>>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut found: BTreeMap<u32, PathBuf> = BTreeMap::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let index = parse_data_file_name(name, store_name).or_else(|| {
                legacy_store_name.and_then(|legacy| parse_data_file_name(name, legacy))
            });
            if let Some(index) = index {
                if let Some(previous) = found.insert(index, entry.path()) {
                    return Err(Error::corruption(format!(
                        "data file index {index} is used by both {} and {}",
                        previous.display(),
                        entry.path().display()
                    )));
                }
            }
        }

        let mut files = BTreeMap::new();
        for (index, path) in found {
            let reader = DataFileReader::open(&path)?;
            if reader.file_index() != index {
                return Err(Error::corruption(format!(
                    "{} claims file index {}",
                    path.display(),
                    reader.file_index()
                )));
            }
            if let Some(callback) = on_load.as_mut() {
                let items = reader.for_each_item(|location, item| callback(location, item))?;
                debug!(path = %path.display(), items, "loaded data file");
            }
            files.insert(index, Arc::new(reader));
        }

        let metadata = match CollectionMetadata::read(&dir.join(CollectionMetadata::file_name(store_name)))? {
            Some(metadata) => Some(metadata),
            None => match legacy_store_name {
                Some(legacy) => {
                    CollectionMetadata::read(&dir.join(CollectionMetadata::file_name(legacy)))?
                }
                None => None,
            },
        };

        let next_file_index = files.keys().next_back().map_or(0, |last| last + 1);
        if !files.is_empty() {
            info!(
                store = store_name,
                files = files.len(),
                next_file_index,
                "opened data file collection"
            );
        }

        Ok(Self {
            dir,
            store_name: store_name.to_string(),
            files: RwLock::new(files),
            writer: Mutex::new(None),
            next_file_index: Mutex::new(next_file_index),
            valid_range: Mutex::new(metadata.map(|m| (m.min_valid, m.max_valid))),
        })
    }

    /// Directory holding the files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Prefix of new file names
    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    /// Valid key range recorded by the last completed write, if any
    pub fn valid_range(&self) -> Option<(i64, i64)> {
        *self.valid_range.lock()
    }

    /// Number of files, including one being written
    pub fn file_count(&self) -> usize {
        self.files.read().len()
    }

    /// Whether a file is being written
    pub fn is_writing(&self) -> bool {
        self.writer.lock().is_some()
    }

    /// Begin a new data file.
    pub fn start_writing(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        if writer.is_some() {
            return Err(Error::invalid_state("a data file is already being written"));
        }
        let mut next = self.next_file_index.lock();
        if *next > MAX_FILE_INDEX {
            return Err(Error::invalid_state("data file indices exhausted"));
        }
        let new_writer = DataFileWriter::create(&self.dir, &self.store_name, *next)?;
        self.files.write().insert(*next, new_writer.reader());
        *next += 1;
        *writer = Some(new_writer);
        Ok(())
    }

    /// Append one item to the file being written.
    pub fn store_data_item(&self, item: &[u8]) -> Result<DataLocation> {
        match self.writer.lock().as_mut() {
            Some(writer) => writer.store_data_item(item),
            None => Err(Error::invalid_state("no data file is being written")),
        }
    }

    /// Finish the file being written and record the valid key range.
    ///
    /// Returns a reader over the new file.
    pub fn end_writing(&self, min_valid: i64, max_valid: i64) -> Result<Arc<DataFileReader>> {
        let writer = self
            .writer
            .lock()
            .take()
            .ok_or_else(|| Error::invalid_state("no data file is being written"))?;
        let reader = writer.finish()?;
        *self.valid_range.lock() = Some((min_valid, max_valid));
        CollectionMetadata {
            min_valid,
            max_valid,
        }
        .write(&self.dir.join(CollectionMetadata::file_name(&self.store_name)))?;
        Ok(reader)
    }

    /// Read the item at `location`.
    pub fn read_data_item(&self, location: DataLocation) -> Result<Option<Bytes>> {
        let reader = self.files.read().get(&location.file_index()).cloned();
        match reader {
            Some(reader) => reader.read_data_item(location.offset()).map(Some),
            None => Ok(None),
        }
    }

    /// Look up `key` in `index` and read the item it points to.
    ///
    /// If the file vanished between the lookup and the read, the lookup is
    /// retried; a location still pointing at a missing file after
    /// [`READ_RETRIES`] attempts is corruption.
    pub fn read_data_item_using_index(
        &self,
        index: &dyn LongList,
        key: u64,
    ) -> Result<Option<Bytes>> {
        let mut last = None;
        for attempt in 0..READ_RETRIES {
            let Some(location) = index.get(key)?.and_then(DataLocation::from_raw) else {
                return Ok(None);
            };
            if let Some(item) = self.read_data_item(location)? {
                return Ok(Some(item));
            }
            warn!(key, %location, attempt, "data file missing for indexed location, retrying");
            last = Some(location);
        }
        Err(Error::corruption(format!(
            "index entry {key} points to missing data file location {}",
            last.map_or_else(String::new, |l| l.to_string())
        )))
    }

    /// Hard-link (or copy) every completed file into `dir`, with the
    /// collection metadata.
    pub fn snapshot(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let files: Vec<_> = self
            .files
            .read()
            .values()
            .filter(|r| r.is_completed())
            .cloned()
            .collect();
        for reader in &files {
            let target = dir.join(data_file_name(&self.store_name, reader.file_index()));
            if let Err(e) = fs::hard_link(reader.path(), &target) {
                debug!(
                    source = %reader.path().display(),
                    error = %e,
                    "hard link failed, copying data file"
                );
                fs::copy(reader.path(), &target)?;
            }
        }
        if let Some((min_valid, max_valid)) = self.valid_range() {
            CollectionMetadata {
                min_valid,
                max_valid,
            }
            .write(&dir.join(CollectionMetadata::file_name(&self.store_name)))?;
        }
        debug!(dir = %dir.display(), files = files.len(), "snapshot data files");
        Ok(())
    }

    /// Size statistics of completed files
    pub fn files_size_statistics(&self) -> FileStatistics {
        let files = self.files.read();
        let mut stats = FileStatistics::default();
        for reader in files.values().filter(|r| r.is_completed()) {
            let size = reader.size();
            stats.min = if stats.count == 0 { size } else { stats.min.min(size) };
            stats.max = stats.max.max(size);
            stats.sum += size;
            stats.count += 1;
        }
        stats
    }

    /// Finish an open writer and drop every reader.
    pub fn close(&self) -> Result<()> {
        let writer = self.writer.lock().take();
        let result = match writer {
            Some(writer) => {
                warn!(store = %self.store_name, "closing data files with a file still being written");
                writer.finish().map(|_| ())
            }
            None => Ok(()),
        };
        self.files.write().clear();
        result
    }
}
