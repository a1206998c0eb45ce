//! The half-disk hash map
//!
//! Keys are routed to a power-of-two number of buckets by the low bits of
//! their hash code. Each non-empty bucket is stored as one serialized item in
//! the data files, and a dense index maps bucket index to its latest
//! location.
//!
//! Writes are buffered in a session. [`HalfDiskHashMap::end_writing`] flushes
//! the session: every touched bucket is read, updated and appended to one new
//! data file. Readers only ever see flushed state.

mod flush;
mod metadata;


use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::bucket::{Bucket, RawBucket, ReusableBucketPool, INVALID_VALUE};
use crate::config::HalfDiskHashMapConfig;
use crate::error::{Error, Result};
use crate::files::{
    parse_data_file_name, DataFileCollection, DataFileReader, DataLocation, FileStatistics,
};
use crate::index::{DiskLongList, LongList, MemoryLongList};
use crate::mutation::BucketMutation;

pub use flush::{FlushExecutor, FlushStats};
pub use metadata::{index_path, metadata_path, MapMetadata};

use flush::{flush_buckets, FlushTarget};
use metadata::{remove_if_exists, working_index_path};

/// Target average number of entries per bucket.
pub const GOOD_AVERAGE_BUCKET_ENTRY_COUNT: u64 = 32;

/// Largest supported bucket count.
pub const MAX_NUM_OF_BUCKETS: u32 = 1 << 30;

/// Observable state of the write session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session is open
    Idle,
    /// A session is open (or being flushed)
    Writing,
    /// The last flush failed; a new session may be started
    Failed,
}

enum Session {
    Idle,
    Writing {
        thread: ThreadId,
        mutations: HashMap<u32, BucketMutation>,
        flushing: bool,
    },
    Failed,
}

impl Session {
    fn state(&self) -> SessionState {
        match self {
            Session::Idle => SessionState::Idle,
            Session::Writing { .. } => SessionState::Writing,
            Session::Failed => SessionState::Failed,
        }
    }
}

/// Number of buckets for an expected number of entries.
///
/// `max(highest_one_bit(map_size / 32) * 2, 2)`
pub fn num_of_buckets_for(map_size: u64) -> Result<u32> {
    let minimum = map_size / GOOD_AVERAGE_BUCKET_ENTRY_COUNT;
    let buckets = highest_one_bit(minimum).saturating_mul(2).max(2);
    if buckets > u64::from(MAX_NUM_OF_BUCKETS) {
        return Err(Error::invalid_argument(format!(
            "map_size {map_size} needs {buckets} buckets, more than the supported {MAX_NUM_OF_BUCKETS}"
        )));
    }
    Ok(buckets as u32)
}

#[inline]
fn highest_one_bit(value: u64) -> u64 {
    if value == 0 {
        0
    } else {
        1 << (63 - value.leading_zeros())
    }
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_argument("key must not be empty"));
    }
    Ok(())
}

/// Whether `dir` holds files of `store_name` (or the legacy name).
fn store_exists(dir: &Path, store_name: &str, legacy_store_name: Option<&str>) -> Result<bool> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    let names: Vec<&str> = std::iter::once(store_name).chain(legacy_store_name).collect();
    for name in &names {
        if metadata_path(dir, name).exists() || index_path(dir, name).exists() {
            return Ok(true);
        }
    }
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if names
            .iter()
            .any(|name| parse_data_file_name(file_name, name).is_some())
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// A hash map from byte keys to `i64` values whose buckets live on disk and
/// whose bucket index lives in memory (or a file).
///
/// One thread at a time writes through a session:
///
/// ```no_run
/// use halfdisk::{hash_key, HalfDiskHashMap, HalfDiskHashMapConfig};
///
/// # fn main() -> halfdisk::Result<()> {
/// let map = HalfDiskHashMap::open(HalfDiskHashMapConfig::new("/tmp/store", "accounts"))?;
/// map.start_writing()?;
/// map.put(b"alice", hash_key(b"alice"), 42)?;
/// map.end_writing()?;
/// assert_eq!(map.get(b"alice", hash_key(b"alice"), -1)?, 42);
/// map.close()?;
/// # Ok(())
/// # }
/// ```
///
/// Any number of threads may call [`get`](Self::get) at any time.
pub struct HalfDiskHashMap {
    config: HalfDiskHashMapConfig,
    num_of_buckets: u32,
    index: Box<dyn LongList>,
    files: DataFileCollection,
    pool: ReusableBucketPool<RawBucket>,
    executor: FlushExecutor,
    session: Mutex<Session>,
}

impl HalfDiskHashMap {
    /// Open or create a map with its own flush executor of
    /// `config.flush_threads` workers.
    pub fn open(config: HalfDiskHashMapConfig) -> Result<Self> {
        config.validate()?;
        let executor = FlushExecutor::new(config.flush_threads)?;
        Self::open_with_executor(config, executor)
    }

    /// Open or create a map that flushes on a shared executor.
    ///
    /// A saved bucket index is loaded and then deleted; only
    /// [`close`](Self::close) writes it again. Without one (after a crash, or
    /// with `index_rebuilding_enforced`) the index is rebuilt by replaying
    /// every data file, newest bucket last.
    ///
    /// A rebuild can bring deleted keys back. A bucket emptied by deletes is
    /// never written, so replay finds its last non-empty version. Close the
    /// map cleanly to keep such deletes.
    pub fn open_with_executor(config: HalfDiskHashMapConfig, executor: FlushExecutor) -> Result<Self> {
        config.validate()?;
        let dir = config.store_dir.clone();
        let store_name = config.store_name.as_str();
        let legacy_store_name = config.legacy_store_name.as_deref();
        let pool: ReusableBucketPool<RawBucket> = ReusableBucketPool::new();

        let mut index_file = index_path(&dir, store_name);
        let (num_of_buckets, rebuild) = if store_exists(&dir, store_name, legacy_store_name)? {
            let mut metadata_file = metadata_path(&dir, store_name);
            let mut loaded_legacy = false;
            if !metadata_file.exists() {
                if let Some(legacy) = legacy_store_name {
                    metadata_file = metadata_path(&dir, legacy);
                    index_file = index_path(&dir, legacy);
                    loaded_legacy = true;
                }
            }
            if !metadata_file.exists() {
                error!(
                    dir = %dir.display(),
                    "loading an existing set of data files but no metadata file was found"
                );
                return Err(Error::MissingMetadata(dir));
            }
            let metadata = MapMetadata::read(&metadata_file)?;
            if loaded_legacy {
                metadata.write(&metadata_path(&dir, store_name))?;
                fs::remove_file(&metadata_file)?;
                info!(
                    store = store_name,
                    legacy_store = legacy_store_name.unwrap_or_default(),
                    "migrated legacy metadata"
                );
            }
            let rebuild = config.index_rebuilding_enforced || !index_file.exists();
            (metadata.num_of_buckets, rebuild)
        } else {
            fs::create_dir_all(&dir)?;
            let num_of_buckets = num_of_buckets_for(config.map_size)?;
            MapMetadata { num_of_buckets }.write(&metadata_path(&dir, store_name))?;
            info!(
                store = store_name,
                minimum_buckets = config.map_size / GOOD_AVERAGE_BUCKET_ENTRY_COUNT,
                num_of_buckets,
                "created half-disk hash map"
            );
            (num_of_buckets, false)
        };

        let capacity = u64::from(num_of_buckets);
        let load_saved = !rebuild && index_file.exists();
        let index: Box<dyn LongList> = match (config.prefer_disk_index, load_saved) {
            (true, true) => Box::new(DiskLongList::load(
                &index_file,
                working_index_path(&dir, store_name),
                capacity,
            )?),
            (true, false) => Box::new(DiskLongList::create(
                working_index_path(&dir, store_name),
                capacity,
            )?),
            (false, true) => Box::new(MemoryLongList::load(&index_file, capacity)?),
            (false, false) => Box::new(MemoryLongList::new(capacity)),
        };
        index.update_valid_range(0, capacity - 1)?;

        let files = if rebuild {
            info!(store = store_name, num_of_buckets, "rebuilding bucket index from data files");
            let mut rebuilt = 0u64;
            let mut on_load = |location: DataLocation, item: &[u8]| -> Result<()> {
                let mut bucket = pool.get_bucket();
                bucket.read_from(&mut &item[..])?;
                let bucket_index = u64::from(bucket.bucket_index());
                if bucket_index >= capacity {
                    return Err(Error::corruption(format!(
                        "stored bucket index {bucket_index} is beyond bucket count {capacity}"
                    )));
                }
                if bucket.is_empty() {
                    index.remove(bucket_index)?;
                } else {
                    index.put(bucket_index, location.raw())?;
                }
                rebuilt += 1;
                Ok(())
            };
            let files = DataFileCollection::open(&dir, store_name, legacy_store_name, Some(&mut on_load))?;
            info!(store = store_name, items = rebuilt, "rebuilt bucket index");
            files
        } else {
            DataFileCollection::open(&dir, store_name, legacy_store_name, None)?
        };

        // A saved index is only valid until the next flush; close writes it back.
        remove_if_exists(&index_file)?;

        Ok(Self {
            num_of_buckets,
            index,
            files,
            pool,
            executor,
            session: Mutex::new(Session::Idle),
            config,
        })
    }

    /// Name prefix of this map's files
    pub fn store_name(&self) -> &str {
        &self.config.store_name
    }

    /// Directory holding this map's files
    pub fn store_dir(&self) -> &Path {
        &self.config.store_dir
    }

    /// Number of buckets
    pub fn num_of_buckets(&self) -> u32 {
        self.num_of_buckets
    }

    /// The bucket a hash code routes to
    #[inline]
    pub fn bucket_index_for(&self, hash_code: i32) -> u32 {
        (self.num_of_buckets - 1) & (hash_code as u32)
    }

    /// Current state of the write session
    pub fn session_state(&self) -> SessionState {
        self.session.lock().state()
    }

    /// The executor flushes run on
    pub fn executor(&self) -> &FlushExecutor {
        &self.executor
    }

    /// Open a write session owned by the calling thread.
    pub fn start_writing(&self) -> Result<()> {
        let mut session = self.session.lock();
        if let Session::Writing { .. } = &*session {
            return Err(Error::invalid_state(
                "start_writing called while a write session is already open",
            ));
        }
        *session = Session::Writing {
            thread: thread::current().id(),
            mutations: HashMap::new(),
            flushing: false,
        };
        Ok(())
    }

    /// Set `key` to `value`.
    pub fn put(&self, key: &[u8], hash_code: i32, value: i64) -> Result<()> {
        self.record(key, hash_code, None, value)
    }

    /// Set `key` to `value` only if it currently holds `expected`.
    ///
    /// A key without a value never matches.
    pub fn put_if_equal(&self, key: &[u8], hash_code: i32, expected: i64, value: i64) -> Result<()> {
        self.record(key, hash_code, Some(expected), value)
    }

    /// Remove `key`.
    pub fn delete(&self, key: &[u8], hash_code: i32) -> Result<()> {
        self.record(key, hash_code, None, INVALID_VALUE)
    }

    /// Remove `key` only if it currently holds `expected`.
    pub fn delete_if_equal(&self, key: &[u8], hash_code: i32, expected: i64) -> Result<()> {
        self.record(key, hash_code, Some(expected), INVALID_VALUE)
    }

    fn record(&self, key: &[u8], hash_code: i32, expected: Option<i64>, value: i64) -> Result<()> {
        check_key(key)?;
        let mut session = self.session.lock();
        let mutations = match &mut *session {
            Session::Writing {
                thread,
                mutations,
                flushing: false,
            } if *thread == thread::current().id() => mutations,
            Session::Writing { flushing: false, .. } => {
                return Err(Error::invalid_state(
                    "write called from a different thread than start_writing",
                ))
            }
            Session::Writing { .. } => {
                return Err(Error::invalid_state("write called while the session is flushing"))
            }
            Session::Idle | Session::Failed => {
                return Err(Error::invalid_state(
                    "write called without start_writing",
                ))
            }
        };

        let bucket_index = self.bucket_index_for(hash_code);
        match mutations.entry(bucket_index) {
            Entry::Vacant(slot) => {
                slot.insert(BucketMutation::new(key, hash_code, expected, value));
            }
            Entry::Occupied(mut slot) => match expected {
                Some(expected) => slot.get_mut().put_if_equal(key, hash_code, expected, value),
                None => slot.get_mut().put(key, hash_code, value),
            },
        }
        Ok(())
    }

    /// Flush the session and close it.
    ///
    /// Returns the data file written, or `None` if the session had no
    /// mutations. On failure some buckets may already be stored; the session
    /// ends in [`SessionState::Failed`].
    pub fn end_writing(&self) -> Result<Option<Arc<DataFileReader>>> {
        let mutations = {
            let mut session = self.session.lock();
            match &mut *session {
                Session::Writing {
                    thread,
                    mutations,
                    flushing,
                } if *thread == thread::current().id() && !*flushing => {
                    *flushing = true;
                    std::mem::take(mutations)
                }
                Session::Writing { .. } => {
                    return Err(Error::invalid_state(
                        "end_writing called from a different thread than start_writing",
                    ))
                }
                Session::Idle | Session::Failed => {
                    return Err(Error::invalid_state("end_writing called without start_writing"))
                }
            }
        };

        let changed_keys: usize = mutations.values().map(BucketMutation::len).sum();
        info!(
            store = %self.config.store_name,
            changed_buckets = mutations.len(),
            changed_keys,
            "finishing writing"
        );

        let result = if mutations.is_empty() {
            Ok(None)
        } else {
            self.flush(mutations).map(Some)
        };

        *self.session.lock() = if result.is_ok() {
            Session::Idle
        } else {
            Session::Failed
        };
        result
    }

    fn flush(&self, mutations: HashMap<u32, BucketMutation>) -> Result<Arc<DataFileReader>> {
        self.files.start_writing()?;
        let target = FlushTarget {
            index: self.index.as_ref(),
            files: &self.files,
            pool: &self.pool,
        };
        let (stats, failure) =
            flush_buckets(&self.executor, &target, mutations, self.config.max_in_flight);
        let ended = self
            .files
            .end_writing(0, i64::from(self.num_of_buckets) - 1);

        if let Some(failure) = failure {
            if let Err(e) = &ended {
                error!(store = %self.config.store_name, error = %e, "failed to finish data file");
            }
            warn!(
                store = %self.config.store_name,
                stored = stats.stored,
                removed = stats.removed,
                failed = stats.failed,
                "flush finished with failures"
            );
            return Err(failure);
        }
        ended
    }

    /// Value stored for `key`, or `not_found`.
    ///
    /// Mutations of an open session are not visible until flushed.
    pub fn get(&self, key: &[u8], hash_code: i32, not_found: i64) -> Result<i64> {
        check_key(key)?;
        let bucket_index = self.bucket_index_for(hash_code);
        let Some(mut bytes) = self
            .files
            .read_data_item_using_index(self.index.as_ref(), u64::from(bucket_index))?
        else {
            return Ok(not_found);
        };
        let mut bucket = self.pool.get_bucket();
        bucket.read_from(&mut bytes)?;
        bucket.find_value(hash_code, key, not_found)
    }

    /// Copy the index, data files and metadata into `dir`.
    ///
    /// The copy can be opened as a store of the same name.
    pub fn snapshot(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        if let Session::Writing { flushing: true, .. } = &*self.session.lock() {
            return Err(Error::invalid_state("snapshot called during a flush"));
        }
        if same_dir(dir, &self.config.store_dir) {
            return Err(Error::invalid_argument(
                "snapshot directory must differ from the store directory",
            ));
        }
        fs::create_dir_all(dir)?;
        let store_name = &self.config.store_name;
        self.index.write_to_file(&index_path(dir, store_name))?;
        self.files.snapshot(dir)?;
        MapMetadata {
            num_of_buckets: self.num_of_buckets,
        }
        .write(&metadata_path(dir, store_name))?;
        info!(store = %store_name, dir = %dir.display(), "snapshot written");
        Ok(())
    }

    /// Size statistics of the completed data files
    pub fn files_size_statistics(&self) -> FileStatistics {
        self.files.files_size_statistics()
    }

    /// Heap memory used by the bucket index
    pub fn index_memory_bytes(&self) -> u64 {
        self.index.memory_bytes()
    }

    /// Log sizing information.
    pub fn print_stats(&self) {
        info!(
            store = %self.config.store_name,
            map_size = self.config.map_size,
            num_of_buckets = self.num_of_buckets,
            good_average_bucket_entry_count = GOOD_AVERAGE_BUCKET_ENTRY_COUNT,
            "half-disk hash map stats"
        );
    }

    /// Close the data files, then persist and close the index.
    ///
    /// Mutations of a session that was never flushed are discarded.
    ///
    /// The saved index is the only record of buckets emptied by deletes. If
    /// the process exits without calling `close`, the next open rebuilds the
    /// index and those buckets reappear with their last stored contents.
    pub fn close(self) -> Result<()> {
        if let Session::Writing { mutations, .. } = &*self.session.lock() {
            warn!(
                store = %self.config.store_name,
                pending_buckets = mutations.len(),
                "closing with an open write session; pending mutations are discarded"
            );
        }
        self.files.close()?;
        self.index
            .write_to_file(&index_path(&self.config.store_dir, &self.config.store_name))?;
        self.index.close()
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    let canonical = |p: &Path| fs::canonicalize(p).unwrap_or_else(|_| PathBuf::from(p));
    canonical(a) == canonical(b)
}

impl std::fmt::Debug for HalfDiskHashMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HalfDiskHashMap")
            .field("store_name", &self.config.store_name)
            .field("store_dir", &self.config.store_dir)
            .field("num_of_buckets", &self.num_of_buckets)
            .field("session", &self.session_state())
            .finish()
    }
}
