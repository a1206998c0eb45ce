//! Flush pipeline: parallel read-update, serial store
//!
//! The thread calling [`HalfDiskHashMap::end_writing`](super::HalfDiskHashMap::end_writing)
//! dispatches one read-update job per touched bucket onto the
//! [`FlushExecutor`], and is itself the only writer: it receives finished
//! buckets over a channel and appends them to the data file one at a time.
//! At most `max_in_flight` buckets are outstanding; each stored bucket frees a
//! slot for the next dispatch.
//!
//! `end_writing` may itself run on a worker of the executor. The writer then
//! keeps executing pending jobs while it waits, since its own spawns sit on
//! that worker's queue.

use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{unbounded, Receiver, TryRecvError};
use rayon::{ThreadPool, ThreadPoolBuilder, Yield};
use tracing::{error, trace};

use crate::bucket::{Bucket, PooledBucket, RawBucket, ReusableBucketPool};
use crate::error::{Error, Result};
use crate::files::DataFileCollection;
use crate::index::LongList;
use crate::mutation::BucketMutation;

/// Worker threads running flush read-update jobs.
///
/// Cloning is cheap; clones share the same threads, so several maps can flush
/// on one executor.
#[derive(Clone)]
pub struct FlushExecutor {
    pool: Arc<ThreadPool>,
}

impl FlushExecutor {
    /// Build an executor with `threads` named workers
    pub fn new(threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("halfdisk-flush-{i}"))
            .build()
            .map_err(|e| Error::Io(io::Error::other(e)))?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Wrap an existing rayon pool
    pub fn from_pool(pool: Arc<ThreadPool>) -> Self {
        Self { pool }
    }

    /// Number of worker threads
    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Whether the calling thread is one of this executor's workers
    pub fn is_worker_thread(&self) -> bool {
        self.pool.current_thread_index().is_some()
    }
}

impl std::fmt::Debug for FlushExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushExecutor")
            .field("num_threads", &self.num_threads())
            .finish()
    }
}

/// Outcome counters of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Buckets appended to the data file
    pub stored: usize,
    /// Buckets left empty whose index entry was removed
    pub removed: usize,
    /// Buckets whose read, update or store failed
    pub failed: usize,
}

/// Everything a flush touches besides the mutations.
pub(crate) struct FlushTarget<'a> {
    pub index: &'a dyn LongList,
    pub files: &'a DataFileCollection,
    pub pool: &'a ReusableBucketPool<RawBucket>,
}

/// Apply `mutations` and store every resulting bucket.
///
/// The data file must already be open for writing. All buckets are processed
/// even after a failure; the first failure is returned once every dispatched
/// bucket has settled.
pub(crate) fn flush_buckets(
    executor: &FlushExecutor,
    target: &FlushTarget<'_>,
    mutations: HashMap<u32, BucketMutation>,
    max_in_flight: usize,
) -> (FlushStats, Option<Error>) {
    let (tx, rx) = unbounded::<FlushResult>();
    let on_worker = executor.is_worker_thread();
    let mut pending = mutations.into_iter();
    let mut stats = FlushStats::default();
    let mut first_error = None;
    let max_in_flight = max_in_flight.max(1);

    executor.pool.in_place_scope(|scope| {
        let mut in_flight = 0usize;
        loop {
            while in_flight < max_in_flight {
                let Some((bucket_index, mutation)) = pending.next() else {
                    break;
                };
                let tx = tx.clone();
                scope.spawn(move |_| {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| {
                        read_update_bucket(target, bucket_index, &mutation)
                    }))
                    .unwrap_or_else(|_| {
                        Err(Error::Io(io::Error::other("read-update task panicked")))
                    });
                    // The receiver outlives every job of this scope.
                    let _ = tx.send((bucket_index, result));
                });
                in_flight += 1;
            }
            if in_flight == 0 {
                break;
            }

            let Some((bucket_index, result)) = next_result(&rx, on_worker) else {
                break;
            };
            in_flight -= 1;

            let outcome = match result {
                Ok(bucket) => store_bucket(target, bucket, &mut stats).map_err(|e| {
                    error!(bucket_index, error = %e, "failed to write bucket");
                    e
                }),
                Err(e) => {
                    error!(bucket_index, error = %e, "failed to read / update bucket");
                    Err(e)
                }
            };
            if let Err(e) = outcome {
                stats.failed += 1;
                first_error.get_or_insert(Error::Flush {
                    bucket_index,
                    source: Box::new(e),
                });
            }
        }
    });

    (stats, first_error)
}

type FlushResult = (u32, Result<PooledBucket<RawBucket>>);

/// Wait for the next finished bucket.
///
/// A worker of the executor must not park: the jobs it waits for may be queued
/// behind it, so it runs them itself until a result arrives.
fn next_result(rx: &Receiver<FlushResult>, on_worker: bool) -> Option<FlushResult> {
    if !on_worker {
        return rx.recv().ok();
    }
    loop {
        match rx.try_recv() {
            Ok(result) => return Some(result),
            Err(TryRecvError::Disconnected) => return None,
            Err(TryRecvError::Empty) => {
                if !matches!(rayon::yield_now(), Some(Yield::Executed)) {
                    thread::yield_now();
                }
            }
        }
    }
}

/// Load the current bucket (or start empty) and apply its mutations.
fn read_update_bucket(
    target: &FlushTarget<'_>,
    bucket_index: u32,
    mutation: &BucketMutation,
) -> Result<PooledBucket<RawBucket>> {
    let mut bucket = target.pool.get_bucket();
    match target
        .files
        .read_data_item_using_index(target.index, u64::from(bucket_index))?
    {
        Some(mut bytes) => {
            bucket.read_from(&mut bytes)?;
            if bucket.bucket_index() != bucket_index {
                return Err(Error::corruption(format!(
                    "bucket stored for index {bucket_index} claims index {}",
                    bucket.bucket_index()
                )));
            }
        }
        None => bucket.set_bucket_index(bucket_index),
    }
    mutation.apply_to(&mut *bucket)?;
    Ok(bucket)
}

/// Persist one bucket and update its index entry. The bucket returns to the
/// pool when dropped here.
fn store_bucket(
    target: &FlushTarget<'_>,
    bucket: PooledBucket<RawBucket>,
    stats: &mut FlushStats,
) -> Result<()> {
    let bucket_index = u64::from(bucket.bucket_index());
    if bucket.is_empty() {
        target.index.remove(bucket_index)?;
        stats.removed += 1;
        trace!(bucket_index, "removed empty bucket");
    } else {
        let location = target.files.store_data_item(bucket.as_bytes())?;
        target.index.put(bucket_index, location.raw())?;
        stats.stored += 1;
        trace!(bucket_index, %location, entries = bucket.entry_count(), "stored bucket");
    }
    Ok(())
}
