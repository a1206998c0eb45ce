//! Reusable bucket pool
//!
//! Flushes borrow one bucket per touched slot. Recycling them avoids a
//! buffer allocation per bucket on the hot path.
//!
//! The pool never blocks and has no capacity cap: when it is empty a new
//! bucket is allocated, and every released bucket is kept. Blocking here
//! could stall the flush pipeline while other buckets are mid-flight.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::queue::SegQueue;

use super::Bucket;

struct PoolInner<B> {
    buckets: SegQueue<B>,
    created: AtomicUsize,
}

impl<B: Bucket> PoolInner<B> {
    fn release(&self, bucket: B) {
        self.buckets.push(bucket);
    }
}

/// A lock-free pool of reusable buckets.
pub struct ReusableBucketPool<B: Bucket> {
    inner: Arc<PoolInner<B>>,
}

impl<B: Bucket> Clone for ReusableBucketPool<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Bucket> Default for ReusableBucketPool<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Bucket> ReusableBucketPool<B> {
    /// Create an empty pool
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buckets: SegQueue::new(),
                created: AtomicUsize::new(0),
            }),
        }
    }

    /// Borrow a cleared bucket, allocating one if the pool is empty.
    ///
    /// The bucket returns to the pool when the guard is dropped.
    pub fn get_bucket(&self) -> PooledBucket<B> {
        let mut bucket = self.inner.buckets.pop().unwrap_or_else(|| {
            self.inner.created.fetch_add(1, Ordering::Relaxed);
            B::default()
        });
        bucket.clear();
        PooledBucket {
            bucket: Some(bucket),
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// Return a bucket that was detached from its guard.
    pub fn release_bucket(&self, bucket: B) {
        self.inner.release(bucket);
    }

    /// Number of buckets currently idle in the pool
    pub fn available(&self) -> usize {
        self.inner.buckets.len()
    }

    /// Number of buckets allocated by this pool so far
    pub fn created(&self) -> usize {
        self.inner.created.load(Ordering::Relaxed)
    }
}

/// A bucket borrowed from a [`ReusableBucketPool`].
///
/// Ownership is exclusive until drop, which releases the bucket back to its
/// pool (if the pool still exists).
pub struct PooledBucket<B: Bucket> {
    bucket: Option<B>,
    pool: Weak<PoolInner<B>>,
}

impl<B: Bucket> PooledBucket<B> {
    /// Create a bucket that is not backed by any pool
    pub fn standalone(bucket: B) -> Self {
        Self {
            bucket: Some(bucket),
            pool: Weak::new(),
        }
    }

    /// Detach the bucket from its pool
    pub fn into_inner(mut self) -> B {
        self.pool = Weak::new();
        self.bucket.take().unwrap_or_default()
    }
}

impl<B: Bucket> Deref for PooledBucket<B> {
    type Target = B;

    fn deref(&self) -> &B {
        // Only `into_inner` and `drop` take the bucket, and both consume the guard.
        self.bucket.as_ref().expect("pooled bucket present")
    }
}

impl<B: Bucket> DerefMut for PooledBucket<B> {
    fn deref_mut(&mut self) -> &mut B {
        self.bucket.as_mut().expect("pooled bucket present")
    }
}

impl<B: Bucket + std::fmt::Debug> std::fmt::Debug for PooledBucket<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledBucket").field(&self.bucket).finish()
    }
}

impl<B: Bucket> Drop for PooledBucket<B> {
    fn drop(&mut self) {
        if let (Some(pool), Some(bucket)) = (self.pool.upgrade(), self.bucket.take()) {
            pool.release(bucket);
        }
    }
}
