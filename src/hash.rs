//! Stable hashing for key bytes.
//!
//! The map never hashes keys itself: every call carries a precomputed hash
//! code. This helper exists for callers that have no hash of their own. The
//! hash must be deterministic across runs, so `DefaultHasher` is not used.

#[cfg(not(any(feature = "hash-xxh3", feature = "hash-xxh64")))]
compile_error!("Enable a hash feature: `hash-xxh3` (default) or `hash-xxh64`.");

/// Hash key bytes into a 64-bit value (deterministic).
#[inline]
pub fn hash64(bytes: &[u8]) -> u64 {
    #[cfg(feature = "hash-xxh3")]
    {
        xxhash_rust::xxh3::xxh3_64(bytes)
    }

    #[cfg(all(not(feature = "hash-xxh3"), feature = "hash-xxh64"))]
    {
        xxhash_rust::xxh64::xxh64(bytes, 0)
    }
}

/// Hash key bytes into the 32-bit hash code used for bucket routing.
///
/// The high half is folded into the low half so that the low bits, which
/// select the bucket, depend on the whole 64-bit hash.
#[inline]
pub fn hash_key(bytes: &[u8]) -> i32 {
    let h = hash64(bytes);
    ((h ^ (h >> 32)) as u32) as i32
}
