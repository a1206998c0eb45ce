//! Shared helpers for halfdisk integration tests.

#![allow(dead_code)]

use std::fs::{self, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

use rand::prelude::*;
use rand::rngs::StdRng;
use tempfile::TempDir;

use halfdisk::{hash_key, HalfDiskHashMap, HalfDiskHashMapConfig};

/// Store name used by most tests.
pub const STORE: &str = "test_store";

/// Size of the bucket index file header.
pub const INDEX_HEADER_SIZE: u64 = 36;

/// A small config rooted in `dir`.
pub fn config(dir: &Path) -> HalfDiskHashMapConfig {
    HalfDiskHashMapConfig::new(dir, STORE)
        .with_map_size(1_000)
        .with_flush_threads(2)
}

/// Open a fresh map in a new temporary directory.
pub fn create_map(map_size: u64) -> (TempDir, HalfDiskHashMap) {
    let dir = tempfile::tempdir().unwrap();
    let map = HalfDiskHashMap::open(config(dir.path()).with_map_size(map_size)).unwrap();
    (dir, map)
}

/// Keys `key-0`, `key-1`, ...
pub fn keys(count: usize) -> Vec<Vec<u8>> {
    (0..count).map(|i| format!("key-{i}").into_bytes()).collect()
}

/// Random keys of 4..32 bytes from a fixed seed.
pub fn random_keys(seed: u64, count: usize) -> Vec<Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|i| {
            let len = rng.gen_range(4..32);
            let mut key = vec![0u8; len];
            rng.fill_bytes(&mut key);
            // Keep keys unique regardless of what the generator returns.
            key.extend_from_slice(&(i as u64).to_le_bytes());
            key
        })
        .collect()
}

/// Write `value_of(i)` for every key in one session.
pub fn write_all(map: &HalfDiskHashMap, keys: &[Vec<u8>], value_of: impl Fn(usize) -> i64) {
    map.start_writing().unwrap();
    for (i, key) in keys.iter().enumerate() {
        map.put(key, hash_key(key), value_of(i)).unwrap();
    }
    map.end_writing().unwrap();
}

/// Value of `key`, or -1.
pub fn lookup(map: &HalfDiskHashMap, key: &[u8]) -> i64 {
    map.get(key, hash_key(key), -1).unwrap()
}

/// Overwrite the bucket index file entry for `bucket_index`.
pub fn patch_index_entry(path: &Path, bucket_index: u32, raw_location: u64) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(
        INDEX_HEADER_SIZE + u64::from(bucket_index) * 8,
    ))?;
    file.write_all(&raw_location.to_le_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Write a metadata file with arbitrary header fields.
pub fn write_metadata(path: &Path, version: i32, num_of_buckets: i32) -> io::Result<()> {
    let mut bytes = Vec::with_capacity(12);
    bytes.extend_from_slice(&version.to_be_bytes());
    bytes.extend_from_slice(&0i32.to_be_bytes());
    bytes.extend_from_slice(&num_of_buckets.to_be_bytes());
    fs::write(path, bytes)
}

/// Names of the files in `dir`, sorted.
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
