//! Open, close and recovery tests
//!
//! Reopening with a saved or rebuilt index, snapshots, legacy store names and
//! the open-time format checks.

mod common;

use std::fs;

use halfdisk::files::data_file_name;
use halfdisk::map::{index_path, metadata_path, MapMetadata};
use halfdisk::{Error, HalfDiskHashMap, HalfDiskHashMapConfig};

use common::{config, lookup, random_keys, write_all, STORE};

fn reopen_keeps_values(prefer_disk_index: bool) {
    let dir = tempfile::tempdir().unwrap();
    let keys = random_keys(1, 1_000);
    {
        let map =
            HalfDiskHashMap::open(config(dir.path()).with_prefer_disk_index(prefer_disk_index))
                .unwrap();
        write_all(&map, &keys, |i| i as i64);
        map.start_writing().unwrap();
        for key in keys.iter().step_by(2) {
            map.delete(key, halfdisk::hash_key(key)).unwrap();
        }
        map.end_writing().unwrap();
        map.close().unwrap();
    }
    assert!(index_path(dir.path(), STORE).exists());

    let map =
        HalfDiskHashMap::open(config(dir.path()).with_prefer_disk_index(prefer_disk_index))
            .unwrap();
    // The saved index is consumed; close writes it again.
    assert!(!index_path(dir.path(), STORE).exists());
    for (i, key) in keys.iter().enumerate() {
        let expected = if i % 2 == 0 { -1 } else { i as i64 };
        assert_eq!(lookup(&map, key), expected);
    }
    map.close().unwrap();
}

#[test]
fn test_reopen_with_memory_index() {
    reopen_keeps_values(false);
}

#[test]
fn test_reopen_with_disk_index() {
    reopen_keeps_values(true);
}

#[test]
fn test_reopen_keeps_bucket_count() {
    let dir = tempfile::tempdir().unwrap();
    let map = HalfDiskHashMap::open(config(dir.path()).with_map_size(10_000)).unwrap();
    let buckets = map.num_of_buckets();
    assert_eq!(buckets, 512);
    map.close().unwrap();

    // A different map size does not resize an existing store.
    let map = HalfDiskHashMap::open(config(dir.path()).with_map_size(1_000_000)).unwrap();
    assert_eq!(map.num_of_buckets(), buckets);
    assert_eq!(
        MapMetadata::read(&metadata_path(dir.path(), STORE)).unwrap(),
        MapMetadata {
            num_of_buckets: buckets
        }
    );
}

#[test]
fn test_rebuild_when_index_missing() {
    let dir = tempfile::tempdir().unwrap();
    let keys = random_keys(2, 800);
    {
        let map = HalfDiskHashMap::open(config(dir.path())).unwrap();
        write_all(&map, &keys, |i| i as i64);
        write_all(&map, &keys[..400], |i| 10_000 + i as i64);
        map.close().unwrap();
    }
    fs::remove_file(index_path(dir.path(), STORE)).unwrap();

    let map = HalfDiskHashMap::open(config(dir.path())).unwrap();
    for (i, key) in keys.iter().enumerate() {
        let expected = if i < 400 { 10_000 + i as i64 } else { i as i64 };
        assert_eq!(lookup(&map, key), expected);
    }
}

#[test]
fn test_enforced_rebuild_ignores_saved_index() {
    let dir = tempfile::tempdir().unwrap();
    let keys = random_keys(3, 300);
    {
        let map = HalfDiskHashMap::open(config(dir.path())).unwrap();
        write_all(&map, &keys, |i| i as i64 + 1);
        map.close().unwrap();
    }
    // Garbage in the saved index must not matter.
    fs::write(index_path(dir.path(), STORE), b"not an index").unwrap();

    let map =
        HalfDiskHashMap::open(config(dir.path()).with_index_rebuilding_enforced(true)).unwrap();
    assert!(!index_path(dir.path(), STORE).exists());
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(lookup(&map, key), i as i64 + 1);
    }
}

#[test]
fn test_corrupt_saved_index_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    {
        let map = HalfDiskHashMap::open(config(dir.path())).unwrap();
        write_all(&map, &random_keys(4, 10), |i| i as i64);
        map.close().unwrap();
    }
    fs::write(
        index_path(dir.path(), STORE),
        b"this is not a bucket index file, only some plain text",
    )
    .unwrap();

    let err = HalfDiskHashMap::open(config(dir.path())).unwrap_err();
    assert!(err.is_corruption(), "{err}");
}

#[test]
fn test_snapshot_opens_as_store() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot_dir = tempfile::tempdir().unwrap();
    let keys = random_keys(5, 500);

    let map = HalfDiskHashMap::open(config(dir.path())).unwrap();
    write_all(&map, &keys, |i| i as i64);
    map.snapshot(snapshot_dir.path()).unwrap();

    // Later writes do not leak into the snapshot.
    write_all(&map, &keys, |_| -5);

    let copy = HalfDiskHashMap::open(config(snapshot_dir.path())).unwrap();
    assert_eq!(copy.num_of_buckets(), map.num_of_buckets());
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(lookup(&copy, key), i as i64);
        assert_eq!(lookup(&map, key), -5);
    }
}

#[test]
fn test_snapshot_rejects_store_dir() {
    let dir = tempfile::tempdir().unwrap();
    let map = HalfDiskHashMap::open(config(dir.path())).unwrap();
    let err = map.snapshot(dir.path()).unwrap_err();
    assert!(err.is_invalid_argument());
}

#[test]
fn test_legacy_store_name_migration() {
    let dir = tempfile::tempdir().unwrap();
    let keys = random_keys(6, 400);
    {
        let map = HalfDiskHashMap::open(HalfDiskHashMapConfig::new(dir.path(), "old_name")).unwrap();
        write_all(&map, &keys, |i| i as i64 * 3);
        map.close().unwrap();
    }

    let map = HalfDiskHashMap::open(
        HalfDiskHashMapConfig::new(dir.path(), "new_name").with_legacy_store_name("old_name"),
    )
    .unwrap();
    assert!(metadata_path(dir.path(), "new_name").exists());
    assert!(!metadata_path(dir.path(), "old_name").exists());
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(lookup(&map, key), i as i64 * 3);
    }

    // New files use the new name; old files stay readable.
    write_all(&map, &keys[..10], |_| 0);
    assert!(dir.path().join(data_file_name("new_name", 1)).exists());
    assert!(dir.path().join(data_file_name("old_name", 0)).exists());
    map.close().unwrap();

    let map = HalfDiskHashMap::open(
        HalfDiskHashMapConfig::new(dir.path(), "new_name").with_legacy_store_name("old_name"),
    )
    .unwrap();
    for (i, key) in keys.iter().enumerate() {
        let expected = if i < 10 { 0 } else { i as i64 * 3 };
        assert_eq!(lookup(&map, key), expected);
    }
}

#[test]
fn test_missing_metadata() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join(data_file_name(STORE, 0)), b"").unwrap();

    let err = HalfDiskHashMap::open(config(dir.path())).unwrap_err();
    assert!(matches!(err, Error::MissingMetadata(_)), "{err}");
}

#[test]
fn test_metadata_version_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    common::write_metadata(&metadata_path(dir.path(), STORE), 2, 64).unwrap();

    let err = HalfDiskHashMap::open(config(dir.path())).unwrap_err();
    assert!(
        matches!(
            err,
            Error::IncompatibleFormat {
                what: "metadata",
                found: 2,
                expected: 1
            }
        ),
        "{err}"
    );
}

#[test]
fn test_metadata_bad_bucket_count() {
    let dir = tempfile::tempdir().unwrap();
    common::write_metadata(&metadata_path(dir.path(), STORE), 1, 100).unwrap();

    let err = HalfDiskHashMap::open(config(dir.path())).unwrap_err();
    assert!(err.is_corruption(), "{err}");
}

#[test]
fn test_other_stores_in_dir_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let a = HalfDiskHashMap::open(HalfDiskHashMapConfig::new(dir.path(), "a")).unwrap();
    let b = HalfDiskHashMap::open(HalfDiskHashMapConfig::new(dir.path(), "b")).unwrap();
    write_all(&a, &[b"k".to_vec()], |_| 1);
    write_all(&b, &[b"k".to_vec()], |_| 2);
    assert_eq!(lookup(&a, b"k"), 1);
    assert_eq!(lookup(&b, b"k"), 2);
    a.close().unwrap();
    b.close().unwrap();

    let a = HalfDiskHashMap::open(HalfDiskHashMapConfig::new(dir.path(), "a")).unwrap();
    assert_eq!(lookup(&a, b"k"), 1);
}

#[test]
fn test_close_discards_open_session() {
    let dir = tempfile::tempdir().unwrap();
    {
        let map = HalfDiskHashMap::open(config(dir.path())).unwrap();
        write_all(&map, &[b"kept".to_vec()], |_| 1);
        map.start_writing().unwrap();
        map.put(b"lost", halfdisk::hash_key(b"lost"), 2).unwrap();
        map.close().unwrap();
    }
    let map = HalfDiskHashMap::open(config(dir.path())).unwrap();
    assert_eq!(lookup(&map, b"kept"), 1);
    assert_eq!(lookup(&map, b"lost"), -1);
}

#[test]
fn test_unclosed_map_rebuild_restores_emptied_bucket() {
    let dir = tempfile::tempdir().unwrap();
    {
        let map = HalfDiskHashMap::open(config(dir.path())).unwrap();
        write_all(&map, &[b"gone".to_vec(), b"kept".to_vec()], |i| i as i64 + 1);
        map.start_writing().unwrap();
        map.delete(b"gone", halfdisk::hash_key(b"gone")).unwrap();
        map.end_writing().unwrap();
        assert_eq!(lookup(&map, b"gone"), -1);
        // Dropped without close: no saved index.
    }
    assert!(!index_path(dir.path(), STORE).exists());

    let map = HalfDiskHashMap::open(config(dir.path())).unwrap();
    assert_eq!(lookup(&map, b"kept"), 2);
    if map.bucket_index_for(halfdisk::hash_key(b"gone"))
        != map.bucket_index_for(halfdisk::hash_key(b"kept"))
    {
        // Its bucket was emptied and never written again.
        assert_eq!(lookup(&map, b"gone"), 1);
    } else {
        assert_eq!(lookup(&map, b"gone"), -1);
    }
}
