use std::collections::HashSet;

use bytes::BufMut;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::wire::{self, Field, WireType};
use super::*;

const NOT_FOUND: i64 = -1;

fn entry_set<B: Bucket>(bucket: &B) -> HashSet<BucketEntry> {
    bucket.entries().unwrap().into_iter().collect()
}

fn round_trip<B: Bucket>(bucket: &B) -> B {
    let bytes = bucket.to_bytes();
    assert_eq!(bytes.len(), bucket.size_in_bytes());
    let mut decoded = B::default();
    decoded.read_from(&mut bytes.as_slice()).unwrap();
    decoded
}

fn check_round_trip<B: Bucket>() {
    let mut bucket = B::default();
    bucket.set_bucket_index(0xABCD);
    for i in 0..40i64 {
        let key = format!("key-{i}");
        bucket.put_value(key.as_bytes(), i as i32 * 7, None, i * 1000).unwrap();
    }

    let decoded = round_trip(&bucket);
    assert_eq!(decoded.bucket_index(), 0xABCD);
    assert_eq!(decoded.entry_count(), 40);
    assert_eq!(entry_set(&decoded), entry_set(&bucket));
}

fn check_empty_bucket<B: Bucket>() {
    let mut bucket = B::default();
    assert!(bucket.is_empty());
    assert_eq!(bucket.size_in_bytes(), wire::BUCKET_INDEX_FIELD_SIZE);
    bucket.set_bucket_index(9);
    let decoded = round_trip(&bucket);
    assert_eq!(decoded.bucket_index(), 9);
    assert!(decoded.is_empty());
}

fn check_put_and_find<B: Bucket>() {
    let mut bucket = B::default();
    bucket.put_value(b"a", 1, None, 10).unwrap();
    bucket.put_value(b"b", 2, None, 20).unwrap();

    assert_eq!(bucket.find_value(1, b"a", NOT_FOUND).unwrap(), 10);
    assert_eq!(bucket.find_value(2, b"b", NOT_FOUND).unwrap(), 20);
    assert_eq!(bucket.find_value(3, b"c", NOT_FOUND).unwrap(), NOT_FOUND);
    // Right key, wrong hash: rejected by the cached hash code.
    assert_eq!(bucket.find_value(2, b"a", NOT_FOUND).unwrap(), NOT_FOUND);
}

fn check_put_idempotence<B: Bucket>() {
    let mut once = B::default();
    once.put_value(b"k", 5, None, 99).unwrap();

    let mut twice = B::default();
    twice.put_value(b"k", 5, None, 99).unwrap();
    twice.put_value(b"k", 5, None, 99).unwrap();

    assert_eq!(twice.entry_count(), 1);
    assert_eq!(entry_set(&once), entry_set(&twice));
    assert_eq!(once.size_in_bytes(), twice.size_in_bytes());
}

fn check_overwrite<B: Bucket>() {
    let mut bucket = B::default();
    bucket.put_value(b"k", 5, None, 1).unwrap();
    let size = bucket.size_in_bytes();
    bucket.put_value(b"k", 5, None, 2).unwrap();
    assert_eq!(bucket.entry_count(), 1);
    assert_eq!(bucket.size_in_bytes(), size);
    assert_eq!(bucket.find_value(5, b"k", NOT_FOUND).unwrap(), 2);
}

fn check_cas<B: Bucket>() {
    let mut bucket = B::default();
    bucket.put_value(b"k", 5, None, 1).unwrap();

    // Mismatched expectation: no-op.
    bucket.put_value(b"k", 5, Some(2), 3).unwrap();
    assert_eq!(bucket.find_value(5, b"k", NOT_FOUND).unwrap(), 1);

    // Matching expectation: update.
    bucket.put_value(b"k", 5, Some(1), 3).unwrap();
    assert_eq!(bucket.find_value(5, b"k", NOT_FOUND).unwrap(), 3);

    // Absent key with any expectation: no-op.
    bucket.put_value(b"absent", 6, Some(0), 4).unwrap();
    bucket.put_value(b"absent", 6, Some(NOT_FOUND), 4).unwrap();
    assert_eq!(bucket.find_value(6, b"absent", NOT_FOUND).unwrap(), NOT_FOUND);
    assert_eq!(bucket.entry_count(), 1);
}

fn check_delete<B: Bucket>() {
    let mut bucket = B::default();
    bucket.set_bucket_index(3);
    for (i, key) in [b"first", b"mid-1", b"mid-2", b"last!"].iter().enumerate() {
        bucket.put_value(*key, i as i32, None, i as i64).unwrap();
    }
    let full_size = bucket.size_in_bytes();

    // Delete from the middle, then the ends.
    bucket.put_value(b"mid-1", 1, None, INVALID_VALUE).unwrap();
    assert_eq!(bucket.entry_count(), 3);
    assert_eq!(
        bucket.size_in_bytes(),
        full_size - wire::entry_field_size(5)
    );
    assert_eq!(bucket.find_value(2, b"mid-2", NOT_FOUND).unwrap(), 2);
    assert_eq!(bucket.find_value(3, b"last!", NOT_FOUND).unwrap(), 3);

    bucket.put_value(b"first", 0, None, INVALID_VALUE).unwrap();
    bucket.put_value(b"last!", 3, None, INVALID_VALUE).unwrap();
    assert_eq!(bucket.entry_count(), 1);
    assert_eq!(bucket.find_value(2, b"mid-2", NOT_FOUND).unwrap(), 2);

    // Deleting an absent key is a no-op.
    bucket.put_value(b"nothing", 9, None, INVALID_VALUE).unwrap();
    assert_eq!(bucket.entry_count(), 1);

    bucket.put_value(b"mid-2", 2, None, INVALID_VALUE).unwrap();
    assert!(bucket.is_empty());
    assert_eq!(bucket.bucket_index(), 3);
    assert_eq!(round_trip(&bucket).bucket_index(), 3);
}

fn check_conditional_delete<B: Bucket>() {
    let mut bucket = B::default();
    bucket.put_value(b"k", 5, None, 1).unwrap();

    bucket.put_value(b"k", 5, Some(7), INVALID_VALUE).unwrap();
    assert_eq!(bucket.entry_count(), 1);

    bucket.put_value(b"k", 5, Some(1), INVALID_VALUE).unwrap();
    assert!(bucket.is_empty());
}

fn check_hash_collisions<B: Bucket>() {
    let mut bucket = B::default();
    bucket.put_value(b"left", 42, None, 1).unwrap();
    bucket.put_value(b"right", 42, None, 2).unwrap();
    assert_eq!(bucket.entry_count(), 2);
    assert_eq!(bucket.find_value(42, b"left", NOT_FOUND).unwrap(), 1);
    assert_eq!(bucket.find_value(42, b"right", NOT_FOUND).unwrap(), 2);

    bucket.put_value(b"left", 42, None, INVALID_VALUE).unwrap();
    assert_eq!(bucket.find_value(42, b"left", NOT_FOUND).unwrap(), NOT_FOUND);
    assert_eq!(bucket.find_value(42, b"right", NOT_FOUND).unwrap(), 2);
}

fn check_clear<B: Bucket>() {
    let mut bucket = B::default();
    bucket.set_bucket_index(77);
    bucket.put_value(b"k", 1, None, 1).unwrap();
    bucket.clear();
    assert_eq!(bucket.bucket_index(), 0);
    assert!(bucket.is_empty());
    assert_eq!(bucket.size_in_bytes(), wire::BUCKET_INDEX_FIELD_SIZE);
}

fn check_unknown_field_is_fatal<B: Bucket>() {
    let mut bytes = Vec::new();
    wire::write_bucket_index(&mut bytes, 1);
    wire::write_tag(&mut bytes, Field::new(4, WireType::Fixed32));
    bytes.put_u32_le(0);

    let mut bucket = B::default();
    let err = bucket.read_from(&mut bytes.as_slice()).unwrap_err();
    assert!(err.is_corruption());
    assert!(err.to_string().contains("unknown bucket field 4"));
}

fn check_truncated_is_fatal<B: Bucket>() {
    let mut source = B::default();
    source.put_value(b"some key", 1, None, 1).unwrap();
    let bytes = source.to_bytes();

    let mut bucket = B::default();
    let truncated = &bytes[..bytes.len() - 3];
    assert!(bucket.read_from(&mut &truncated[..]).unwrap_err().is_corruption());
}

fn check_random_against_model<B: Bucket>(seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut bucket = B::default();
    let mut model = std::collections::HashMap::new();

    for _ in 0..2000 {
        let k = rng.gen_range(0..24u32);
        let key = format!("k{k}").into_bytes();
        let hash = (k % 5) as i32;
        let op = rng.gen_range(0u8..=99);
        match op {
            0..=49 => {
                let v = rng.gen_range(0..100i64);
                bucket.put_value(&key, hash, None, v).unwrap();
                model.insert(key.clone(), v);
            }
            50..=69 => {
                bucket.put_value(&key, hash, None, INVALID_VALUE).unwrap();
                model.remove(&key);
            }
            70..=89 => {
                let expected = rng.gen_range(0..100i64);
                let v = rng.gen_range(0..100i64);
                bucket.put_value(&key, hash, Some(expected), v).unwrap();
                if model.get(&key) == Some(&expected) {
                    model.insert(key.clone(), v);
                }
            }
            _ => {
                let expected = rng.gen_range(0..100i64);
                bucket.put_value(&key, hash, Some(expected), INVALID_VALUE).unwrap();
                if model.get(&key) == Some(&expected) {
                    model.remove(&key);
                }
            }
        }

        let expected = model.get(&key).copied().unwrap_or(NOT_FOUND);
        assert_eq!(bucket.find_value(hash, &key, NOT_FOUND).unwrap(), expected);
    }

    assert_eq!(bucket.entry_count(), model.len());
    let decoded = round_trip(&bucket);
    assert_eq!(decoded.entry_count(), model.len());
    for (key, value) in &model {
        let k: u32 = std::str::from_utf8(&key[1..]).unwrap().parse().unwrap();
        assert_eq!(
            decoded.find_value((k % 5) as i32, key, NOT_FOUND).unwrap(),
            *value
        );
    }
}

macro_rules! bucket_contract_tests {
    ($module:ident, $bucket:ty) => {
        mod $module {
            use super::*;

            #[test]
            fn test_round_trip() {
                check_round_trip::<$bucket>();
            }

            #[test]
            fn test_empty_bucket() {
                check_empty_bucket::<$bucket>();
            }

            #[test]
            fn test_put_and_find() {
                check_put_and_find::<$bucket>();
            }

            #[test]
            fn test_put_idempotence() {
                check_put_idempotence::<$bucket>();
            }

            #[test]
            fn test_overwrite() {
                check_overwrite::<$bucket>();
            }

            #[test]
            fn test_cas() {
                check_cas::<$bucket>();
            }

            #[test]
            fn test_delete() {
                check_delete::<$bucket>();
            }

            #[test]
            fn test_conditional_delete() {
                check_conditional_delete::<$bucket>();
            }

            #[test]
            fn test_hash_collisions() {
                check_hash_collisions::<$bucket>();
            }

            #[test]
            fn test_clear() {
                check_clear::<$bucket>();
            }

            #[test]
            fn test_unknown_field_is_fatal() {
                check_unknown_field_is_fatal::<$bucket>();
            }

            #[test]
            fn test_truncated_is_fatal() {
                check_truncated_is_fatal::<$bucket>();
            }

            #[test]
            fn test_random_against_model() {
                for seed in [1, 7, 42] {
                    check_random_against_model::<$bucket>(seed);
                }
            }
        }
    };
}

bucket_contract_tests!(raw, RawBucket);
bucket_contract_tests!(parsed, ParsedBucket);

#[test]
fn test_variants_decode_each_other() {
    let mut parsed = ParsedBucket::new(12);
    let mut raw = RawBucket::new();
    raw.set_bucket_index(12);
    for i in 0..10i64 {
        let key = vec![i as u8; (i as usize) * 13];
        parsed.put_value(&key, i as i32, None, -i).unwrap();
        raw.put_value(&key, i as i32, None, -i).unwrap();
    }

    let from_parsed = RawBucket::from_bytes(&parsed.to_bytes()).unwrap();
    let from_raw = ParsedBucket::from_bytes(&raw.to_bytes()).unwrap();
    assert_eq!(from_parsed.bucket_index(), 12);
    assert_eq!(from_raw.bucket_index(), 12);
    assert_eq!(entry_set(&from_parsed), entry_set(&parsed));
    assert_eq!(entry_set(&from_raw), entry_set(&raw));
}

#[test]
fn test_raw_normalizes_index_field_position() {
    // Index field after the entries, as a foreign writer might emit it.
    let mut bytes = Vec::new();
    wire::write_entry(&mut bytes, 1, 100, b"a");
    wire::write_entry(&mut bytes, 2, 200, b"b");
    wire::write_bucket_index(&mut bytes, 5);

    let mut bucket = RawBucket::from_bytes(&bytes).unwrap();
    assert_eq!(bucket.bucket_index(), 5);
    assert_eq!(bucket.entry_count(), 2);
    assert_eq!(bucket.as_bytes()[0], wire::FIELD_BUCKET_INDEX.tag() as u8);

    bucket.set_bucket_index(6);
    bucket.put_value(b"a", 1, None, INVALID_VALUE).unwrap();
    let decoded = ParsedBucket::from_bytes(bucket.as_bytes()).unwrap();
    assert_eq!(decoded.bucket_index(), 6);
    assert_eq!(decoded.entry_list(), &[BucketEntry::new(2, 200, b"b".to_vec())]);
}

#[test]
fn test_raw_missing_index_field_defaults_to_zero() {
    let mut bytes = Vec::new();
    wire::write_entry(&mut bytes, 1, 100, b"a");
    let bucket = RawBucket::from_bytes(&bytes).unwrap();
    assert_eq!(bucket.bucket_index(), 0);
    assert_eq!(bucket.find_value(1, b"a", NOT_FOUND).unwrap(), 100);
}

#[test]
fn test_raw_skips_entry_without_key_on_lookup() {
    // Entry with a matching hash code but no key field.
    let mut body = Vec::new();
    wire::write_tag(&mut body, wire::FIELD_ENTRY_HASH_CODE);
    body.put_i32_le(8);
    wire::write_tag(&mut body, wire::FIELD_ENTRY_VALUE);
    body.put_i64_le(1);

    let mut bytes = Vec::new();
    wire::write_bucket_index(&mut bytes, 0);
    wire::write_tag(&mut bytes, wire::FIELD_BUCKET_ENTRIES);
    wire::write_varint(&mut bytes, body.len() as u64);
    bytes.extend_from_slice(&body);
    wire::write_entry(&mut bytes, 8, 2, b"key");

    let bucket = RawBucket::from_bytes(&bytes).unwrap();
    assert_eq!(bucket.find_value(8, b"key", NOT_FOUND).unwrap(), 2);
    assert_eq!(bucket.find_value(8, b"", NOT_FOUND).unwrap(), NOT_FOUND);

    // The fully decoding variant refuses such a bucket.
    assert!(ParsedBucket::from_bytes(&bytes).unwrap_err().is_corruption());
}

#[test]
fn test_raw_buffer_growth_preserves_content() {
    let mut bucket = RawBucket::new();
    bucket.set_bucket_index(1234);
    let initial_capacity = bucket.capacity();
    let big_key = vec![0xEE; initial_capacity * 3];
    bucket.put_value(b"small", 1, None, 1).unwrap();
    bucket.put_value(&big_key, 2, None, 2).unwrap();

    assert!(bucket.capacity() >= bucket.size_in_bytes());
    assert_eq!(bucket.bucket_index(), 1234);
    assert_eq!(bucket.find_value(1, b"small", NOT_FOUND).unwrap(), 1);
    assert_eq!(bucket.find_value(2, &big_key, NOT_FOUND).unwrap(), 2);
    assert_eq!(RawBucket::from_bytes(bucket.as_bytes()).unwrap().bucket_index(), 1234);
}

#[test]
fn test_parsed_preserves_update_order() {
    let mut bucket = ParsedBucket::new(0);
    bucket.put_value(b"x", 1, None, 1).unwrap();
    bucket.put_value(b"y", 2, None, 2).unwrap();
    bucket.put_value(b"x", 1, None, 3).unwrap();
    let keys: Vec<_> = bucket.entry_list().iter().map(|e| e.key.clone()).collect();
    assert_eq!(keys, vec![b"x".to_vec(), b"y".to_vec()]);
}

#[test]
fn test_failed_decode_leaves_raw_bucket_empty() {
    let mut bucket = RawBucket::new();
    bucket.put_value(b"k", 1, None, 1).unwrap();
    let garbage = [0xFFu8, 0xFF, 0xFF];
    assert!(bucket.read_from(&mut &garbage[..]).is_err());
    assert!(bucket.is_empty());
    assert_eq!(bucket.size_in_bytes(), wire::BUCKET_INDEX_FIELD_SIZE);
}
