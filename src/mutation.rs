//! Pending key mutations of one write session
//!
//! Each touched bucket index owns a singly linked list of mutations. A key
//! appears at most once per list: mutating it again updates its node in
//! place, so only the final value is applied when the session flushes.

use crate::bucket::{Bucket, INVALID_VALUE};
use crate::error::Result;

/// One pending mutation, linked to the next mutation of the same bucket.
#[derive(Debug, Clone)]
pub struct BucketMutation {
    key: Vec<u8>,
    hash_code: i32,
    /// Value the key must currently have, or `None` for an unconditional write
    expected: Option<i64>,
    /// Target value, or [`INVALID_VALUE`] to delete
    value: i64,
    next: Option<Box<BucketMutation>>,
}

impl BucketMutation {
    /// Create the head of a list
    pub fn new(key: &[u8], hash_code: i32, expected: Option<i64>, value: i64) -> Self {
        Self {
            key: key.to_vec(),
            hash_code,
            expected,
            value,
            next: None,
        }
    }

    /// Record an unconditional write (or delete, with [`INVALID_VALUE`]).
    ///
    /// An existing mutation for the key loses any condition it carried.
    pub fn put(&mut self, key: &[u8], hash_code: i32, value: i64) {
        match self.find_or_tail(key) {
            Ok(node) => {
                node.value = value;
                node.expected = None;
            }
            Err(tail) => {
                tail.next = Some(Box::new(BucketMutation::new(key, hash_code, None, value)));
            }
        }
    }

    /// Record a conditional write.
    ///
    /// If the key already has a pending mutation, the condition is checked
    /// against that pending value: on a match the pending value is replaced,
    /// otherwise this call is ignored.
    pub fn put_if_equal(&mut self, key: &[u8], hash_code: i32, expected: i64, value: i64) {
        match self.find_or_tail(key) {
            Ok(node) => {
                if node.value == expected {
                    node.value = value;
                }
            }
            Err(tail) => {
                tail.next = Some(Box::new(BucketMutation::new(
                    key,
                    hash_code,
                    Some(expected),
                    value,
                )));
            }
        }
    }

    /// The node for `key`, or the last node of the list.
    fn find_or_tail(&mut self, key: &[u8]) -> std::result::Result<&mut Self, &mut Self> {
        let mut node = self;
        while node.key != key {
            match node.next {
                Some(ref mut next) => node = &mut **next,
                None => return Err(node),
            }
        }
        Ok(node)
    }

    /// Number of mutations in this list
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// A list always holds at least its head
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Iterate over `(key, hash_code, expected, value)` tuples
    pub fn iter(&self) -> MutationIter<'_> {
        MutationIter { node: Some(self) }
    }

    /// Apply every mutation of the list to `bucket`.
    pub fn apply_to<B: Bucket>(&self, bucket: &mut B) -> Result<()> {
        for m in self.iter() {
            bucket.put_value(m.key, m.hash_code, m.expected, m.value)?;
        }
        Ok(())
    }

    /// Whether this node deletes its key
    pub fn is_delete(&self) -> bool {
        self.value == INVALID_VALUE
    }
}

impl Drop for BucketMutation {
    // Unlink iteratively so that very long lists cannot overflow the stack.
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(mut node) = next {
            next = node.next.take();
        }
    }
}

/// A borrowed view of one mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationRef<'a> {
    /// Key bytes
    pub key: &'a [u8],
    /// Key hash code
    pub hash_code: i32,
    /// Required current value, if conditional
    pub expected: Option<i64>,
    /// Target value or [`INVALID_VALUE`]
    pub value: i64,
}

/// Iterator over a mutation list.
pub struct MutationIter<'a> {
    node: Option<&'a BucketMutation>,
}

impl<'a> Iterator for MutationIter<'a> {
    type Item = MutationRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.node?;
        self.node = node.next.as_deref();
        Some(MutationRef {
            key: &node.key,
            hash_code: node.hash_code,
            expected: node.expected,
            value: node.value,
        })
    }
}
