//! Attribute hashing for change detection.
//!
//! This module provides deterministic hashing of attribute sets so that
//! unchanged resources can be recognised without a deep comparison, and a
//! fingerprint of whole plans for display.

use sha2::{Digest, Sha256};

use crate::graph::{AttributeValue, Attributes};

/// Hasher for computing attribute fingerprints.
#[derive(Debug, Default, Clone, Copy)]
pub struct AttributeHasher;

impl AttributeHasher {
    /// Creates a new attribute hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the SHA-256 fingerprint of an attribute set.
    ///
    /// Keys are visited in order, and every value is prefixed with a type tag
    /// so that `"1"` and `1` hash differently.
    #[must_use]
    pub fn hash_attributes(attributes: &Attributes) -> String {
        let mut hasher = Sha256::new();
        feed_map(&mut hasher, attributes);
        hex::encode(hasher.finalize())
    }

    /// Computes a fingerprint over an ordered sequence of parts.
    #[must_use]
    pub fn fingerprint<I, P>(parts: I) -> String
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        let mut hasher = Sha256::new();
        for part in parts {
            let bytes = part.as_ref();
            hasher.update((bytes.len() as u64).to_be_bytes());
            hasher.update(bytes);
        }
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        // Constant-time comparison
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

fn feed_str(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value.as_bytes());
}

fn feed_map(hasher: &mut Sha256, entries: &Attributes) {
    hasher.update((entries.len() as u64).to_be_bytes());
    for (key, value) in entries {
        feed_str(hasher, key);
        feed_value(hasher, value);
    }
}

fn feed_value(hasher: &mut Sha256, value: &AttributeValue) {
    match value {
        AttributeValue::Null => hasher.update([0u8]),
        AttributeValue::Bool(b) => hasher.update([1u8, u8::from(*b)]),
        AttributeValue::Integer(i) => {
            hasher.update([2u8]);
            hasher.update(i.to_be_bytes());
        }
        AttributeValue::Float(f) => {
            hasher.update([3u8]);
            hasher.update(f.to_bits().to_be_bytes());
        }
        AttributeValue::String(s) => {
            hasher.update([4u8]);
            feed_str(hasher, s);
        }
        AttributeValue::List(items) => {
            hasher.update([5u8]);
            hasher.update((items.len() as u64).to_be_bytes());
            for item in items {
                feed_value(hasher, item);
            }
        }
        AttributeValue::Map(entries) => {
            hasher.update([6u8]);
            feed_map(hasher, entries);
        }
        AttributeValue::Reference(reference) => {
            hasher.update([7u8]);
            feed_str(hasher, &reference.to_string());
        }
        AttributeValue::Computed => hasher.update([8u8]),
    }
}
