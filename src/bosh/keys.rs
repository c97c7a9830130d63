//! Key sequencing (XEP-0124 §15).
//!
//! `K(0)` is a random seed, `K(i) = hex(sha1(K(i-1)))`. Keys are spent in
//! reverse generation order, so a key seen on the wire only reveals keys that
//! were already used.

use rand::Rng;
use sha1::{Digest, Sha1};
use uuid::Uuid;

/// Lower bound (inclusive) of a generated sequence length.
pub const MIN_SEQUENCE_LEN: usize = 256;

/// Upper bound (exclusive) of a generated sequence length.
pub const MAX_SEQUENCE_LEN: usize = 32768;

/// Key fields to attach to one outgoing body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFields {
    pub key: Option<String>,
    pub newkey: Option<String>,
}

/// Remaining keys of the current sequence; the next key to spend is last.
#[derive(Debug, Clone)]
pub struct KeySequence {
    keys: Vec<String>,
}

/// Lowercase hex SHA-1 of `input`.
pub fn hash_key(input: &str) -> String {
    format!("{:x}", Sha1::digest(input.as_bytes()))
}

impl KeySequence {
    /// Generate a sequence of random length in `[256, 32768)`.
    pub fn generate() -> Self {
        let len = rand::rng().random_range(MIN_SEQUENCE_LEN..MAX_SEQUENCE_LEN);
        Self::with_seed(&Uuid::new_v4().to_string(), len)
    }

    /// Generate `K(1)..=K(len)` from a fixed seed.
    pub fn with_seed(seed: &str, len: usize) -> Self {
        let mut keys = Vec::with_capacity(len);
        let mut previous = seed.to_string();
        for _ in 0..len {
            let key = hash_key(&previous);
            keys.push(key.clone());
            previous = key;
        }
        Self { keys }
    }

    pub fn remaining(&self) -> usize {
        self.keys.len()
    }

    /// Start a session: the first request only announces the tail of a
    /// fresh sequence as `newkey`.
    pub fn initial(&mut self) -> KeyFields {
        if self.keys.is_empty() {
            *self = Self::generate();
        }
        KeyFields {
            key: None,
            newkey: self.keys.pop(),
        }
    }

    /// Spend the next key. When that was the last key of the sequence a new
    /// sequence is generated and chained through `newkey` in the same body.
    pub fn advance(&mut self) -> KeyFields {
        self.advance_with(Self::generate)
    }

    fn advance_with(&mut self, regenerate: impl FnOnce() -> Self) -> KeyFields {
        let key = self.keys.pop();
        let newkey = if self.keys.is_empty() {
            *self = regenerate();
            self.keys.pop()
        } else {
            None
        };
        KeyFields { key, newkey }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_length_in_range() {
        let seq = KeySequence::generate();
        assert!(seq.remaining() >= MIN_SEQUENCE_LEN);
        assert!(seq.remaining() < MAX_SEQUENCE_LEN);
    }

    #[test]
    fn test_hash_key_is_hex_sha1() {
        // sha1("abc")
        assert_eq!(hash_key("abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_each_key_hashes_to_the_previous_one() {
        let mut seq = KeySequence::with_seed("seed", 16);
        let first = seq.initial().newkey.unwrap();
        let mut previous = first;
        for _ in 0..14 {
            let fields = seq.advance();
            let key = fields.key.unwrap();
            assert_eq!(fields.newkey, None);
            assert_eq!(hash_key(&key), previous);
            previous = key;
        }
    }

    #[test]
    fn test_exhaustion_chains_new_sequence_in_same_body() {
        let mut seq = KeySequence::with_seed("seed", 3);
        let announced = seq.initial().newkey.unwrap();

        let second = seq.advance();
        assert_eq!(hash_key(second.key.as_ref().unwrap()), announced);
        assert_eq!(second.newkey, None);

        let replacement = KeySequence::with_seed("other", 4);
        let replacement_tail = replacement.keys.last().cloned().unwrap();
        let last = seq.advance_with(|| replacement);

        // The last old key is spent and the new tail is announced together
        assert_eq!(hash_key(last.key.as_ref().unwrap()), second.key.unwrap());
        assert_eq!(last.newkey.as_deref(), Some(replacement_tail.as_str()));
        assert_eq!(seq.remaining(), 3);

        // The next request uses the new sequence
        let next = seq.advance();
        assert_eq!(hash_key(next.key.as_ref().unwrap()), replacement_tail);
    }

    #[test]
    fn test_initial_on_empty_sequence_generates() {
        let mut seq = KeySequence::with_seed("seed", 0);
        let fields = seq.initial();
        assert!(fields.key.is_none());
        assert!(fields.newkey.is_some());
        assert!(seq.remaining() >= MIN_SEQUENCE_LEN - 1);
    }
}
