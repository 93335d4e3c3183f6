//! # In-Memory Dictionary
//!
//! Provide the in-memory backend with sharded locking so concurrent
//! sessions touching different keys rarely contend.
//!
//! ## Usage
//!
//! - Use `MemoryDictionary::new()` for a shard count derived from CPU
//!   parallelism.
//! - Use `MemoryDictionary::with_shard_count` to pin the shard count (tests,
//!   small deployments).
//!
//! ## Design Principles
//!
//! 1. **Sharded Locks**: Per-shard `RwLock`s let readers proceed in parallel.
//! 2. **Bytes-backed Buffers**: Values are `Bytes` so reads hand out cheap
//!    clones instead of copies.
//! 3. **Strategy Pattern**: Implements `Dictionary` to keep callers decoupled.
//!
//! ## Structure Overview
//!
//! ```text
//! MemoryDictionary
//!   ├── shards: Vec<Shard>
//!   │     └── Shard
//!   │           └── map: RwLock<HashMap<Bytes, Bytes>>
//!   └── entries: AtomicUsize (global count)
//! ```

use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use ahash::RandomState;
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::engine::Dictionary;

/// Default shards = CPU count * multiplier to reduce lock contention.
const DEFAULT_SHARD_MULTIPLIER: usize = 4;

#[derive(Debug)]
struct Shard {
    map: RwLock<HashMap<Bytes, Bytes, RandomState>>,
}

/// Sharded in-memory implementation of [`Dictionary`].
#[derive(Debug)]
pub struct MemoryDictionary {
    shards: Vec<Shard>,
    /// Bitmask for fast shard selection (power-of-two shard count).
    shard_mask: usize,
    /// Hash state used to pick shards deterministically.
    hash_state: RandomState,
    entries: AtomicUsize,
}

impl MemoryDictionary {
    /// Creates a dictionary with a default shard count based on CPU parallelism.
    pub fn new() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        Self::with_shard_count(threads.saturating_mul(DEFAULT_SHARD_MULTIPLIER))
    }

    /// Creates a dictionary with a caller-provided shard count.
    ///
    /// The count is normalized to the next power of two to enable fast masking.
    pub fn with_shard_count(shards: usize) -> Self {
        let shard_count = normalize_shard_count(shards);
        let hash_state = RandomState::new();
        let shards = (0..shard_count)
            .map(|_| Shard {
                map: RwLock::new(HashMap::with_hasher(hash_state.clone())),
            })
            .collect();

        MemoryDictionary {
            shards,
            shard_mask: shard_count - 1,
            hash_state,
            entries: AtomicUsize::new(0),
        }
    }

    /// Number of shards after normalization.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Hashes a key to its owning shard index.
    fn shard_index(&self, key: &[u8]) -> usize {
        let mut hasher = self.hash_state.build_hasher();
        hasher.write(key);
        (hasher.finish() as usize) & self.shard_mask
    }

    fn shard_for(&self, key: &[u8]) -> &Shard {
        &self.shards[self.shard_index(key)]
    }
}

impl Default for MemoryDictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl Dictionary for MemoryDictionary {
    fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.shard_for(key).map.read().get(key).cloned()
    }

    fn set(&self, key: Bytes, value: Bytes) -> Option<Bytes> {
        let previous = self.shard_for(&key).map.write().insert(key, value);
        if previous.is_none() {
            self.entries.fetch_add(1, Ordering::Relaxed);
        }
        previous
    }

    fn delete(&self, key: &[u8]) -> bool {
        let removed = self.shard_for(key).map.write().remove(key).is_some();
        if removed {
            self.entries.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    fn len(&self) -> usize {
        self.entries.load(Ordering::Relaxed)
    }
}

/// Normalizes shard counts to a power of two for fast masking.
fn normalize_shard_count(count: usize) -> usize {
    count.max(1).next_power_of_two()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn set_get_roundtrip() {
        let dict = MemoryDictionary::with_shard_count(4);
        assert!(dict.set(Bytes::from_static(b"alpha"), Bytes::from_static(b"value")).is_none());
        assert_eq!(dict.get(b"alpha"), Some(Bytes::from_static(b"value")));
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn set_returns_previous_and_keeps_count() {
        let dict = MemoryDictionary::with_shard_count(2);
        dict.set(Bytes::from_static(b"alpha"), Bytes::from_static(b"one"));
        let previous = dict.set(Bytes::from_static(b"alpha"), Bytes::from_static(b"two"));
        assert_eq!(previous, Some(Bytes::from_static(b"one")));
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn delete_removes_key() {
        let dict = MemoryDictionary::with_shard_count(2);
        dict.set(Bytes::from_static(b"alpha"), Bytes::from_static(b"value"));
        assert!(dict.delete(b"alpha"));
        assert!(!dict.delete(b"alpha"));
        assert!(dict.get(b"alpha").is_none());
        assert!(dict.is_empty());
    }

    #[test]
    fn missing_key_is_none() {
        let dict = MemoryDictionary::with_shard_count(1);
        assert!(dict.get(b"missing").is_none());
    }

    #[test]
    fn shard_count_is_power_of_two() {
        assert_eq!(MemoryDictionary::with_shard_count(0).shard_count(), 1);
        assert_eq!(MemoryDictionary::with_shard_count(3).shard_count(), 4);
        assert_eq!(MemoryDictionary::with_shard_count(8).shard_count(), 8);
    }

    #[test]
    fn concurrent_writers_on_distinct_keys() {
        let dict = Arc::new(MemoryDictionary::with_shard_count(8));
        let handles: Vec<_> = (0..4)
            .map(|thread| {
                let dict = Arc::clone(&dict);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        let key = Bytes::from(format!("t{thread}-k{i}"));
                        dict.set(key, Bytes::from_static(b"v"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(dict.len(), 1000);
    }
}
