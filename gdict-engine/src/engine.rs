//! # Dictionary Trait
//!
//! Strategy seam between the server and its storage backend.

use bytes::Bytes;

/// Key/value storage used by the server session loop.
///
/// Keys and values are opaque bytes. Implementations must be safe to share
/// across session tasks.
pub trait Dictionary: Send + Sync + 'static {
    /// Returns the value stored under `key`, if any.
    fn get(&self, key: &[u8]) -> Option<Bytes>;

    /// Stores `value` under `key`, returning the previous value.
    fn set(&self, key: Bytes, value: Bytes) -> Option<Bytes>;

    /// Removes `key`. Returns true when a value was removed.
    fn delete(&self, key: &[u8]) -> bool;

    /// Number of stored entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
