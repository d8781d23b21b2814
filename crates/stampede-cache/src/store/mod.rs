//! Raw key/value stores.
//!
//! A [`Store`] only knows about values and time-to-live. It has no notion of dependencies or
//! early expiration, those are layered on top by the
//! [`DependencyAwareStore`](crate::DependencyAwareStore) and the [`Cache`](crate::Cache).
//!
//! Keys handed to a store must already be valid storage keys, see [`validate`](crate::key::validate).

use std::time::Duration;

use serde_json::Value;

use crate::error::StoreError;

pub mod file;
mod memory;

pub use file::{BinaryFileStore, FileLayout, GcStats, SourceFileStore};
pub use memory::MemoryStore;

/// The minimal key/value contract the cache is built on.
///
/// Single key operations are atomic from the caller's perspective. There are no other
/// ordering or atomicity guarantees, in particular not for the multi-key variants.
pub trait Store: Send + Sync {
    /// Returns the value stored under `key`, or `None` if it is missing or expired.
    ///
    /// Use [`Option::unwrap_or`] to fall back to a default value.
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Stores `value` under `key`.
    ///
    /// A `ttl` of `None` never expires. A zero `ttl` deletes the key instead.
    fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Deletes `key`, returning whether it existed.
    ///
    /// Deleting a key that does not exist is not an error.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Removes every entry of this store.
    fn clear(&self) -> Result<(), StoreError>;

    /// Returns `true` if a fresh value is stored under `key`.
    fn has(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    /// Returns the values for all `keys`, in the same order.
    fn get_multiple(&self, keys: &[&str]) -> Result<Vec<Option<Value>>, StoreError> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    /// Stores all `entries` with the same `ttl`.
    fn set_multiple(
        &self,
        entries: Vec<(String, Value)>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        for (key, value) in entries {
            self.set(&key, value, ttl)?;
        }
        Ok(())
    }

    /// Deletes all `keys`, returning how many of them existed.
    fn delete_multiple(&self, keys: &[&str]) -> Result<usize, StoreError> {
        let mut deleted = 0;
        for key in keys {
            deleted += usize::from(self.delete(key)?);
        }
        Ok(deleted)
    }
}

impl<S: Store + ?Sized> Store for std::sync::Arc<S> {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        (**self).set(key, value, ttl)
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        (**self).delete(key)
    }

    fn clear(&self) -> Result<(), StoreError> {
        (**self).clear()
    }

    fn has(&self, key: &str) -> Result<bool, StoreError> {
        (**self).has(key)
    }

    fn get_multiple(&self, keys: &[&str]) -> Result<Vec<Option<Value>>, StoreError> {
        (**self).get_multiple(keys)
    }

    fn set_multiple(
        &self,
        entries: Vec<(String, Value)>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        (**self).set_multiple(entries, ttl)
    }

    fn delete_multiple(&self, keys: &[&str]) -> Result<usize, StoreError> {
        (**self).delete_multiple(keys)
    }
}
