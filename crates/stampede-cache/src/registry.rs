use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::dependency::DependencyContext;
use crate::error::Error;
use crate::item::CacheItem;

/// The [`CacheItem`]s this process has written or read, by normalized key.
///
/// The registry can only ever short-circuit a lookup into a miss: if it tracks an item that is
/// expired, the store does not need to be consulted. A registry hit says nothing about the
/// store, which may have lost the entry in the meantime.
#[derive(Debug, Default)]
pub struct ItemRegistry {
    items: Mutex<HashMap<String, CacheItem>>,
}

impl ItemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks `item`, replacing any previous item for its key.
    pub fn set(&self, item: CacheItem) {
        self.lock().insert(item.key.clone(), item);
    }

    /// Stops tracking `key`.
    pub fn remove(&self, key: &str) -> Option<CacheItem> {
        self.lock().remove(key)
    }

    pub fn get(&self, key: &str) -> Option<CacheItem> {
        self.lock().get(key).cloned()
    }

    /// Returns `true` if a tracked item for `key` is expired.
    ///
    /// Untracked keys are not expired, as far as the registry knows.
    pub fn expired(&self, key: &str, beta: f64, ctx: &DependencyContext<'_>) -> Result<bool, Error> {
        // Dependencies may call back into the store, so they are not evaluated under the lock.
        match self.get(key) {
            Some(item) => item.expired(beta, ctx),
            None => Ok(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
