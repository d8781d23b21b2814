use std::time::{Duration, Instant};

use serde_json::Value;

use crate::error::StoreError;
use crate::key::validate;

use super::Store;

/// TTLs longer than this never expire.
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// An item saved in the in-memory moka cache.
#[derive(Clone, Debug)]
struct MemoryItem {
    /// When to evict this item, `None` keeps it forever.
    deadline: Option<Instant>,
    /// The actual data.
    value: Value,
}

/// A struct implementing [`moka::Expiry`] that uses the [`MemoryItem`] [`Instant`] as the explicit
/// expiration time.
struct ItemExpiration;

impl moka::Expiry<String, MemoryItem> for ItemExpiration {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &MemoryItem,
        current_time: Instant,
    ) -> Option<Duration> {
        value
            .deadline
            .map(|deadline| deadline.saturating_duration_since(current_time))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &MemoryItem,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        value
            .deadline
            .map(|deadline| deadline.saturating_duration_since(current_time))
    }
}

/// A process-local [`Store`] backed by [`moka`].
///
/// Entries are dropped once their TTL has passed. There is no capacity bound.
#[derive(Clone)]
pub struct MemoryStore {
    items: moka::sync::Cache<String, MemoryItem>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("items", &self.items.entry_count())
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let items = moka::sync::Cache::builder()
            .name("memory")
            .expire_after(ItemExpiration)
            .build();
        Self { items }
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        validate(key)?;
        Ok(self.items.get(key).map(|item| item.value))
    }

    fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        validate(key)?;
        if ttl == Some(Duration::ZERO) {
            self.items.invalidate(key);
            return Ok(());
        }
        let deadline = ttl
            .filter(|ttl| *ttl <= MAX_TTL)
            .and_then(|ttl| Instant::now().checked_add(ttl));
        self.items
            .insert(key.to_owned(), MemoryItem { deadline, value });
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        validate(key)?;
        Ok(self.items.remove(key).is_some())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.items.invalidate_all();
        Ok(())
    }

    fn has(&self, key: &str) -> Result<bool, StoreError> {
        validate(key)?;
        Ok(self.items.contains_key(key))
    }
}
