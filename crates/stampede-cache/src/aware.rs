use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dependency::{DependencyContext, Sources};
use crate::error::StoreError;
use crate::item::CacheItem;
use crate::store::Store;

/// A cached value together with its metadata, as handed to the raw store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Entry {
    pub value: Value,
    pub item: CacheItem,
}

impl Entry {
    /// The payload written to the raw store.
    pub fn pack(&self) -> Result<Value, StoreError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Splits a raw payload into value and item.
    ///
    /// Payloads that were not written by [`pack`](Self::pack) are handed back unchanged.
    pub fn unpack(payload: Value) -> Result<Self, Value> {
        let Value::Object(mut map) = payload else {
            return Err(payload);
        };
        if map.len() != 2 || !map.contains_key("value") {
            return Err(Value::Object(map));
        }
        let item = match map.get("item").map(CacheItem::deserialize) {
            Some(Ok(item)) => item,
            _ => return Err(Value::Object(map)),
        };
        let value = map.remove("value").unwrap_or(Value::Null);
        Ok(Self { value, item })
    }
}

/// Why an entry read from the store was discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Discarded {
    /// The item was written under a different key.
    Key,
    /// The dependency of the item changed.
    Dependency,
}

impl Discarded {
    fn as_str(self) -> &'static str {
        match self {
            Self::Key => "key",
            Self::Dependency => "dependency",
        }
    }
}

/// A [`Store`] decorator that enforces the dependencies of [`Entry`]s.
///
/// Reads unpack the stored entry and turn it into a miss if it belongs to a different key or
/// if its dependency changed. TTL is not checked here, that is up to the raw store and the
/// [`CacheItem`]. Payloads that are not entries pass through, so the store can be shared with
/// other users of the raw store. All other operations are forwarded as they are.
///
/// Dependencies are evaluated against this store, so they see unpacked values too.
#[derive(Clone)]
pub struct DependencyAwareStore {
    inner: Arc<dyn Store>,
    sources: Sources,
}

impl fmt::Debug for DependencyAwareStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyAwareStore")
            .field("sources", &self.sources)
            .finish_non_exhaustive()
    }
}

impl DependencyAwareStore {
    pub fn new(inner: Arc<dyn Store>, sources: Sources) -> Self {
        Self { inner, sources }
    }

    /// The raw store wrapped by this one.
    pub fn inner(&self) -> &Arc<dyn Store> {
        &self.inner
    }

    pub fn sources(&self) -> &Sources {
        &self.sources
    }

    pub fn context(&self) -> DependencyContext<'_> {
        DependencyContext::new(self, &self.sources)
    }

    /// Reads the entry stored under `key`, with its metadata.
    ///
    /// Anything but a valid entry for `key` with an unchanged dependency is a miss.
    pub fn get_entry(&self, key: &str) -> Result<Option<Entry>, StoreError> {
        let Some(payload) = self.inner.get(key)? else {
            metric!(counter("cache.miss") += 1, "reason" => "storage");
            return Ok(None);
        };
        let Ok(entry) = Entry::unpack(payload) else {
            tracing::debug!(key, "Discarding payload that is not a cache entry");
            metric!(counter("cache.miss") += 1, "reason" => "foreign");
            return Ok(None);
        };
        match self.check(key, entry)? {
            Ok(entry) => Ok(Some(entry)),
            Err(discarded) => {
                metric!(counter("cache.miss") += 1, "reason" => discarded.as_str());
                Ok(None)
            }
        }
    }

    /// Writes `entry` under `key`.
    pub fn set_entry(
        &self,
        key: &str,
        entry: &Entry,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.inner.set(key, entry.pack()?, ttl)
    }

    fn check(&self, key: &str, entry: Entry) -> Result<Result<Entry, Discarded>, StoreError> {
        if entry.item.key != key {
            tracing::warn!(key, found = %entry.item.key, "Discarding entry written under another key");
            return Ok(Err(Discarded::Key));
        }
        if let Some(ref dependency) = entry.item.dependency {
            if dependency.is_changed(&self.context())? {
                tracing::debug!(key, "Discarding entry with changed dependency");
                return Ok(Err(Discarded::Dependency));
            }
        }
        Ok(Ok(entry))
    }

    fn unpack_fresh(&self, key: &str, payload: Value) -> Result<Option<Value>, StoreError> {
        match Entry::unpack(payload) {
            Ok(entry) => Ok(self.check(key, entry)?.ok().map(|entry| entry.value)),
            Err(raw) => Ok(Some(raw)),
        }
    }
}

impl Store for DependencyAwareStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        match self.inner.get(key)? {
            Some(payload) => self.unpack_fresh(key, payload),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.inner.set(key, value, ttl)
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.delete(key)
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.inner.clear()
    }

    fn get_multiple(&self, keys: &[&str]) -> Result<Vec<Option<Value>>, StoreError> {
        let payloads = self.inner.get_multiple(keys)?;
        keys.iter()
            .zip(payloads)
            .map(|(key, payload)| match payload {
                Some(payload) => self.unpack_fresh(key, payload),
                None => Ok(None),
            })
            .collect()
    }

    fn set_multiple(
        &self,
        entries: Vec<(String, Value)>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.inner.set_multiple(entries, ttl)
    }

    fn delete_multiple(&self, keys: &[&str]) -> Result<usize, StoreError> {
        self.inner.delete_multiple(keys)
    }
}
