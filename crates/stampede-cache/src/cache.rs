use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::aware::{DependencyAwareStore, Entry};
use crate::config::CacheConfig;
use crate::dependency::{self, Dependency, DependencySource, Sources};
use crate::error::{CacheError, Error};
use crate::item::{CacheItem, check_beta, timestamp};
use crate::key::{Key, normalize};
use crate::store::Store;

/// The time-to-live of a cache entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Ttl {
    /// The default TTL of the [`Cache`].
    #[default]
    Default,
    /// The entry never expires by time.
    Forever,
    /// The entry expires after the given number of seconds.
    ///
    /// Zero or negative values are not cached at all, and remove any existing entry.
    Seconds(i64),
}

impl Ttl {
    fn from_duration(duration: Duration) -> i64 {
        // Partial seconds are rounded up so entries live at least as long as requested.
        let secs = duration
            .as_secs()
            .saturating_add(u64::from(duration.subsec_nanos() > 0));
        i64::try_from(secs).unwrap_or(i64::MAX)
    }
}

impl From<Duration> for Ttl {
    fn from(duration: Duration) -> Self {
        Self::Seconds(Self::from_duration(duration))
    }
}

impl From<Option<Duration>> for Ttl {
    fn from(duration: Option<Duration>) -> Self {
        duration.map_or(Self::Forever, Self::from)
    }
}

impl From<i64> for Ttl {
    fn from(secs: i64) -> Self {
        Self::Seconds(secs)
    }
}

impl From<i32> for Ttl {
    fn from(secs: i32) -> Self {
        Self::Seconds(secs.into())
    }
}

/// Per-call options of [`Cache::get_or_set_with`].
#[derive(Clone, Debug, Default)]
pub struct Options {
    pub ttl: Ttl,
    /// Invalidates the entry independently of its TTL.
    pub dependency: Option<Dependency>,
    /// The early expiration factor, defaults to the one of the [`Cache`].
    pub beta: Option<f64>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: impl Into<Ttl>) -> Self {
        self.ttl = ttl.into();
        self
    }

    pub fn dependency(mut self, dependency: Dependency) -> Self {
        self.dependency = Some(dependency);
        self
    }

    pub fn beta(mut self, beta: f64) -> Self {
        self.beta = Some(beta);
        self
    }
}

/// Builds a [`Cache`] around a raw [`Store`].
pub struct CacheBuilder {
    store: Arc<dyn Store>,
    sources: Sources,
    default_ttl: Option<Duration>,
    beta: f64,
}

impl CacheBuilder {
    /// The TTL of entries written with [`Ttl::Default`].
    pub fn default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// The early expiration factor used unless a call overrides it.
    pub fn beta(mut self, beta: f64) -> Self {
        self.beta = beta;
        self
    }

    /// Applies the `cache` configuration section.
    pub fn config(self, config: &CacheConfig) -> Self {
        self.default_ttl(config.default_ttl).beta(config.beta)
    }

    /// Registers a source for [`Dependency::Callback`]s.
    pub fn source(mut self, name: impl Into<String>, source: impl DependencySource + 'static) -> Self {
        self.sources.insert(name, source);
        self
    }

    pub fn build(self) -> Cache {
        Cache {
            store: DependencyAwareStore::new(self.store, self.sources),
            registry: Default::default(),
            default_ttl: self.default_ttl,
            beta: self.beta,
        }
    }
}

/// A read-through cache with dependencies and probabilistic early expiration.
///
/// Values are computed by a producer on a miss and written to the store together with a
/// [`CacheItem`]. Entries are recomputed once their TTL passes, once their dependency changes,
/// or, with a probability that grows the closer they get to their expiry, a little earlier.
/// Spreading recomputations out like this keeps concurrent readers from all recomputing the
/// same entry at once. It does not prevent it entirely: there is no locking between readers.
#[derive(Debug)]
pub struct Cache {
    store: DependencyAwareStore,
    registry: crate::registry::ItemRegistry,
    default_ttl: Option<Duration>,
    beta: f64,
}

impl Cache {
    /// Creates a cache without default TTL, with `beta = 1`, and without dependency sources.
    pub fn new(store: impl Store + 'static) -> Self {
        Self::builder(store).build()
    }

    pub fn builder(store: impl Store + 'static) -> CacheBuilder {
        CacheBuilder {
            store: Arc::new(store),
            sources: Sources::new(),
            default_ttl: None,
            beta: 1.0,
        }
    }

    pub fn from_config(config: &CacheConfig, store: impl Store + 'static) -> Self {
        Self::builder(store).config(config).build()
    }

    /// The store handed to producers.
    ///
    /// Reads through it honor dependencies, writes go to the raw store unchanged.
    pub fn store(&self) -> &DependencyAwareStore {
        &self.store
    }

    /// Returns the value cached under `key`, or computes, caches, and returns it.
    ///
    /// This uses the default TTL and `beta` of the cache. See
    /// [`get_or_set_with`](Self::get_or_set_with).
    pub fn get_or_set<K, T, F>(&self, key: K, producer: F) -> Result<T, Error>
    where
        K: Into<Key>,
        T: Serialize + DeserializeOwned,
        F: FnOnce(&dyn Store) -> T,
    {
        self.get_or_set_with(key, Options::default(), producer)
    }

    /// Returns the value cached under `key`, or computes, caches, and returns it.
    ///
    /// The producer is only invoked if there is no fresh entry. Its result is written with the
    /// TTL and dependency given in `options`. A cached value that does not deserialize into `T`
    /// is treated as a miss.
    ///
    /// A failed write is reported as [`CacheError::Persist`], which carries the computed value.
    pub fn get_or_set_with<K, T, F>(&self, key: K, options: Options, producer: F) -> Result<T, Error>
    where
        K: Into<Key>,
        T: Serialize + DeserializeOwned,
        F: FnOnce(&dyn Store) -> T,
    {
        self.try_get_or_set_with(key, options, |store| Ok(producer(store)))
    }

    /// Like [`get_or_set_with`](Self::get_or_set_with), with a fallible producer.
    ///
    /// If the producer fails, its error is returned and nothing is cached.
    pub fn try_get_or_set_with<K, T, E, F>(&self, key: K, options: Options, producer: F) -> Result<T, E>
    where
        K: Into<Key>,
        T: Serialize + DeserializeOwned,
        E: From<Error>,
        F: FnOnce(&dyn Store) -> Result<T, E>,
    {
        let key = normalize(&key.into()).map_err(Error::from)?;
        let beta = options.beta.unwrap_or(self.beta);
        check_beta(beta).map_err(Error::from)?;

        metric!(counter("cache.access") += 1);
        if let Some(value) = self.lookup(&key, beta)? {
            metric!(counter("cache.hit") += 1);
            return Ok(value);
        }

        let ttl = match options.ttl {
            Ttl::Default => self.default_ttl.map(Ttl::from_duration),
            Ttl::Forever => None,
            Ttl::Seconds(secs) => Some(secs),
        };

        tracing::trace!(key = %key, "Computing cache entry");
        let start = Instant::now();
        let value = producer(&self.store)?;
        metric!(timer("cache.compute") = start.elapsed());

        Ok(self.persist(key, value, ttl, options.dependency)?)
    }

    /// Returns the value cached under `key` without computing it.
    ///
    /// Entries that [`get_or_set`](Self::get_or_set) would recompute are misses.
    pub fn get<K, T>(&self, key: K) -> Result<Option<T>, Error>
    where
        K: Into<Key>,
        T: DeserializeOwned,
    {
        let key = normalize(&key.into())?;
        self.lookup(&key, self.beta)
    }

    /// Removes the entry for `key`.
    ///
    /// Removing a key that does not exist is not an error.
    pub fn remove(&self, key: impl Into<Key>) -> Result<(), Error> {
        let key = normalize(&key.into())?;
        self.remove_normalized(key)
    }

    /// Invalidates every entry with a [`Dependency::Tag`] on any of `tags`.
    pub fn invalidate_tags<I, T>(&self, tags: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        dependency::invalidate_tags(&self.store, tags)?;
        Ok(())
    }

    fn lookup<T: DeserializeOwned>(&self, key: &str, beta: f64) -> Result<Option<T>, Error> {
        let ctx = self.store.context();
        if self.registry.expired(key, beta, &ctx)? {
            tracing::trace!(key, "Cache entry expired in registry");
            metric!(counter("cache.miss") += 1, "reason" => "registry");
            return Ok(None);
        }

        let Some(entry) = self.store.get_entry(key)? else {
            return Ok(None);
        };
        if entry.item.expired(beta, &ctx)? {
            tracing::trace!(key, "Cache entry expired");
            metric!(counter("cache.miss") += 1, "reason" => "expired");
            return Ok(None);
        }

        match serde_json::from_value(entry.value) {
            Ok(value) => {
                self.registry.set(entry.item);
                Ok(Some(value))
            }
            Err(err) => {
                tracing::debug!(key, "Cached value has an unexpected shape: {}", err);
                metric!(counter("cache.miss") += 1, "reason" => "shape");
                Ok(None)
            }
        }
    }

    fn persist<T: Serialize>(
        &self,
        key: String,
        value: T,
        ttl: Option<i64>,
        dependency: Option<Dependency>,
    ) -> Result<T, Error> {
        if ttl.is_some_and(|secs| secs <= 0) {
            tracing::debug!(key = %key, "Not caching entry with non-positive TTL");
            self.remove_normalized(key)?;
            return Ok(value);
        }

        let expiry = ttl.map(|secs| (timestamp() as i64).saturating_add(secs));
        let mut item = CacheItem::new(key.clone(), expiry, dependency);
        item.evaluate_dependency(&self.store.context())?;

        let entry = Entry {
            value: serde_json::to_value(&value)?,
            item,
        };
        let store_ttl = ttl.map(|secs| Duration::from_secs(secs.unsigned_abs()));
        if let Err(source) = self.store.set_entry(&key, &entry, store_ttl) {
            let Entry { value, item } = entry;
            return Err(CacheError::Persist {
                key,
                value,
                item: Box::new(item),
                source,
            }
            .into());
        }

        metric!(counter("cache.write") += 1);
        self.registry.set(entry.item);
        Ok(value)
    }

    fn remove_normalized(&self, key: String) -> Result<(), Error> {
        match self.store.delete(&key) {
            Ok(existed) => {
                tracing::debug!(key = %key, existed, "Removed cache entry");
                self.registry.remove(&key);
                Ok(())
            }
            Err(source) => Err(CacheError::Remove { key, source }.into()),
        }
    }
}
