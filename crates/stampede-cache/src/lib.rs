//! # Stampede
//!
//! A read-through cache for expensive computations, with invalidation dependencies and
//! probabilistic early expiration.
//!
//! ## Cache Layers
//!
//! A [`Cache`] is made up of the following layers:
//!
//! - An in-process [`ItemRegistry`] remembering the metadata of every entry this process has
//!   seen. It can only ever turn a lookup into a miss early, without a storage round trip.
//! - A [`DependencyAwareStore`] which packs values together with their [`CacheItem`] and hides
//!   entries whose [`Dependency`] changed.
//! - A raw [`Store`] which only knows about values and TTLs. Included are an in-memory
//!   [`MemoryStore`] and two file stores, [`BinaryFileStore`] and [`SourceFileStore`].
//!
//! A cache request goes through the following steps:
//! - The key is normalized into a storage key.
//! - If the registry knows the entry is expired, it is a miss.
//! - Otherwise, the entry is loaded from the store. Missing entries, entries with a changed
//!   dependency, and expired entries are misses.
//! - On miss, the producer computes a fresh value, which is written to the store and recorded
//!   in the registry.
//!
//! ## Early Expiration
//!
//! When many readers share an entry, all of them see it expire at the same moment and
//! recompute it at once. To spread these recomputations out, an entry may expire a little
//! early: the closer it is to its expiry, the more likely a reader treats it as expired. The
//! `beta` factor scales that window, and `0` turns early expiration off. See
//! [`early_expiration`] for the details.
//!
//! ### Metrics
//!
//! Metrics are reported via statsd once configured, see [`metrics`]:
//!
//! - `cache.access`: All accesses.
//! - `cache.hit`: Accesses served from the store.
//! - `cache.miss`: Misses, tagged with a `reason`.
//! - `cache.compute`: Time spent in producers.
//! - `cache.write`: Entries written to the store.
//! - `store.file.write.bytes`: Size of files written by the file stores (histogram).
//! - `store.file.gc.*`: Garbage collection runs of the file stores, and the files they retained.

#[macro_use]
pub mod metrics;

pub mod aware;
pub mod cache;
pub mod config;
pub mod dependency;
pub mod error;
pub mod item;
pub mod key;
pub mod logging;
pub mod registry;
pub mod store;

pub use aware::{DependencyAwareStore, Entry};
pub use cache::{Cache, CacheBuilder, Options, Ttl};
pub use config::Config;
pub use dependency::{Dependency, DependencyContext, DependencySource, Sources};
pub use error::{CacheError, Error, InvalidArgument, StoreError};
pub use item::{CacheItem, early_expiration};
pub use key::{Key, normalize};
pub use registry::ItemRegistry;
pub use store::{BinaryFileStore, FileLayout, GcStats, MemoryStore, SourceFileStore, Store};
