//! Invalidation dependencies.
//!
//! A [`Dependency`] is attached to a cache entry when it is written. At that moment its
//! baseline snapshot is captured via [`Dependency::evaluate`]. Whenever the entry is read back,
//! [`Dependency::is_changed`] evaluates the dependency again and compares the result to the
//! baseline. A changed dependency turns the read into a miss, no matter how much TTL is left.
//!
//! Dependencies are persisted together with the entry, so they need to be plain data. Arbitrary
//! user logic is therefore not stored inline: a [`Dependency::Callback`] refers to a
//! [`DependencySource`] by name, and the sources are registered on the
//! [`Cache`](crate::Cache) when it is constructed.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::key::{Key, normalize};
use crate::store::Store;

/// User logic whose result a [`Dependency::Callback`] tracks.
///
/// Sources are evaluated synchronously, and get access to the store so they can look at other
/// cache entries.
pub trait DependencySource: Send + Sync {
    fn evaluate(&self, store: &dyn Store) -> Value;
}

impl<F> DependencySource for F
where
    F: Fn(&dyn Store) -> Value + Send + Sync,
{
    fn evaluate(&self, store: &dyn Store) -> Value {
        self(store)
    }
}

/// Named [`DependencySource`]s.
#[derive(Clone, Default)]
pub struct Sources {
    sources: HashMap<String, Arc<dyn DependencySource>>,
}

impl Sources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `source` under `name`, replacing any previous source of that name.
    pub fn insert(&mut self, name: impl Into<String>, source: impl DependencySource + 'static) {
        self.sources.insert(name.into(), Arc::new(source));
    }

    pub fn get(&self, name: &str) -> Option<&dyn DependencySource> {
        self.sources.get(name).map(|source| &**source)
    }
}

impl fmt::Debug for Sources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.sources.keys().collect();
        names.sort();
        f.debug_set().entries(names).finish()
    }
}

/// Everything a [`Dependency`] can look at while being evaluated.
#[derive(Clone, Copy)]
pub struct DependencyContext<'a> {
    pub store: &'a dyn Store,
    pub sources: &'a Sources,
}

impl<'a> DependencyContext<'a> {
    pub fn new(store: &'a dyn Store, sources: &'a Sources) -> Self {
        Self { store, sources }
    }
}

/// A condition, independent of TTL, under which a cache entry becomes stale.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Dependency {
    /// Pins a literal value.
    ///
    /// The snapshot is the value itself, so this only reports a change when the snapshot has
    /// been captured from a different literal.
    Value {
        value: Value,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "deserialize_some"
        )]
        snapshot: Option<Value>,
    },
    /// Tracks the modification time of a file.
    ///
    /// A missing file cannot be compared, and always counts as changed.
    File {
        path: PathBuf,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "deserialize_some"
        )]
        snapshot: Option<Value>,
    },
    /// Tracks the result of the [`DependencySource`] registered under `source`.
    ///
    /// If no such source is registered, the dependency always counts as changed.
    Callback {
        source: String,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "deserialize_some"
        )]
        snapshot: Option<Value>,
    },
    /// Tracks the versions of a set of tags.
    ///
    /// Versions live in the store itself, and [`invalidate_tags`] bumps them.
    Tag {
        tags: Vec<String>,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "deserialize_some"
        )]
        snapshot: Option<Value>,
    },
    /// Changed only when *every* inner dependency is changed.
    ///
    /// An empty list never changes.
    All { dependencies: Vec<Dependency> },
    /// Changed when *any* inner dependency is changed.
    Any { dependencies: Vec<Dependency> },
}

/// Distinguishes a `null` snapshot from a missing one.
fn deserialize_some<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl Dependency {
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value {
            value: value.into(),
            snapshot: None,
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File {
            path: path.into(),
            snapshot: None,
        }
    }

    pub fn callback(source: impl Into<String>) -> Self {
        Self::Callback {
            source: source.into(),
            snapshot: None,
        }
    }

    pub fn tags<I, T>(tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self::Tag {
            tags: tags.into_iter().map(Into::into).collect(),
            snapshot: None,
        }
    }

    pub fn all(dependencies: impl Into<Vec<Dependency>>) -> Self {
        Self::All {
            dependencies: dependencies.into(),
        }
    }

    pub fn any(dependencies: impl Into<Vec<Dependency>>) -> Self {
        Self::Any {
            dependencies: dependencies.into(),
        }
    }

    /// Captures the baseline snapshot, replacing any previous one.
    pub fn evaluate(&mut self, ctx: &DependencyContext<'_>) -> Result<(), StoreError> {
        match self {
            Self::Value { value, snapshot } => *snapshot = Some(value.clone()),
            Self::File { path, snapshot } => *snapshot = Some(file_stamp(path)),
            Self::Callback { source, snapshot } => {
                *snapshot = match ctx.sources.get(source) {
                    Some(s) => Some(s.evaluate(ctx.store)),
                    None => {
                        tracing::warn!(source = %source, "Dependency source is not registered");
                        None
                    }
                };
            }
            Self::Tag { tags, snapshot } => *snapshot = Some(tag_versions(ctx.store, tags, true)?),
            Self::All { dependencies } | Self::Any { dependencies } => {
                for dependency in dependencies {
                    dependency.evaluate(ctx)?;
                }
            }
        }
        Ok(())
    }

    /// Evaluates the dependency again and compares it to the baseline snapshot.
    ///
    /// A dependency that has never been evaluated is always changed.
    pub fn is_changed(&self, ctx: &DependencyContext<'_>) -> Result<bool, StoreError> {
        let changed = match self {
            Self::Value { value, snapshot } => snapshot.as_ref() != Some(value),
            Self::File { path, snapshot } => match (snapshot, file_stamp(path)) {
                (Some(before @ Value::Number(_)), now @ Value::Number(_)) => *before != now,
                _ => true,
            },
            Self::Callback { source, snapshot } => match (snapshot, ctx.sources.get(source)) {
                (Some(before), Some(s)) => *before != s.evaluate(ctx.store),
                _ => true,
            },
            Self::Tag { tags, snapshot } => match snapshot {
                Some(before) => *before != tag_versions(ctx.store, tags, false)?,
                None => true,
            },
            Self::All { dependencies } => {
                if dependencies.is_empty() {
                    return Ok(false);
                }
                for dependency in dependencies {
                    if !dependency.is_changed(ctx)? {
                        return Ok(false);
                    }
                }
                true
            }
            Self::Any { dependencies } => {
                for dependency in dependencies {
                    if dependency.is_changed(ctx)? {
                        return Ok(true);
                    }
                }
                false
            }
        };
        Ok(changed)
    }
}

/// The modification time of `path` in nanoseconds, or `null` if it cannot be determined.
fn file_stamp(path: &Path) -> Value {
    path.metadata()
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
        .map_or(Value::Null, |since| Value::from(since.as_nanos() as u64))
}

/// The storage key holding the version of `tag`.
fn tag_key(tag: &str) -> String {
    // Composite keys are always hashed, so this never fails.
    normalize(&Key::from(("__tag__", tag))).unwrap_or_else(|_| format!("__tag__{tag}"))
}

fn new_version() -> Value {
    Value::from(format!("{:016x}", rand::random::<u64>()))
}

/// Reads the current version of every tag.
///
/// Missing versions are created if `create` is set, and are `null` otherwise.
fn tag_versions(store: &dyn Store, tags: &[String], create: bool) -> Result<Value, StoreError> {
    let mut versions = Map::new();
    for tag in tags {
        let key = tag_key(tag);
        let version = match store.get(&key)? {
            Some(version) => version,
            None if create => {
                let version = new_version();
                store.set(&key, version.clone(), None)?;
                version
            }
            None => Value::Null,
        };
        versions.insert(tag.clone(), version);
    }
    Ok(Value::Object(versions))
}

/// Invalidates every cache entry that has a [`Dependency::Tag`] on any of `tags`.
pub fn invalidate_tags<I, T>(store: &dyn Store, tags: I) -> Result<(), StoreError>
where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    for tag in tags {
        let tag = tag.as_ref();
        tracing::debug!(tag, "Invalidating tag");
        store.set(&tag_key(tag), new_version(), None)?;
    }
    Ok(())
}
