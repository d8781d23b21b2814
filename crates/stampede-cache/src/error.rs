use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::item::CacheItem;

/// Misuse of the cache API.
///
/// These are programming errors. They are raised before any I/O happens and are never
/// retried internally.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidArgument {
    /// The key is the empty string.
    #[error("cache key must not be empty")]
    EmptyKey,
    /// The key cannot be used as a storage key as-is.
    ///
    /// Raw stores reject keys containing any of `{}()/\@:` and keys with a leading `.`.
    /// Keys passed through [`normalize`](crate::normalize) never trigger this.
    #[error("cache key `{0}` contains reserved characters")]
    ReservedCharacters(String),
    /// `beta` was negative or not a number.
    #[error("beta must be a non-negative number, got {0}")]
    Beta(f64),
}

/// An error raised by a raw [`Store`](crate::Store) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend refused the key.
    #[error(transparent)]
    InvalidKey(#[from] InvalidArgument),
    /// A file or directory could not be created, read, or removed.
    #[error("i/o error on `{}`", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// A payload could not be encoded or decoded.
    #[error("failed to encode or decode cache payload")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Wraps an [`io::Error`] together with the path it happened on.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_owned(),
            source,
        }
    }
}

/// An operational failure of the cache.
///
/// Unlike [`InvalidArgument`], these are expected to happen occasionally, and callers are
/// expected to branch on them.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A freshly computed value could not be written to the store.
    ///
    /// Carries the value and the [`CacheItem`] so that callers can log the failure or retry
    /// the write without computing the value again.
    #[error("could not persist cache entry `{key}`")]
    Persist {
        key: String,
        value: serde_json::Value,
        item: Box<CacheItem>,
        #[source]
        source: StoreError,
    },
    /// Removing an entry failed.
    ///
    /// Removing an entry that does not exist is not an error.
    #[error("could not remove cache entry `{key}`")]
    Remove {
        key: String,
        #[source]
        source: StoreError,
    },
    /// Reading from the store or evaluating a dependency failed.
    #[error("cache store failure")]
    Store(#[source] StoreError),
}

/// The error type of the public cache API.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    InvalidArgument(#[from] InvalidArgument),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl Error {
    /// Returns `true` if this error is caused by misuse of the API.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidKey(err) => Self::InvalidArgument(err),
            err => Self::Cache(CacheError::Store(err)),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        StoreError::from(err).into()
    }
}

pub(crate) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
