use std::io;
use std::path::Path;
use std::time::Duration;

use serde_json::Value;

use crate::config::FileStoreConfig;
use crate::error::StoreError;
use crate::item::timestamp;
use crate::store::Store;

use super::{FileLayout, GcStats};

/// A file [`Store`] whose files are self-describing literals.
///
/// Every file holds the JSON literal `[expiration, value]`, where `expiration` is the epoch
/// second at which the entry expires, or `0` if it never does. Loading a file is all that is
/// needed to both obtain the value and check its freshness, no filesystem metadata is involved.
/// The flip side is that freshness checks and garbage collection have to read every file.
#[derive(Debug, Clone)]
pub struct SourceFileStore {
    layout: FileLayout,
}

/// The contents of a cache file.
type Literal = (i64, Value);

impl SourceFileStore {
    /// The default suffix of cache files.
    pub const SUFFIX: &'static str = ".vex";

    /// Opens a store in `root` with default settings.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::new(FileLayout::new(root.as_ref(), Self::SUFFIX))
    }

    /// Creates a store using `layout`, creating its root directory if needed.
    pub fn new(layout: FileLayout) -> Result<Self, StoreError> {
        layout.create_root()?;
        Ok(Self { layout })
    }

    pub fn from_config(config: &FileStoreConfig) -> Result<Self, StoreError> {
        Self::new(FileLayout::from_config(config, Self::SUFFIX))
    }

    pub fn layout(&self) -> &FileLayout {
        &self.layout
    }

    /// Removes all expired files.
    pub fn gc(&self) -> Result<GcStats, StoreError> {
        self.layout.gc(true, &is_fresh)
    }

    /// Loads the literal at `path`.
    ///
    /// Unreadable literals are logged and treated as missing.
    fn load(&self, path: &Path) -> Result<Option<Literal>, StoreError> {
        let Some(bytes) = self.layout.read(path)? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(literal) => Ok(Some(literal)),
            Err(e) => {
                tracing::error!(path = %path.display(), "Failed to load cache file: {:?}", e);
                Ok(None)
            }
        }
    }
}

fn expiration_is_fresh(expiration: i64) -> bool {
    expiration == 0 || timestamp() < expiration as f64
}

/// Garbage collection check, unreadable files count as expired.
fn is_fresh(path: &Path) -> io::Result<bool> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice::<Literal>(&bytes)
        .is_ok_and(|(expiration, _)| expiration_is_fresh(expiration)))
}

impl Store for SourceFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let path = self.layout.path_for(key)?;
        Ok(self
            .load(&path)?
            .filter(|(expiration, _)| expiration_is_fresh(*expiration))
            .map(|(_, value)| value))
    }

    fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        let path = self.layout.path_for(key)?;
        if ttl == Some(Duration::ZERO) {
            self.layout.remove(&path)?;
            return Ok(());
        }

        // Rounding down never keeps an entry past its TTL. The cast saturates for huge TTLs.
        let expiration = ttl.map_or(0, |ttl| (timestamp() + ttl.as_secs_f64()).floor() as i64);
        let contents = serde_json::to_vec_pretty(&(expiration, &value))?;
        self.layout.write(&path, &contents, None)?;

        self.layout.maybe_gc(&is_fresh);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.layout.path_for(key)?;
        self.layout.remove(&path)
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.layout.gc(false, &is_fresh)?;
        Ok(())
    }
}
