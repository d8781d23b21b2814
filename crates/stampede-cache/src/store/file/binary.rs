use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

use serde_json::Value;

use crate::config::FileStoreConfig;
use crate::error::{StoreError, catch_not_found};
use crate::store::Store;

use super::{FileLayout, GcStats};

/// How far in the future the mtime of entries without a TTL is set.
const FOREVER: Duration = Duration::from_secs(365 * 24 * 3600);

/// Magic bytes of a zstd frame.
///
/// See <https://tools.ietf.org/id/draft-kucherawy-dispatch-zstd-00.html#rfc.section.2.1.1>
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// A file [`Store`] that encodes expiration in the file's modification time.
///
/// Values are written as JSON, optionally compressed with zstd. Writing an entry sets the
/// file's `mtime` to the moment it expires, so checking whether an entry is fresh is a single
/// `stat` call: the entry is fresh if the file exists and its `mtime` lies in the future.
/// Entries without a TTL are kept for a year, as are entries whose TTL does not fit into a
/// timestamp.
///
/// This relies on the filesystem preserving arbitrary modification times.
#[derive(Debug, Clone)]
pub struct BinaryFileStore {
    layout: FileLayout,
    compression_level: Option<i32>,
}

impl BinaryFileStore {
    /// The default suffix of cache files.
    pub const SUFFIX: &'static str = ".bin";

    /// Opens a store in `root` with default settings.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::new(FileLayout::new(root.as_ref(), Self::SUFFIX))
    }

    /// Creates a store using `layout`, creating its root directory if needed.
    pub fn new(layout: FileLayout) -> Result<Self, StoreError> {
        layout.create_root()?;
        Ok(Self {
            layout,
            compression_level: None,
        })
    }

    pub fn from_config(config: &FileStoreConfig) -> Result<Self, StoreError> {
        let store = Self::new(FileLayout::from_config(config, Self::SUFFIX))?;
        Ok(store.compression_level(config.compression_level))
    }

    /// Compresses written values with zstd at the given level.
    ///
    /// Reading transparently handles both compressed and uncompressed files.
    pub fn compression_level(mut self, level: Option<i32>) -> Self {
        self.compression_level = level;
        self
    }

    pub fn layout(&self) -> &FileLayout {
        &self.layout
    }

    /// Removes all expired files.
    pub fn gc(&self) -> Result<GcStats, StoreError> {
        self.layout.gc(true, &is_fresh)
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, StoreError> {
        let json = serde_json::to_vec(value)?;
        match self.compression_level {
            Some(level) => zstd::encode_all(json.as_slice(), level)
                .map_err(|e| StoreError::io(self.layout.root(), e)),
            None => Ok(json),
        }
    }

    fn decode(path: &Path, bytes: Vec<u8>) -> Option<Value> {
        let bytes = if bytes.starts_with(&ZSTD_MAGIC) {
            match zstd::decode_all(bytes.as_slice()) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(path = %path.display(), "Failed to decompress cache file: {:?}", e);
                    return None;
                }
            }
        } else {
            bytes
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(path = %path.display(), "Failed to decode cache file: {:?}", e);
                None
            }
        }
    }
}

/// An entry is fresh as long as its `mtime` is in the future.
fn is_fresh(path: &Path) -> io::Result<bool> {
    let mtime = path.metadata()?.modified()?;
    Ok(mtime > SystemTime::now())
}

impl Store for BinaryFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let path = self.layout.path_for(key)?;

        let fresh = catch_not_found(|| is_fresh(&path)).map_err(|e| StoreError::io(&path, e))?;
        if fresh != Some(true) {
            return Ok(None);
        }

        let Some(bytes) = self.layout.read(&path)? else {
            return Ok(None);
        };
        Ok(Self::decode(&path, bytes))
    }

    fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        let path = self.layout.path_for(key)?;
        if ttl == Some(Duration::ZERO) {
            self.layout.remove(&path)?;
            return Ok(());
        }

        let bytes = self.encode(&value)?;
        let now = SystemTime::now();
        let expires = ttl
            .and_then(|ttl| now.checked_add(ttl))
            .unwrap_or(now + FOREVER);
        self.layout.write(&path, &bytes, Some(expires))?;

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

    fn has(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.layout.path_for(key)?;
        let fresh = catch_not_found(|| is_fresh(&path)).map_err(|e| StoreError::io(&path, e))?;
        Ok(fresh == Some(true))
    }
}
