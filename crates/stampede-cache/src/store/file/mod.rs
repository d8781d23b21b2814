//! Stores that keep one file per key.
//!
//! Both backends share the same on-disk layout, described by [`FileLayout`]:
//!
//! ```text
//! <root>/<shard 1>/<shard 2>/.../<key><suffix>
//! ```
//!
//! Each shard is the next two characters of the key, so with a `directory_level` of `2` the key
//! `abcdef` ends up at `<root>/ab/cd/abcdef.bin`. This bounds the number of entries per
//! directory.
//!
//! Files are never written in place. New contents go to a hidden temporary file next to the
//! target, which is then atomically renamed over it. Readers thus see either the previous or
//! the new contents, and a file left behind by a different OS user is simply replaced.
//!
//! Entries starting with a `.` are ignored by garbage collection and [`Store::clear`](super::Store::clear).

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use filetime::FileTime;
use tempfile::NamedTempFile;

use crate::config::FileStoreConfig;
use crate::error::{InvalidArgument, StoreError, catch_not_found};
use crate::key::validate;

mod binary;
mod source;

pub use binary::BinaryFileStore;
pub use source::SourceFileStore;

/// Default permissions of cache files.
pub const DEFAULT_FILE_MODE: u32 = 0o644;
/// Default permissions of shard directories.
pub const DEFAULT_DIRECTORY_MODE: u32 = 0o775;
/// Default probability (in parts per million) of running GC on a write.
pub const DEFAULT_GC_PROBABILITY: u32 = 10;

/// The parts-per-million base of the GC probability.
const GC_PROBABILITY_BASE: u32 = 1_000_000;

/// Checks whether the cache file at the given path is still fresh.
pub(crate) type FreshnessCheck<'a> = &'a dyn Fn(&Path) -> io::Result<bool>;

/// Describes where and how a file store keeps its files.
#[derive(Debug, Clone)]
pub struct FileLayout {
    root: PathBuf,
    directory_level: usize,
    suffix: String,
    file_mode: u32,
    directory_mode: u32,
    gc_probability: u32,
}

impl FileLayout {
    /// Creates a layout rooted at `root`, using `suffix` for all files.
    pub fn new(root: impl Into<PathBuf>, suffix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            directory_level: 1,
            suffix: suffix.into(),
            file_mode: DEFAULT_FILE_MODE,
            directory_mode: DEFAULT_DIRECTORY_MODE,
            gc_probability: DEFAULT_GC_PROBABILITY,
        }
    }

    /// Creates a layout from the configuration, using `default_suffix` unless a suffix is configured.
    pub fn from_config(config: &FileStoreConfig, default_suffix: &str) -> Self {
        Self {
            root: config.path.clone(),
            directory_level: config.directory_level,
            suffix: config
                .file_suffix
                .clone()
                .unwrap_or_else(|| default_suffix.to_owned()),
            file_mode: config.file_mode,
            directory_mode: config.directory_mode,
            gc_probability: config.gc_probability,
        }
    }

    /// Sets the number of shard directories between the root and the file.
    pub fn directory_level(mut self, level: usize) -> Self {
        self.directory_level = level;
        self
    }

    /// Sets the permissions of newly written files.
    pub fn file_mode(mut self, mode: u32) -> Self {
        self.file_mode = mode;
        self
    }

    /// Sets the permissions of newly created directories.
    pub fn directory_mode(mut self, mode: u32) -> Self {
        self.directory_mode = mode;
        self
    }

    /// Sets the probability, in parts per million, that a write triggers garbage collection.
    pub fn gc_probability(mut self, ppm: u32) -> Self {
        self.gc_probability = ppm.min(GC_PROBABILITY_BASE);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Returns the path of the file holding `key`.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, InvalidArgument> {
        validate(key)?;

        let mut path = self.root.clone();
        let chars: Vec<char> = key.chars().collect();
        for shard in chars.chunks(2).take(self.directory_level) {
            // Shards must never be `.` or `..`.
            let shard: String = shard
                .iter()
                .map(|&c| if c == '.' { '_' } else { c })
                .collect();
            path.push(shard);
        }
        path.push(format!("{key}{}", self.suffix));
        Ok(path)
    }

    pub(crate) fn create_root(&self) -> Result<(), StoreError> {
        self.create_dir_all(&self.root)
            .map_err(|e| StoreError::io(&self.root, e))
    }

    fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(self.directory_mode);
        }
        builder.create(dir)
    }

    /// Create a new temporary file next to the final location of a cache file.
    fn tempfile_in(&self, dir: &Path) -> Result<NamedTempFile, StoreError> {
        // Garbage collection could potentially remove the directories we are operating in,
        // so be defensive here and retry the fs operations.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = self.create_dir_all(dir) {
                tracing::error!(path = %dir.display(), "Failed to create cache directory: {:?}", e);
                if retries > MAX_RETRIES {
                    return Err(StoreError::io(dir, e));
                }
                continue;
            }

            match tempfile::Builder::new().prefix(".tmp").tempfile_in(dir) {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    tracing::error!(path = %dir.display(), "Failed to create cache file: {:?}", e);
                    if retries > MAX_RETRIES {
                        return Err(StoreError::io(dir, e));
                    }
                    continue;
                }
            }
        }
    }

    /// Atomically replaces the file at `path` with `contents`.
    ///
    /// If `mtime` is given, the modification time of the new file is set to it.
    pub(crate) fn write(
        &self,
        path: &Path,
        contents: &[u8],
        mtime: Option<SystemTime>,
    ) -> Result<(), StoreError> {
        let dir = path.parent().unwrap_or(&self.root);
        let mut temp_file = self.tempfile_in(dir)?;
        temp_file
            .write_all(contents)
            .map_err(|e| StoreError::io(temp_file.path(), e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(temp_file.path(), fs::Permissions::from_mode(self.file_mode))
                .map_err(|e| StoreError::io(temp_file.path(), e))?;
        }

        if let Some(mtime) = mtime {
            filetime::set_file_mtime(temp_file.path(), FileTime::from_system_time(mtime))
                .map_err(|e| StoreError::io(temp_file.path(), e))?;
        }

        temp_file
            .persist(path)
            .map_err(|e| StoreError::io(path, e.error))?;

        metric!(histogram("store.file.write.bytes") = contents.len() as u64);
        tracing::trace!("Wrote {} bytes to `{}`", contents.len(), path.display());
        Ok(())
    }

    /// Reads the file at `path`, returning `None` if it does not exist.
    pub(crate) fn read(&self, path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
        let contents = catch_not_found(|| fs::read(path)).map_err(|e| StoreError::io(path, e))?;
        if let Some(ref contents) = contents {
            tracing::trace!("Read {} bytes from `{}`", contents.len(), path.display());
        }
        Ok(contents)
    }

    /// Removes the file at `path`, returning whether it existed.
    pub(crate) fn remove(&self, path: &Path) -> Result<bool, StoreError> {
        let removed =
            catch_not_found(|| fs::remove_file(path)).map_err(|e| StoreError::io(path, e))?;
        Ok(removed.is_some())
    }

    /// Runs [`gc`](Self::gc) on expired files with the configured probability.
    ///
    /// Failures are logged and otherwise ignored.
    pub(crate) fn maybe_gc(&self, is_fresh: FreshnessCheck<'_>) {
        if self.gc_probability == 0
            || rand::random_range(0..GC_PROBABILITY_BASE) >= self.gc_probability
        {
            return;
        }
        if let Err(e) = self.gc(true, is_fresh) {
            let error: &dyn std::error::Error = &e;
            tracing::error!(error, "Cache garbage collection failed");
        }
    }

    /// Removes cache files below the root.
    ///
    /// If `expired_only` is `true`, only files failing `is_fresh` are removed and directories
    /// are left alone. Otherwise all files and directories are removed, with the exception of
    /// the root itself and hidden entries.
    ///
    /// Failing to remove a single file is logged and does not abort the pass. Failing to
    /// remove a directory during a full pass is returned as an error.
    pub(crate) fn gc(
        &self,
        expired_only: bool,
        is_fresh: FreshnessCheck<'_>,
    ) -> Result<GcStats, StoreError> {
        tracing::debug!(expired_only, "Collecting garbage in `{}`", self.root.display());
        let mut stats = GcStats::default();
        self.gc_directory(&self.root, expired_only, is_fresh, &mut stats)?;

        tracing::info!(
            "Removed {} directories and {} files, totaling {} bytes",
            stats.removed_dirs,
            stats.removed_files,
            stats.removed_bytes,
        );
        tracing::info!(
            "Retained {} files, totaling {} bytes",
            stats.retained_files,
            stats.retained_bytes,
        );
        metric!(counter("store.file.gc.runs") += 1, "expired_only" => if expired_only { "true" } else { "false" });
        metric!(counter("store.file.gc.removed_files") += stats.removed_files as i64);
        metric!(counter("store.file.gc.removed_bytes") += stats.removed_bytes as i64);
        metric!(gauge("store.file.gc.retained_files") = stats.retained_files as u64);
        metric!(gauge("store.file.gc.retained_bytes") = stats.retained_bytes);

        Ok(stats)
    }

    fn gc_directory(
        &self,
        directory: &Path,
        expired_only: bool,
        is_fresh: FreshnessCheck<'_>,
        stats: &mut GcStats,
    ) -> Result<(), StoreError> {
        let entries = match catch_not_found(|| fs::read_dir(directory))
            .map_err(|e| StoreError::io(directory, e))?
        {
            Some(x) => x,
            None => {
                tracing::warn!("Directory not found: `{}`", directory.display());
                return Ok(());
            }
        };

        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(directory, e))?;
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let path = entry.path();
            let Some(file_type) =
                catch_not_found(|| entry.file_type()).map_err(|e| StoreError::io(&path, e))?
            else {
                continue;
            };

            if file_type.is_dir() {
                self.gc_directory(&path, expired_only, is_fresh, stats)?;
                if !expired_only {
                    tracing::debug!("Removing directory `{}`", path.display());
                    catch_not_found(|| fs::remove_dir(&path))
                        .map_err(|e| StoreError::io(&path, e))?;
                    stats.removed_dirs += 1;
                }
            } else {
                self.gc_file(&path, expired_only, is_fresh, stats);
            }
        }

        Ok(())
    }

    fn gc_file(
        &self,
        path: &Path,
        expired_only: bool,
        is_fresh: FreshnessCheck<'_>,
        stats: &mut GcStats,
    ) {
        tracing::trace!("Checking file `{}`", path.display());
        let size = match catch_not_found(|| path.metadata()) {
            Ok(Some(metadata)) => metadata.len(),
            Ok(None) => return,
            Err(e) => {
                tracing::error!(path = %path.display(), "Failed to stat cache file: {:?}", e);
                stats.failed_files += 1;
                return;
            }
        };

        if expired_only {
            match catch_not_found(|| is_fresh(path)) {
                Ok(Some(false)) => {}
                Ok(None) => return,
                Ok(Some(true)) => {
                    stats.retained_files += 1;
                    stats.retained_bytes += size;
                    return;
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), "Failed to check cache file: {:?}", e);
                    stats.failed_files += 1;
                    return;
                }
            }
        }

        tracing::debug!("Removing file `{}`", path.display());
        match catch_not_found(|| fs::remove_file(path)) {
            Ok(_) => {
                stats.removed_files += 1;
                stats.removed_bytes += size;
            }
            Err(e) => {
                tracing::error!(path = %path.display(), "Failed to remove cache file: {:?}", e);
                stats.failed_files += 1;
            }
        }
    }
}

/// What a garbage collection pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub removed_dirs: usize,
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_files: usize,
    pub retained_bytes: u64,

    /// Files that could not be checked or removed.
    pub failed_files: usize,
}
