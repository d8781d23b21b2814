use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::store::file::{DEFAULT_DIRECTORY_MODE, DEFAULT_FILE_MODE, DEFAULT_GC_PROBABILITY};

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level of the cache.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "stampede".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Settings of the [`Cache`](crate::Cache) itself.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// The TTL of entries written without an explicit one.
    ///
    /// Unset means entries never expire.
    #[serde(with = "humantime_serde")]
    pub default_ttl: Option<Duration>,

    /// The default early expiration factor.
    ///
    /// `0` disables early expiration, higher values recompute entries earlier.
    pub beta: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: None,
            beta: 1.0,
        }
    }
}

/// Settings of the file stores.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FileStoreConfig {
    /// The directory all cache files are written to.
    pub path: PathBuf,
    /// The number of two-character shard directories between the root and a file.
    pub directory_level: usize,
    /// The suffix of cache files, defaults to the suffix of the store type.
    pub file_suffix: Option<String>,
    /// Permissions of cache files, as an octal number.
    #[serde(deserialize_with = "deserialize_mode")]
    pub file_mode: u32,
    /// Permissions of shard directories, as an octal number.
    #[serde(deserialize_with = "deserialize_mode")]
    pub directory_mode: u32,
    /// The probability, in parts per million, that a write triggers garbage collection.
    pub gc_probability: u32,
    /// Compresses values with zstd at the given level.
    ///
    /// Only used by the [`BinaryFileStore`](crate::BinaryFileStore).
    pub compression_level: Option<i32>,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            path: env::temp_dir().join("stampede"),
            directory_level: 1,
            file_suffix: None,
            file_mode: DEFAULT_FILE_MODE,
            directory_mode: DEFAULT_DIRECTORY_MODE,
            gc_probability: DEFAULT_GC_PROBABILITY,
            compression_level: None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub logging: Logging,
    /// Metrics configuration.
    pub metrics: Metrics,
    /// Behavior of the cache.
    pub cache: CacheConfig,
    /// Where and how the file stores keep their files.
    pub file_store: FileStoreConfig,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

/// Accepts permission modes as YAML octal integers (`0o644`) or octal strings (`"644"`).
#[derive(Debug)]
struct ModeVisitor;

impl de::Visitor<'_> for ModeVisitor {
    type Value = u32;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "a permission mode like 0o644 or \"0644\"")
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match u32::try_from(v) {
            Ok(mode) if mode <= 0o7777 => Ok(mode),
            _ => Err(E::invalid_value(de::Unexpected::Unsigned(v), &self)),
        }
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match u64::try_from(v) {
            Ok(v) => self.visit_u64(v),
            Err(_) => Err(E::invalid_value(de::Unexpected::Signed(v), &self)),
        }
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        let digits = v.strip_prefix("0o").unwrap_or(v);
        match u32::from_str_radix(digits, 8) {
            Ok(mode) => self.visit_u64(mode.into()),
            Err(_) => Err(E::invalid_value(de::Unexpected::Str(v), &self)),
        }
    }
}

fn deserialize_mode<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    deserializer.deserialize_any(ModeVisitor)
}
