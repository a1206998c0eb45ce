//! Configuration of a half-disk hash map, and loading it from TOML or the
//! environment.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default expected number of entries.
pub const DEFAULT_MAP_SIZE: u64 = 1_000_000;

/// Default number of buckets a flush keeps outstanding.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 1024;

/// Settings of one [`HalfDiskHashMap`](crate::HalfDiskHashMap).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HalfDiskHashMapConfig {
    /// Expected maximum number of entries; sizes the bucket count
    pub map_size: u64,
    /// Directory holding metadata, index and data files
    pub store_dir: PathBuf,
    /// Prefix of every file name
    pub store_name: String,
    /// Prefix to migrate from when no files of `store_name` exist
    pub legacy_store_name: Option<String>,
    /// Keep the bucket index in a file instead of memory
    pub prefer_disk_index: bool,
    /// Worker threads of a privately owned flush executor
    pub flush_threads: usize,
    /// Buckets a flush keeps outstanding at once
    pub max_in_flight: usize,
    /// Ignore a saved index and rebuild it from the data files
    pub index_rebuilding_enforced: bool,
}

impl Default for HalfDiskHashMapConfig {
    fn default() -> Self {
        Self {
            map_size: DEFAULT_MAP_SIZE,
            store_dir: PathBuf::new(),
            store_name: String::new(),
            legacy_store_name: None,
            prefer_disk_index: false,
            flush_threads: default_flush_threads(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            index_rebuilding_enforced: false,
        }
    }
}

impl HalfDiskHashMapConfig {
    /// Create a config for the store `store_name` in `store_dir`
    pub fn new(store_dir: impl Into<PathBuf>, store_name: impl Into<String>) -> Self {
        Self {
            store_dir: store_dir.into(),
            store_name: store_name.into(),
            ..Self::default()
        }
    }

    /// Set the expected maximum number of entries
    pub fn with_map_size(mut self, map_size: u64) -> Self {
        self.map_size = map_size;
        self
    }

    /// Set the legacy store name to migrate from
    pub fn with_legacy_store_name(mut self, name: impl Into<String>) -> Self {
        self.legacy_store_name = Some(name.into());
        self
    }

    /// Use a file-backed bucket index
    pub fn with_prefer_disk_index(mut self, prefer: bool) -> Self {
        self.prefer_disk_index = prefer;
        self
    }

    /// Set the flush worker count
    pub fn with_flush_threads(mut self, threads: usize) -> Self {
        self.flush_threads = threads;
        self
    }

    /// Set the in-flight bucket budget of a flush
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    /// Force the bucket index to be rebuilt on open
    pub fn with_index_rebuilding_enforced(mut self, enforced: bool) -> Self {
        self.index_rebuilding_enforced = enforced;
        self
    }

    /// Check the settings before opening a map.
    pub fn validate(&self) -> Result<()> {
        if self.map_size == 0 {
            return Err(Error::invalid_argument("map_size must be positive"));
        }
        validate_store_name("store_name", &self.store_name)?;
        if let Some(legacy) = &self.legacy_store_name {
            validate_store_name("legacy_store_name", legacy)?;
        }
        if self.store_dir.as_os_str().is_empty() {
            return Err(Error::invalid_argument("store_dir must be set"));
        }
        if self.flush_threads == 0 {
            return Err(Error::invalid_argument("flush_threads must be positive"));
        }
        if self.max_in_flight == 0 {
            return Err(Error::invalid_argument("max_in_flight must be positive"));
        }
        Ok(())
    }
}

fn validate_store_name(field: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_argument(format!("{field} must not be empty")));
    }
    if name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(Error::invalid_argument(format!(
            "{field} {name:?} must be a plain file name prefix"
        )));
    }
    Ok(())
}

/// Available parallelism, or 1 if unknown.
pub fn default_flush_threads() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    /// Missing required configuration field.
    #[error("missing required field: {0}")]
    MissingField(String),
}

const ENV_CONFIG_PATH: &str = "HALFDISK_CONFIG";
const ENV_PREFIX: &str = "HALFDISK__";

/// Top-level configuration file schema.
///
/// ```toml
/// [map]
/// store_dir = "/var/lib/store"
/// store_name = "accounts"
/// map_size = 10000000
///
/// [flush]
/// threads = 8
///
/// [index]
/// prefer_disk = true
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Map sizing and location.
    pub map: Option<MapSection>,
    /// Flush pipeline settings.
    pub flush: Option<FlushSection>,
    /// Bucket index settings.
    pub index: Option<IndexSection>,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `HALFDISK_CONFIG` env var (if set),
    /// then apply `HALFDISK__section__field` overrides.
    pub fn load_from_env() -> std::result::Result<Self, ConfigError> {
        let config_path = env::var(ENV_CONFIG_PATH).ok();
        let mut config = match config_path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> std::result::Result<(), ConfigError> {
        for (key, value) in env::vars() {
            let Some(path) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let path = path.to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["map", "map_size"] => {
                    self.map_mut().map_size = Some(parse_value(&key, &value)?);
                }
                ["map", "store_dir"] => {
                    self.map_mut().store_dir = Some(PathBuf::from(value));
                }
                ["map", "store_name"] => {
                    self.map_mut().store_name = Some(value);
                }
                ["map", "legacy_store_name"] => {
                    self.map_mut().legacy_store_name = Some(value);
                }
                ["flush", "threads"] => {
                    self.flush_mut().threads = Some(parse_value(&key, &value)?);
                }
                ["flush", "max_in_flight"] => {
                    self.flush_mut().max_in_flight = Some(parse_value(&key, &value)?);
                }
                ["index", "prefer_disk"] => {
                    self.index_mut().prefer_disk = Some(parse_value(&key, &value)?);
                }
                ["index", "rebuilding_enforced"] => {
                    self.index_mut().rebuilding_enforced = Some(parse_value(&key, &value)?);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }

        Ok(())
    }

    /// Build a map config from defaults plus the loaded settings.
    pub fn to_map_config(&self) -> std::result::Result<HalfDiskHashMapConfig, ConfigError> {
        let map = self
            .map
            .as_ref()
            .ok_or_else(|| ConfigError::MissingField("map".into()))?;
        let store_dir = map
            .store_dir
            .clone()
            .ok_or_else(|| ConfigError::MissingField("map.store_dir".into()))?;
        let store_name = map
            .store_name
            .clone()
            .ok_or_else(|| ConfigError::MissingField("map.store_name".into()))?;

        let mut config = HalfDiskHashMapConfig::new(store_dir, store_name);
        map.apply_to(&mut config)?;
        if let Some(flush) = &self.flush {
            flush.apply_to(&mut config)?;
        }
        if let Some(index) = &self.index {
            index.apply_to(&mut config);
        }
        Ok(config)
    }

    fn map_mut(&mut self) -> &mut MapSection {
        self.map.get_or_insert_with(MapSection::default)
    }

    fn flush_mut(&mut self) -> &mut FlushSection {
        self.flush.get_or_insert_with(FlushSection::default)
    }

    fn index_mut(&mut self) -> &mut IndexSection {
        self.index.get_or_insert_with(IndexSection::default)
    }
}

/// `[map]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MapSection {
    /// Expected maximum number of entries.
    pub map_size: Option<u64>,
    /// Store directory.
    pub store_dir: Option<PathBuf>,
    /// File name prefix.
    pub store_name: Option<String>,
    /// Legacy file name prefix.
    pub legacy_store_name: Option<String>,
}

impl MapSection {
    fn apply_to(&self, config: &mut HalfDiskHashMapConfig) -> std::result::Result<(), ConfigError> {
        if let Some(value) = self.map_size {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "map.map_size".into(),
                    value: value.to_string(),
                });
            }
            config.map_size = value;
        }
        if let Some(value) = &self.legacy_store_name {
            config.legacy_store_name = Some(value.clone());
        }
        Ok(())
    }
}

/// `[flush]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlushSection {
    /// Flush worker threads.
    pub threads: Option<usize>,
    /// In-flight bucket budget.
    pub max_in_flight: Option<usize>,
}

impl FlushSection {
    fn apply_to(&self, config: &mut HalfDiskHashMapConfig) -> std::result::Result<(), ConfigError> {
        if let Some(value) = self.threads {
            config.flush_threads = value.max(1);
        }
        if let Some(value) = self.max_in_flight {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "flush.max_in_flight".into(),
                    value: value.to_string(),
                });
            }
            config.max_in_flight = value;
        }
        Ok(())
    }
}

/// `[index]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexSection {
    /// Use a file-backed index.
    pub prefer_disk: Option<bool>,
    /// Always rebuild the index on open.
    pub rebuilding_enforced: Option<bool>,
}

impl IndexSection {
    fn apply_to(&self, config: &mut HalfDiskHashMapConfig) {
        if let Some(value) = self.prefer_disk {
            config.prefer_disk_index = value;
        }
        if let Some(value) = self.rebuilding_enforced {
            config.index_rebuilding_enforced = value;
        }
    }
}

fn parse_value<T: std::str::FromStr>(
    key: &str,
    value: &str,
) -> std::result::Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
