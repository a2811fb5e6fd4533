//! Cache configuration structures.
//!
//! Mirrors the external configuration surface (`shouldDecompressImages`,
//! `maxAge`, `maxMemoryCost`, ...) as two builder-pattern structs plus a
//! live-update channel for the memory tier's limits.

use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use tokio::sync::watch;

/// Read strategy for disk tier payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DiskReadOptions {
    /// Read the whole file into a buffer.
    #[default]
    Buffered,
    /// Memory-map the file where the platform supports it. Falls back to
    /// a buffered read for files too small to be worth mapping.
    MemoryMapped,
}

/// Live-updatable limits for [`crate::memory_store::MemoryStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStoreLimits {
    /// Maximum total cost of resident entries. `0` means unbounded.
    pub max_cost: u64,
    /// Maximum number of resident entries. `0` means unbounded.
    pub max_count: u64,
}

impl Default for MemoryStoreLimits {
    fn default() -> Self {
        Self {
            max_cost: 0,
            max_count: 0,
        }
    }
}

/// In-memory tier configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStoreConfig {
    /// Eviction limits.
    pub limits: MemoryStoreLimits,
    /// How often the background trim pass runs, in seconds.
    pub auto_trim_interval: Duration,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            limits: MemoryStoreLimits::default(),
            auto_trim_interval: Duration::from_secs_f64(5.0),
        }
    }
}

impl MemoryStoreConfig {
    /// Creates a default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum total cost, in whatever unit the caller's
    /// [`crate::decoder::Decoder`] reports (`0` = unbounded).
    #[must_use]
    pub fn with_max_cost(mut self, max_cost: u64) -> Self {
        self.limits.max_cost = max_cost;
        self
    }

    /// Sets the maximum entry count (`0` = unbounded).
    #[must_use]
    pub fn with_max_count(mut self, max_count: u64) -> Self {
        self.limits.max_count = max_count;
        self
    }

    /// Sets the periodic trim interval.
    #[must_use]
    pub fn with_auto_trim_interval(mut self, interval: Duration) -> Self {
        self.auto_trim_interval = interval;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error message if `auto_trim_interval` is zero.
    pub fn validate(&self) -> Result<(), String> {
        if self.auto_trim_interval.is_zero() {
            return Err("auto_trim_interval must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Creates a [`watch`] channel pre-loaded with this configuration's
    /// limits, for subscribing [`crate::memory_store::MemoryStore`] to live
    /// updates.
    #[must_use]
    pub fn watch_channel(&self) -> (watch::Sender<MemoryStoreLimits>, watch::Receiver<MemoryStoreLimits>) {
        watch::channel(self.limits)
    }
}

/// Disk tier configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskStoreConfig {
    /// Root directory under which the namespace subdirectory is created.
    pub root_dir: PathBuf,
    /// Namespace subdirectory, e.g. `"images"`.
    pub namespace: String,
    /// Maximum age before a file becomes eligible for cleanup.
    pub max_age: Duration,
    /// Maximum total bytes before the oldest files are evicted (`0` =
    /// unbounded).
    pub max_size: u64,
    /// Read strategy.
    pub read_options: DiskReadOptions,
    /// Whether written files should be marked excluded from device backups.
    pub should_disable_backup: bool,
    /// How often the background cleanup task runs.
    pub cleanup_interval: Duration,
}

impl Default for DiskStoreConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("cache"),
            namespace: "default".to_string(),
            max_age: Duration::from_secs(7 * 24 * 3600),
            max_size: 0,
            read_options: DiskReadOptions::default(),
            should_disable_backup: true,
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

impl DiskStoreConfig {
    /// Creates a default configuration rooted at `root_dir`.
    #[must_use]
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Self::default()
        }
    }

    /// Sets the namespace subdirectory.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the maximum file age.
    #[must_use]
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Sets the maximum total size in bytes (`0` = unbounded).
    #[must_use]
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    /// Sets the read strategy.
    #[must_use]
    pub fn with_read_options(mut self, read_options: DiskReadOptions) -> Self {
        self.read_options = read_options;
        self
    }

    /// The directory this store reads and writes under:
    /// `{root_dir}/{namespace}`.
    #[must_use]
    pub fn namespace_dir(&self) -> PathBuf {
        self.root_dir.join(&self.namespace)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error message if `namespace` is empty or
    /// `cleanup_interval` is zero.
    pub fn validate(&self) -> Result<(), String> {
        if self.namespace.is_empty() {
            return Err("namespace must not be empty".to_string());
        }
        if self.cleanup_interval.is_zero() {
            return Err("cleanup_interval must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Top-level configuration combining both tiers and the loader-wide
/// defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Memory tier configuration.
    pub memory: MemoryStoreConfig,
    /// Disk tier configuration.
    pub disk: DiskStoreConfig,
    /// Whether decoders should decompress/decode images eagerly on store.
    pub should_decompress_images: bool,
    /// Whether completed downloads are persisted to the memory tier.
    pub should_cache_in_memory: bool,
    /// Maximum number of concurrent downloads.
    pub max_concurrent_downloads: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory: MemoryStoreConfig::default(),
            disk: DiskStoreConfig::default(),
            should_decompress_images: true,
            should_cache_in_memory: true,
            max_concurrent_downloads: 2,
        }
    }
}

impl CacheConfig {
    /// Creates a default configuration rooted at `root_dir` for the disk
    /// tier.
    #[must_use]
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            disk: DiskStoreConfig::new(root_dir),
            ..Self::default()
        }
    }

    /// Validates both tier configurations.
    ///
    /// # Errors
    ///
    /// Returns the first validation error encountered.
    pub fn validate(&self) -> Result<(), String> {
        self.memory.validate()?;
        self.disk.validate()?;
        if self.max_concurrent_downloads == 0 {
            return Err("max_concurrent_downloads must be greater than 0".to_string());
        }
        Ok(())
    }
}
