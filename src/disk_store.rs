//! Content-addressed disk cache tier.
//!
//! Files live at `{root_dir}/{namespace}/{CacheKey}`; the filesystem is the
//! index; there is no separate manifest. Writes go through a single-permit
//! semaphore so mutations and directory scans serialize against each other,
//! while reads share a separate, higher-permit semaphore so concurrent
//! reads do not block on each other.

use crate::{
    config::{DiskReadOptions, DiskStoreConfig},
    error::Result,
    key::CacheKey,
    stats::AtomicCacheMetrics,
};
use bytes::Bytes;
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::{sync::Semaphore, task::JoinHandle, time::interval};
use tracing::{debug, warn};

const READ_PERMITS: usize = 16;

/// Below this size, mapping the file costs more than just reading it.
const MIN_MMAP_SIZE: u64 = 16 * 1024;

/// Marks a file as excluded from platform device backups.
///
/// The concrete mechanism (e.g. a filesystem extended attribute) is
/// platform-specific and out of scope for this crate; the default
/// implementation is a no-op, and callers on a given platform supply a real
/// implementation.
pub trait BackupExclusion: Send + Sync {
    /// Marks `path` as excluded from backups. Best-effort: failures are
    /// logged, not propagated, since the file has already been written
    /// successfully.
    fn exclude(&self, path: &Path);
}

/// The default [`BackupExclusion`]: does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackupExclusion;

impl BackupExclusion for NoBackupExclusion {
    fn exclude(&self, _path: &Path) {}
}

/// Content-addressed, file-backed cache tier.
pub struct DiskStore {
    config: DiskStoreConfig,
    write_semaphore: Arc<Semaphore>,
    read_semaphore: Arc<Semaphore>,
    backup_exclusion: Arc<dyn BackupExclusion>,
    metrics: Arc<AtomicCacheMetrics>,
    cleanup_handle: Option<JoinHandle<()>>,
}

impl DiskStore {
    /// Creates a store rooted at `config.namespace_dir()`, creating the
    /// directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace directory cannot be created.
    pub fn new(config: DiskStoreConfig) -> Result<Self> {
        fs::create_dir_all(config.namespace_dir())?;
        Ok(Self {
            config,
            write_semaphore: Arc::new(Semaphore::new(1)),
            read_semaphore: Arc::new(Semaphore::new(READ_PERMITS)),
            backup_exclusion: Arc::new(NoBackupExclusion),
            metrics: Arc::new(AtomicCacheMetrics::new()),
            cleanup_handle: None,
        })
    }

    /// Swaps in a platform-specific [`BackupExclusion`].
    #[must_use]
    pub fn with_backup_exclusion(mut self, backup_exclusion: Arc<dyn BackupExclusion>) -> Self {
        self.backup_exclusion = backup_exclusion;
        self
    }

    /// Starts the background cleanup task (age cutoff then size cutoff, on
    /// `config.cleanup_interval`).
    #[must_use]
    pub fn with_background_cleanup(mut self) -> Self {
        let interval_period = self.config.cleanup_interval;
        if interval_period > Duration::ZERO {
            let config = self.config.clone();
            let write_semaphore = Arc::clone(&self.write_semaphore);
            let metrics = Arc::clone(&self.metrics);

            let handle = tokio::spawn(async move {
                let mut ticker = interval(interval_period);
                loop {
                    ticker.tick().await;
                    let _permit = write_semaphore.acquire().await;
                    if let Err(err) = Self::cleanup_sync(&config, &metrics) {
                        warn!(error = %err, "disk store cleanup failed");
                    }
                }
            });
            self.cleanup_handle = Some(handle);
        }
        self
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.config.namespace_dir().join(key.as_hex())
    }

    /// Reads `path` per the configured [`DiskReadOptions`]: memory-mapped
    /// when requested and the file is large enough to be worth mapping,
    /// buffered otherwise.
    fn read_via_strategy(path: &Path, strategy: DiskReadOptions) -> std::io::Result<Bytes> {
        if strategy == DiskReadOptions::MemoryMapped {
            let file = fs::File::open(path)?;
            if file.metadata()?.len() >= MIN_MMAP_SIZE {
                // SAFETY: this path is only ever written by `put`'s
                // temp-file-then-rename sequence, so the mapped file is
                // never truncated or modified in place while mapped.
                #[allow(unsafe_code)]
                let mmap = unsafe { memmap2::Mmap::map(&file)? };
                return Ok(Bytes::copy_from_slice(&mmap));
            }
        }
        fs::read(path).map(Bytes::from)
    }

    /// Reads the bytes stored under `key`.
    ///
    /// I/O errors (missing file, permission denied, corruption) are
    /// swallowed and reported as a miss rather than propagated, per the
    /// disk-tier error-propagation policy: the caller's recovery path is a
    /// network re-fetch, not error handling.
    pub async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let _permit = self.read_semaphore.acquire().await.ok()?;
        let path = self.path_for(key);
        match Self::read_via_strategy(&path, self.config.read_options) {
            Ok(bytes) => {
                self.metrics.record_get(true);
                Some(bytes)
            }
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "disk store read failed, treating as miss");
                }
                self.metrics.record_get(false);
                None
            }
        }
    }

    /// Checks presence without reading the file's contents.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.path_for(key).is_file()
    }

    /// Writes `bytes` under `key` atomically (temp file + rename).
    ///
    /// # Errors
    ///
    /// Returns an error if the temp file cannot be written or the rename
    /// fails.
    pub async fn put(&self, key: &CacheKey, bytes: &Bytes) -> Result<()> {
        let _permit = self.write_semaphore.acquire().await;
        let path = self.path_for(key);
        let temp_path = path.with_extension("tmp");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)?;
            file.write_all(bytes)?;
            file.flush()?;

            #[cfg(unix)]
            {
                use std::os::unix::io::AsRawFd;
                // SAFETY: `file` is a valid, open file descriptor for the
                // duration of this call.
                #[allow(unsafe_code)]
                unsafe {
                    libc::fsync(file.as_raw_fd());
                }
            }
        }

        fs::rename(&temp_path, &path)?;

        if self.config.should_disable_backup {
            self.backup_exclusion.exclude(&path);
        }

        self.metrics.record_put(i64::try_from(bytes.len()).unwrap_or(i64::MAX), true);
        debug!(key = %key, bytes = bytes.len(), "disk store wrote entry");
        Ok(())
    }

    /// Deletes the file for `key`. A no-op if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error for any failure other than "not found".
    pub async fn remove(&self, key: &CacheKey) -> Result<()> {
        let _permit = self.write_semaphore.acquire().await;
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => {
                self.metrics.record_remove(0, false);
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Deletes the namespace directory and recreates it empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be removed or recreated.
    pub async fn clear(&self) -> Result<()> {
        let _permit = self.write_semaphore.acquire().await;
        let dir = self.config.namespace_dir();
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        self.metrics.reset_residency();
        Ok(())
    }

    /// Runs one cleanup pass: deletes files older than `max_age`, then, if
    /// the remaining total size still exceeds `max_size` (0 = unbounded),
    /// deletes oldest-mtime-first until under the cap.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace directory cannot be scanned.
    pub async fn cleanup(&self) -> Result<()> {
        let _permit = self.write_semaphore.acquire().await;
        Self::cleanup_sync(&self.config, &self.metrics)
    }

    fn cleanup_sync(config: &DiskStoreConfig, metrics: &AtomicCacheMetrics) -> Result<()> {
        let dir = config.namespace_dir();
        if !dir.exists() {
            return Ok(());
        }

        let now = SystemTime::now();
        let mut entries: Vec<(PathBuf, SystemTime, u64)> = Vec::new();

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "tmp") {
                continue;
            }
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().unwrap_or(now);
            entries.push((path, modified, metadata.len()));
        }

        entries.retain(|(path, modified, size)| {
            let age = now.duration_since(*modified).unwrap_or(Duration::ZERO);
            if age > config.max_age {
                if fs::remove_file(path).is_ok() {
                    metrics.record_remove(usize::try_from(*size).unwrap_or(usize::MAX), true);
                    debug!(path = %path.display(), "disk store cleanup removed aged-out entry");
                }
                false
            } else {
                true
            }
        });

        if config.max_size > 0 {
            let mut total: u64 = entries.iter().map(|(_, _, size)| size).sum();
            if total > config.max_size {
                entries.sort_by_key(|(_, modified, _)| *modified);
                for (path, _, size) in entries {
                    if total <= config.max_size {
                        break;
                    }
                    if fs::remove_file(&path).is_ok() {
                        total = total.saturating_sub(size);
                        metrics.record_remove(usize::try_from(size).unwrap_or(usize::MAX), true);
                        debug!(path = %path.display(), "disk store cleanup removed over-size-cap entry");
                    }
                }
            }
        }

        Ok(())
    }
}

impl Drop for DiskStore {
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup_handle.take() {
            handle.abort();
        }
    }
}
