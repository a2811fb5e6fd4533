//! End-to-end load orchestration: memory, then disk, then network.

use crate::{
    config::CacheConfig,
    decoder::Decoder,
    disk_store::DiskStore,
    downloader::{CompletionCallback as DownloadCompletion, DownloadPriority, Downloader},
    error::ImageCacheError,
    fetcher::{FetchOptions, ProgressCallback},
    handle::OperationHandle,
    image::CachedImage,
    key::CacheKey,
    memory_store::MemoryStore,
};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::Url;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use tracing::{debug, warn};

/// Which tier (if any) satisfied a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheType {
    /// Served from the network (not previously cached).
    None,
    /// Served from the disk tier.
    Disk,
    /// Served from the memory tier.
    Memory,
}

/// The independent option bits a caller can set on a load.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Bypass the blacklist for this URL.
    pub retry_failed: bool,
    /// Queue this download at the back of the downloader's pool.
    pub low_priority: bool,
    /// Queue this download at the front of the downloader's pool.
    pub high_priority: bool,
    /// Do not persist a successful download to the disk tier.
    pub cache_memory_only: bool,
    /// Deliver partial decoded frames during download (decoder-dependent;
    /// the passthrough decoder ignores this).
    pub progressive_load: bool,
    /// Deliver a cached hit as a preview, then still perform the network
    /// fetch.
    pub refresh_cached: bool,
    /// Request a best-effort background-execution wrapper around the
    /// fetch (platform-specific; a no-op in this core).
    pub continue_in_background: bool,
    /// Allow cookies on the HTTP request.
    pub handle_cookies: bool,
    /// Skip TLS certificate validation (diagnostic only).
    pub allow_invalid_ssl_certificates: bool,
    /// The caller takes over image installation; the manager still
    /// delivers the result, it just documents the caller's intent.
    pub avoid_auto_set_image: bool,
}

impl LoadOptions {
    fn to_fetch_options(self) -> FetchOptions {
        FetchOptions {
            handle_cookies: self.handle_cookies,
            allow_invalid_ssl_certificates: self.allow_invalid_ssl_certificates,
        }
    }

    /// Maps the two priority flags to a [`DownloadPriority`]. `high_priority`
    /// wins if both are set, since "jump the queue" is a stronger request
    /// than "don't".
    fn download_priority(self) -> DownloadPriority {
        if self.high_priority {
            DownloadPriority::High
        } else if self.low_priority {
            DownloadPriority::Low
        } else {
            DownloadPriority::Normal
        }
    }
}

/// One delivery of a load's outcome. A single request may deliver this
/// twice: once as a `finished = false` preview (only under
/// [`LoadOptions::refresh_cached`]), then once more with `finished = true`.
#[derive(Debug, Clone)]
pub struct LoadResult {
    /// The decoded image, if any tier or the network produced one.
    pub image: Option<CachedImage>,
    /// The raw encoded bytes backing `image`.
    pub data: Option<Bytes>,
    /// The error, if this delivery represents a failure.
    pub error: Option<Arc<ImageCacheError>>,
    /// Which tier (if any) satisfied this delivery.
    pub cache_type: CacheType,
    /// Whether this is the terminal delivery for the request.
    pub finished: bool,
    /// The URL this result is for, as originally supplied to
    /// [`Manager::load_image`]. A `String` rather than a [`Url`] because an
    /// [`ImageCacheError::InvalidInput`] delivery may not have parsed to one.
    pub url: String,
}

/// Completion callback for [`Manager::load_image`].
pub type LoadCompletionCallback = Arc<dyn Fn(&LoadResult) + Send + Sync>;

/// Presence of a URL across both tiers, per [`Manager::is_cached`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheState {
    /// Resident in the memory tier.
    pub in_memory: bool,
    /// Present on disk.
    pub on_disk: bool,
}

/// End-to-end orchestrator: memory -> disk -> network, with cancellation,
/// coalescing (via [`Downloader`]), and a non-retriable-failure blacklist.
pub struct Manager {
    memory: Arc<MemoryStore>,
    disk: Arc<DiskStore>,
    downloader: Arc<Downloader>,
    decoder: Arc<dyn Decoder>,
    blacklist: Arc<DashMap<Url, Arc<ImageCacheError>>>,
    in_flight: Arc<DashMap<u64, OperationHandle>>,
    next_request_id: AtomicU64,
    should_cache_in_memory: bool,
}

impl Manager {
    /// Builds a manager over fresh memory/disk tiers and a downloader,
    /// configured per `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the disk tier's root directory cannot be
    /// created.
    pub fn new(config: CacheConfig, decoder: Arc<dyn Decoder>) -> crate::error::Result<Self> {
        let (_tx, limits_rx) = config.memory.watch_channel();
        let memory = Arc::new(MemoryStore::with_live_limits(
            limits_rx,
            config.memory.auto_trim_interval,
        ));
        let disk = Arc::new(DiskStore::new(config.disk)?.with_background_cleanup());
        let downloader = Arc::new(Downloader::new(config.max_concurrent_downloads));

        Ok(Self {
            memory,
            disk,
            downloader,
            decoder,
            blacklist: Arc::new(DashMap::new()),
            in_flight: Arc::new(DashMap::new()),
            next_request_id: AtomicU64::new(0),
            should_cache_in_memory: config.should_cache_in_memory,
        })
    }

    /// Reports whether `url` is resident in either tier, without promoting
    /// either tier's recency order and without triggering a download.
    #[must_use]
    pub async fn is_cached(&self, url: &Url) -> CacheState {
        let key = CacheKey::from_url(url.as_str());
        CacheState {
            in_memory: self.memory.contains(&key),
            on_disk: self.disk.contains(&key),
        }
    }

    /// Cancels every in-flight request and clears the blacklist.
    pub fn cancel_all(&self) {
        for entry in self.in_flight.iter() {
            entry.value().cancel();
        }
        self.in_flight.clear();
        self.blacklist.clear();
    }

    /// Loads `url`, consulting the memory tier, then the disk tier, then
    /// the network, in that order, per the ordered tie-break algorithm.
    ///
    /// A null/empty `url`, or one that fails to parse, is rejected
    /// synchronously: `completion` fires once, before this call returns,
    /// with [`ImageCacheError::InvalidInput`], `finished = true`, and
    /// `cache_type = CacheType::None`; the returned handle is an inert
    /// no-op (there is nothing in flight to cancel).
    ///
    /// Otherwise returns immediately with a cancellable handle; `completion`
    /// is invoked asynchronously, possibly twice (a `refresh_cached` preview
    /// followed by the final result).
    pub fn load_image(
        &self,
        url: impl AsRef<str>,
        options: LoadOptions,
        completion: LoadCompletionCallback,
        progress: Option<ProgressCallback>,
    ) -> OperationHandle {
        let raw_url = url.as_ref();
        if raw_url.is_empty() {
            completion(&LoadResult {
                image: None,
                data: None,
                error: Some(Arc::new(ImageCacheError::InvalidInput("empty url".to_string()))),
                cache_type: CacheType::None,
                finished: true,
                url: raw_url.to_string(),
            });
            return OperationHandle::noop();
        }
        let url = match Url::parse(raw_url) {
            Ok(url) => url,
            Err(err) => {
                completion(&LoadResult {
                    image: None,
                    data: None,
                    error: Some(Arc::new(ImageCacheError::InvalidInput(err.to_string()))),
                    cache_type: CacheType::None,
                    finished: true,
                    url: raw_url.to_string(),
                });
                return OperationHandle::noop();
            }
        };

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let inner_download_handle: Arc<Mutex<Option<OperationHandle>>> = Arc::new(Mutex::new(None));

        let in_flight = Arc::clone(&self.in_flight);
        let handle = OperationHandle::new({
            let cancel_flag = Arc::clone(&cancel_flag);
            let inner_download_handle = Arc::clone(&inner_download_handle);
            move || {
                cancel_flag.store(true, Ordering::SeqCst);
                if let Some(inner) = inner_download_handle.lock().as_ref() {
                    inner.cancel();
                }
            }
        });
        self.in_flight.insert(request_id, handle.clone());

        let memory = Arc::clone(&self.memory);
        let disk = Arc::clone(&self.disk);
        let downloader = Arc::clone(&self.downloader);
        let decoder = Arc::clone(&self.decoder);
        let blacklist = Arc::clone(&self.blacklist);
        let should_cache_in_memory = self.should_cache_in_memory;

        tokio::spawn(async move {
            Self::run(
                url,
                options,
                completion,
                progress,
                memory,
                disk,
                downloader,
                decoder,
                blacklist,
                should_cache_in_memory,
                cancel_flag,
                inner_download_handle,
            )
            .await;
            in_flight.remove(&request_id);
        });

        handle
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        url: Url,
        options: LoadOptions,
        completion: LoadCompletionCallback,
        progress: Option<ProgressCallback>,
        memory: Arc<MemoryStore>,
        disk: Arc<DiskStore>,
        downloader: Arc<Downloader>,
        decoder: Arc<dyn Decoder>,
        blacklist: Arc<DashMap<Url, Arc<ImageCacheError>>>,
        should_cache_in_memory: bool,
        cancel_flag: Arc<AtomicBool>,
        inner_download_handle: Arc<Mutex<Option<OperationHandle>>>,
    ) {
        let key = CacheKey::from_url(url.as_str());

        if cancel_flag.load(Ordering::Relaxed) {
            return;
        }

        if !options.retry_failed
            && let Some(err) = blacklist.get(&url).map(|e| Arc::clone(e.value()))
        {
            debug!(url = %url, "blacklisted url, skipping fetch");
            completion(&LoadResult {
                image: None,
                data: None,
                error: Some(err),
                cache_type: CacheType::None,
                finished: true,
                url: url.to_string(),
            });
            return;
        }

        if let Some(image) = memory.get(&key) {
            completion(&LoadResult {
                data: Some(image.encoded.clone()),
                image: Some(image),
                error: None,
                cache_type: CacheType::Memory,
                finished: !options.refresh_cached,
                url: url.to_string(),
            });
            if !options.refresh_cached {
                return;
            }
        } else if let Some(bytes) = disk.get(&key).await {
            match decoder.decode(bytes.clone()).await {
                Ok(image) => {
                    if should_cache_in_memory {
                        memory.put(key.clone(), image.clone(), image.cost());
                    }
                    completion(&LoadResult {
                        data: Some(bytes),
                        image: Some(image),
                        error: None,
                        cache_type: CacheType::Disk,
                        finished: !options.refresh_cached,
                        url: url.to_string(),
                    });
                    if !options.refresh_cached {
                        return;
                    }
                }
                Err(err) => {
                    warn!(url = %url, error = %err, "disk hit failed to decode");
                    completion(&LoadResult {
                        image: None,
                        data: None,
                        error: Some(Arc::new(err)),
                        cache_type: CacheType::Disk,
                        finished: true,
                        url: url.to_string(),
                    });
                    return;
                }
            }
        }

        if cancel_flag.load(Ordering::Relaxed) {
            return;
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let download_completion: DownloadCompletion = Arc::new(move |result| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(match result {
                    Ok(outcome) => Ok(outcome.bytes.clone()),
                    Err(err) => {
                        let status = match err {
                            ImageCacheError::ProtocolFailure { status, .. } => Some(*status),
                            _ => None,
                        };
                        Err((status, err.is_blacklistable(), err.to_string()))
                    }
                });
            }
        });

        let download_handle = downloader.download(
            url.clone(),
            options.to_fetch_options(),
            options.download_priority(),
            progress,
            None,
            Some(download_completion),
        );
        *inner_download_handle.lock() = Some(download_handle);

        let Ok(outcome) = rx.await else {
            // Cancelled: the sender was dropped without sending because
            // this subscriber's completion callback was suppressed.
            return;
        };

        if cancel_flag.load(Ordering::Relaxed) {
            return;
        }

        match outcome {
            Ok(bytes) => match decoder.decode(bytes.clone()).await {
                Ok(image) => {
                    if should_cache_in_memory {
                        memory.put(key.clone(), image.clone(), image.cost());
                    }
                    if !options.cache_memory_only
                        && let Err(err) = disk.put(&key, &bytes).await
                    {
                        warn!(url = %url, error = %err, "failed to persist downloaded image to disk");
                    }
                    completion(&LoadResult {
                        data: Some(bytes),
                        image: Some(image),
                        error: None,
                        cache_type: CacheType::None,
                        finished: true,
                        url: url.to_string(),
                    });
                }
                Err(err) => {
                    completion(&LoadResult {
                        image: None,
                        data: None,
                        error: Some(Arc::new(err)),
                        cache_type: CacheType::None,
                        finished: true,
                        url: url.to_string(),
                    });
                }
            },
            Err((status, is_blacklistable, message)) => {
                let err = Arc::new(match status {
                    Some(status) => ImageCacheError::ProtocolFailure { status, url: url.to_string() },
                    None => ImageCacheError::DecodeFailure(message),
                });
                if is_blacklistable {
                    blacklist.insert(url.clone(), Arc::clone(&err));
                }
                completion(&LoadResult {
                    image: None,
                    data: None,
                    error: Some(err),
                    cache_type: CacheType::None,
                    finished: true,
                    url: url.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::decoder::PassthroughDecoder;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn manager(dir: &TempDir) -> Manager {
        let config = CacheConfig::new(dir.path());
        Manager::new(config, Arc::new(PassthroughDecoder)).expect("manager should build")
    }

    #[tokio::test]
    async fn cold_miss_then_warm_hit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"pixels".to_vec()))
            .mount(&server)
            .await;

        let dir = TempDir::new().expect("tempdir");
        let mgr = manager(&dir);
        let url = Url::parse(&format!("{}/a.png", server.uri())).expect("valid url");

        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let completion: LoadCompletionCallback = Arc::new(move |result| {
            if result.finished
                && let Some(tx) = tx.lock().take()
            {
                let _ = tx.send(result.cache_type);
            }
        });
        mgr.load_image(url.clone(), LoadOptions::default(), completion, None);
        let first_type = rx.await.expect("first load should complete");
        assert_eq!(first_type, CacheType::None);

        let (tx2, rx2) = tokio::sync::oneshot::channel();
        let tx2 = Mutex::new(Some(tx2));
        let completion2: LoadCompletionCallback = Arc::new(move |result| {
            if result.finished
                && let Some(tx2) = tx2.lock().take()
            {
                let _ = tx2.send(result.cache_type);
            }
        });
        mgr.load_image(url, LoadOptions::default(), completion2, None);
        let second_type = rx2.await.expect("second load should complete");
        assert_eq!(second_type, CacheType::Memory);
    }

    #[tokio::test]
    async fn non_retriable_failure_blacklists_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = TempDir::new().expect("tempdir");
        let mgr = manager(&dir);
        let url = Url::parse(&format!("{}/missing.png", server.uri())).expect("valid url");

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let completion: LoadCompletionCallback = Arc::new(move |result| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(());
            }
        });
        mgr.load_image(url.clone(), LoadOptions::default(), completion, None);
        rx.await.expect("first attempt should complete");

        assert!(mgr.blacklist.contains_key(&url));

        let (tx2, rx2) = tokio::sync::oneshot::channel();
        let tx2 = Mutex::new(Some(tx2));
        let completion2: LoadCompletionCallback = Arc::new(move |result| {
            if let Some(tx2) = tx2.lock().take() {
                let _ = tx2.send(result.error.is_some());
            }
        });
        mgr.load_image(url, LoadOptions::default(), completion2, None);
        let had_error = rx2.await.expect("second attempt should complete from blacklist");
        assert!(had_error);
    }

    #[tokio::test]
    async fn empty_url_completes_synchronously_with_invalid_input() {
        let dir = TempDir::new().expect("tempdir");
        let mgr = manager(&dir);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let completion: LoadCompletionCallback = Arc::new(move |result| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
            assert!(result.finished);
            assert_eq!(result.cache_type, CacheType::None);
            match result.error.as_deref() {
                Some(ImageCacheError::InvalidInput(_)) => {}
                other => panic!("expected InvalidInput, got {other:?}"),
            }
        });

        // No task is ever spawned for this: the callback must already have
        // fired by the time `load_image` returns.
        let handle = mgr.load_image("", LoadOptions::default(), completion, None);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        handle.cancel();
    }

    #[tokio::test]
    async fn unparseable_url_completes_synchronously_with_invalid_input() {
        let dir = TempDir::new().expect("tempdir");
        let mgr = manager(&dir);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let completion: LoadCompletionCallback = Arc::new(move |result| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
            match result.error.as_deref() {
                Some(ImageCacheError::InvalidInput(_)) => {}
                other => panic!("expected InvalidInput, got {other:?}"),
            }
        });

        mgr.load_image("not a url", LoadOptions::default(), completion, None);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn is_cached_reports_both_tiers() {
        let dir = TempDir::new().expect("tempdir");
        let mgr = manager(&dir);
        let url = Url::parse("http://h/a.png").expect("valid url");
        let state = mgr.is_cached(&url).await;
        assert!(!state.in_memory);
        assert!(!state.on_disk);
    }

    #[tokio::test]
    async fn cancel_all_clears_blacklist() {
        let dir = TempDir::new().expect("tempdir");
        let mgr = manager(&dir);
        let url = Url::parse("http://h/a.png").expect("valid url");
        mgr.blacklist.insert(
            url,
            Arc::new(ImageCacheError::ProtocolFailure { status: 404, url: "http://h/a.png".to_string() }),
        );
        mgr.cancel_all();
        assert!(mgr.blacklist.is_empty());
    }
}
