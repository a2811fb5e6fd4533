//! Bounded-concurrency download pool with per-URL request coalescing.
//!
//! Multiple subscribers for the same URL share one [`Fetcher`]. The bucket
//! protocol follows the one in the crate's design notes: a fine-grained,
//! per-URL lock (rather than one global lock) guards subscriber list
//! mutation, and terminal completion snapshots the subscriber list, removes
//! the bucket, *then* fans the result out — in that order — so a late
//! subscriber arriving between removal and fan-out gets a fresh bucket
//! instead of a stale completion.
//!
//! Fetches beyond `max_concurrent` queue rather than racing a shared
//! semaphore directly: a single dispatcher task drains three priority
//! classes (high, normal, low) front-to-back within a class and
//! high-before-normal-before-low across classes, so [`DownloadPriority`]
//! actually governs queue order instead of being decorative.

use crate::{
    error::Result,
    fetcher::{FetchOptions, FetchOutcome, Fetcher, ProgressCallback, RedirectCallback},
    handle::OperationHandle,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::Url;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{broadcast, Notify, Semaphore},
    task::JoinHandle,
};
use tracing::info;

/// Completion callback for one subscriber's download.
///
/// Takes a shared handle to the result rather than an owned value since one
/// outcome fans out to every subscriber of a coalesced URL.
pub type CompletionCallback = Arc<dyn Fn(&Result<FetchOutcome>) + Send + Sync>;

/// Where a fetch is placed in the downloader's queue relative to other
/// fetches waiting for a concurrency permit. Has no effect once a fetch has
/// started; it only governs dispatch order among queued work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadPriority {
    /// Dispatched after every `Normal`/`High` job ahead of it in the queue.
    Low,
    /// Dispatched in submission order relative to other `Normal` jobs.
    #[default]
    Normal,
    /// Dispatched before every `Normal`/`Low` job in the queue, but after
    /// `High` jobs submitted earlier.
    High,
}

#[derive(Clone)]
struct Subscriber {
    id: u64,
    progress: Option<ProgressCallback>,
    redirect: Option<RedirectCallback>,
    completion: Option<CompletionCallback>,
    cancel_flag: Arc<AtomicBool>,
}

enum FetchState {
    /// Sitting in the queue, not yet granted a concurrency permit.
    Queued,
    /// Dispatched; the handle lets cancellation abort the transfer.
    Running(JoinHandle<()>),
}

struct Bucket {
    subscribers: Vec<Subscriber>,
    state: FetchState,
}

struct QueuedJob {
    url: Url,
    options: FetchOptions,
}

/// Pool of bounded concurrent [`Fetcher`]s with per-URL coalescing.
pub struct Downloader {
    buckets: Arc<DashMap<Url, Arc<Mutex<Bucket>>>>,
    high: Arc<Mutex<VecDeque<QueuedJob>>>,
    normal: Arc<Mutex<VecDeque<QueuedJob>>>,
    low: Arc<Mutex<VecDeque<QueuedJob>>>,
    queue_signal: Arc<Notify>,
    semaphore: Arc<Semaphore>,
    next_id: AtomicU64,
    start_tx: broadcast::Sender<Url>,
    stop_tx: broadcast::Sender<Url>,
    dispatcher_handle: JoinHandle<()>,
}

impl Downloader {
    /// Creates a downloader allowing `max_concurrent` simultaneous
    /// transfers (default 2 per the external configuration contract).
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        let (start_tx, _) = broadcast::channel(64);
        let (stop_tx, _) = broadcast::channel(64);

        let buckets: Arc<DashMap<Url, Arc<Mutex<Bucket>>>> = Arc::new(DashMap::new());
        let high: Arc<Mutex<VecDeque<QueuedJob>>> = Arc::new(Mutex::new(VecDeque::new()));
        let normal: Arc<Mutex<VecDeque<QueuedJob>>> = Arc::new(Mutex::new(VecDeque::new()));
        let low: Arc<Mutex<VecDeque<QueuedJob>>> = Arc::new(Mutex::new(VecDeque::new()));
        let queue_signal = Arc::new(Notify::new());
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));

        let dispatcher_handle = Self::spawn_dispatcher(
            Arc::clone(&buckets),
            Arc::clone(&high),
            Arc::clone(&normal),
            Arc::clone(&low),
            Arc::clone(&queue_signal),
            Arc::clone(&semaphore),
            start_tx.clone(),
            stop_tx.clone(),
        );

        Self {
            buckets,
            high,
            normal,
            low,
            queue_signal,
            semaphore,
            next_id: AtomicU64::new(0),
            start_tx,
            stop_tx,
            dispatcher_handle,
        }
    }

    /// Subscribes to "download started" notifications (one per URL, the
    /// first time it begins transferring).
    #[must_use]
    pub fn subscribe_start(&self) -> broadcast::Receiver<Url> {
        self.start_tx.subscribe()
    }

    /// Subscribes to "download stopped" notifications (one per URL, on its
    /// terminal event).
    #[must_use]
    pub fn subscribe_stop(&self) -> broadcast::Receiver<Url> {
        self.stop_tx.subscribe()
    }

    /// Grows the concurrency limit by `additional` permits.
    ///
    /// Tokio's semaphore cannot be shrunk without first acquiring and
    /// forgetting outstanding permits, so only growth is supported here;
    /// shrinking takes effect gradually as in-flight transfers complete and
    /// their permits are not replaced (not implemented — the common case is
    /// raising the limit, not lowering it).
    pub fn increase_max_concurrent(&self, additional: usize) {
        self.semaphore.add_permits(additional);
    }

    /// Subscribes to `url`, returning a cancellable handle.
    ///
    /// If no transfer is currently in flight for `url`, queues one at
    /// `priority`. If one is already queued or running, attaches to it — the
    /// new subscriber shares the existing [`Fetcher`] and receives
    /// progress/redirect/completion callbacks alongside every other
    /// subscriber, and `priority` is ignored (the job's place in the queue
    /// was already decided by its first subscriber).
    pub fn download(
        &self,
        url: Url,
        options: FetchOptions,
        priority: DownloadPriority,
        progress: Option<ProgressCallback>,
        redirect: Option<RedirectCallback>,
        completion: Option<CompletionCallback>,
    ) -> OperationHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel_flag = Arc::new(AtomicBool::new(false));

        let subscriber = Subscriber {
            id,
            progress,
            redirect,
            completion,
            cancel_flag: Arc::clone(&cancel_flag),
        };

        // Barrier-sync creation/append: `entry()` takes DashMap's exclusive
        // per-shard lock, so bucket creation and the subsequent subscriber
        // push are not interleaved with another caller's append for the
        // same URL.
        let bucket_arc = Arc::clone(
            self.buckets
                .entry(url.clone())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Bucket {
                        subscribers: Vec::new(),
                        state: FetchState::Queued,
                    }))
                })
                .value(),
        );

        let is_first = {
            let mut bucket = bucket_arc.lock();
            let first = bucket.subscribers.is_empty();
            bucket.subscribers.push(subscriber);
            first
        };

        if is_first {
            let job = QueuedJob { url: url.clone(), options };
            match priority {
                DownloadPriority::High => self.high.lock().push_back(job),
                DownloadPriority::Normal => self.normal.lock().push_back(job),
                DownloadPriority::Low => self.low.lock().push_back(job),
            }
            self.queue_signal.notify_one();
        }

        let buckets = Arc::clone(&self.buckets);
        let high = Arc::clone(&self.high);
        let normal = Arc::clone(&self.normal);
        let low = Arc::clone(&self.low);
        let bucket_arc_for_cancel = Arc::clone(&bucket_arc);
        let url_for_cancel = url.clone();

        OperationHandle::new(move || {
            cancel_flag.store(true, Ordering::SeqCst);
            let last_subscriber_left = {
                let mut bucket = bucket_arc_for_cancel.lock();
                bucket.subscribers.retain(|s| s.id != id);
                bucket.subscribers.is_empty()
            };
            if last_subscriber_left {
                let mut bucket = bucket_arc_for_cancel.lock();
                match std::mem::replace(&mut bucket.state, FetchState::Queued) {
                    FetchState::Running(handle) => handle.abort(),
                    FetchState::Queued => {
                        remove_queued_job(&high, &url_for_cancel);
                        remove_queued_job(&normal, &url_for_cancel);
                        remove_queued_job(&low, &url_for_cancel);
                    }
                }
                drop(bucket);
                buckets.remove(&url_for_cancel);
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_dispatcher(
        buckets: Arc<DashMap<Url, Arc<Mutex<Bucket>>>>,
        high: Arc<Mutex<VecDeque<QueuedJob>>>,
        normal: Arc<Mutex<VecDeque<QueuedJob>>>,
        low: Arc<Mutex<VecDeque<QueuedJob>>>,
        queue_signal: Arc<Notify>,
        semaphore: Arc<Semaphore>,
        start_tx: broadcast::Sender<Url>,
        stop_tx: broadcast::Sender<Url>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    return;
                };

                let job = Self::pop_next_job(&high, &normal, &low);
                let Some(job) = job else {
                    drop(permit);
                    queue_signal.notified().await;
                    continue;
                };

                // The subscriber that queued this job may have cancelled
                // (and removed the bucket) between enqueue and dispatch.
                let Some(entry) = buckets.get(&job.url) else {
                    drop(permit);
                    continue;
                };
                let bucket_arc = Arc::clone(entry.value());
                drop(entry);

                let fetch_handle = Self::spawn_fetch(
                    job.url.clone(),
                    job.options,
                    Arc::clone(&buckets),
                    permit,
                    start_tx.clone(),
                    stop_tx.clone(),
                );
                bucket_arc.lock().state = FetchState::Running(fetch_handle);
            }
        })
    }

    fn pop_next_job(
        high: &Mutex<VecDeque<QueuedJob>>,
        normal: &Mutex<VecDeque<QueuedJob>>,
        low: &Mutex<VecDeque<QueuedJob>>,
    ) -> Option<QueuedJob> {
        if let Some(job) = high.lock().pop_front() {
            return Some(job);
        }
        if let Some(job) = normal.lock().pop_front() {
            return Some(job);
        }
        low.lock().pop_front()
    }

    fn spawn_fetch(
        url: Url,
        options: FetchOptions,
        buckets: Arc<DashMap<Url, Arc<Mutex<Bucket>>>>,
        permit: tokio::sync::OwnedSemaphorePermit,
        start_tx: broadcast::Sender<Url>,
        stop_tx: broadcast::Sender<Url>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let _permit = permit;
            let _ = start_tx.send(url.clone());
            info!(url = %url, "downloader starting transfer");

            let progress_cb: ProgressCallback = {
                let buckets = Arc::clone(&buckets);
                let url = url.clone();
                Arc::new(move |received, total| {
                    broadcast_progress(&buckets, &url, received, total);
                })
            };

            let redirect_cb: RedirectCallback = {
                let buckets = Arc::clone(&buckets);
                let url = url.clone();
                Arc::new(move |new_url| broadcast_redirect(&buckets, &url, new_url))
            };

            let fetcher = Fetcher::new(url.clone(), options);
            let result = fetcher.run(Some(progress_cb), Some(redirect_cb)).await;

            // snapshot -> remove -> fan-out, in that exact order.
            let snapshot = buckets
                .get(&url)
                .map(|entry| entry.value().lock().subscribers.clone());
            buckets.remove(&url);

            if let Some(subscribers) = snapshot {
                for sub in subscribers {
                    if sub.cancel_flag.load(Ordering::Relaxed) {
                        continue;
                    }
                    if let Some(cb) = &sub.completion {
                        cb(&result);
                    }
                }
            }

            let _ = stop_tx.send(url);
        })
    }
}

fn remove_queued_job(queue: &Mutex<VecDeque<QueuedJob>>, url: &Url) {
    queue.lock().retain(|job| job.url != *url);
}

fn broadcast_progress(buckets: &DashMap<Url, Arc<Mutex<Bucket>>>, url: &Url, received: u64, total: i64) {
    let Some(entry) = buckets.get(url) else {
        return;
    };
    let bucket = entry.value().lock();
    for sub in &bucket.subscribers {
        if sub.cancel_flag.load(Ordering::Relaxed) {
            continue;
        }
        if let Some(cb) = &sub.progress {
            cb(received, total);
        }
    }
}

fn broadcast_redirect(buckets: &DashMap<Url, Arc<Mutex<Bucket>>>, url: &Url, new_url: &Url) -> bool {
    let Some(entry) = buckets.get(url) else {
        return true;
    };
    let bucket = entry.value().lock();
    for sub in &bucket.subscribers {
        if sub.cancel_flag.load(Ordering::Relaxed) {
            continue;
        }
        if let Some(cb) = &sub.redirect
            && !cb(new_url)
        {
            return false;
        }
    }
    true
}

impl Drop for Downloader {
    fn drop(&mut self) {
        self.dispatcher_handle.abort();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    #[tokio::test]
    async fn single_subscriber_receives_completion() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"pixels".to_vec()))
            .mount(&server)
            .await;

        let downloader = Downloader::new(2);
        let url = Url::parse(&format!("{}/a.png", server.uri())).expect("valid url");

        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let completion: CompletionCallback = Arc::new(move |result| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(result.is_ok());
            }
        });

        let _handle = downloader.download(url, FetchOptions::default(), DownloadPriority::default(), None, None, Some(completion));
        let ok = rx.await.expect("completion should fire");
        assert!(ok);
    }

    #[tokio::test]
    async fn concurrent_subscribers_for_same_url_share_one_fetcher() {
        let server = MockServer::start().await;
        let hit_count = Arc::new(AtomicUsize::new(0));
        let hit_count_clone = Arc::clone(&hit_count);

        Mock::given(method("GET"))
            .and(path("/b.png"))
            .respond_with(move |_: &wiremock::Request| {
                hit_count_clone.fetch_add(1, Ordering::SeqCst);
                ResponseTemplate::new(200).set_body_bytes(b"pixels".to_vec())
            })
            .mount(&server)
            .await;

        let downloader = Arc::new(Downloader::new(2));
        let url = Url::parse(&format!("{}/b.png", server.uri())).expect("valid url");

        let mut receivers = Vec::new();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let (tx, rx) = tokio::sync::oneshot::channel();
            let tx = Mutex::new(Some(tx));
            let completion: CompletionCallback = Arc::new(move |result| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(result.is_ok());
                }
            });
            handles.push(downloader.download(
                url.clone(),
                FetchOptions::default(),
                DownloadPriority::default(),
                None,
                None,
                Some(completion),
            ));
            receivers.push(rx);
        }

        for rx in receivers {
            assert!(rx.await.expect("completion should fire"));
        }
        assert_eq!(hit_count.load(Ordering::SeqCst), 1, "only one fetch should have reached the server");
    }

    #[tokio::test]
    async fn cancelling_one_of_many_does_not_prevent_others_completion() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/c.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"pixels".to_vec()).set_delay(std::time::Duration::from_millis(50)))
            .mount(&server)
            .await;

        let downloader = Downloader::new(2);
        let url = Url::parse(&format!("{}/c.png", server.uri())).expect("valid url");

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let completion_survivor: CompletionCallback = Arc::new(move |_result| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        let completion_cancelled: CompletionCallback = Arc::new(|_result| {
            panic!("cancelled subscriber must not receive a completion callback");
        });

        let cancel_me = downloader.download(
            url.clone(),
            FetchOptions::default(),
            DownloadPriority::default(),
            None,
            None,
            Some(completion_cancelled),
        );
        let _survivor = downloader.download(url, FetchOptions::default(), DownloadPriority::default(), None, None, Some(completion_survivor));

        cancel_me.cancel();

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn high_priority_job_dispatches_before_earlier_normal_jobs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slot.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"pixels".to_vec()).set_delay(std::time::Duration::from_millis(80)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/normal.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"pixels".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/urgent.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"pixels".to_vec()))
            .mount(&server)
            .await;

        // Concurrency of 1: the first download occupies the only permit
        // while the normal- and high-priority jobs sit in the queue.
        let downloader = Downloader::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let slot_url = Url::parse(&format!("{}/slot.png", server.uri())).expect("valid url");
        let _slot = downloader.download(slot_url, FetchOptions::default(), DownloadPriority::Normal, None, None, None);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let normal_url = Url::parse(&format!("{}/normal.png", server.uri())).expect("valid url");
        let order_normal = Arc::clone(&order);
        let completion_normal: CompletionCallback = Arc::new(move |_| order_normal.lock().push("normal"));
        let _normal = downloader.download(normal_url, FetchOptions::default(), DownloadPriority::Normal, None, None, Some(completion_normal));

        let urgent_url = Url::parse(&format!("{}/urgent.png", server.uri())).expect("valid url");
        let order_urgent = Arc::clone(&order);
        let completion_urgent: CompletionCallback = Arc::new(move |_| order_urgent.lock().push("urgent"));
        let _urgent = downloader.download(urgent_url, FetchOptions::default(), DownloadPriority::High, None, None, Some(completion_urgent));

        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        assert_eq!(*order.lock(), vec!["urgent", "normal"]);
    }
}
