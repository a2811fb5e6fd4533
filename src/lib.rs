//! Two-tier caching and request-coalescing downloader for remote images.
//!
//! This crate caches images fetched from remote URLs across a bounded
//! in-memory tier and a content-addressed disk tier, and coalesces
//! concurrent requests for the same URL behind a single HTTP transfer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │              Manager                 │
//! │   blacklist, in-flight bookkeeping   │
//! └──────────────┬───────────┬───────────┘
//!                │           │
//!     ┌──────────▼─┐     ┌───▼──────────┐
//!     │ MemoryStore │     │  DiskStore    │
//!     │ arena LRU   │     │ content-      │
//!     │             │     │ addressed     │
//!     └─────────────┘     └───────┬───────┘
//!                                 │ miss
//!                         ┌───────▼────────┐
//!                         │   Downloader    │
//!                         │ per-URL bucket, │
//!                         │ bounded pool    │
//!                         └───────┬────────┘
//!                                 │
//!                           ┌─────▼─────┐
//!                           │  Fetcher   │
//!                           │ one HTTP   │
//!                           │ transfer   │
//!                           └────────────┘
//! ```
//!
//! [`Manager::load_image`] is the entry point: it checks the memory tier,
//! then the disk tier, then falls through to the network, in that order.
//! Format decoding itself is delegated to a [`decoder::Decoder`]
//! implementation the caller supplies; this crate ships only a
//! [`decoder::PassthroughDecoder`] for standalone use and testing.
//!
//! # Usage
//!
//! ```rust,no_run
//! use rimagecache::{
//!     config::CacheConfig,
//!     decoder::PassthroughDecoder,
//!     manager::{LoadOptions, LoadResult, Manager},
//! };
//! use reqwest::Url;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CacheConfig::new("/tmp/image-cache");
//! let manager = Manager::new(config, Arc::new(PassthroughDecoder))?;
//!
//! let url = Url::parse("https://example.com/avatar.png")?;
//! let completion = Arc::new(|result: &LoadResult| {
//!     if let Some(image) = &result.image {
//!         println!("loaded {}x{} from {:?}", image.width, image.height, result.cache_type);
//!     }
//! });
//! let handle = manager.load_image(url, LoadOptions::default(), completion, None);
//! // handle.cancel() to abandon the request early.
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::return_self_not_must_use)] // Builder patterns
#![allow(clippy::float_cmp)] // Statistics need exact float comparisons
#![allow(clippy::mixed_attributes_style)] // Inner and outer doc attributes
#![allow(clippy::doc_markdown)] // Cache-specific terms don't need backticks
#![allow(clippy::use_self)] // Sometimes explicit types are clearer
#![allow(clippy::redundant_closure_for_method_calls)] // Sometimes clearer
#![allow(clippy::manual_instant_elapsed)] // Direct subtraction can be clearer

pub mod config;
pub mod decoder;
pub mod disk_store;
pub mod downloader;
pub mod error;
pub mod fetcher;
pub mod handle;
pub mod image;
pub mod key;
pub mod manager;
pub mod memory_store;
pub mod stats;

pub use config::CacheConfig;
pub use decoder::{Decoder, PassthroughDecoder};
pub use disk_store::{BackupExclusion, DiskStore, NoBackupExclusion};
pub use downloader::Downloader;
pub use error::{ImageCacheError, Result};
pub use fetcher::{FetchOptions, FetchOutcome, Fetcher};
pub use handle::OperationHandle;
pub use image::CachedImage;
pub use key::CacheKey;
pub use manager::{CacheState, CacheType, LoadOptions, LoadResult, Manager};
pub use memory_store::MemoryStore;
pub use stats::{AtomicCacheMetrics, CacheStats};

/// Convenient re-exports of the crate's commonly used types.
pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    pub use crate::{
        config::{CacheConfig, DiskStoreConfig, MemoryStoreConfig, MemoryStoreLimits},
        decoder::{Decoder, PassthroughDecoder},
        disk_store::{BackupExclusion, DiskStore, NoBackupExclusion},
        downloader::Downloader,
        error::{ImageCacheError, Result},
        fetcher::{FetchOptions, FetchOutcome, Fetcher},
        handle::OperationHandle,
        image::CachedImage,
        key::CacheKey,
        manager::{CacheState, CacheType, LoadOptions, LoadResult, Manager},
        memory_store::MemoryStore,
        stats::{AtomicCacheMetrics, CacheStats},
    };
}
