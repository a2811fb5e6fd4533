//! Error types for the image cache core.

use thiserror::Error;

/// Errors surfaced by [`crate::manager::Manager`] and the individual cache
/// tiers.
///
/// Disk I/O failures are deliberately *not* part of the caller-visible
/// completion path: [`crate::disk_store::DiskStore`] swallows them and
/// reports a miss, falling back to the network. `IoFailure` exists for
/// callers that talk to [`crate::disk_store::DiskStore`] directly (e.g. an
/// explicit `cleanup()` call) and need to know a sweep could not finish.
#[derive(Debug, Error)]
pub enum ImageCacheError {
    /// A null or empty URL/key was supplied.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The underlying HTTP transport failed (connect, timeout, DNS).
    #[error("network failure: {0}")]
    NetworkFailure(#[from] reqwest::Error),

    /// The server responded but with a non-2xx status or a malformed
    /// response.
    #[error("protocol failure: {status} for {url}")]
    ProtocolFailure {
        /// HTTP status code returned by the server.
        status: u16,
        /// The request URL that produced this status.
        url: String,
    },

    /// Bytes were received but the decoder rejected them.
    #[error("decode failure: {0}")]
    DecodeFailure(String),

    /// A disk read/write/enumerate operation failed.
    #[error("io failure: {0}")]
    IoFailure(#[from] std::io::Error),

    /// The operation was cancelled by its caller.
    ///
    /// This variant exists for completeness and internal bookkeeping; per
    /// the cancellation contract it is never delivered to the cancelled
    /// subscriber as a completion error.
    #[error("operation cancelled")]
    Cancelled,
}

impl ImageCacheError {
    /// Whether this failure should cause the originating URL to be added to
    /// the manager's blacklist (non-retriable without
    /// [`crate::manager::LoadOptions::retry_failed`]).
    #[must_use]
    pub fn is_blacklistable(&self) -> bool {
        matches!(
            self,
            Self::ProtocolFailure { status, .. }
                if matches!(status, 400 | 403 | 404 | 410)
        )
    }
}

/// Convenience alias used throughout the cache core.
pub type Result<T> = std::result::Result<T, ImageCacheError>;
