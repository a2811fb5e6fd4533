//! A single HTTP transfer for one URL.
//!
//! One [`Fetcher`] is one attempt at downloading one resource; it does not
//! retry internally (retry-on-failure, via `RetryFailed`, is the manager's
//! concern — see [`crate::manager`]).

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::{redirect::Policy, Client, Url};
use std::{
    sync::{Arc, Once},
    time::Duration,
};
use tracing::{debug, trace};

use crate::error::{ImageCacheError, Result};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

static INSTALL_CRYPTO_PROVIDER: Once = Once::new();

/// Installs the process-wide `ring` crypto provider `reqwest`'s
/// `rustls-no-provider` feature expects, the first time any fetcher runs.
fn ensure_crypto_provider() {
    INSTALL_CRYPTO_PROVIDER.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Progress callback: `(received_bytes, expected_total)`. `expected_total`
/// is negative if the server did not report a `Content-Length`.
pub type ProgressCallback = Arc<dyn Fn(u64, i64) + Send + Sync>;

/// Redirect callback, invoked once per hop before it is followed. Returning
/// `false` aborts the transfer with `NetworkFailure`. Absent a callback,
/// redirects are always followed.
pub type RedirectCallback = Arc<dyn Fn(&Url) -> bool + Send + Sync>;

/// Per-request knobs that affect the HTTP transfer itself (the subset of
/// the manager's options bitmask that `Fetcher` needs to know about).
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Allow cookies on this request (`HandleCookies`).
    pub handle_cookies: bool,
    /// Skip TLS certificate validation (`AllowInvalidSSLCertificates`,
    /// diagnostic only).
    pub allow_invalid_ssl_certificates: bool,
}

/// The outcome of one completed transfer.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// The bytes received.
    pub bytes: Bytes,
    /// The final URL after following redirects.
    pub final_url: Url,
}

/// Executes one HTTP transfer for `url`.
pub struct Fetcher {
    url: Url,
    options: FetchOptions,
}

impl Fetcher {
    /// Creates a fetcher for `url` with the given options.
    #[must_use]
    pub fn new(url: Url, options: FetchOptions) -> Self {
        Self { url, options }
    }

    fn build_client(&self, redirect_cb: Option<RedirectCallback>) -> Result<Client> {
        ensure_crypto_provider();

        let policy = match redirect_cb {
            Some(cb) => Policy::custom(move |attempt| {
                if attempt.previous().len() >= 10 {
                    return attempt.error("too many redirects");
                }
                if cb(attempt.url()) {
                    attempt.follow()
                } else {
                    attempt.stop()
                }
            }),
            None => Policy::default(),
        };

        let mut builder = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .redirect(policy)
            .gzip(true)
            .deflate(true)
            .brotli(true);

        if !self.options.handle_cookies {
            builder = builder.cookie_store(false);
        }
        if self.options.allow_invalid_ssl_certificates {
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(builder.build()?)
    }

    /// Runs the transfer to completion, invoking `progress` on each chunk
    /// received and `redirect` before following each hop.
    ///
    /// # Errors
    ///
    /// Returns [`ImageCacheError::NetworkFailure`] for transport-level
    /// failures (connect, timeout, DNS, a rejected redirect) and
    /// [`ImageCacheError::ProtocolFailure`] for a non-2xx response.
    pub async fn run(
        &self,
        progress: Option<ProgressCallback>,
        redirect: Option<RedirectCallback>,
    ) -> Result<FetchOutcome> {
        let client = self.build_client(redirect)?;

        debug!(url = %self.url, "fetcher starting transfer");

        let response = client
            .get(self.url.clone())
            .header("Accept", "image/*")
            .send()
            .await?;

        let final_url = response.url().clone();
        let status = response.status();
        if !status.is_success() {
            return Err(ImageCacheError::ProtocolFailure {
                status: status.as_u16(),
                url: self.url.to_string(),
            });
        }

        let expected_total: i64 = response
            .content_length()
            .map_or(-1, |len| i64::try_from(len).unwrap_or(i64::MAX));

        let mut received: u64 = 0;
        let mut buffer = BytesMut::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            received += chunk.len() as u64;
            buffer.extend_from_slice(&chunk);
            trace!(url = %self.url, received, expected_total, "fetcher progress");
            if let Some(cb) = &progress {
                cb(received, expected_total);
            }
        }

        debug!(url = %self.url, bytes = buffer.len(), "fetcher completed transfer");

        Ok(FetchOutcome {
            bytes: buffer.freeze(),
            final_url,
        })
    }
}
