//! The seam between raw bytes and a [`CachedImage`].
//!
//! Format decoding is out of scope for this crate (see the crate-level
//! documentation); [`Decoder`] is the capability collaborators implement to
//! plug a real decoder in. [`PassthroughDecoder`] is the default so the
//! cache and manager are usable and testable standalone.

use crate::{error::Result, image::CachedImage};
use async_trait::async_trait;
use bytes::Bytes;

/// Converts encoded bytes into a [`CachedImage`].
#[async_trait]
pub trait Decoder: Send + Sync {
    /// Decodes `bytes`. Returns `Err(ImageCacheError::DecodeFailure)` if the
    /// bytes are not a recognizable image.
    async fn decode(&self, bytes: Bytes) -> Result<CachedImage>;
}

/// A decoder that treats the whole payload as an opaque single-frame,
/// single-pixel image.
///
/// Stands in for a real decoder in standalone use and in tests; it never
/// fails and never inspects the bytes beyond wrapping them.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughDecoder;

#[async_trait]
impl Decoder for PassthroughDecoder {
    async fn decode(&self, bytes: Bytes) -> Result<CachedImage> {
        Ok(CachedImage {
            width: 1,
            height: 1,
            scale: 1,
            frame_count: 1,
            format: "raw".to_string(),
            encoded: bytes,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passthrough_decoder_never_fails() {
        let decoder = PassthroughDecoder;
        let image = decoder
            .decode(Bytes::from_static(b"not really an image"))
            .await
            .expect("passthrough decode should succeed");
        assert_eq!(image.frame_count, 1);
        assert_eq!(image.encoded, Bytes::from_static(b"not really an image"));
    }
}
