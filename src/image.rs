//! The decoded image record carried through the memory tier.

use bytes::Bytes;

/// A decoded image plus its original encoded payload.
///
/// Format-specific decoding is outside this crate's scope; a
/// [`crate::decoder::Decoder`] produces this record, and the core treats it
/// as an opaque, pluggable value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedImage {
    /// Pixel width of the decoded image.
    pub width: u32,
    /// Pixel height of the decoded image.
    pub height: u32,
    /// Display scale factor (e.g. `2` for a 2x asset); `1` if unscaled.
    pub scale: u32,
    /// Number of frames; `1` for a static image.
    pub frame_count: u32,
    /// A short tag identifying the encoded format (`"png"`, `"jpeg"`, ...).
    pub format: String,
    /// The original encoded bytes, kept so the image can be re-persisted to
    /// disk without re-encoding.
    pub encoded: Bytes,
}

impl CachedImage {
    /// Memory cost in bytes: `width * height * scale^2 * 4 * frame_count`,
    /// assuming 4 bytes per decoded pixel (RGBA8).
    #[must_use]
    pub fn cost(&self) -> u64 {
        const BYTES_PER_PIXEL: u64 = 4;
        u64::from(self.width)
            * u64::from(self.height)
            * u64::from(self.scale).pow(2)
            * BYTES_PER_PIXEL
            * u64::from(self.frame_count)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn cost_accounts_for_scale_and_frames() {
        let image = CachedImage {
            width: 10,
            height: 10,
            scale: 2,
            frame_count: 3,
            format: "png".to_string(),
            encoded: Bytes::new(),
        };
        // 10 * 10 * 2^2 * 4 * 3 = 4800
        assert_eq!(image.cost(), 4800);
    }

    #[test]
    fn cost_of_static_unscaled_image() {
        let image = CachedImage {
            width: 2,
            height: 2,
            scale: 1,
            frame_count: 1,
            format: "png".to_string(),
            encoded: Bytes::new(),
        };
        assert_eq!(image.cost(), 2 * 2 * 1 * 4 * 1);
    }
}
