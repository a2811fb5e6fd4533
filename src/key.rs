//! Cache key derivation.
//!
//! A [`CacheKey`] is the stable identifier shared by the memory tier and the
//! disk tier for a given source URL. It is the lowercase hex encoding of the
//! MD5 digest of the URL's UTF-8 bytes, matching the disk layout
//! `{root}/{namespace}/{hex(md5(url))}`.

use std::fmt;
use std::sync::OnceLock;

/// A stable, filesystem-safe identifier derived from a source URL.
///
/// Two URLs that hash to the same digest are treated as the same cached
/// object; collision resistance is not required, only a uniform, stable
/// mapping from URL to filename/map-key.
#[derive(Clone)]
pub struct CacheKey {
    url: Box<str>,
    digest: OnceLock<Box<str>>,
}

impl CacheKey {
    /// Derives a cache key from a source URL.
    #[must_use]
    pub fn from_url(url: &str) -> Self {
        Self {
            url: url.into(),
            digest: OnceLock::new(),
        }
    }

    /// The source URL this key was derived from.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The lowercase hex MD5 digest used as the map key and disk filename.
    ///
    /// Computed lazily on first access and cached for the lifetime of this
    /// key.
    #[must_use]
    pub fn as_hex(&self) -> &str {
        self.digest
            .get_or_init(|| hex::encode(md5::compute(self.url.as_bytes()).0).into())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheKey")
            .field("url", &self.url)
            .field("hex", &self.as_hex())
            .finish()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_hex())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.as_hex() == other.as_hex()
    }
}

impl Eq for CacheKey {}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_hex().hash(state);
    }
}

impl From<&str> for CacheKey {
    fn from(url: &str) -> Self {
        Self::from_url(url)
    }
}

impl From<String> for CacheKey {
    fn from(url: String) -> Self {
        Self {
            url: url.into_boxed_str(),
            digest: OnceLock::new(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn same_url_yields_same_hex() {
        let a = CacheKey::from_url("http://example.com/a.png");
        let b = CacheKey::from_url("http://example.com/a.png");
        assert_eq!(a.as_hex(), b.as_hex());
        assert_eq!(a, b);
    }

    #[test]
    fn different_urls_yield_different_hex() {
        let a = CacheKey::from_url("http://example.com/a.png");
        let b = CacheKey::from_url("http://example.com/b.png");
        assert_ne!(a.as_hex(), b.as_hex());
    }

    #[test]
    fn hex_digest_is_lowercase_32_chars() {
        let key = CacheKey::from_url("http://example.com/a.png");
        let hex = key.as_hex();
        assert_eq!(hex.len(), 32);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn known_digest_matches_reference_md5() {
        // md5("") = d41d8cd98f00b204e9800998ecf8427e
        let key = CacheKey::from_url("");
        assert_eq!(key.as_hex(), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn display_matches_as_hex() {
        let key = CacheKey::from_url("http://example.com/a.png");
        assert_eq!(format!("{key}"), key.as_hex());
    }

    #[test]
    fn usable_as_hashmap_key() {
        let mut map = std::collections::HashMap::new();
        map.insert(CacheKey::from_url("http://example.com/a.png"), 1u32);
        assert_eq!(
            map.get(&CacheKey::from_url("http://example.com/a.png")),
            Some(&1)
        );
    }

    #[test]
    fn url_is_preserved() {
        let key = CacheKey::from_url("http://example.com/a.png");
        assert_eq!(key.url(), "http://example.com/a.png");
    }
}
