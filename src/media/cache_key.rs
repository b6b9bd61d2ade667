//! Cache key derivation for image variants
//!
//! A variant's storage path is a pure function of the origin reference, the
//! target width and the quality. Nothing time- or process-dependent goes in,
//! so concurrent requests for the same variant always race on the same path
//! rather than producing duplicates.

use sha2::{Digest, Sha256};
use std::fmt;

/// Default namespace segment for generated variants.
pub const DEFAULT_VARIANT_PREFIX: &str = "_variants";

/// Extension of the normalized output format.
pub const VARIANT_EXTENSION: &str = "webp";

/// Longest file stem kept from the origin path.
const MAX_STEM_LEN: usize = 64;

/// Hex characters of the origin digest used as the directory segment.
const DIGEST_HEX_LEN: usize = 32;

/// Storage path of a transformed variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for `origin_ref` resized to `width` at `quality`.
    ///
    /// `origin_ref` should identify the original object including its host
    /// (for example the URL without fragment) so two origins serving the same
    /// path never share variants. Layout:
    /// `{prefix}/{sha256(origin_ref)[..32]}/{stem}_w{width}_q{quality}.webp`.
    pub fn derive(prefix: &str, origin_ref: &str, width: u32, quality: u8) -> Self {
        let digest = hex::encode(Sha256::digest(origin_ref.as_bytes()));
        let stem = file_stem(origin_ref);
        let prefix = prefix.trim_matches('/');
        let prefix = if prefix.is_empty() {
            DEFAULT_VARIANT_PREFIX
        } else {
            prefix
        };

        CacheKey(format!(
            "{prefix}/{}/{stem}_w{width}_q{quality}.{VARIANT_EXTENSION}",
            &digest[..DIGEST_HEX_LEN]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Readable, storage-safe stem of the last path segment.
fn file_stem(origin_ref: &str) -> String {
    let path = origin_ref
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    let last = path.rsplit('/').next().unwrap_or_default();
    let stem = match last.rfind('.') {
        Some(idx) if idx > 0 => &last[..idx],
        _ => last,
    };

    let sanitized: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .take(MAX_STEM_LEN)
        .collect();

    if sanitized.is_empty() {
        "image".to_string()
    } else {
        sanitized
    }
}
