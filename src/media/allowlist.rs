//! Origin allowlist guard
//!
//! Structural SSRF defense for the media endpoints. A candidate URL is parsed
//! and its origin (scheme, host, port) compared against a fixed set of trusted
//! origins loaded at startup. No DNS lookup or network I/O happens here, so a
//! rejected URL never produces traffic toward its host.
//!
//! The storage backend's origin is special: it also serves non-object API
//! routes, so requests against it must additionally stay under the public
//! object path prefix.

use thiserror::Error;
use url::{Origin, Url};

/// Maximum accepted URL length (2KB)
pub const MAX_URL_LENGTH: usize = 2048;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllowlistError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("origin not allowed: {origin}")]
    ForbiddenOrigin { origin: String },
}

/// A trusted origin, optionally restricted to a path prefix.
#[derive(Debug, Clone)]
pub struct AllowlistEntry {
    origin: Origin,
    path_prefix: Option<String>,
}

impl AllowlistEntry {
    /// Parse an entry from an absolute http(s) URL. Only the origin is kept.
    pub fn parse(raw: &str) -> Result<Self, AllowlistError> {
        let url = Url::parse(raw).map_err(|e| AllowlistError::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(AllowlistError::InvalidUrl(format!(
                "allowlist entry must be an absolute http(s) url: {raw}"
            )));
        }
        Ok(Self {
            origin: url.origin(),
            path_prefix: None,
        })
    }

    /// Require matching request paths to start with `prefix`.
    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.starts_with('/') {
            prefix.insert(0, '/');
        }
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        self.path_prefix = Some(prefix);
        self
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    fn admits(&self, url: &Url) -> bool {
        if url.origin() != self.origin {
            return false;
        }
        match &self.path_prefix {
            Some(prefix) => url.path().starts_with(prefix.as_str()),
            None => true,
        }
    }
}

/// Immutable set of trusted origins.
#[derive(Debug, Clone, Default)]
pub struct OriginAllowlist {
    entries: Vec<AllowlistEntry>,
}

impl OriginAllowlist {
    pub fn new(entries: Vec<AllowlistEntry>) -> Self {
        Self { entries }
    }

    /// Build from raw origin strings (no path constraints).
    pub fn from_origins<I, S>(origins: I) -> Result<Self, AllowlistError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = origins
            .into_iter()
            .map(|o| AllowlistEntry::parse(o.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }

    pub fn push(&mut self, entry: AllowlistEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Validate a candidate URL and return it parsed.
    ///
    /// Fails with `InvalidUrl` when the string is not an absolute URL and with
    /// `ForbiddenOrigin` when no entry admits it.
    pub fn check(&self, candidate: &str) -> Result<Url, AllowlistError> {
        if candidate.len() > MAX_URL_LENGTH {
            return Err(AllowlistError::InvalidUrl(format!(
                "url too long: {} bytes (max {MAX_URL_LENGTH})",
                candidate.len()
            )));
        }

        let url =
            Url::parse(candidate).map_err(|e| AllowlistError::InvalidUrl(e.to_string()))?;

        // Credentials in the URL would be forwarded upstream.
        if !url.username().is_empty() || url.password().is_some() {
            return Err(forbidden(&url));
        }

        if self.entries.iter().any(|entry| entry.admits(&url)) {
            Ok(url)
        } else {
            Err(forbidden(&url))
        }
    }
}

fn forbidden(url: &Url) -> AllowlistError {
    AllowlistError::ForbiddenOrigin {
        origin: url.origin().ascii_serialization(),
    }
}
