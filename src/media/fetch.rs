//! Origin fetch
//!
//! HTTP client for allowlisted origins. URLs reaching this module have already
//! passed the allowlist guard; the client adds the transport-level limits:
//! - Redirects disabled (a 3xx could point at a host outside the allowlist)
//! - Connect timeout plus a deadline for buffered fetches
//! - Per-read idle timeout for streamed bodies
//! - Size limit enforced while streaming image bodies

use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::Client;
use thiserror::Error;
use url::Url;

/// Default fetch timeout in milliseconds (15s)
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 15_000;

/// Default connect timeout in milliseconds (5s)
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Default maximum image body size (25MB)
pub const DEFAULT_MAX_INPUT_BYTES: u64 = 25 * 1024 * 1024;

/// Request headers forwarded to the origin on streamed (video) fetches.
const FORWARDED_REQUEST_HEADERS: [HeaderName; 2] = [header::RANGE, header::IF_RANGE];

#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("failed to build http client: {0}")]
    Client(String),

    #[error("origin request failed: {0}")]
    Request(String),

    #[error("origin timed out")]
    Timeout,

    #[error("origin returned status {0}")]
    Status(StatusCode),

    #[error("origin response too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("failed to read origin body: {0}")]
    StreamRead(String),
}

impl FetchError {
    /// Upstream status code, when the origin answered at all.
    pub fn upstream_status(&self) -> Option<StatusCode> {
        match self {
            FetchError::Status(status) => Some(*status),
            _ => None,
        }
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Request(e.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Deadline for buffered fetches and for receiving streamed response headers
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Maximum buffered body size in bytes
    pub max_size: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_FETCH_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            max_size: DEFAULT_MAX_INPUT_BYTES,
        }
    }
}

/// A fully buffered origin object.
#[derive(Debug, Clone)]
pub struct FetchedObject {
    pub bytes: Bytes,
    /// Content-Type from the response headers, if present
    pub content_type: Option<String>,
}

/// Client for allowlisted origins.
#[derive(Clone)]
pub struct OriginClient {
    client: Client,
    config: FetchConfig,
}

impl OriginClient {
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            // Idle limit between body chunks; streamed bodies have no total deadline.
            .read_timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Fetch and buffer an origin object, bounded by the fetch timeout and
    /// the size limit. Any non-2xx status is an error.
    pub async fn fetch(&self, url: &Url) -> Result<FetchedObject, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }

        if let Some(content_length) = response.content_length() {
            if content_length > self.config.max_size {
                return Err(FetchError::TooLarge {
                    size: content_length,
                    max: self.config.max_size,
                });
            }
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let bytes = read_with_limit(response, self.config.max_size).await?;

        Ok(FetchedObject {
            bytes,
            content_type,
        })
    }

    /// Open a streamed fetch, forwarding `Range`/`If-Range` from `inbound`.
    ///
    /// Only the wait for response headers is bounded by the fetch timeout;
    /// the body is left for the caller to stream. 2xx, 304 and 416 are passed
    /// through (a 416 carries the `Content-Range: bytes */len` players need),
    /// everything else is an error.
    pub async fn open_stream(
        &self,
        url: &Url,
        inbound: &HeaderMap,
    ) -> Result<reqwest::Response, FetchError> {
        let mut request = self.client.get(url.clone());
        for name in FORWARDED_REQUEST_HEADERS.iter() {
            if let Some(value) = inbound.get(name) {
                request = request.header(name, value.clone());
            }
        }

        let response = tokio::time::timeout(self.config.timeout, request.send())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(FetchError::from_reqwest)?;

        let status = response.status();
        if status.is_success()
            || status == StatusCode::NOT_MODIFIED
            || status == StatusCode::RANGE_NOT_SATISFIABLE
        {
            Ok(response)
        } else {
            Err(FetchError::Status(status))
        }
    }
}

/// Read a response body, failing once more than `max_size` bytes arrive.
async fn read_with_limit(response: reqwest::Response, max_size: u64) -> Result<Bytes, FetchError> {
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::StreamRead(e.to_string())
            }
        })?;

        let new_size = body.len() as u64 + chunk.len() as u64;
        if new_size > max_size {
            return Err(FetchError::TooLarge {
                size: new_size,
                max: max_size,
            });
        }

        body.extend_from_slice(&chunk);
    }

    Ok(Bytes::from(body))
}
