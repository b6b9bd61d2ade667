//! Media request pipeline
//!
//! Image requests run `validate -> cache lookup -> {hit: redirect |
//! miss: fetch -> transform -> respond -> queue write-back}`. Video requests
//! are validated and then relayed to the origin with their byte range.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use thiserror::Error;
use url::Url;

use crate::media::allowlist::{AllowlistError, OriginAllowlist};
use crate::media::cache_control::{cache_control_value, NO_STORE};
use crate::media::cache_key::{CacheKey, DEFAULT_VARIANT_PREFIX};
use crate::media::fetch::{FetchError, FetchedObject, OriginClient};
use crate::media::store::VariantCache;
use crate::media::transform::{
    base_mime, sniff_content_type, transform_blocking, TransformError, TransformParams,
};
use crate::media::writeback::{WriteBackJob, WriteBackQueue};
use crate::server::metrics::MediaMetrics;

pub const DEFAULT_MAX_WIDTH: u32 = 3840;
pub const DEFAULT_MAX_QUALITY: u8 = 90;
pub const DEFAULT_QUALITY: u8 = 75;
pub const DEFAULT_IMAGE_MAX_AGE_SECS: u64 = 31_536_000;
pub const DEFAULT_VIDEO_MAX_AGE_SECS: u64 = 86_400;

/// Response header reporting how an image request was served.
pub const MEDIA_CACHE_HEADER: &str = "x-media-cache";

/// Origin response headers relayed verbatim on the video path.
const RELAYED_VIDEO_HEADERS: [HeaderName; 6] = [
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::CONTENT_RANGE,
    header::ACCEPT_RANGES,
    header::ETAG,
    header::LAST_MODIFIED,
];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("invalid value for `{name}`: {value:?}")]
    InvalidParam { name: &'static str, value: String },

    #[error("origin not allowed: {origin}")]
    ForbiddenOrigin { origin: String },

    #[error("upstream error: {message}")]
    Upstream {
        status: Option<StatusCode>,
        message: String,
    },

    #[error("upstream timed out")]
    UpstreamTimeout,

    #[error("upstream returned non-image content: {content_type}")]
    NotAnImage { content_type: String },

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("no storage backend configured")]
    StorageUnavailable,
}

impl MediaError {
    pub fn status(&self) -> StatusCode {
        match self {
            MediaError::InvalidUrl(_) | MediaError::InvalidParam { .. } => StatusCode::BAD_REQUEST,
            MediaError::ForbiddenOrigin { .. } => StatusCode::FORBIDDEN,
            MediaError::Upstream {
                status: Some(status),
                ..
            } if status.is_client_error() || status.is_server_error() => *status,
            MediaError::Upstream { .. } | MediaError::NotAnImage { .. } => StatusCode::BAD_GATEWAY,
            MediaError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            MediaError::Transform(_) => StatusCode::INTERNAL_SERVER_ERROR,
            MediaError::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            MediaError::InvalidUrl(_) => "INVALID_URL",
            MediaError::InvalidParam { .. } => "INVALID_PARAM",
            MediaError::ForbiddenOrigin { .. } => "FORBIDDEN_ORIGIN",
            MediaError::Upstream { .. } | MediaError::NotAnImage { .. } => "UPSTREAM_ERROR",
            MediaError::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            MediaError::Transform(_) => "TRANSFORM_ERROR",
            MediaError::StorageUnavailable => "STORAGE_UNAVAILABLE",
        }
    }
}

impl From<AllowlistError> for MediaError {
    fn from(e: AllowlistError) -> Self {
        match e {
            AllowlistError::InvalidUrl(msg) => MediaError::InvalidUrl(msg),
            AllowlistError::ForbiddenOrigin { origin } => MediaError::ForbiddenOrigin { origin },
        }
    }
}

impl From<FetchError> for MediaError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::Timeout => MediaError::UpstreamTimeout,
            FetchError::Status(status) => MediaError::Upstream {
                status: Some(status),
                message: format!("origin returned status {status}"),
            },
            other => MediaError::Upstream {
                status: None,
                message: other.to_string(),
            },
        }
    }
}

impl IntoResponse for MediaError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (
            self.status(),
            [
                (header::CONTENT_TYPE, "application/json; charset=utf-8"),
                (header::CACHE_CONTROL, NO_STORE),
            ],
            body.to_string(),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Requests and outcomes
// ---------------------------------------------------------------------------

/// Limits and cache policy applied by [`MediaService`].
#[derive(Debug, Clone)]
pub struct MediaSettings {
    pub max_width: u32,
    pub max_quality: u8,
    pub default_quality: u8,
    pub image_max_age_secs: u64,
    pub video_max_age_secs: u64,
    pub variant_prefix: String,
}

impl Default for MediaSettings {
    fn default() -> Self {
        Self {
            max_width: DEFAULT_MAX_WIDTH,
            max_quality: DEFAULT_MAX_QUALITY,
            default_quality: DEFAULT_QUALITY,
            image_max_age_secs: DEFAULT_IMAGE_MAX_AGE_SECS,
            video_max_age_secs: DEFAULT_VIDEO_MAX_AGE_SECS,
            variant_prefix: DEFAULT_VARIANT_PREFIX.to_string(),
        }
    }
}

/// A parsed `/media/image` query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub url: String,
    /// `None` means passthrough
    pub transform: Option<TransformParams>,
}

impl ImageRequest {
    /// Parse raw query values.
    ///
    /// Width and quality are clamped into range rather than rejected; only a
    /// non-numeric value is an error. Quality without width is ignored.
    pub fn parse(
        url: Option<&str>,
        width: Option<&str>,
        quality: Option<&str>,
        settings: &MediaSettings,
    ) -> Result<Self, MediaError> {
        let url = require_url(url)?;
        let width = parse_int("w", width)?;
        let quality = parse_int("q", quality)?;

        let transform = width.map(|w| {
            let max_quality = settings.max_quality.max(1);
            let q = quality.unwrap_or(settings.default_quality as i64);
            TransformParams {
                width: w.clamp(1, settings.max_width.max(1) as i64) as u32,
                quality: q.clamp(1, max_quality as i64) as u8,
            }
        });

        Ok(Self {
            url: url.to_string(),
            transform,
        })
    }
}

fn require_url(url: Option<&str>) -> Result<&str, MediaError> {
    url.map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| MediaError::InvalidUrl("missing `url` parameter".to_string()))
}

fn parse_int(name: &'static str, raw: Option<&str>) -> Result<Option<i64>, MediaError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value
            .parse::<i64>()
            .map(Some)
            .map_err(|_| MediaError::InvalidParam {
                name,
                value: value.to_string(),
            }),
    }
}

/// How an image response was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Bypass,
    Passthrough,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Miss => "miss",
            CacheStatus::Bypass => "bypass",
            CacheStatus::Passthrough => "passthrough",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ImageOutcome {
    /// Variant already stored; redirect to its public URL.
    Redirect {
        location: String,
        cache_control: String,
    },
    /// Bytes served directly.
    Body {
        bytes: Bytes,
        content_type: String,
        cache_control: String,
        cache: CacheStatus,
    },
}

impl ImageOutcome {
    pub fn cache_status(&self) -> CacheStatus {
        match self {
            ImageOutcome::Redirect { .. } => CacheStatus::Hit,
            ImageOutcome::Body { cache, .. } => *cache,
        }
    }
}

impl IntoResponse for ImageOutcome {
    fn into_response(self) -> Response {
        let cache = self.cache_status().as_str();
        match self {
            ImageOutcome::Redirect {
                location,
                cache_control,
            } => (
                StatusCode::TEMPORARY_REDIRECT,
                [
                    (header::LOCATION, location),
                    (header::CACHE_CONTROL, cache_control),
                    (HeaderName::from_static(MEDIA_CACHE_HEADER), cache.to_string()),
                ],
            )
                .into_response(),
            ImageOutcome::Body {
                bytes,
                content_type,
                cache_control,
                ..
            } => (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, content_type),
                    (header::CACHE_CONTROL, cache_control),
                    (header::X_CONTENT_TYPE_OPTIONS, "nosniff".to_string()),
                    (HeaderName::from_static(MEDIA_CACHE_HEADER), cache.to_string()),
                ],
                bytes,
            )
                .into_response(),
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// The media pipeline shared by the HTTP handlers.
pub struct MediaService {
    allowlist: OriginAllowlist,
    client: OriginClient,
    cache: Option<VariantCache>,
    writeback: Option<WriteBackQueue>,
    settings: MediaSettings,
    metrics: Arc<MediaMetrics>,
}

impl MediaService {
    pub fn new(
        allowlist: OriginAllowlist,
        client: OriginClient,
        settings: MediaSettings,
        metrics: Arc<MediaMetrics>,
    ) -> Self {
        Self {
            allowlist,
            client,
            cache: None,
            writeback: None,
            settings,
            metrics,
        }
    }

    /// Attach the variant cache and the queue its write-backs go through.
    pub fn with_cache(mut self, cache: VariantCache, writeback: WriteBackQueue) -> Self {
        self.cache = Some(cache);
        self.writeback = Some(writeback);
        self
    }

    pub fn settings(&self) -> &MediaSettings {
        &self.settings
    }

    pub fn metrics(&self) -> &Arc<MediaMetrics> {
        &self.metrics
    }

    /// Serve an image request.
    pub async fn image(&self, request: ImageRequest) -> Result<ImageOutcome, MediaError> {
        let url = self.validate(&request.url)?;
        let cache = self.cache.as_ref().ok_or(MediaError::StorageUnavailable)?;
        let cache_control = cache_control_value(self.settings.image_max_age_secs);

        let Some(params) = request.transform else {
            let (bytes, content_type) = self.fetch_image(&url).await?;
            return Ok(ImageOutcome::Body {
                bytes,
                content_type,
                cache_control,
                cache: CacheStatus::Passthrough,
            });
        };

        // Fragments never reach the origin, so they must not split variants.
        let mut origin_ref = url.clone();
        origin_ref.set_fragment(None);
        let key = CacheKey::derive(
            &self.settings.variant_prefix,
            origin_ref.as_str(),
            params.width,
            params.quality,
        );

        if let Some(location) = cache.lookup(&key).await {
            self.metrics.cache_lookups_total.inc(&["hit"]);
            tracing::debug!(url = %url, key = %key, "variant cache hit");
            return Ok(ImageOutcome::Redirect {
                location,
                cache_control,
            });
        }
        self.metrics.cache_lookups_total.inc(&["miss"]);

        let (bytes, content_type) = self.fetch_image(&url).await?;

        let started = Instant::now();
        let output = transform_blocking(bytes, content_type, params)
            .await
            .map_err(|e| {
                self.metrics.transform_failures_total.inc();
                tracing::warn!(url = %url, width = params.width, quality = params.quality, error = %e, "image transform failed");
                e
            })?;

        if !output.transformed {
            tracing::debug!(url = %url, content_type = %output.content_type, "animated image, transform bypassed");
            return Ok(ImageOutcome::Body {
                bytes: output.bytes,
                content_type: output.content_type,
                cache_control,
                cache: CacheStatus::Bypass,
            });
        }

        self.metrics.transforms_total.inc();
        self.metrics
            .transform_seconds
            .observe(started.elapsed().as_secs_f64());
        tracing::debug!(
            url = %url,
            key = %key,
            width = params.width,
            quality = params.quality,
            bytes = output.bytes.len(),
            "variant generated"
        );

        // Identical concurrent misses each reach this point and each queue a
        // write for the same key. The store keeps whichever lands last; the
        // bytes are equivalent, so no in-flight deduplication is done.
        if let Some(writeback) = &self.writeback {
            writeback.submit(WriteBackJob {
                key,
                bytes: output.bytes.clone(),
                content_type: output.content_type.clone(),
            });
        }

        Ok(ImageOutcome::Body {
            bytes: output.bytes,
            content_type: output.content_type,
            cache_control,
            cache: CacheStatus::Miss,
        })
    }

    /// Relay a video request to its origin, forwarding the byte range.
    ///
    /// The body is streamed; dropping the response (client disconnect) drops
    /// the upstream connection with it.
    pub async fn video(&self, url: Option<&str>, inbound: &HeaderMap) -> Result<Response, MediaError> {
        let url = self.validate(require_url(url)?)?;

        let upstream = self
            .client
            .open_stream(&url, inbound)
            .await
            .map_err(|e| self.upstream_error(&url, e))?;

        let status = upstream.status();
        let mut headers = HeaderMap::new();
        for name in RELAYED_VIDEO_HEADERS.iter() {
            if let Some(value) = upstream.headers().get(name) {
                headers.insert(name.clone(), value.clone());
            }
        }
        if let Ok(value) = HeaderValue::from_str(&cache_control_value(self.settings.video_max_age_secs)) {
            headers.insert(header::CACHE_CONTROL, value);
        }
        headers.insert(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        );

        tracing::debug!(url = %url, status = status.as_u16(), "relaying video");

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }

    fn validate(&self, raw: &str) -> Result<Url, MediaError> {
        self.allowlist.check(raw).map_err(|e| {
            if let AllowlistError::ForbiddenOrigin { origin } = &e {
                self.metrics.forbidden_origins_total.inc();
                tracing::warn!(target: "security", origin = %origin, "media request for non-allowlisted origin rejected");
            }
            MediaError::from(e)
        })
    }

    /// Fetch an origin image and resolve its content type.
    async fn fetch_image(&self, url: &Url) -> Result<(Bytes, String), MediaError> {
        let FetchedObject {
            bytes,
            content_type,
        } = self
            .client
            .fetch(url)
            .await
            .map_err(|e| self.upstream_error(url, e))?;

        let declared = content_type.as_deref().map(base_mime).unwrap_or_default();
        let content_type = if declared.is_empty() || declared == "application/octet-stream" {
            sniff_content_type(&bytes).map(str::to_string).unwrap_or(declared)
        } else {
            declared
        };

        if !content_type.starts_with("image/") {
            self.metrics.upstream_errors_total.inc(&["not_image"]);
            tracing::warn!(url = %url, content_type = %content_type, "origin returned non-image content");
            return Err(MediaError::NotAnImage { content_type });
        }

        Ok((bytes, content_type))
    }

    fn upstream_error(&self, url: &Url, e: FetchError) -> MediaError {
        let label = match &e {
            FetchError::Status(status) => status.as_u16().to_string(),
            FetchError::Timeout => "timeout".to_string(),
            FetchError::TooLarge { .. } => "too_large".to_string(),
            _ => "network".to_string(),
        };
        self.metrics.upstream_errors_total.inc(&[&label]);
        tracing::warn!(url = %url, status = %label, error = %e, "origin fetch failed");
        MediaError::from(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> MediaSettings {
        MediaSettings::default()
    }

    #[test]
    fn test_parse_passthrough() {
        let req = ImageRequest::parse(Some("https://cdn.test/a.png"), None, None, &settings()).unwrap();
        assert_eq!(req.transform, None);

        // Quality alone does not trigger a transform.
        let req = ImageRequest::parse(Some("https://cdn.test/a.png"), None, Some("80"), &settings())
            .unwrap();
        assert_eq!(req.transform, None);
    }

    #[test]
    fn test_parse_default_quality() {
        let req = ImageRequest::parse(Some("https://cdn.test/a.png"), Some("800"), None, &settings())
            .unwrap();
        assert_eq!(
            req.transform,
            Some(TransformParams {
                width: 800,
                quality: DEFAULT_QUALITY
            })
        );
    }

    #[test]
    fn test_parse_clamps() {
        let req = ImageRequest::parse(
            Some("https://cdn.test/a.png"),
            Some("100000"),
            Some("101"),
            &settings(),
        )
        .unwrap();
        assert_eq!(
            req.transform,
            Some(TransformParams {
                width: DEFAULT_MAX_WIDTH,
                quality: DEFAULT_MAX_QUALITY
            })
        );

        let req =
            ImageRequest::parse(Some("https://cdn.test/a.png"), Some("-5"), Some("0"), &settings())
                .unwrap();
        assert_eq!(req.transform, Some(TransformParams { width: 1, quality: 1 }));
    }

    #[test]
    fn test_parse_rejects_non_numeric() {
        let err = ImageRequest::parse(Some("https://cdn.test/a.png"), Some("wide"), None, &settings())
            .unwrap_err();
        assert!(matches!(err, MediaError::InvalidParam { name: "w", .. }));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err =
            ImageRequest::parse(Some("https://cdn.test/a.png"), Some("10"), Some("1.5"), &settings())
                .unwrap_err();
        assert!(matches!(err, MediaError::InvalidParam { name: "q", .. }));
    }

    #[test]
    fn test_parse_missing_url() {
        for url in [None, Some(""), Some("   ")] {
            let err = ImageRequest::parse(url, None, None, &settings()).unwrap_err();
            assert!(matches!(err, MediaError::InvalidUrl(_)));
        }
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            MediaError::ForbiddenOrigin {
                origin: "http://169.254.169.254".into()
            }
            .status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            MediaError::from(FetchError::Status(StatusCode::NOT_FOUND)).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            MediaError::from(FetchError::Status(StatusCode::FOUND)).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            MediaError::from(FetchError::Request("reset".into())).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            MediaError::from(FetchError::Timeout).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            MediaError::from(TransformError::Decode("bad".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            MediaError::StorageUnavailable.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_error_response_is_json_no_store() {
        let response = MediaError::InvalidUrl("nope".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            NO_STORE
        );
        assert!(response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("application/json"));
    }

    #[test]
    fn test_redirect_outcome_headers() {
        let response = ImageOutcome::Redirect {
            location: "https://cache.test/_variants/x.webp".into(),
            cache_control: cache_control_value(3600),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://cache.test/_variants/x.webp"
        );
        assert_eq!(response.headers().get(MEDIA_CACHE_HEADER).unwrap(), "hit");
    }
}
