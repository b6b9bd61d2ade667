//! HTTP surface
//!
//! Routes:
//! - `GET /media/image?url=&w=&q=`
//! - `GET /media/video?url=` (honors `Range` / `If-Range`)
//! - `GET /health`
//! - `GET /metrics`
//!
//! The rate limiter guards the media routes only.

use std::sync::Arc;

use axum::extract::{RawQuery, State};
use axum::http::HeaderMap;
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::media::service::{ImageRequest, MediaError, MediaService};
use crate::server::metrics::{metrics_handler, MediaMetrics};
use crate::server::ratelimit::{rate_limit_middleware, RateLimitState};

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<MediaService>,
    pub metrics: Arc<MediaMetrics>,
}

impl AppState {
    pub fn new(service: MediaService) -> Self {
        let metrics = Arc::clone(service.metrics());
        Self {
            service: Arc::new(service),
            metrics,
        }
    }
}

/// Raw `/media/*` query values; parsing happens in the service so malformed
/// input gets the JSON error body instead of an extractor rejection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct MediaQuery {
    url: Option<String>,
    w: Option<String>,
    q: Option<String>,
}

impl MediaQuery {
    fn parse(raw: Option<&str>) -> Self {
        let mut query = MediaQuery::default();
        for (key, value) in url::form_urlencoded::parse(raw.unwrap_or_default().as_bytes()) {
            let slot = match key.as_ref() {
                "url" => &mut query.url,
                "w" => &mut query.w,
                "q" => &mut query.q,
                _ => continue,
            };
            // First occurrence wins
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }
        query
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Build the application router.
pub fn router(state: AppState, rate_limit: Option<RateLimitState>) -> Router {
    let mut media = Router::new()
        .route("/media/image", get(image_handler))
        .route("/media/video", get(video_handler));
    if let Some(rate_limit) = rate_limit {
        media = media.route_layer(middleware::from_fn_with_state(
            rate_limit,
            rate_limit_middleware,
        ));
    }

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(media)
        .with_state(state)
}

async fn image_handler(State(state): State<AppState>, RawQuery(raw): RawQuery) -> Response {
    let query = MediaQuery::parse(raw.as_deref());
    let request = match ImageRequest::parse(
        query.url.as_deref(),
        query.w.as_deref(),
        query.q.as_deref(),
        state.service.settings(),
    ) {
        Ok(request) => request,
        Err(e) => return error_response(&state, "image", e),
    };

    match state.service.image(request).await {
        Ok(outcome) => {
            state
                .metrics
                .requests_total
                .inc(&["image", outcome.cache_status().as_str()]);
            outcome.into_response()
        }
        Err(e) => error_response(&state, "image", e),
    }
}

async fn video_handler(
    State(state): State<AppState>,
    RawQuery(raw): RawQuery,
    headers: HeaderMap,
) -> Response {
    let query = MediaQuery::parse(raw.as_deref());
    match state.service.video(query.url.as_deref(), &headers).await {
        Ok(response) => {
            state.metrics.requests_total.inc(&["video", "ok"]);
            response
        }
        Err(e) => error_response(&state, "video", e),
    }
}

fn error_response(state: &AppState, endpoint: &str, error: MediaError) -> Response {
    let outcome = error.code().to_ascii_lowercase();
    state.metrics.requests_total.inc(&[endpoint, &outcome]);
    if error.status().is_server_error() {
        tracing::warn!(endpoint, code = error.code(), error = %error, "media request failed");
    } else {
        tracing::debug!(endpoint, code = error.code(), error = %error, "media request rejected");
    }
    error.into_response()
}

/// Health check handler
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.metrics.uptime_secs(),
    })
}
