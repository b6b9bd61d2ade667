//! Rate limiting middleware
//!
//! Sliding-window admission control keyed by client identifier. Each
//! identifier keeps the timestamps of its admitted requests inside the
//! window; a request is admitted while fewer than `max_requests` remain.
//!
//! State is split across a fixed number of shards, each behind its own
//! `parking_lot::Mutex`, so the read-filter-append sequence for one
//! identifier is atomic and unrelated identifiers rarely contend.

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::RateLimitSettings;
use crate::server::connect_info::MaybeConnectInfo;
use crate::server::metrics::MediaMetrics;

/// Number of independently locked shards
const SHARD_COUNT: usize = 16;

/// Minimum time between sweeps of idle identifiers
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Time until the oldest request leaves the window (set when rejected)
    pub retry_after: Option<Duration>,
    /// Requests still available in the current window
    pub remaining: u32,
}

type Shard = Mutex<HashMap<String, VecDeque<Instant>>>;

/// Sharded sliding-window rate limiter.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    shards: Vec<Shard>,
    last_prune: Mutex<Instant>,
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl SlidingWindowLimiter {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            last_prune: Mutex::new(Instant::now()),
        }
    }

    /// Record a request for `identifier` and decide whether to admit it.
    pub fn check(&self, identifier: &str, max_requests: u32, window: Duration) -> RateDecision {
        self.check_at(identifier, max_requests, window, Instant::now())
    }

    fn check_at(
        &self,
        identifier: &str,
        max_requests: u32,
        window: Duration,
        now: Instant,
    ) -> RateDecision {
        let decision = {
            let mut shard = self.shard(identifier).lock();
            let hits = shard.entry(identifier.to_string()).or_default();

            while let Some(&oldest) = hits.front() {
                if now.saturating_duration_since(oldest) >= window {
                    hits.pop_front();
                } else {
                    break;
                }
            }

            let limit = max_requests as usize;
            if hits.len() < limit {
                hits.push_back(now);
                RateDecision {
                    allowed: true,
                    retry_after: None,
                    remaining: (limit - hits.len()) as u32,
                }
            } else {
                let retry_after = hits
                    .front()
                    .map(|&oldest| window.saturating_sub(now.saturating_duration_since(oldest)))
                    .unwrap_or(window);
                RateDecision {
                    allowed: false,
                    retry_after: Some(retry_after),
                    remaining: 0,
                }
            }
        };

        self.maybe_prune(window, now);
        decision
    }

    /// Drop identifiers with no requests inside `window`.
    pub fn prune(&self, window: Duration) {
        self.prune_at(window, Instant::now());
    }

    fn prune_at(&self, window: Duration, now: Instant) {
        for shard in &self.shards {
            shard.lock().retain(|_, hits| {
                hits.back()
                    .is_some_and(|&newest| now.saturating_duration_since(newest) < window)
            });
        }
    }

    fn maybe_prune(&self, window: Duration, now: Instant) {
        {
            let mut last_prune = self.last_prune.lock();
            if now.saturating_duration_since(*last_prune) < PRUNE_INTERVAL {
                return;
            }
            *last_prune = now;
        }
        self.prune_at(window, now);
        tracing::debug!(tracked = self.tracked(), "rate limiter pruned");
    }

    /// Number of identifiers currently tracked
    pub fn tracked(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    fn shard(&self, identifier: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        identifier.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }
}

/// State for [`rate_limit_middleware`].
#[derive(Clone)]
pub struct RateLimitState {
    limiter: Arc<SlidingWindowLimiter>,
    settings: RateLimitSettings,
    metrics: Arc<MediaMetrics>,
}

impl RateLimitState {
    pub fn new(settings: RateLimitSettings, metrics: Arc<MediaMetrics>) -> Self {
        Self {
            limiter: Arc::new(SlidingWindowLimiter::new()),
            settings,
            metrics,
        }
    }

    pub fn limiter(&self) -> &SlidingWindowLimiter {
        &self.limiter
    }

    fn is_exempt(&self, ip: &IpAddr) -> bool {
        self.settings.exempt_loopback && ip.is_loopback()
    }
}

/// Extract client IP from request
fn extract_client_ip(
    remote_addr: Option<SocketAddr>,
    headers: &HeaderMap,
    trust_proxy: bool,
) -> Option<IpAddr> {
    if trust_proxy {
        // Leftmost X-Forwarded-For entry is the original client
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|ip| ip.trim().parse::<IpAddr>().ok());
        if forwarded.is_some() {
            return forwarded;
        }

        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|ip| ip.trim().parse::<IpAddr>().ok());
        if real_ip.is_some() {
            return real_ip;
        }
    }

    remote_addr.map(|addr| addr.ip())
}

/// Rate limiting middleware
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    MaybeConnectInfo(remote_addr): MaybeConnectInfo,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !state.settings.enabled {
        return next.run(request).await;
    }

    let Some(client_ip) = extract_client_ip(
        remote_addr,
        request.headers(),
        state.settings.trust_proxy_headers,
    ) else {
        tracing::debug!("rate limit skipped, client IP unknown");
        return next.run(request).await;
    };

    if state.is_exempt(&client_ip) {
        return next.run(request).await;
    }

    let decision = state.limiter.check(
        &client_ip.to_string(),
        state.settings.max_requests,
        Duration::from_millis(state.settings.window_ms),
    );

    if decision.allowed {
        return next.run(request).await;
    }

    state.metrics.rate_limited_total.inc();
    let retry_after_secs = decision
        .retry_after
        .map(|d| d.as_secs() + u64::from(d.subsec_nanos() > 0))
        .unwrap_or(1)
        .max(1);
    tracing::warn!(client = %client_ip, path = %request.uri().path(), retry_after_secs, "rate limit exceeded");
    rate_limit_exceeded_response(retry_after_secs)
}

fn rate_limit_exceeded_response(retry_after_secs: u64) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [
            (header::CONTENT_TYPE, "application/json; charset=utf-8".to_string()),
            (header::RETRY_AFTER, retry_after_secs.to_string()),
            (header::CACHE_CONTROL, "no-store".to_string()),
        ],
        format!(
            r#"{{"error":{{"code":"RATE_LIMIT_EXCEEDED","message":"Too many requests","retryAfter":{}}}}}"#,
            retry_after_secs
        ),
    )
        .into_response()
}
