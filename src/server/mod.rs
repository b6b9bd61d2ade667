//! Server module
//!
//! Wires configuration into the media pipeline and runs the HTTP server
//! with graceful shutdown.

pub mod connect_info;
pub mod http;
pub mod metrics;
pub mod ratelimit;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use thiserror::Error;
use url::Url;

use crate::config::Config;
use crate::media::allowlist::{AllowlistEntry, OriginAllowlist};
use crate::media::fetch::{FetchConfig, OriginClient};
use crate::media::service::{MediaService, MediaSettings};
use crate::media::store::{HttpObjectStore, HttpStoreConfig, ObjectStore, VariantCache};
use crate::media::writeback::WriteBackPool;
use crate::server::http::{router, AppState};
use crate::server::metrics::MediaMetrics;
use crate::server::ratelimit::RateLimitState;

/// How long shutdown waits for queued write-backs
const WRITEBACK_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to bind {addr}: {message}")]
    Bind { addr: String, message: String },

    #[error("Server error: {0}")]
    Serve(String),
}

/// A built application: the router plus the write-back workers to drain
/// on shutdown.
pub struct App {
    pub router: Router,
    pub writeback: Option<WriteBackPool>,
}

/// Build the allowlist: configured origins plus the storage origin restricted
/// to its public object path.
pub fn build_allowlist(config: &Config) -> Result<OriginAllowlist, ServerError> {
    let storage_origin = match &config.storage {
        Some(storage) => Some(
            AllowlistEntry::parse(&storage.base_url)
                .map_err(|e| ServerError::Config(format!("storage.baseUrl: {e}")))?,
        ),
        None => None,
    };

    let mut allowlist = OriginAllowlist::default();
    for raw in &config.media.allowed_origins {
        let entry = AllowlistEntry::parse(raw)
            .map_err(|e| ServerError::Config(format!("media.allowedOrigins: {e}")))?;
        // An unrestricted entry would bypass the public-path constraint.
        if storage_origin
            .as_ref()
            .is_some_and(|storage| storage.origin() == entry.origin())
        {
            tracing::warn!(origin = %raw, "storage origin listed in allowedOrigins; keeping public-path restriction");
            continue;
        }
        allowlist.push(entry);
    }

    if let (Some(entry), Some(storage)) = (storage_origin, &config.storage) {
        allowlist.push(entry.with_path_prefix(storage.public_path.clone()));
    }

    Ok(allowlist)
}

/// Build the application from configuration.
pub fn build_app(config: &Config, metrics: Arc<MediaMetrics>) -> Result<App, ServerError> {
    let allowlist = build_allowlist(config)?;

    let client = OriginClient::new(FetchConfig {
        timeout: Duration::from_millis(config.media.fetch_timeout_ms),
        connect_timeout: Duration::from_millis(config.media.connect_timeout_ms),
        max_size: config.media.max_input_bytes,
    })
    .map_err(|e| ServerError::Config(e.to_string()))?;

    let mut settings = MediaSettings {
        max_width: config.media.max_width,
        max_quality: config.media.max_quality,
        default_quality: config.media.default_quality,
        image_max_age_secs: config.cache.image_max_age_secs,
        video_max_age_secs: config.cache.video_max_age_secs,
        ..Default::default()
    };

    let mut writeback = None;
    let service = match &config.storage {
        Some(storage) => {
            settings.variant_prefix = storage.variant_prefix.clone();
            let base_url = Url::parse(&storage.base_url)
                .map_err(|e| ServerError::Config(format!("storage.baseUrl: {e}")))?;
            let store: Arc<dyn ObjectStore> = Arc::new(
                HttpObjectStore::new(HttpStoreConfig {
                    base_url,
                    bucket: storage.bucket.clone(),
                    service_key: storage.service_key.clone(),
                    object_path: storage.object_path.clone(),
                    public_path: storage.public_path.clone(),
                    timeout: Duration::from_millis(storage.timeout_ms),
                })
                .map_err(|e| ServerError::Config(e.to_string()))?,
            );

            let (queue, pool) = WriteBackPool::spawn(
                Arc::clone(&store),
                config.write_back.workers,
                config.write_back.queue_capacity,
                Arc::clone(&metrics),
            );
            writeback = Some(pool);
            MediaService::new(allowlist, client, settings, Arc::clone(&metrics))
                .with_cache(VariantCache::new(store), queue)
        }
        None => {
            tracing::warn!("no storage configured; image requests will return 503");
            MediaService::new(allowlist, client, settings, Arc::clone(&metrics))
        }
    };

    let rate_limit = config
        .rate_limit
        .enabled
        .then(|| RateLimitState::new(config.rate_limit.clone(), Arc::clone(&metrics)));

    Ok(App {
        router: router(AppState::new(service), rate_limit),
        writeback,
    })
}

/// Run the server until Ctrl-C / SIGTERM, then drain pending write-backs.
pub async fn run(config: Config) -> Result<(), ServerError> {
    let metrics = Arc::new(MediaMetrics::new());
    let App { router, writeback } = build_app(&config, metrics)?;

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ServerError::Bind {
            addr: addr.clone(),
            message: e.to_string(),
        })?;

    tracing::info!(
        address = %addr,
        origins = config.media.allowed_origins.len(),
        storage = config.storage.is_some(),
        "media proxy listening"
    );

    // Serving consumes the router, and with it the last write-back queue
    // handle, so the workers see a closed queue once the server stops.
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| ServerError::Serve(e.to_string()))?;

    if let Some(pool) = writeback {
        tracing::info!("draining write-back queue");
        if !pool.shutdown(WRITEBACK_DRAIN_TIMEOUT).await {
            tracing::warn!("write-back queue did not drain before timeout");
        }
    }

    tracing::info!("media proxy stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;

    fn storage() -> StorageConfig {
        StorageConfig {
            base_url: "https://project.storage.example.net".to_string(),
            bucket: "media".to_string(),
            service_key: String::new(),
            object_path: "/storage/v1/object".to_string(),
            public_path: "/storage/v1/object/public".to_string(),
            variant_prefix: "_variants".to_string(),
            timeout_ms: 1000,
        }
    }

    #[test]
    fn test_allowlist_includes_storage_with_prefix() {
        let mut config = Config::default();
        config.media.allowed_origins = vec!["https://cdn.example.com".to_string()];
        config.storage = Some(storage());

        let allowlist = build_allowlist(&config).unwrap();
        assert_eq!(allowlist.len(), 2);
        assert!(allowlist.check("https://cdn.example.com/any/path.png").is_ok());
        assert!(allowlist
            .check("https://project.storage.example.net/storage/v1/object/public/media/a.png")
            .is_ok());
        assert!(allowlist
            .check("https://project.storage.example.net/auth/v1/admin/users")
            .is_err());
    }

    #[test]
    fn test_storage_origin_keeps_restriction_when_listed() {
        let mut config = Config::default();
        config.media.allowed_origins = vec!["https://project.storage.example.net".to_string()];
        config.storage = Some(storage());

        let allowlist = build_allowlist(&config).unwrap();
        assert_eq!(allowlist.len(), 1);
        assert!(allowlist
            .check("https://project.storage.example.net/rest/v1/secrets")
            .is_err());
    }

    #[tokio::test]
    async fn test_build_app_without_storage() {
        let app = build_app(&Config::default(), Arc::new(MediaMetrics::new())).unwrap();
        assert!(app.writeback.is_none());
    }

    #[tokio::test]
    async fn test_build_app_with_storage() {
        let mut config = Config::default();
        config.storage = Some(storage());
        let app = build_app(&config, Arc::new(MediaMetrics::new())).unwrap();
        assert!(app.writeback.is_some());
    }
}
