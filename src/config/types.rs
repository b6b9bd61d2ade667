//! Typed configuration structures
//!
//! Every section has production defaults, so an empty file (or no file at
//! all) yields a runnable proxy that rejects every origin.

use serde::{Deserialize, Serialize};

use crate::media::cache_key::DEFAULT_VARIANT_PREFIX;
use crate::media::fetch::{DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_FETCH_TIMEOUT_MS, DEFAULT_MAX_INPUT_BYTES};
use crate::media::service::{
    DEFAULT_IMAGE_MAX_AGE_SECS, DEFAULT_MAX_QUALITY, DEFAULT_MAX_WIDTH, DEFAULT_QUALITY,
    DEFAULT_VIDEO_MAX_AGE_SECS,
};
use crate::media::store::{DEFAULT_OBJECT_PATH, DEFAULT_PUBLIC_PATH, DEFAULT_STORE_TIMEOUT_MS};
use crate::media::writeback::{DEFAULT_WRITEBACK_QUEUE_CAPACITY, DEFAULT_WRITEBACK_WORKERS};

pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_RATE_LIMIT_MAX_REQUESTS: u32 = 120;
pub const DEFAULT_RATE_LIMIT_WINDOW_MS: u64 = 60_000;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub media: MediaConfig,
    pub cache: CacheConfig,
    /// Object store for variants. Image requests fail with 503 without it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,
    pub write_back: WriteBackConfig,
    pub rate_limit: RateLimitSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `media_proxy=debug,info`
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaConfig {
    /// Trusted origins (`scheme://host[:port]`)
    pub allowed_origins: Vec<String>,
    pub max_width: u32,
    pub max_quality: u8,
    pub default_quality: u8,
    pub max_input_bytes: u64,
    pub fetch_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            max_width: DEFAULT_MAX_WIDTH,
            max_quality: DEFAULT_MAX_QUALITY,
            default_quality: DEFAULT_QUALITY,
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// 0 disables caching (`no-store`)
    pub image_max_age_secs: u64,
    pub video_max_age_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            image_max_age_secs: DEFAULT_IMAGE_MAX_AGE_SECS,
            video_max_age_secs: DEFAULT_VIDEO_MAX_AGE_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    pub base_url: String,
    pub bucket: String,
    #[serde(default)]
    pub service_key: String,
    #[serde(default = "default_object_path")]
    pub object_path: String,
    #[serde(default = "default_public_path")]
    pub public_path: String,
    #[serde(default = "default_variant_prefix")]
    pub variant_prefix: String,
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_object_path() -> String {
    DEFAULT_OBJECT_PATH.to_string()
}

fn default_public_path() -> String {
    DEFAULT_PUBLIC_PATH.to_string()
}

fn default_variant_prefix() -> String {
    DEFAULT_VARIANT_PREFIX.to_string()
}

fn default_store_timeout_ms() -> u64 {
    DEFAULT_STORE_TIMEOUT_MS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WriteBackConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for WriteBackConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WRITEBACK_WORKERS,
            queue_capacity: DEFAULT_WRITEBACK_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub max_requests: u32,
    pub window_ms: u64,
    /// Honor `X-Forwarded-For` / `X-Real-IP`; only safe behind a proxy
    pub trust_proxy_headers: bool,
    pub exempt_loopback: bool,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: DEFAULT_RATE_LIMIT_MAX_REQUESTS,
            window_ms: DEFAULT_RATE_LIMIT_WINDOW_MS,
            trust_proxy_headers: false,
            exempt_loopback: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_gives_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.media.default_quality, DEFAULT_QUALITY);
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.storage.is_none());
        assert!(config.rate_limit.enabled);
    }

    #[test]
    fn test_camel_case_fields() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "media": { "allowedOrigins": ["https://cdn.example.com"], "maxWidth": 2000 },
            "writeBack": { "queueCapacity": 8 },
            "rateLimit": { "trustProxyHeaders": true },
            "logging": { "format": "json" }
        }))
        .unwrap();

        assert_eq!(config.media.allowed_origins, vec!["https://cdn.example.com"]);
        assert_eq!(config.media.max_width, 2000);
        assert_eq!(config.media.max_quality, DEFAULT_MAX_QUALITY);
        assert_eq!(config.write_back.queue_capacity, 8);
        assert_eq!(config.write_back.workers, DEFAULT_WRITEBACK_WORKERS);
        assert!(config.rate_limit.trust_proxy_headers);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_storage_defaults() {
        let storage: StorageConfig = serde_json::from_value(serde_json::json!({
            "baseUrl": "https://project.storage.example.net",
            "bucket": "media"
        }))
        .unwrap();
        assert_eq!(storage.public_path, DEFAULT_PUBLIC_PATH);
        assert_eq!(storage.variant_prefix, DEFAULT_VARIANT_PREFIX);
        assert!(storage.service_key.is_empty());
    }

    #[test]
    fn test_storage_requires_bucket() {
        let result: Result<StorageConfig, _> = serde_json::from_value(serde_json::json!({
            "baseUrl": "https://project.storage.example.net"
        }));
        assert!(result.is_err());
    }
}
