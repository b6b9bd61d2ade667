//! Object store client and variant cache
//!
//! The object store is both the home of original uploads and the cache for
//! generated variants. `ObjectStore` is the pluggable backend seam;
//! `VariantCache` is the cache-aside layer the image path talks to, so a
//! different eviction or TTL policy can be attached there without touching
//! the transform or proxy logic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{header, StatusCode};
use bytes::Bytes;
use parking_lot::RwLock;
use reqwest::Client;
use thiserror::Error;
use url::Url;

use crate::media::cache_key::CacheKey;

/// Default object store request timeout (10s)
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 10_000;

/// Default object API path on the storage host
pub const DEFAULT_OBJECT_PATH: &str = "/storage/v1/object";

/// Default public-object path prefix on the storage host
pub const DEFAULT_PUBLIC_PATH: &str = "/storage/v1/object/public";

/// Cache lifetime stamped on uploaded variants (1 year)
const VARIANT_UPLOAD_CACHE_CONTROL: &str = "max-age=31536000";

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("failed to build http client: {0}")]
    Client(String),

    #[error("object store request failed: {0}")]
    Request(String),

    #[error("object store returned status {status} for {path}")]
    Status { status: StatusCode, path: String },
}

/// Backend holding original objects and generated variants.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether an object exists at `path`.
    async fn exists(&self, path: &str) -> Result<bool, StoreError>;

    /// Create or overwrite the object at `path`.
    async fn put(&self, path: &str, bytes: Bytes, content_type: &str) -> Result<(), StoreError>;

    /// Public URL clients can be redirected to for `path`.
    fn public_url(&self, path: &str) -> String;
}

// ---------------------------------------------------------------------------
// HTTP backend
// ---------------------------------------------------------------------------

/// Connection settings for an HTTP object store.
#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    pub base_url: Url,
    pub bucket: String,
    pub service_key: String,
    pub object_path: String,
    pub public_path: String,
    pub timeout: Duration,
}

/// Object store reached over a bucket-style HTTP API:
/// - `HEAD {public_path}/{bucket}/{path}` for existence
/// - `POST {object_path}/{bucket}/{path}` with `x-upsert: true` for writes
#[derive(Clone)]
pub struct HttpObjectStore {
    client: Client,
    config: HttpStoreConfig,
}

impl HttpObjectStore {
    pub fn new(config: HttpStoreConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| StoreError::Client(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn join(&self, prefix: &str, path: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.config.base_url.as_str().trim_end_matches('/'),
            prefix.trim_matches('/'),
            self.config.bucket.trim_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn object_url(&self, path: &str) -> String {
        self.join(&self.config.object_path, path)
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let response = self
            .client
            .head(self.public_url(path))
            .send()
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            // Some bucket APIs report a missing object as 400.
            StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST => Ok(false),
            status => Err(StoreError::Status {
                status,
                path: path.to_string(),
            }),
        }
    }

    async fn put(&self, path: &str, bytes: Bytes, content_type: &str) -> Result<(), StoreError> {
        let response = self
            .client
            .post(self.object_url(path))
            .bearer_auth(&self.config.service_key)
            .header("apikey", &self.config.service_key)
            .header("x-upsert", "true")
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CACHE_CONTROL, VARIANT_UPLOAD_CACHE_CONTROL)
            .body(bytes)
            .send()
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(StoreError::Status {
                status,
                path: path.to_string(),
            })
        }
    }

    fn public_url(&self, path: &str) -> String {
        self.join(&self.config.public_path, path)
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Bytes,
    pub content_type: String,
}

/// Process-local object store. Last write wins, like the HTTP backend.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    public_base: String,
    objects: RwLock<HashMap<String, StoredObject>>,
    fail_writes: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new(public_base: impl Into<String>) -> Self {
        Self {
            public_base: public_base.into().trim_end_matches('/').to_string(),
            ..Default::default()
        }
    }

    pub fn get(&self, path: &str) -> Option<StoredObject> {
        self.objects.read().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Make subsequent writes fail, for exercising the write-back error path.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        Ok(self.objects.read().contains_key(path))
    }

    async fn put(&self, path: &str, bytes: Bytes, content_type: &str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StoreError::Status {
                status: StatusCode::SERVICE_UNAVAILABLE,
                path: path.to_string(),
            });
        }
        self.objects.write().insert(
            path.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}/{}", self.public_base, path)
    }
}

// ---------------------------------------------------------------------------
// Cache-aside layer
// ---------------------------------------------------------------------------

/// Cache-aside view of the object store for image variants.
#[derive(Clone)]
pub struct VariantCache {
    store: Arc<dyn ObjectStore>,
}

impl VariantCache {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Public URL of the variant if it is already stored.
    ///
    /// Lookup failures count as a miss: the caller recomputes the variant
    /// instead of failing the request.
    pub async fn lookup(&self, key: &CacheKey) -> Option<String> {
        match self.store.exists(key.as_str()).await {
            Ok(true) => Some(self.store.public_url(key.as_str())),
            Ok(false) => None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "variant lookup failed, treating as miss");
                None
            }
        }
    }
}
