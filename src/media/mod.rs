//! Media pipeline
//!
//! - **allowlist**: structural SSRF guard over trusted origins
//! - **cache_key**: deterministic storage paths for image variants
//! - **cache_control**: `Cache-Control` policy for media responses
//! - **fetch**: origin client (no redirects, timeouts, size limits)
//! - **store**: object store backends and the cache-aside `VariantCache`
//! - **transform**: decode, shrink and re-encode to WebP
//! - **writeback**: bounded worker pool persisting new variants
//! - **service**: the image and video request pipelines

pub mod allowlist;
pub mod cache_control;
pub mod cache_key;
pub mod fetch;
pub mod service;
pub mod store;
pub mod transform;
pub mod writeback;

pub use allowlist::{AllowlistEntry, AllowlistError, OriginAllowlist};
pub use cache_control::cache_control_value;
pub use cache_key::CacheKey;
pub use fetch::{FetchConfig, FetchError, OriginClient};
pub use service::{CacheStatus, ImageOutcome, ImageRequest, MediaError, MediaService, MediaSettings};
pub use store::{HttpObjectStore, HttpStoreConfig, MemoryObjectStore, ObjectStore, StoreError, VariantCache};
pub use transform::{TransformError, TransformOutput, TransformParams};
pub use writeback::{WriteBackJob, WriteBackPool, WriteBackQueue};
