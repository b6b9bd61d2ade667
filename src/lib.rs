//! media-proxy library
//!
//! Fetches images and videos from allowlisted origins, serves resized WebP
//! variants that are cached back into object storage under deterministic
//! keys, and relays byte-range video requests.

pub mod cli;
pub mod config;
pub mod logging;
pub mod media;
pub mod server;
