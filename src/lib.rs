//! # wxcore - credential caching REST client core
//!
//! The shared layer under thin provider API bindings (menus, QR codes, content
//! checks, messaging, licensing). It obtains short-lived access tokens, caches
//! them in-process or in Redis, refreshes them without duplicate refreshes
//! from concurrent callers, and transparently retries a call once when the
//! provider rejects the token mid-flight.
//!
//! ## Features
//!
//! - Access-token cache with one in-flight refresh per identity
//! - In-memory and Redis key-value backends behind one trait
//! - Built-in sources for app, corp and third-party component identities
//! - JSON, query, multipart and download calls with a single credential retry
//! - Typed errors carrying provider `errcode`/`errmsg`
//!
//! ## Basic Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use wxcore::{AppCredential, Config, CredentialCache, MemoryCache, RestClient};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let source = Arc::new(AppCredential::new("wx1234567890", "app-secret"));
//!     let credential = CredentialCache::new(source, Arc::new(MemoryCache::new()));
//!     let client = RestClient::new(Config::default(), credential)?;
//!
//!     let menu = client.get("/cgi-bin/get_current_selfmenu_info", &[("lang", "zh_CN")])?;
//!     println!("menu open: {:?}", menu.get("is_menu_open"));
//!     Ok(())
//! }
//! ```
//!
//! ## Shared cache
//!
//! With the `redis` feature (on by default), `RedisCache` shares tokens
//! between processes; see the `redis_cache` module.

pub mod cache;
pub mod client;
pub mod clock;
pub mod credential;
pub mod error;
#[cfg(feature = "redis")]
pub mod redis_cache;
pub mod response;
pub mod rest;
pub mod token_cache;
pub mod upload;

// Re-export main types for convenience
pub use cache::{KvCache, MemoryCache};
pub use client::{AuthPlacement, Config, DEFAULT_CREDENTIAL_CODES};
pub use clock::{Clock, ManualClock, SystemClock};
pub use credential::{
    AppCredential, ComponentCredential, CorpCredential, CredentialRecord, CredentialSource, IssuedCredential,
};
pub use error::{RestError, Result};
#[cfg(feature = "redis")]
pub use redis_cache::{RedisCache, RedisOptions, RedisUrl};
pub use response::Response;
pub use rest::RestClient;
pub use token_cache::{CredentialCache, RefreshLocks};
pub use upload::{Download, MediaUpload};

// Re-export serde_json for convenience
pub use serde_json::json;
