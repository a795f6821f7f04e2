//! # imcache
//!
//! A remote image cache: fetches image bytes over HTTP (optionally with basic
//! authentication), keeps them in a bounded memory tier and an optional disk
//! tier, and guarantees at most one network fetch per image at a time no
//! matter how many callers ask for it.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use imcache::{CacheConfig, ImageManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = ImageManager::new(CacheConfig::new().disk_dir("/tmp/imcache"))?;
//!     let bytes = manager.image_of_url("http://127.0.0.1:8080/logo.png").await?;
//!     println!("fetched {} bytes", bytes.len());
//!
//!     // Served from the cache this time.
//!     let again = manager.image_of_url("http://127.0.0.1:8080/logo.png").await?;
//!     assert_eq!(bytes, again);
//!     Ok(())
//! }
//! ```
//!
//! ## Layers
//!
//! - [`key`]: cache keys derived from URL and credentials.
//! - [`store`]: memory + disk LRU tiers.
//! - [`http`] / [`transport`]: the HTTP/1.1 GET client behind a cache miss.
//! - [`coordinator`]: request deduplication and cancellation.
//! - [`manager`]: the application-facing handle.
//! - [`view`]: adapter for UI image views.

pub mod config;
pub mod coordinator;
pub mod http;
pub mod key;
pub mod manager;
pub mod store;
pub mod transport;
pub mod view;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use config::{CacheConfig, ConfigError};
pub use coordinator::{FetchCoordinator, FetchError};
pub use key::{CacheKey, Credentials};
pub use manager::ImageManager;
pub use store::Store;
pub use transport::{FetchRequest, HttpTransport, NetworkError, Transport};
pub use view::{CachedImageView, ImageSink};
