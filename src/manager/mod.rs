//! Process-level image manager.
//!
//! [`ImageManager`] bundles a [`Store`] and a [`FetchCoordinator`] behind the
//! operations a UI layer needs. There is no implicit global instance: build
//! one with [`ImageManager::new`] and, if the application wants a
//! process-wide handle, publish it explicitly with
//! [`install_shared`](ImageManager::install_shared) and retire it with
//! [`teardown_shared`](ImageManager::teardown_shared).

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::info;

use crate::config::{CacheConfig, ConfigError};
use crate::coordinator::{FetchCoordinator, FetchError};
use crate::key::Credentials;
use crate::store::Store;
use crate::transport::{HttpTransport, Transport};

static SHARED: RwLock<Option<ImageManager>> = parking_lot::const_rwlock(None);

/// Cheaply cloneable handle to an image cache.
///
/// # Examples
///
/// ```rust,no_run
/// use imcache::config::CacheConfig;
/// use imcache::manager::ImageManager;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let manager = ImageManager::new(CacheConfig::new().disk_dir("/tmp/imcache"))?;
///     let logo = manager.image_of_url("http://127.0.0.1:8080/logo.png").await?;
///     let avatar = manager
///         .image_of_url_with_credentials("http://127.0.0.1:8080/me.png", "alice", "secret")
///         .await?;
///     println!("{} + {} bytes", logo.len(), avatar.len());
///
///     manager.clear_images();
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ImageManager {
    coordinator: FetchCoordinator,
}

impl ImageManager {
    /// Creates a manager that fetches over [`HttpTransport`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `config` fails validation.
    pub fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        let transport = Arc::new(HttpTransport::from_config(&config));
        Self::with_transport(config, transport)
    }

    /// Creates a manager that fetches through `transport`.
    pub fn with_transport(
        config: CacheConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let store = Arc::new(Store::from_config(&config));
        Ok(Self {
            coordinator: FetchCoordinator::new(store, transport),
        })
    }

    /// Returns the bytes of the image at `url`.
    pub async fn image_of_url(&self, url: &str) -> Result<Bytes, FetchError> {
        self.coordinator.resolve(url, None).await
    }

    /// Returns the bytes of the image at `url`, fetched with HTTP basic auth.
    ///
    /// The result is cached separately from anonymous and other-user fetches
    /// of the same URL.
    pub async fn image_of_url_with_credentials(
        &self,
        url: &str,
        username: &str,
        password: &str,
    ) -> Result<Bytes, FetchError> {
        let credentials = Credentials::new(username, password);
        self.coordinator.resolve(url, Some(&credentials)).await
    }

    /// Resolves `url` with optional credentials.
    pub async fn resolve(
        &self,
        url: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Bytes, FetchError> {
        self.coordinator.resolve(url, credentials).await
    }

    /// Cancels every in-flight fetch; their waiters receive
    /// [`FetchError::Cancelled`]. Returns how many fetches were cancelled.
    pub fn cancel_all_operations(&self) -> usize {
        self.coordinator.cancel_all()
    }

    /// Drops the in-memory tier. Images persisted on disk remain available.
    pub fn clear_images(&self) {
        self.coordinator.store().clear_in_memory();
    }

    /// Deletes every cached image from memory and disk.
    pub fn truncate_store(&self) {
        self.coordinator.store().truncate();
    }

    /// Returns the backing store.
    pub fn store(&self) -> &Arc<Store> {
        self.coordinator.store()
    }

    /// Returns the fetch coordinator.
    pub fn coordinator(&self) -> &FetchCoordinator {
        &self.coordinator
    }

    /// Publishes `manager` as the process-wide instance, returning the one it
    /// replaces. The replaced manager is left running.
    pub fn install_shared(manager: ImageManager) -> Option<ImageManager> {
        let previous = SHARED.write().replace(manager);
        info!(replaced = previous.is_some(), "shared image manager installed");
        previous
    }

    /// Returns the process-wide instance, if one is installed.
    pub fn shared() -> Option<ImageManager> {
        SHARED.read().clone()
    }

    /// Removes the process-wide instance and cancels its pending fetches.
    ///
    /// Returns the removed manager so callers can also truncate or inspect
    /// it. Safe to call when nothing is installed.
    pub fn teardown_shared() -> Option<ImageManager> {
        let manager = SHARED.write().take()?;
        let cancelled = manager.cancel_all_operations();
        info!(cancelled, "shared image manager torn down");
        Some(manager)
    }
}
