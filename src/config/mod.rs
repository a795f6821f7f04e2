//! Cache configuration.
//!
//! [`CacheConfig`] can be built in code with its builder methods or loaded
//! from JSON. Every field has a default, so a config file only needs to name
//! the values it changes.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while loading or validating a [`CacheConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Default `User-Agent` sent by the HTTP transport.
pub const DEFAULT_USER_AGENT: &str = concat!("imcache/", env!("CARGO_PKG_VERSION"));

/// Configuration for an [`ImageManager`](crate::manager::ImageManager).
///
/// # Examples
///
/// ```
/// use imcache::config::CacheConfig;
///
/// let config = CacheConfig::from_json_str(r#"{ "memory_capacity": 16, "max_redirects": 0 }"#).unwrap();
/// assert_eq!(config.memory_capacity, 16);
/// assert_eq!(config.max_redirects, 0);
/// assert!(config.disk_dir.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries in the memory tier.
    pub memory_capacity: usize,
    /// Maximum total payload bytes in the memory tier.
    pub memory_max_bytes: u64,
    /// Directory of the disk tier. `None` keeps the cache memory-only.
    pub disk_dir: Option<PathBuf>,
    /// Maximum total payload bytes in the disk tier.
    pub disk_max_bytes: u64,
    /// Upper bound on one complete fetch, redirects included, in milliseconds.
    pub timeout_ms: u64,
    /// Redirects followed before giving up.
    pub max_redirects: u32,
    /// Largest response body accepted.
    pub max_body_bytes: usize,
    /// `User-Agent` request header.
    pub user_agent: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 256,
            memory_max_bytes: 64 * 1024 * 1024,
            disk_dir: None,
            disk_max_bytes: 256 * 1024 * 1024,
            timeout_ms: 30_000,
            max_redirects: 5,
            max_body_bytes: 32 * 1024 * 1024,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }
}

impl CacheConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Json`] for malformed JSON and
    /// [`ConfigError::Invalid`] if [`validate`](Self::validate) fails.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that would make the cache unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "memory_capacity",
                reason: "must be greater than zero",
            });
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "timeout_ms",
                reason: "must be greater than zero",
            });
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "max_body_bytes",
                reason: "must be greater than zero",
            });
        }
        Ok(())
    }

    /// Returns the fetch timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Sets the memory-tier entry capacity.
    #[must_use]
    pub fn memory_capacity(mut self, entries: usize) -> Self {
        self.memory_capacity = entries;
        self
    }

    /// Sets the memory-tier byte budget.
    #[must_use]
    pub fn memory_max_bytes(mut self, bytes: u64) -> Self {
        self.memory_max_bytes = bytes;
        self
    }

    /// Enables the disk tier rooted at `dir`.
    #[must_use]
    pub fn disk_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.disk_dir = Some(dir.into());
        self
    }

    /// Sets the disk-tier byte budget.
    #[must_use]
    pub fn disk_max_bytes(mut self, bytes: u64) -> Self {
        self.disk_max_bytes = bytes;
        self
    }

    /// Sets the fetch timeout.
    #[must_use]
    pub fn timeout_ms(mut self, millis: u64) -> Self {
        self.timeout_ms = millis;
        self
    }

    /// Sets how many redirects the transport follows.
    #[must_use]
    pub fn max_redirects(mut self, redirects: u32) -> Self {
        self.max_redirects = redirects;
        self
    }

    /// Sets the largest accepted response body.
    #[must_use]
    pub fn max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }

    /// Sets the `User-Agent` header.
    #[must_use]
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = agent.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert!(config.user_agent.starts_with("imcache/"));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = CacheConfig::from_json_str(r#"{ "disk_dir": "/tmp/images" }"#).unwrap();
        assert_eq!(config.disk_dir, Some(PathBuf::from("/tmp/images")));
        assert_eq!(config.memory_capacity, 256);
    }

    #[test]
    fn zero_capacity_rejected() {
        let err = CacheConfig::from_json_str(r#"{ "memory_capacity": 0 }"#).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "memory_capacity",
                ..
            }
        ));
    }

    #[test]
    fn malformed_json() {
        let err = CacheConfig::from_json_str("{ nope").unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn builder_chain() {
        let config = CacheConfig::new()
            .memory_capacity(4)
            .disk_dir("/var/cache/img")
            .timeout_ms(500)
            .user_agent("test-agent");
        assert_eq!(config.memory_capacity, 4);
        assert_eq!(config.timeout(), Duration::from_millis(500));
        assert_eq!(config.user_agent, "test-agent");
    }
}
