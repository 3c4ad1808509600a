//! Environment-driven configuration, in the style of the rest of the
//! fleet's `*Config::from_env()` constructors: typed fields, sensible
//! defaults, no generic config-file parser.

use std::time::Duration;

/// Connection and namespace configuration for the datastore facade.
#[derive(Debug, Clone)]
pub struct DatastoreConfig {
    /// Redis/DragonflyDB connection URL.
    pub url: String,

    /// Prefix applied to every key this workspace touches (`<prefix>:`).
    pub key_prefix: String,

    /// How long to wait for a connection to be established.
    pub connect_timeout: Duration,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "conveyor".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl DatastoreConfig {
    /// Build configuration from environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// - `REDIS_URL` (default `redis://127.0.0.1:6379`)
    /// - `CONVEYOR_KEY_PREFIX` (default `conveyor`)
    /// - `CONVEYOR_CONNECT_TIMEOUT_MS` (default `5000`)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let url = std::env::var("REDIS_URL").unwrap_or(defaults.url);
        let key_prefix = std::env::var("CONVEYOR_KEY_PREFIX").unwrap_or(defaults.key_prefix);
        let connect_timeout = std::env::var("CONVEYOR_CONNECT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.connect_timeout);

        Self {
            url,
            key_prefix,
            connect_timeout,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Load a `.env` file (if present) before reading from the
    /// environment. No-op if the file doesn't exist.
    pub fn load_dotenv() {
        let _ = dotenvy::dotenv();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DatastoreConfig::default();
        assert_eq!(config.url, "redis://127.0.0.1:6379");
        assert_eq!(config.key_prefix, "conveyor");
    }

    #[test]
    fn test_builder() {
        let config = DatastoreConfig::default()
            .with_url("redis://example:6380")
            .with_key_prefix("myapp");
        assert_eq!(config.url, "redis://example:6380");
        assert_eq!(config.key_prefix, "myapp");
    }
}
