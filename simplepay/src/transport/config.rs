//! Settings of the bundled HTTP transport.
//!
//! Deserialized from the `[transport]` table of the gateway configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{GatewayError, Result};

/// HTTP client settings.
///
/// # Examples
///
/// ```
/// use simplepay::transport::HttpConfig;
///
/// let config: HttpConfig = toml::from_str("timeout_secs = 60\nmax_retries = 2").unwrap();
/// assert_eq!(config.timeout_secs, 60);
/// assert_eq!(config.connect_timeout_secs, 10);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Idle connections kept per host.
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle_per_host: usize,

    /// Whole-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Connect timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// HTTP protocol version.
    #[serde(default)]
    pub http_version: HttpVersion,

    /// Extra attempts on timeouts, connection errors and 5xx answers.
    #[serde(default)]
    pub max_retries: u32,

    /// First backoff delay in milliseconds; doubles per retry.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            pool_max_idle_per_host: default_pool_max_idle(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            http_version: HttpVersion::default(),
            max_retries: 0,
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl HttpConfig {
    /// Checks the timeout and retry bounds.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ConfigError`] when `timeout_secs` is outside
    /// 1..=300, `connect_timeout_secs` outside 1..=60, or `max_retries` above 5.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 || self.timeout_secs > 300 {
            return Err(GatewayError::ConfigError(
                "timeout_secs must be between 1 and 300".to_owned(),
            ));
        }
        if self.connect_timeout_secs == 0 || self.connect_timeout_secs > 60 {
            return Err(GatewayError::ConfigError(
                "connect_timeout_secs must be between 1 and 60".to_owned(),
            ));
        }
        if self.max_retries > 5 {
            return Err(GatewayError::ConfigError("max_retries must not exceed 5".to_owned()));
        }
        Ok(())
    }

    /// Whole-request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Connect timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// HTTP protocol version selection.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HttpVersion {
    /// HTTP/1.1 only.
    Http1,
    /// HTTP/2 with prior knowledge.
    Http2,
    /// Negotiated.
    #[default]
    Auto,
}

fn default_pool_max_idle() -> usize {
    100
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_retry_delay_ms() -> u64 {
    200
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_config_default() {
        let config = HttpConfig::default();
        assert_eq!(config.pool_max_idle_per_host, 100);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.http_version, HttpVersion::Auto);
        assert_eq!(config.max_retries, 0);
    }

    #[test]
    fn test_http_config_from_toml() {
        let toml = "
            pool_max_idle_per_host = 20
            timeout_secs = 45
            connect_timeout_secs = 15
            http_version = \"http2\"
            max_retries = 3
        ";

        let config: HttpConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.pool_max_idle_per_host, 20);
        assert_eq!(config.timeout_secs, 45);
        assert_eq!(config.connect_timeout_secs, 15);
        assert_eq!(config.http_version, HttpVersion::Http2);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_http_version_invalid_value() {
        #[derive(Deserialize)]
        #[allow(dead_code, reason = "field used for deserialization test")]
        struct Wrapper {
            http_version: HttpVersion,
        }

        let result: std::result::Result<Wrapper, _> = toml::from_str("http_version = \"http3\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_bounds() {
        assert!(HttpConfig::default().validate().is_ok());

        let config = HttpConfig { timeout_secs: 0, ..HttpConfig::default() };
        assert!(config.validate().is_err());

        let config = HttpConfig { connect_timeout_secs: 61, ..HttpConfig::default() };
        assert!(config.validate().is_err());

        let config = HttpConfig { max_retries: 6, ..HttpConfig::default() };
        assert!(config.validate().is_err());
    }
}
