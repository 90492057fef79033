//! HTTP transport implementation.
//!
//! This module provides HTTP/1.1 and HTTP/2 delivery of prepared gateway
//! requests using reqwest.

use reqwest::Client;
use tracing::instrument;
use url::Url;

use super::{
    OutboundRequest, RequestBody, Transport, TransportResponse,
    config::{HttpConfig, HttpVersion},
    retry::{RetryPolicy, retry_with_backoff},
};
use crate::error::{GatewayError, Result};

/// Validates URL for security constraints.
///
/// Ensures the URL uses HTTPS and does not point to localhost.
fn validate_url(url: &Url) -> Result<()> {
    if url.scheme() != "https" {
        return Err(GatewayError::TransportFailure("Only HTTPS URLs are allowed".to_owned()));
    }

    if let Some(host) = url.host_str()
        && (host == "localhost" || host == "127.0.0.1" || host == "::1" || host == "[::1]")
    {
        return Err(GatewayError::TransportFailure("Localhost URLs are not allowed".to_owned()));
    }

    Ok(())
}

/// Validates header name and value for CRLF injection prevention.
fn validate_header(name: &str, value: &str) -> Result<()> {
    if name.contains(['\r', '\n', '\0']) {
        return Err(GatewayError::TransportFailure(
            "Invalid header name: control characters not allowed".to_owned(),
        ));
    }
    if value.contains(['\r', '\n', '\0']) {
        return Err(GatewayError::TransportFailure(
            "Invalid header value: control characters not allowed".to_owned(),
        ));
    }
    Ok(())
}

/// HTTP/1.1 and HTTP/2 transport using reqwest.
///
/// Supports connection pooling, keep-alive, and HTTP/2 multiplexing. Non-2xx
/// answers are returned as responses, not errors: the gateway puts error
/// codes in the body.
///
/// # Examples
///
/// ```rust,no_run
/// use simplepay::transport::{HttpConfig, HttpTransport, OutboundRequest, Transport};
///
/// # async fn example() -> simplepay::error::Result<()> {
/// let config = HttpConfig { max_retries: 2, ..HttpConfig::default() };
/// let transport = HttpTransport::with_config(&config)?;
///
/// let request = OutboundRequest::form(
///     "https://sandbox.simplepay.hu/payment/order/ios.php",
///     vec![("MERCHANT".to_owned(), "PUBLICTESTHUF".to_owned())],
/// );
/// let response = transport.send(request).await?;
/// println!("{}", response.text());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    http_version: HttpVersion,
    retry: RetryPolicy,
}

impl HttpTransport {
    /// Creates a new HTTP transport with default settings.
    ///
    /// Default configuration:
    /// - Pool max idle per host: 100
    /// - Timeout: 30 seconds
    /// - Connect timeout: 10 seconds
    /// - HTTP version: Auto (prefer HTTP/2)
    /// - No retries
    ///
    /// # Errors
    ///
    /// Returns error if the TLS backend cannot be initialized.
    ///
    /// # Examples
    ///
    /// ```
    /// use simplepay::transport::{HttpTransport, Transport};
    ///
    /// let transport = HttpTransport::new().unwrap();
    /// assert_eq!(transport.protocol_name(), "http");
    /// ```
    pub fn new() -> Result<Self> {
        Self::with_config(&HttpConfig::default())
    }

    /// Creates HTTP transport with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ConfigError`] for out-of-range settings, or
    /// [`GatewayError::HttpError`] if client creation fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use simplepay::transport::{HttpConfig, HttpTransport, HttpVersion, Transport};
    ///
    /// let config = HttpConfig {
    ///     pool_max_idle_per_host: 20,
    ///     timeout_secs: 60,
    ///     connect_timeout_secs: 15,
    ///     http_version: HttpVersion::Http2,
    ///     ..HttpConfig::default()
    /// };
    ///
    /// let transport = HttpTransport::with_config(&config).unwrap();
    /// assert_eq!(transport.protocol_name(), "http/2");
    /// ```
    pub fn with_config(config: &HttpConfig) -> Result<Self> {
        config.validate()?;

        let mut builder = Client::builder()
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout());

        builder = match config.http_version {
            HttpVersion::Http1 => builder.http1_only(),
            HttpVersion::Http2 => builder.http2_prior_knowledge(),
            HttpVersion::Auto => builder,
        };

        let client = builder.build().map_err(GatewayError::HttpError)?;
        let retry = RetryPolicy::with_retries(
            config.max_retries,
            std::time::Duration::from_millis(config.retry_delay_ms),
        );

        Ok(Self { client, http_version: config.http_version, retry })
    }

    /// Retry policy applied to every request.
    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    #[instrument(skip(self, request), fields(url = %request.url))]
    async fn execute_request(&self, request: &OutboundRequest) -> Result<TransportResponse> {
        let mut builder = self.client.post(&request.url);
        if request.header("Content-Type").is_none() {
            builder = builder.header("Content-Type", request.body.content_type());
        }

        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }

        builder = match &request.body {
            RequestBody::Json(text) => builder.body(text.clone()),
            RequestBody::Form(pairs) => builder.form(pairs),
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();

        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_owned()))
            .collect();

        if response.status().is_server_error() {
            return Err(GatewayError::TransportFailure(format!("gateway returned status {status}")));
        }

        let body = response.bytes().await.map_err(GatewayError::HttpError)?.to_vec();
        tracing::debug!(status, bytes = body.len(), "response received");

        Ok(TransportResponse { status, body, headers })
    }
}

impl Transport for HttpTransport {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse> {
        let url = Url::parse(&request.url)
            .map_err(|e| GatewayError::TransportFailure(format!("invalid url: {e}")))?;

        // Security: Validate URL scheme and host
        validate_url(&url)?;

        // Security: Validate custom headers for CRLF injection
        for (key, value) in &request.headers {
            validate_header(key, value)?;
        }

        retry_with_backoff(&self.retry, || self.execute_request(&request)).await
    }

    fn protocol_name(&self) -> &'static str {
        match self.http_version {
            HttpVersion::Http1 => "http/1.1",
            HttpVersion::Http2 => "http/2",
            HttpVersion::Auto => "http",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_transport_new() {
        let transport = HttpTransport::new();
        assert!(transport.is_ok());
        assert_eq!(transport.unwrap().retry_policy().max_attempts, 1);
    }

    #[test]
    fn test_http_transport_protocol_name() {
        let config_http1 = HttpConfig { http_version: HttpVersion::Http1, ..Default::default() };
        let transport_http1 = HttpTransport::with_config(&config_http1).unwrap();
        assert_eq!(transport_http1.protocol_name(), "http/1.1");

        let config_http2 = HttpConfig { http_version: HttpVersion::Http2, ..Default::default() };
        let transport_http2 = HttpTransport::with_config(&config_http2).unwrap();
        assert_eq!(transport_http2.protocol_name(), "http/2");

        let config_auto = HttpConfig { http_version: HttpVersion::Auto, ..Default::default() };
        let transport_auto = HttpTransport::with_config(&config_auto).unwrap();
        assert_eq!(transport_auto.protocol_name(), "http");
    }

    #[test]
    fn test_http_transport_retry_config() {
        let config = HttpConfig { max_retries: 3, ..Default::default() };
        let transport = HttpTransport::with_config(&config).unwrap();
        assert_eq!(transport.retry_policy().max_attempts, 4);
    }

    #[test]
    fn test_http_transport_rejects_invalid_config() {
        let config = HttpConfig { timeout_secs: 0, ..Default::default() };
        assert!(matches!(HttpTransport::with_config(&config), Err(GatewayError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_send_invalid_url() {
        let transport = HttpTransport::new().unwrap();
        let result = transport.send(OutboundRequest::json("not-a-url", "{}")).await;
        assert!(matches!(result, Err(GatewayError::TransportFailure(_))));
    }

    #[tokio::test]
    async fn test_send_rejects_plain_http() {
        let transport = HttpTransport::new().unwrap();
        let result = transport.send(OutboundRequest::json("http://gateway.example.com/v2/start", "{}")).await;
        assert!(matches!(result, Err(GatewayError::TransportFailure(msg)) if msg.contains("HTTPS")));
    }

    #[tokio::test]
    async fn test_send_rejects_localhost() {
        let transport = HttpTransport::new().unwrap();
        let result = transport.send(OutboundRequest::json("https://localhost/v2/start", "{}")).await;
        assert!(matches!(result, Err(GatewayError::TransportFailure(msg)) if msg.contains("Localhost")));
    }

    #[tokio::test]
    async fn test_send_rejects_header_injection() {
        let transport = HttpTransport::new().unwrap();
        let request = OutboundRequest::json("https://gateway.example.com/v2/start", "{}")
            .with_header("Signature", "abc\r\nX-Evil: 1");
        let result = transport.send(request).await;
        assert!(matches!(result, Err(GatewayError::TransportFailure(msg)) if msg.contains("control")));
    }

    #[test]
    fn test_validate_header() {
        assert!(validate_header("Signature", "abc=").is_ok());
        assert!(validate_header("X\nY", "v").is_err());
        assert!(validate_header("X", "v\0").is_err());
    }
}
