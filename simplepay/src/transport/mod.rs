//! Outbound HTTP capability.
//!
//! Everything in this crate that talks to the gateway does so through the
//! [`Transport`] trait. The crate ships [`HttpTransport`], built on reqwest;
//! applications can supply their own implementation (a proxy client, a
//! recording stub in tests) without touching the signing or validation code.
//!
//! Requests are fully prepared before they reach the transport: the URL is
//! absolute, the signature header is set and the body is final. A transport
//! only moves bytes.
//!
//! # Examples
//!
//! ```rust,no_run
//! use simplepay::transport::{HttpTransport, OutboundRequest, Transport};
//!
//! # async fn example() -> simplepay::error::Result<()> {
//! let transport = HttpTransport::new()?;
//! let request = OutboundRequest::json(
//!     "https://sandbox.simplepay.hu/payment/v2/query",
//!     r#"{"merchant":"PUBLICTESTHUF"}"#,
//! )
//! .with_header("Signature", "...");
//!
//! let response = transport.send(request).await?;
//! println!("Status: {}", response.status);
//! # Ok(())
//! # }
//! ```

#[allow(
    redundant_imports,
    reason = "Future needed for RPITIT despite being in Edition 2024 prelude"
)]
use std::future::Future;

use crate::error::Result;

pub mod config;
pub mod http;
pub mod retry;

pub use config::{HttpConfig, HttpVersion};
pub use http::HttpTransport;
pub use retry::{RetryPolicy, retry_with_backoff};

/// Body of an outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    /// JSON text, sent as `application/json`.
    Json(String),
    /// Form pairs, sent as `application/x-www-form-urlencoded`.
    Form(Vec<(String, String)>),
}

impl RequestBody {
    /// Content type matching the body.
    #[must_use]
    pub const fn content_type(&self) -> &'static str {
        match self {
            Self::Json(_) => "application/json",
            Self::Form(_) => "application/x-www-form-urlencoded",
        }
    }
}

/// Fully prepared POST request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    /// Absolute endpoint URL.
    pub url: String,
    /// Extra headers, in order.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: RequestBody,
}

impl OutboundRequest {
    /// JSON request to `url`.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn json(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self { url: url.into(), headers: Vec::new(), body: RequestBody::Json(body.into()) }
    }

    /// Form request to `url`.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn form(url: impl Into<String>, pairs: Vec<(String, String)>) -> Self {
        Self { url: url.into(), headers: Vec::new(), body: RequestBody::Form(pairs) }
    }

    /// Adds a header.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header called `name`, ignoring case.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Response returned by a transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
    /// Response headers.
    pub headers: Vec<(String, String)>,
}

impl TransportResponse {
    /// Convenience constructor for a 200 response.
    #[must_use]
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self { status: 200, body: body.into(), headers: Vec::new() }
    }

    /// Adds a header.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Body decoded as UTF-8, invalid sequences replaced.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Capability to deliver one prepared request to the gateway.
///
/// Implementations must be safe to share between tasks. Retries, if any,
/// belong inside the implementation; callers send each request once.
pub trait Transport: Send + Sync {
    /// Sends `request` and returns the gateway's answer.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::TransportFailure`](crate::error::GatewayError::TransportFailure)
    /// or [`GatewayError::HttpError`](crate::error::GatewayError::HttpError)
    /// when the request cannot be delivered.
    fn send(&self, request: OutboundRequest) -> impl Future<Output = Result<TransportResponse>> + Send;

    /// Protocol name for logs.
    fn protocol_name(&self) -> &'static str {
        "http"
    }
}

impl<T: Transport> Transport for std::sync::Arc<T> {
    fn send(&self, request: OutboundRequest) -> impl Future<Output = Result<TransportResponse>> + Send {
        (**self).send(request)
    }

    fn protocol_name(&self) -> &'static str {
        (**self).protocol_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_request() {
        let request = OutboundRequest::json("https://example.com/v2/start", "{}")
            .with_header("Signature", "abc");
        assert_eq!(request.body.content_type(), "application/json");
        assert_eq!(request.header("signature"), Some("abc"));
        assert_eq!(request.header("missing"), None);
    }

    #[test]
    fn test_form_request() {
        let request = OutboundRequest::form(
            "https://example.com/order/ios.php",
            vec![("MERCHANT".into(), "M".into())],
        );
        assert_eq!(request.body.content_type(), "application/x-www-form-urlencoded");
    }

    #[test]
    fn test_response_text() {
        let response = TransportResponse::ok("héllo").with_header("Signature", "x");
        assert_eq!(response.text(), "héllo");
        assert_eq!(response.status, 200);
        assert_eq!(response.headers.len(), 1);
    }
}
