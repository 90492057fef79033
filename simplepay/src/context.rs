//! Inbound request context and call deadlines.
//!
//! Validators never read ambient server state. The web framework in front
//! of this crate copies what it received into a [`RequestContext`] and
//! passes it in explicitly.
//!
//! # Examples
//!
//! ```
//! use simplepay::context::RequestContext;
//!
//! let ctx = RequestContext::new("https", "shop.example.com", "/back?order_ref=101&RT=000%20OK")
//!     .with_header("Signature", "abc=");
//!
//! assert_eq!(ctx.query_param("RT"), Some("000 OK"));
//! assert_eq!(ctx.full_url(), "https://shop.example.com/back?order_ref=101&RT=000%20OK");
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::{
    error::{GatewayError, Result},
    projector::{FormData, collect_form},
    signature::signature_from_headers,
};

/// Everything the gateway sent in one inbound HTTP request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Scheme the request arrived on, `http` or `https`.
    pub scheme: String,
    /// Value of the `Host` header.
    pub host: String,
    /// Path and query string exactly as received.
    pub request_uri: String,
    /// Request headers.
    pub headers: Vec<(String, String)>,
    /// Decoded query parameters.
    pub query: Vec<(String, String)>,
    /// Raw body.
    pub body: Vec<u8>,
    /// When the request was received. Confirmation timestamps derive from it.
    pub received_at: DateTime<Utc>,
}

impl RequestContext {
    /// Creates a context and decodes the query string of `request_uri`.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn new(
        scheme: impl Into<String>,
        host: impl Into<String>,
        request_uri: impl Into<String>,
    ) -> Self {
        let request_uri = request_uri.into();
        let query = request_uri
            .split_once('?')
            .map(|(_, query)| {
                url::form_urlencoded::parse(query.as_bytes())
                    .map(|(name, value)| (name.into_owned(), value.into_owned()))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            scheme: scheme.into(),
            host: host.into(),
            request_uri,
            headers: Vec::new(),
            query,
            body: Vec::new(),
            received_at: Utc::now(),
        }
    }

    /// Context of a request that only carries a body, such as a webhook.
    #[must_use]
    pub fn from_body(body: impl Into<Vec<u8>>) -> Self {
        Self::new("https", "", "/").with_body(body)
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

    /// Sets the raw body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets the body to the URL encoding of `pairs`.
    #[must_use]
    pub fn with_form<'a, I>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        self.body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish()
            .into_bytes();
        self
    }

    /// Overrides the receive time.
    #[must_use]
    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }

    /// `scheme://host` followed by the request URI.
    #[must_use]
    pub fn full_url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host, self.request_uri)
    }

    /// First query parameter called `name`.
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.iter().find(|(key, _)| key == name).map(|(_, value)| value.as_str())
    }

    /// First header called `name`, ignoring case.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// `Signature` header, or the missing-signature sentinel.
    #[must_use]
    pub fn signature(&self) -> String {
        signature_from_headers(self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    /// Body as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidInput`] when the body is not UTF-8.
    pub fn body_text(&self) -> Result<&str> {
        std::str::from_utf8(&self.body)
            .map_err(|e| GatewayError::InvalidInput(format!("body is not UTF-8: {e}")))
    }

    /// Decodes a URL-encoded body into form fields.
    #[must_use]
    pub fn form(&self) -> FormData {
        collect_form(
            url::form_urlencoded::parse(&self.body)
                .map(|(name, value)| (name.into_owned(), value.into_owned())),
        )
    }
}

/// Point in time after which an operation gives up.
///
/// [`Deadline::none`] never expires. The deadline bounds the single outbound
/// call of a transaction and every poll and sleep of the status loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline that never expires.
    #[must_use]
    pub const fn none() -> Self {
        Self(None)
    }

    /// Expires `timeout` from now.
    #[must_use]
    pub fn after(timeout: Duration) -> Self {
        Self(Some(Instant::now() + timeout))
    }

    /// Expires at `instant`.
    #[must_use]
    pub const fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    /// Time left, `None` when unbounded.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// `true` once the deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    /// Runs `operation`, failing with [`GatewayError::DeadlineExceeded`] if it
    /// does not finish in time.
    ///
    /// # Errors
    ///
    /// Propagates the operation's error, or returns `DeadlineExceeded`.
    pub async fn run<F, T>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.0 {
            Some(at) => tokio::time::timeout_at(at, operation)
                .await
                .map_err(|_| GatewayError::DeadlineExceeded)?,
            None => operation.await,
        }
    }

    /// Sleeps for `delay`, or fails early if the deadline comes first.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::DeadlineExceeded`] when the deadline is
    /// reached before `delay` elapsed.
    pub async fn sleep(&self, delay: Duration) -> Result<()> {
        if let Some(at) = self.0
            && Instant::now() + delay > at
        {
            tokio::time::sleep_until(at).await;
            return Err(GatewayError::DeadlineExceeded);
        }
        tokio::time::sleep(delay).await;
        Ok(())
    }
}
