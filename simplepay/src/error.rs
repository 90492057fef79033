//! Error types for the SimplePay integration layer.
//!
//! Every fallible operation in this crate returns [`Result`], whose error type
//! is [`GatewayError`]. The enum is implemented with [`thiserror::Error`].
//!
//! # Error Categories
//!
//! - **Signature errors** ([`GatewayError::SignatureMismatch`],
//!   [`GatewayError::MissingSignatureInput`], [`GatewayError::NestedFieldError`]):
//!   the payload could not be signed, or a received signature did not match.
//! - **Resolution errors** ([`GatewayError::UnresolvedMerchant`]): no merchant
//!   credentials could be selected for the operation.
//! - **Inbound validation errors** ([`GatewayError::InvalidControlHash`],
//!   [`GatewayError::MissingRequiredFields`]): untrusted input failed a check.
//! - **Transport errors** ([`GatewayError::TransportFailure`],
//!   [`GatewayError::HttpError`], [`GatewayError::DeadlineExceeded`]):
//!   the gateway could not be reached in time.
//! - **Protocol errors** ([`GatewayError::MalformedResponse`]): the gateway
//!   answered with something that is neither JSON nor XML where one was expected.
//!
//! Expected validation outcomes are returned as values. Nothing in the crate
//! panics on hostile input.
//!
//! # Examples
//!
//! ```
//! use simplepay::error::{GatewayError, Result};
//!
//! fn require_order_ref(order_ref: &str) -> Result<&str> {
//!     if order_ref.is_empty() {
//!         return Err(GatewayError::MissingRequiredFields(vec!["ORDER_REF".to_owned()]));
//!     }
//!     Ok(order_ref)
//! }
//!
//! assert!(require_order_ref("").is_err());
//! ```

use thiserror::Error;

/// Result type alias for gateway operations.
///
/// All fallible functions in this crate return this type.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors that can occur while talking to the gateway or judging its messages.
///
/// # Error Recovery
///
/// - **Transient errors** ([`HttpError`](Self::HttpError),
///   [`TransportFailure`](Self::TransportFailure)): see [`is_retryable`](Self::is_retryable)
/// - **Configuration errors** ([`ConfigError`](Self::ConfigError),
///   [`UnresolvedMerchant`](Self::UnresolvedMerchant)): fix the credential table
/// - **Untrusted input** ([`SignatureMismatch`](Self::SignatureMismatch),
///   [`InvalidControlHash`](Self::InvalidControlHash)): reject the message, never confirm it
#[must_use = "errors should be handled, propagated, or explicitly panicked"]
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A received signature does not match the locally computed one.
    ///
    /// Both values are kept for the audit log. The expected value is a MAC
    /// over data the peer already holds, so it leaks nothing new.
    ///
    /// # Recovery
    ///
    /// Treat the message as forged or corrupted. Do not act on its fields.
    #[error("signature mismatch (expected {expected}, received {received})")]
    SignatureMismatch {
        /// Signature computed from the local secret.
        expected: String,
        /// Signature carried by the message.
        received: String,
    },

    /// A signature cannot be computed because the secret or the payload is empty.
    ///
    /// # Recovery
    ///
    /// Check that the merchant secret is configured and that at least one field
    /// was added to the request before signing.
    #[error("missing signature input: {0}")]
    MissingSignatureInput(String),

    /// A legacy hash chain was asked to sign a nested value.
    ///
    /// The positional chain only accepts scalar values. The payload names the
    /// offending field.
    #[error("nested value cannot be signed: {0}")]
    NestedFieldError(String),

    /// No merchant credential pair could be selected.
    ///
    /// Raised when a currency has no `{CUR}_MERCHANT`/`{CUR}_SECRET_KEY` pair,
    /// when a merchant account token matches nothing, or when it matches more
    /// than one entry.
    ///
    /// # Recovery
    ///
    /// Add or deduplicate the entry in the merchant table. The operation must
    /// not be retried with a guessed credential.
    #[error("unresolved merchant: {0}")]
    UnresolvedMerchant(String),

    /// The `ctrl` parameter of a legacy browser redirect does not match the URL.
    #[error("invalid control hash on redirect for order {0}")]
    InvalidControlHash(String),

    /// Required fields are absent. Lists every missing field, not just the first.
    #[error("missing required fields: {}", .0.join(", "))]
    MissingRequiredFields(Vec<String>),

    /// The transport collaborator failed to deliver the request.
    ///
    /// # Recovery
    ///
    /// The request may or may not have reached the gateway. Use a query
    /// operation to reconcile before repeating a start or refund.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// HTTP request failed inside the bundled reqwest transport.
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The gateway sent a body that could not be parsed as the expected format.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The configured deadline elapsed before the operation completed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Invalid or inconsistent configuration.
    ///
    /// # Examples
    ///
    /// ```
    /// use simplepay::error::GatewayError;
    ///
    /// let err = GatewayError::ConfigError("poller budget must be positive".to_owned());
    /// assert!(err.to_string().contains("configuration"));
    /// ```
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Caller supplied input that cannot be used.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl GatewayError {
    /// Returns `true` for transport faults that may succeed on a second attempt.
    ///
    /// Timeouts, connection failures and gateway 5xx answers qualify.
    /// Everything that judged a message (signatures, merchants, required
    /// fields) is final.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpError(e) => {
                e.is_timeout() || e.is_connect() || e.status().is_some_and(|s| s.is_server_error())
            }
            Self::TransportFailure(_) => true,
            Self::SignatureMismatch { .. }
            | Self::MissingSignatureInput(_)
            | Self::NestedFieldError(_)
            | Self::UnresolvedMerchant(_)
            | Self::InvalidControlHash(_)
            | Self::MissingRequiredFields(_)
            | Self::MalformedResponse(_)
            | Self::DeadlineExceeded
            | Self::ConfigError(_)
            | Self::InvalidInput(_) => false,
        }
    }
}
