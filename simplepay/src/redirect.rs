//! Browser redirect validation.
//!
//! Two redirect styles exist:
//!
//! - **Legacy BackRef**: the query string ends in a `ctrl` parameter holding
//!   an HMAC-MD5 of the URL before it. A valid `ctrl` only proves the URL is
//!   authentic; the result additionally depends on the `RT` return code and
//!   on the order status polled from the gateway.
//! - **Modern Back**: the query carries `r`, a base64 JSON object, and `s`,
//!   its HMAC-SHA384 signature.
//!
//! # Legacy result rule
//!
//! 1. `ctrl` must match, else [`GatewayError::InvalidControlHash`].
//! 2. The status is polled (see [`StatusPoller`]).
//! 3. Gate A on `RT`: prefix `000` or `001` succeeds, any other non-empty
//!    value fails, empty defers to gate B, absent fails.
//! 4. Gate B: the polled status is in the successful partition.

use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE_NO_PAD},
};
use serde_json::{Map, Value};
use tracing::instrument;

use crate::{
    context::{Deadline, RequestContext},
    error::{GatewayError, Result},
    log::{LogRecord, Logger},
    poller::{PollOutcome, StatusPoller},
    signature::{LegacySigner, ModernSigner, Signer},
    transport::Transport,
};

/// Width of the trailing `&ctrl=<32 hex>` suffix.
pub const CTRL_SUFFIX_LEN: usize = 38;

/// Return codes the card processor uses for an accepted payment.
const ACCEPTED_RETURN_CODES: [&str; 2] = ["000", "001"];

/// Classified `RT` query parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnCode {
    /// Three-character prefix `000` or `001`.
    Accepted(String),
    /// Any other non-empty value; holds the prefix.
    Declined(String),
    /// Present but empty, as for wire transfers.
    Empty,
    /// Not present at all.
    Missing,
}

impl ReturnCode {
    /// Classifies a raw `RT` value.
    #[must_use]
    pub fn classify(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::Missing;
        };
        if raw.is_empty() {
            return Self::Empty;
        }
        let prefix: String = raw.chars().take(3).collect();
        if ACCEPTED_RETURN_CODES.contains(&prefix.as_str()) {
            Self::Accepted(prefix)
        } else {
            Self::Declined(prefix)
        }
    }
}

/// Result record shared by the redirect decision and the audit log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackStatus {
    /// `date` query parameter, or `N/A`.
    pub backref_date: String,
    /// `order_ref` query parameter.
    pub refnoext: String,
    /// `payrefno` query parameter, or `N/A`.
    pub payrefno: String,
    /// Polled order status, or `IOS_ERROR`.
    pub order_status: String,
    /// Polled payment method, or `N/A`.
    pub pay_method: String,
    /// Final verdict.
    pub result: bool,
}

impl BackStatus {
    fn to_record(&self, record: LogRecord) -> LogRecord {
        record
            .with_entry("BACKREF_DATE", &self.backref_date)
            .with_entry("REFNOEXT", &self.refnoext)
            .with_entry("PAYREFNO", &self.payrefno)
            .with_entry("ORDER_STATUS", &self.order_status)
            .with_entry("PAYMETHOD", &self.pay_method)
            .with_entry("RESULT", self.result)
    }
}

/// Outcome of a legacy BackRef validation that passed the `ctrl` check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackRefOutcome {
    /// Shared result record; `back_status.result` is the verdict.
    pub back_status: BackStatus,
    /// Classified `RT` parameter.
    pub return_code: ReturnCode,
    /// Reconciliation result.
    pub poll: PollOutcome,
    /// Reasons for a negative verdict.
    pub messages: Vec<String>,
}

impl BackRefOutcome {
    /// Whether the payment may be treated as successful.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.back_status.result
    }
}

/// Event reported by a modern browser redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackEvent {
    /// Payment succeeded.
    Success,
    /// Payment failed.
    Fail,
    /// Payer cancelled.
    Cancel,
    /// Payer ran out of time.
    Timeout,
    /// Anything else.
    Other(String),
}

impl BackEvent {
    fn parse(raw: &str) -> Self {
        match raw {
            "SUCCESS" => Self::Success,
            "FAIL" => Self::Fail,
            "CANCEL" => Self::Cancel,
            "TIMEOUT" => Self::Timeout,
            other => Self::Other(other.to_owned()),
        }
    }
}

/// Decoded modern redirect.
#[derive(Debug, Clone, PartialEq)]
pub struct BackNotification {
    /// Whether `s` is a valid signature of the decoded `r`.
    pub valid: bool,
    /// `r`: gateway response code.
    pub response_code: String,
    /// `t`: gateway transaction id.
    pub transaction_id: String,
    /// `e`: event.
    pub event: BackEvent,
    /// `m`: merchant account.
    pub merchant: String,
    /// `o`: merchant order reference.
    pub order_ref: String,
    /// Every decoded field.
    pub content: Map<String, Value>,
}

/// Validates browser redirects.
#[derive(Debug)]
pub struct RedirectValidator<T, L> {
    poller: StatusPoller<T, L>,
}

impl<T, L> RedirectValidator<T, L>
where
    T: Transport,
    L: Logger,
{
    /// Creates a validator that reconciles through `poller`.
    #[must_use]
    pub const fn new(poller: StatusPoller<T, L>) -> Self {
        Self { poller }
    }

    /// Validates a legacy BackRef request.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::MissingRequiredFields`] without `order_ref`.
    /// - [`GatewayError::UnresolvedMerchant`] when `order_currency` has no merchant.
    /// - [`GatewayError::InvalidControlHash`] when `ctrl` does not match.
    /// - [`GatewayError::DeadlineExceeded`] when reconciliation runs out of time.
    #[instrument(skip(self, ctx, deadline), fields(order_ref = ctx.query_param("order_ref")))]
    pub async fn check_back_ref(&self, ctx: &RequestContext, deadline: Deadline) -> Result<BackRefOutcome> {
        let Some(order_ref) = ctx.query_param("order_ref").filter(|r| !r.is_empty()) else {
            return Err(GatewayError::MissingRequiredFields(vec!["order_ref".to_owned()]));
        };
        let profile = self.poller.resolver().by_currency(ctx.query_param("order_currency").unwrap_or_default())?;

        let logger = self.poller.logger();
        logger.log(
            &ctx.query
                .iter()
                .fold(LogRecord::new("BackRef").with_order_ref(order_ref), |record, (k, v)| record.with_entry(k, v)),
        );

        let url = ctx.full_url();
        let signed_part = url.len().checked_sub(CTRL_SUFFIX_LEN).and_then(|end| url.get(..end)).unwrap_or_default();
        let ctrl = ctx.query_param("ctrl").unwrap_or_default();
        let check = LegacySigner.verify_chain(profile.secret_key(), [signed_part], ctrl)?;
        if !check.valid {
            tracing::warn!(order_ref, expected = %check.expected, received = ctrl, "invalid ctrl");
            logger.log(
                &LogRecord::new("BackRef")
                    .with_order_ref(order_ref)
                    .with_entry("ctrlExpected", &check.expected)
                    .with_entry("ctrlReceived", ctrl)
                    .with_entry("err", ctx.query_param("err").unwrap_or_default()),
            );
            return Err(GatewayError::InvalidControlHash(format!(
                "ctrl of order {order_ref} does not match the request URL"
            )));
        }

        let poll = self.poller.poll_with(&profile, order_ref, deadline).await?;
        let polled_ok = poll.valid && poll.status.is_successful();

        let mut messages = Vec::new();
        if !poll.valid {
            messages.push(format!("IOS answer not trusted, status {}", poll.status));
        } else if !polled_ok {
            messages.push(format!("IOS status unsuccessful: {}", poll.status));
        }

        let return_code = ReturnCode::classify(ctx.query_param("RT"));
        let result = match &return_code {
            ReturnCode::Accepted(_) => true,
            ReturnCode::Declined(code) => {
                messages.push(format!("Return code: {code}"));
                false
            }
            ReturnCode::Empty => {
                if !polled_ok {
                    messages.push(format!("Empty RT and status is: {}", poll.status));
                }
                polled_ok
            }
            ReturnCode::Missing => {
                messages.push("Missing variable: (RT)".to_owned());
                false
            }
        };

        let back_status = BackStatus {
            backref_date: ctx.query_param("date").unwrap_or("N/A").to_owned(),
            refnoext: order_ref.to_owned(),
            payrefno: ctx.query_param("payrefno").unwrap_or("N/A").to_owned(),
            order_status: poll
                .field("ORDER_STATUS")
                .map_or_else(|| "IOS_ERROR".to_owned(), |_| poll.status.as_str().to_owned()),
            pay_method: poll.pay_method().unwrap_or("N/A").to_owned(),
            result,
        };
        logger.log(&back_status.to_record(LogRecord::new("BackRef_BackStatus").with_order_ref(order_ref)));

        Ok(BackRefOutcome { back_status, return_code, poll, messages })
    }

    /// Validates a modern redirect carrying `r` and `s`.
    ///
    /// A wrong signature is reported through [`BackNotification::valid`].
    ///
    /// # Errors
    ///
    /// - [`GatewayError::MissingRequiredFields`] without `r`.
    /// - [`GatewayError::InvalidInput`] when `r` is not base64 JSON.
    /// - [`GatewayError::UnresolvedMerchant`] when `m` matches no merchant.
    pub fn check_back(&self, ctx: &RequestContext) -> Result<BackNotification> {
        let Some(encoded) = ctx.query_param("r").filter(|r| !r.is_empty()) else {
            return Err(GatewayError::MissingRequiredFields(vec!["r".to_owned()]));
        };
        let signature = ctx.query_param("s").unwrap_or_default();

        let json = decode_base64_lenient(encoded)?;
        let content = match serde_json::from_str::<Value>(&json) {
            Ok(Value::Object(map)) => map,
            _ => return Err(GatewayError::InvalidInput("r is not a JSON object".to_owned())),
        };

        let text = |key: &str| content.get(key).map(scalar_text).unwrap_or_else(|| "N/A".to_owned());
        let merchant = text("m");
        let profile = self.poller.resolver().by_account(&merchant)?;
        let valid = ModernSigner.verify(profile.secret_key(), json.as_bytes(), signature)?.valid;

        let notification = BackNotification {
            valid,
            response_code: text("r"),
            transaction_id: text("t"),
            event: BackEvent::parse(&text("e")),
            merchant,
            order_ref: text("o"),
            content: content.clone(),
        };

        self.poller.logger().log(
            &LogRecord::new("back")
                .with_order_ref(&notification.order_ref)
                .with_transaction_id(&notification.transaction_id)
                .with_entry("rRequest", encoded)
                .with_entry("sRequest", signature)
                .with_entry("rJson", &json)
                .with_entry("checkCtrlResult", valid),
        );
        if !valid {
            tracing::warn!(order_ref = %notification.order_ref, "modern redirect signature invalid");
        }

        Ok(notification)
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Decodes base64 that went through a query string: spaces are read back as
/// `+`, and padded, unpadded and URL-safe alphabets are accepted.
fn decode_base64_lenient(encoded: &str) -> Result<String> {
    let cleaned = encoded.trim().replace(' ', "+");
    let bytes = STANDARD
        .decode(&cleaned)
        .or_else(|_| STANDARD_NO_PAD.decode(&cleaned))
        .or_else(|_| URL_SAFE_NO_PAD.decode(cleaned.trim_end_matches('=')))
        .map_err(|e| GatewayError::InvalidInput(format!("r is not base64: {e}")))?;
    String::from_utf8(bytes).map_err(|e| GatewayError::InvalidInput(format!("r is not UTF-8: {e}")))
}
