//! Server-to-server payment notifications (IPN).
//!
//! The gateway reports payment results asynchronously. Every notification is
//! untrusted until its signature checks out, and only a validated
//! notification ever yields a signed confirmation.
//!
//! - **Modern IPN**: JSON body (raw, or base64 of the JSON) signed with
//!   HMAC-SHA384 in the `Signature` header. The confirmation echoes the
//!   content plus a `receiveDate` and is signed the same way.
//! - **Legacy IPN**: form POST whose `HASH` field is an HMAC-MD5 chain over
//!   every other posted value. The `ORDERSTATUS` must also be confirmable;
//!   both gates must pass. The confirmation is
//!   `<EPAYMENT>{date}|{hash}</EPAYMENT>`.
//!
//! Validation is a pure function of the request: confirmation timestamps
//! come from [`RequestContext::received_at`], so validating the same request
//! twice gives the same result and the same confirmation.
//!
//! # Examples
//!
//! ```
//! use simplepay::{
//!     config::GatewayConfig,
//!     context::RequestContext,
//!     log::MemoryLogger,
//!     merchant::SecretKey,
//!     notification::NotificationValidator,
//!     signature::{ModernSigner, Signer},
//! };
//!
//! let config = GatewayConfig::from_pairs([("EUR_MERCHANT", "M1"), ("EUR_SECRET_KEY", "S1")])?;
//! let validator = NotificationValidator::new(&config, MemoryLogger::new());
//!
//! let body = r#"{"merchant":"M1","orderRef":"101","transactionId":500,"status":"FINISHED"}"#;
//! let signature = ModernSigner.sign(&SecretKey::from("S1"), body.as_bytes())?;
//! let ctx = RequestContext::from_body(body).with_header("Signature", signature);
//!
//! let outcome = validator.validate_ipn(&ctx)?;
//! assert!(outcome.valid);
//! assert!(outcome.confirmation.is_some());
//! # Ok::<(), simplepay::error::GatewayError>(())
//! ```

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::instrument;

use crate::{
    config::GatewayConfig,
    context::RequestContext,
    error::{GatewayError, Result},
    log::{LogRecord, Logger, redact_json_text},
    merchant::{MerchantProfile, MerchantResolver},
    projector::{FormData, FormValue, flat_values, form_get},
    signature::{LegacySigner, MISSING_HEADER_SIGNATURE, ModernSigner, Signer},
    status::OrderStatus,
};

/// Destination of an immediate confirmation, usually the HTTP response of
/// the notification request.
pub trait ConfirmationSink {
    /// Writes the response headers and body. Called at most once per validation.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::TransportFailure`] when the response cannot be written.
    fn respond(&mut self, headers: &[(&str, &str)], body: &str) -> Result<()>;
}

/// Sink that keeps what was written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferedResponse {
    /// Headers written.
    pub headers: Vec<(String, String)>,
    /// Body written.
    pub body: String,
    /// Number of `respond` calls.
    pub writes: u32,
}

impl ConfirmationSink for BufferedResponse {
    fn respond(&mut self, headers: &[(&str, &str)], body: &str) -> Result<()> {
        self.headers = headers.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();
        body.clone_into(&mut self.body);
        self.writes += 1;
        Ok(())
    }
}

/// Signed answer to a modern IPN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    /// JSON text to send back.
    pub body: String,
    /// Signature of `body`.
    pub signature: String,
}

impl Confirmation {
    /// Headers accompanying the body.
    #[must_use]
    pub fn headers(&self) -> [(&str, &str); 3] {
        [
            ("Accept-Language", "EN"),
            ("Content-Type", "application/json"),
            ("Signature", &self.signature),
        ]
    }
}

/// Result of a modern IPN validation.
#[derive(Debug, Clone, PartialEq)]
pub struct IpnOutcome {
    /// Whether the header signature matched the body.
    pub valid: bool,
    /// Decoded content. Untrusted unless `valid`.
    pub content: Map<String, Value>,
    /// Signature header as received, or the missing-signature sentinel.
    pub received_signature: String,
    /// Confirmation, present only when `valid`.
    pub confirmation: Option<Confirmation>,
}

impl IpnOutcome {
    fn text(&self, key: &str) -> String {
        self.content.get(key).map(scalar_text).unwrap_or_default()
    }

    /// `orderRef` of the notification.
    #[must_use]
    pub fn order_ref(&self) -> String {
        self.text("orderRef")
    }

    /// `transactionId` of the notification.
    #[must_use]
    pub fn transaction_id(&self) -> String {
        self.text("transactionId")
    }
}

/// Result of a legacy IPN validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyIpnOutcome {
    /// Whether `HASH` matched the posted values.
    pub hash_valid: bool,
    /// Reported `ORDERSTATUS`.
    pub status: OrderStatus,
    /// Whether the status may be confirmed.
    pub status_confirmable: bool,
    /// Both gates passed.
    pub valid: bool,
    /// Posted fields.
    pub fields: FormData,
    /// `<EPAYMENT>` answer, present only when `valid`.
    pub confirmation: Option<String>,
    /// Reasons for a negative verdict.
    pub messages: Vec<String>,
}

/// Validates inbound notifications.
#[derive(Debug)]
pub struct NotificationValidator<L> {
    resolver: MerchantResolver,
    logger: L,
}

impl<L: Logger> NotificationValidator<L> {
    /// Creates a validator over the merchants of `config`.
    #[must_use]
    pub fn new(config: &GatewayConfig, logger: L) -> Self {
        Self { resolver: config.resolver(), logger }
    }

    /// Validates a modern IPN.
    ///
    /// The merchant comes from the `merchant` field, or from `currency` when
    /// the merchant field is absent.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::InvalidInput`] when the body is not a JSON object.
    /// - [`GatewayError::UnresolvedMerchant`] when no merchant matches.
    ///
    /// A wrong or missing signature is not an error; see [`IpnOutcome::valid`].
    #[instrument(skip(self, ctx), fields(len = ctx.body.len()))]
    pub fn validate_ipn(&self, ctx: &RequestContext) -> Result<IpnOutcome> {
        let body = ctx.body_text()?;
        let received_signature = ctx.signature();
        let content = decode_ipn_body(body)?;

        let merchant = content.get("merchant").and_then(Value::as_str);
        let currency = content.get("currency").and_then(Value::as_str);
        let profile = match merchant.filter(|m| !m.is_empty()) {
            Some(account) => self.resolver.by_account(account)?,
            None => self.resolver.resolve(currency, None)?,
        };

        let valid = received_signature != MISSING_HEADER_SIGNATURE
            && ModernSigner.verify(profile.secret_key(), body.as_bytes(), &received_signature)?.valid;

        let mut outcome = IpnOutcome { valid, content, received_signature, confirmation: None };

        let mut record = LogRecord::new("ipn")
            .with_order_ref(outcome.order_ref())
            .with_transaction_id(outcome.transaction_id())
            .with_entry("ipnBodyToValidation", redact_json_text(body))
            .with_value("", &Value::Object(outcome.content.clone()))
            .with_entry("validationResult", valid);

        if valid {
            let confirmation = self.modern_confirmation(&profile, &outcome.content, ctx.received_at)?;
            record = record
                .with_entry("confirmSignature", &confirmation.signature)
                .with_entry("confirmContent", redact_json_text(&confirmation.body));
            outcome.confirmation = Some(confirmation);
        } else {
            tracing::warn!(order_ref = %outcome.order_ref(), "IPN signature invalid, no confirmation");
            record = record.with_entry("validationResultMessage", "UNSUCCESSFUL VALIDATION, NO CONFIRMATION");
        }
        self.logger.log(&record);

        Ok(outcome)
    }

    fn modern_confirmation(
        &self,
        profile: &MerchantProfile,
        content: &Map<String, Value>,
        received_at: DateTime<Utc>,
    ) -> Result<Confirmation> {
        let mut echoed = content.clone();
        echoed.insert(
            "receiveDate".to_owned(),
            Value::String(received_at.to_rfc3339_opts(SecondsFormat::Secs, false)),
        );
        let body = serde_json::to_string(&echoed)
            .map_err(|e| GatewayError::InvalidInput(format!("confirmation not serializable: {e}")))?;
        let signature = ModernSigner.sign(profile.secret_key(), body.as_bytes())?;
        Ok(Confirmation { body, signature })
    }

    /// Writes the confirmation of a valid modern IPN to `sink`.
    ///
    /// Returns `false` without writing when the IPN was not valid. A failing
    /// sink is logged and reported as `false`, never propagated.
    pub fn confirm_ipn<K: ConfirmationSink>(&self, outcome: &IpnOutcome, sink: &mut K) -> bool {
        let Some(confirmation) = &outcome.confirmation else {
            return false;
        };
        let result = sink.respond(&confirmation.headers(), &confirmation.body);
        self.log_confirm(&outcome.order_ref(), result, "Confirmed directly by confirm_ipn")
    }

    /// Validates a legacy IPN form post.
    ///
    /// The merchant is selected by `currency`, or by the posted `CURRENCY`
    /// field when `currency` is `None`.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::MissingRequiredFields`] without `REFNOEXT`.
    /// - [`GatewayError::UnresolvedMerchant`] when no merchant matches.
    #[instrument(skip(self, ctx))]
    pub fn validate_legacy_ipn(&self, ctx: &RequestContext, currency: Option<&str>) -> Result<LegacyIpnOutcome> {
        let fields = ctx.form();
        let Some(order_ref) = form_get(&fields, "REFNOEXT").and_then(FormValue::first).map(str::to_owned)
        else {
            return Err(GatewayError::MissingRequiredFields(vec!["REFNOEXT".to_owned()]));
        };

        let posted_currency = form_get(&fields, "CURRENCY").and_then(FormValue::first);
        let profile = self.resolver.resolve(currency.or(posted_currency), None)?;

        self.logger.log(
            &fields
                .iter()
                .fold(LogRecord::new("IPN").with_order_ref(&order_ref), |record, (name, value)| match value {
                    FormValue::Single(value) => record.with_entry(name, value),
                    FormValue::List(values) => record.with_entry(name, values.join(",")),
                }),
        );

        let raw_status = form_get(&fields, "ORDERSTATUS").and_then(FormValue::first).unwrap_or_default();
        let status = OrderStatus::parse(raw_status);
        let status_confirmable = status.is_confirmable();

        let received = form_get(&fields, "HASH").and_then(FormValue::first).unwrap_or_default();
        let values = flat_values(&fields, &["HASH"]);
        let check = LegacySigner.verify_chain(profile.secret_key(), &values, received)?;

        let mut messages = Vec::new();
        if !status_confirmable {
            messages.push(format!("INVALID IPN ORDER STATUS: {status}"));
        }
        if !check.valid {
            messages.push(format!("IPN CALCULATED HASH: {}", check.expected));
            messages.push(format!("IPN RECEIVED HASH: {received}"));
        }

        let valid = status_confirmable && check.valid;
        let confirmation = if valid { Some(legacy_confirmation(&profile, &fields, ctx.received_at)?) } else { None };

        self.logger.log(
            &LogRecord::new("IPN")
                .with_order_ref(&order_ref)
                .with_entry("hashValid", check.valid)
                .with_entry("statusConfirmable", status_confirmable)
                .with_entry("validationResult", valid),
        );
        if !valid {
            tracing::warn!(order_ref, status = %status, hash_valid = check.valid, "legacy IPN rejected");
        }

        Ok(LegacyIpnOutcome {
            hash_valid: check.valid,
            status,
            status_confirmable,
            valid,
            fields,
            confirmation,
            messages,
        })
    }

    /// Writes the `<EPAYMENT>` answer of a valid legacy IPN to `sink`.
    ///
    /// Same contract as [`confirm_ipn`](Self::confirm_ipn).
    pub fn confirm_legacy_ipn<K: ConfirmationSink>(&self, outcome: &LegacyIpnOutcome, sink: &mut K) -> bool {
        let Some(confirmation) = &outcome.confirmation else {
            return false;
        };
        let order_ref = form_get(&outcome.fields, "REFNOEXT").and_then(FormValue::first).unwrap_or_default();
        let result = sink.respond(&[], confirmation);
        self.log_confirm(order_ref, result, "Confirmed directly by confirm_legacy_ipn")
    }

    fn log_confirm(&self, order_ref: &str, result: Result<()>, message: &str) -> bool {
        let record = LogRecord::new("ipn").with_order_ref(order_ref);
        match result {
            Ok(()) => {
                self.logger.log(&record.with_entry("ipnConfirm", message));
                true
            }
            Err(error) => {
                tracing::warn!(%error, order_ref, "IPN confirmation could not be written");
                self.logger.log(&record.with_entry("ipnConfirm", &error));
                false
            }
        }
    }
}

/// Builds `<EPAYMENT>{YmdHis}|{hash}</EPAYMENT>` for a legacy IPN.
///
/// The hash covers the first `IPN_PID`, the first `IPN_PNAME`, `IPN_DATE`
/// and the date itself.
///
/// # Errors
///
/// Returns [`GatewayError::MissingSignatureInput`] when the merchant secret is empty.
pub fn legacy_confirmation(profile: &MerchantProfile, fields: &FormData, at: DateTime<Utc>) -> Result<String> {
    let server_date = at.format("%Y%m%d%H%M%S").to_string();
    let first = |name: &str| form_get(fields, name).and_then(FormValue::first).unwrap_or_default();
    let hash = LegacySigner.sign_chain(
        profile.secret_key(),
        [first("IPN_PID"), first("IPN_PNAME"), first("IPN_DATE"), server_date.as_str()],
    )?;
    Ok(format!("<EPAYMENT>{server_date}|{hash}</EPAYMENT>"))
}

/// Parses a modern IPN body: raw JSON first, then base64 of JSON.
fn decode_ipn_body(body: &str) -> Result<Map<String, Value>> {
    let parsed = serde_json::from_str::<Value>(body).ok().or_else(|| {
        STANDARD
            .decode(body.trim())
            .ok()
            .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
    });
    match parsed {
        Some(Value::Object(map)) => Ok(map),
        _ => Err(GatewayError::InvalidInput("IPN body is not a JSON object".to_owned())),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::{log::MemoryLogger, merchant::SecretKey};

    struct BrokenSink;

    impl ConfirmationSink for BrokenSink {
        fn respond(&mut self, _headers: &[(&str, &str)], _body: &str) -> Result<()> {
            Err(GatewayError::TransportFailure("client went away".into()))
        }
    }

    fn validator() -> NotificationValidator<MemoryLogger> {
        let config = GatewayConfig::from_pairs([
            ("EUR_MERCHANT", "M1"),
            ("EUR_SECRET_KEY", "S1"),
            ("HUF_MERCHANT", "M2"),
            ("HUF_SECRET_KEY", "S2"),
        ])
        .unwrap();
        NotificationValidator::new(&config, MemoryLogger::new())
    }

    fn received_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap()
    }

    fn modern_ctx(body: &str, key: &str) -> RequestContext {
        let signature = ModernSigner.sign(&SecretKey::from(key), body.as_bytes()).unwrap();
        RequestContext::from_body(body).with_header("Signature", signature).with_received_at(received_at())
    }

    #[test]
    fn test_modern_ipn_confirmation() {
        let body = r#"{"r":0,"t":500,"merchant":"M1","orderRef":"101","status":"FINISHED"}"#;
        let outcome = validator().validate_ipn(&modern_ctx(body, "S1")).unwrap();

        assert!(outcome.valid);
        assert_eq!(outcome.order_ref(), "101");
        let confirmation = outcome.confirmation.unwrap();
        let echoed: Value = serde_json::from_str(&confirmation.body).unwrap();
        assert_eq!(echoed["receiveDate"], "2024-03-01T12:30:05+00:00");
        assert_eq!(echoed["orderRef"], "101");
        let check = ModernSigner.verify(&SecretKey::from("S1"), confirmation.body.as_bytes(), &confirmation.signature);
        assert!(check.unwrap().valid);
    }

    #[test]
    fn test_modern_ipn_is_idempotent() {
        let validator = validator();
        let ctx = modern_ctx(r#"{"merchant":"M2","orderRef":"9"}"#, "S2");
        let first = validator.validate_ipn(&ctx).unwrap();
        let second = validator.validate_ipn(&ctx).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_modern_ipn_wrong_key_no_confirmation() {
        let outcome = validator().validate_ipn(&modern_ctx(r#"{"merchant":"M1"}"#, "S2")).unwrap();
        assert!(!outcome.valid);
        assert!(outcome.confirmation.is_none());

        let mut sink = BufferedResponse::default();
        assert!(!validator().confirm_ipn(&outcome, &mut sink));
        assert_eq!(sink.writes, 0);
    }

    #[test]
    fn test_modern_ipn_missing_header() {
        let ctx = RequestContext::from_body(r#"{"merchant":"M1"}"#);
        let outcome = validator().validate_ipn(&ctx).unwrap();
        assert_eq!(outcome.received_signature, MISSING_HEADER_SIGNATURE);
        assert!(!outcome.valid);
    }

    #[test]
    fn test_modern_ipn_base64_body() {
        let json = r#"{"merchant":"M1","orderRef":"5"}"#;
        let encoded = STANDARD.encode(json);
        let outcome = validator().validate_ipn(&modern_ctx(&encoded, "S1")).unwrap();
        assert!(outcome.valid);
        assert_eq!(outcome.order_ref(), "5");
    }

    #[test]
    fn test_modern_ipn_rejects_garbage() {
        let result = validator().validate_ipn(&RequestContext::from_body("not json"));
        assert!(matches!(result, Err(GatewayError::InvalidInput(_))));
    }

    #[test]
    fn test_modern_ipn_unknown_merchant() {
        let result = validator().validate_ipn(&modern_ctx(r#"{"merchant":"M9"}"#, "S1"));
        assert!(matches!(result, Err(GatewayError::UnresolvedMerchant(_))));
    }

    #[test]
    fn test_confirm_ipn_writes_once() {
        let validator = validator();
        let outcome = validator.validate_ipn(&modern_ctx(r#"{"merchant":"M1"}"#, "S1")).unwrap();
        let mut sink = BufferedResponse::default();
        assert!(validator.confirm_ipn(&outcome, &mut sink));
        assert_eq!(sink.writes, 1);
        assert!(sink.headers.iter().any(|(k, _)| k == "Signature"));
        assert_eq!(sink.body, outcome.confirmation.unwrap().body);
    }

    #[test]
    fn test_confirm_ipn_swallows_sink_failure() {
        let validator = validator();
        let outcome = validator.validate_ipn(&modern_ctx(r#"{"merchant":"M1"}"#, "S1")).unwrap();
        assert!(!validator.confirm_ipn(&outcome, &mut BrokenSink));
        assert!(validator.logger.records().iter().any(|r| r.get("ipnConfirm").is_some_and(|v| v.contains("went away"))));
    }

    fn legacy_ctx(status: &str, key: &str) -> RequestContext {
        let pairs = [
            ("REFNOEXT", "101"),
            ("REFNO", "5000"),
            ("ORDERSTATUS", status),
            ("IPN_PID[]", "7"),
            ("IPN_PNAME[]", "Product"),
            ("IPN_DATE", "20240301123005"),
        ];
        let values: Vec<&str> = pairs.iter().map(|(_, v)| *v).collect();
        let hash = LegacySigner.sign_chain(&SecretKey::from(key), values).unwrap();
        let mut all = pairs.to_vec();
        all.push(("HASH", hash.as_str()));
        RequestContext::from_body(Vec::new()).with_form(all).with_received_at(received_at())
    }

    #[test]
    fn test_legacy_ipn_valid() {
        let outcome = validator().validate_legacy_ipn(&legacy_ctx("PAYMENT_AUTHORIZED", "S2"), Some("HUF")).unwrap();
        assert!(outcome.valid);

        let expected_hash =
            LegacySigner.sign_chain(&SecretKey::from("S2"), ["7", "Product", "20240301123005", "20240301123005"]).unwrap();
        assert_eq!(outcome.confirmation.as_deref(), Some(format!("<EPAYMENT>20240301123005|{expected_hash}</EPAYMENT>").as_str()));
    }

    #[test]
    fn test_legacy_ipn_gates_are_independent() {
        let validator = validator();

        let outcome = validator.validate_legacy_ipn(&legacy_ctx("CARD_NOTAUTHORIZED", "S2"), Some("HUF")).unwrap();
        assert!(outcome.hash_valid);
        assert!(!outcome.status_confirmable);
        assert!(!outcome.valid);
        assert!(outcome.confirmation.is_none());

        let outcome = validator.validate_legacy_ipn(&legacy_ctx("COMPLETE", "wrong"), Some("HUF")).unwrap();
        assert!(!outcome.hash_valid);
        assert!(outcome.status_confirmable);
        assert!(!outcome.valid);
        assert!(outcome.confirmation.is_none());
    }

    #[test]
    fn test_legacy_ipn_requires_refnoext() {
        let ctx = RequestContext::from_body(Vec::new()).with_form([("ORDERSTATUS", "COMPLETE")]);
        let result = validator().validate_legacy_ipn(&ctx, Some("HUF"));
        assert!(matches!(result, Err(GatewayError::MissingRequiredFields(f)) if f == ["REFNOEXT"]));
    }

    #[test]
    fn test_confirm_legacy_ipn() {
        let validator = validator();
        let outcome = validator.validate_legacy_ipn(&legacy_ctx("COMPLETE", "S2"), Some("HUF")).unwrap();
        let mut sink = BufferedResponse::default();
        assert!(validator.confirm_legacy_ipn(&outcome, &mut sink));
        assert!(sink.body.starts_with("<EPAYMENT>20240301123005|"));
    }
}
