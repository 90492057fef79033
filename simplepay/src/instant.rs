//! Instant refund (IRN) and instant delivery (IDN) notices.
//!
//! Both are legacy form POSTs that tell the gateway about an order change.
//! The request carries `ORDER_HASH`, an HMAC-MD5 chain over a fixed field
//! list. The gateway answers with
//! `<EPAYMENT>ORDER_REF|RESPONSE_CODE|RESPONSE_MSG|DATE|ORDER_HASH</EPAYMENT>`,
//! whose trailing hash covers the four values before it.

use std::fmt;

use chrono::{DateTime, Utc};
use tracing::instrument;

use crate::{
    config::GatewayConfig,
    context::Deadline,
    error::{GatewayError, Result},
    log::{LogRecord, Logger},
    merchant::MerchantResolver,
    signature::LegacySigner,
    transport::{OutboundRequest, Transport},
};

/// Value used for answer elements the gateway did not send.
pub const NOT_AVAILABLE: &str = "N/A";

/// Which instant notice to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeKind {
    /// Instant refund notice.
    Refund,
    /// Instant delivery notice.
    Delivery,
}

impl NoticeKind {
    /// Log interface name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Refund => "IRN",
            Self::Delivery => "IDN",
        }
    }

    /// Path below the legacy base.
    #[must_use]
    pub const fn path(self) -> &'static str {
        match self {
            Self::Refund => "order/irn.php",
            Self::Delivery => "order/idn.php",
        }
    }

    /// Name of the date field.
    #[must_use]
    pub const fn date_field(self) -> &'static str {
        match self {
            Self::Refund => "IRN_DATE",
            Self::Delivery => "IDN_DATE",
        }
    }

    /// Fields sent and signed, in chain order.
    #[must_use]
    pub const fn hash_fields(self) -> &'static [&'static str] {
        match self {
            Self::Refund => &["MERCHANT", "ORDER_REF", "ORDER_AMOUNT", "ORDER_CURRENCY", "IRN_DATE", "AMOUNT"],
            Self::Delivery => &["MERCHANT", "ORDER_REF", "ORDER_AMOUNT", "ORDER_CURRENCY", "IDN_DATE"],
        }
    }
}

impl fmt::Display for NoticeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One IRN or IDN request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstantNotice {
    kind: NoticeKind,
    merchant_order_ref: String,
    values: Vec<(&'static str, String)>,
}

impl InstantNotice {
    /// Refund of `amount` from an order of `order_amount`.
    ///
    /// `order_ref` is the gateway reference (`REFNO`); `merchant_order_ref`
    /// is only used to correlate log records.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn refund(
        merchant_order_ref: impl Into<String>,
        order_ref: impl Into<String>,
        order_amount: impl Into<String>,
        currency: impl Into<String>,
        amount: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: NoticeKind::Refund,
            merchant_order_ref: merchant_order_ref.into(),
            values: vec![
                ("ORDER_REF", order_ref.into()),
                ("ORDER_AMOUNT", order_amount.into()),
                ("ORDER_CURRENCY", currency.into()),
                ("IRN_DATE", notice_date(at)),
                ("AMOUNT", amount.into()),
            ],
        }
    }

    /// Delivery of an order of `order_amount`.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn delivery(
        merchant_order_ref: impl Into<String>,
        order_ref: impl Into<String>,
        order_amount: impl Into<String>,
        currency: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: NoticeKind::Delivery,
            merchant_order_ref: merchant_order_ref.into(),
            values: vec![
                ("ORDER_REF", order_ref.into()),
                ("ORDER_AMOUNT", order_amount.into()),
                ("ORDER_CURRENCY", currency.into()),
                ("IDN_DATE", notice_date(at)),
            ],
        }
    }

    /// Kind of notice.
    #[must_use]
    pub const fn kind(&self) -> NoticeKind {
        self.kind
    }

    /// Value of a request field.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<&str> {
        self.values.iter().find(|(key, _)| *key == name).map(|(_, value)| value.as_str())
    }

    /// Currency of the order.
    #[must_use]
    pub fn currency(&self) -> &str {
        self.value("ORDER_CURRENCY").unwrap_or_default()
    }
}

fn notice_date(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Parsed gateway answer to a notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoticeReply {
    /// Kind of notice answered.
    pub kind: NoticeKind,
    /// Gateway order reference.
    pub order_ref: String,
    /// Response code.
    pub response_code: String,
    /// Response message.
    pub response_msg: String,
    /// Date echoed as `IRN_DATE` or `IDN_DATE`.
    pub date: String,
    /// Trailing hash.
    pub order_hash: String,
    /// Whether `order_hash` matched the other values.
    pub hash_valid: bool,
}

impl NoticeReply {
    /// Answer as named pairs, date under its kind-specific name.
    #[must_use]
    pub fn named(&self) -> [(&'static str, &str); 5] {
        [
            ("ORDER_REF", &self.order_ref),
            ("RESPONSE_CODE", &self.response_code),
            ("RESPONSE_MSG", &self.response_msg),
            (self.kind.date_field(), &self.date),
            ("ORDER_HASH", &self.order_hash),
        ]
    }
}

/// Returns the `|`-separated elements of the first `<EPAYMENT>` element.
///
/// # Errors
///
/// Returns [`GatewayError::MalformedResponse`] when the text has no
/// `<EPAYMENT>` element.
///
/// # Examples
///
/// ```
/// use simplepay::instant::epayment_elements;
///
/// let parts = epayment_elements("<html><EPAYMENT>5000|1|OK|2024-03-01 10:00:00|abc</EPAYMENT></html>")?;
/// assert_eq!(parts, ["5000", "1", "OK", "2024-03-01 10:00:00", "abc"]);
/// # Ok::<(), simplepay::error::GatewayError>(())
/// ```
pub fn epayment_elements(text: &str) -> Result<Vec<String>> {
    const OPEN: &str = "<EPAYMENT>";
    const CLOSE: &str = "</EPAYMENT>";
    let inner = text
        .split_once(OPEN)
        .and_then(|(_, rest)| rest.split_once(CLOSE))
        .map(|(inner, _)| inner)
        .ok_or_else(|| GatewayError::MalformedResponse("no EPAYMENT element in answer".to_owned()))?;
    Ok(inner.split('|').map(str::to_owned).collect())
}

/// Sends IRN and IDN notices.
#[derive(Debug)]
pub struct InstantNotifier<T, L> {
    transport: T,
    logger: L,
    resolver: MerchantResolver,
    legacy_base: String,
}

impl<T, L> InstantNotifier<T, L>
where
    T: Transport,
    L: Logger,
{
    /// Creates a notifier for the environment of `config`.
    #[must_use]
    pub fn new(config: &GatewayConfig, transport: T, logger: L) -> Self {
        Self {
            transport,
            logger,
            resolver: config.resolver(),
            legacy_base: config.legacy_base().to_owned(),
        }
    }

    /// Signs and sends `notice` with the merchant of its currency.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::UnresolvedMerchant`] for an unknown currency.
    /// - [`GatewayError::MissingRequiredFields`] when `ORDER_REF` is empty.
    /// - [`GatewayError::MalformedResponse`] when the answer has no `<EPAYMENT>` element.
    /// - Transport errors and [`GatewayError::DeadlineExceeded`].
    ///
    /// A wrong answer hash is reported through [`NoticeReply::hash_valid`].
    #[instrument(skip(self, notice), fields(kind = %notice.kind(), order_ref = %notice.merchant_order_ref))]
    pub async fn send(&self, notice: &InstantNotice, deadline: Deadline) -> Result<NoticeReply> {
        if notice.value("ORDER_REF").is_none_or(str::is_empty) {
            return Err(GatewayError::MissingRequiredFields(vec!["ORDER_REF".to_owned()]));
        }
        let profile = self.resolver.by_currency(notice.currency())?;
        let kind = notice.kind();

        let mut form: Vec<(String, String)> = kind
            .hash_fields()
            .iter()
            .map(|name| {
                let value = if *name == "MERCHANT" {
                    profile.merchant_id()
                } else {
                    notice.value(name).unwrap_or_default()
                };
                ((*name).to_owned(), value.to_owned())
            })
            .collect();
        let hash = LegacySigner.sign_chain(profile.secret_key(), form.iter().map(|(_, value)| value))?;
        form.push(("ORDER_HASH".to_owned(), hash));

        self.logger.log(&form.iter().fold(
            LogRecord::new(kind.as_str()).with_order_ref(&notice.merchant_order_ref),
            |record, (name, value)| record.with_entry(name, value),
        ));

        let url = format!("{}{}", self.legacy_base, kind.path());
        let answer = deadline.run(self.transport.send(OutboundRequest::form(url, form))).await?;
        let mut parts = epayment_elements(&answer.text())?;

        let hash_valid = match parts.len() {
            5 => LegacySigner.verify_chain(profile.secret_key(), &parts[..4], &parts[4])?.valid,
            _ => false,
        };
        parts.resize(5, NOT_AVAILABLE.to_owned());
        let mut parts = parts.into_iter();
        let mut next = || parts.next().unwrap_or_default();
        let reply = NoticeReply {
            kind,
            order_ref: next(),
            response_code: next(),
            response_msg: next(),
            date: next(),
            order_hash: next(),
            hash_valid,
        };

        if !hash_valid {
            tracing::warn!(order_ref = %reply.order_ref, "notice answer hash mismatch");
        }
        self.logger.log(
            &reply
                .named()
                .iter()
                .fold(LogRecord::new(kind.as_str()).with_order_ref(&notice.merchant_order_ref), |record, (k, v)| {
                    record.with_entry(*k, v)
                })
                .with_entry("HASH_CHECK", if hash_valid { "Successful" } else { "Fail" }),
        );

        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex, PoisonError};

    use chrono::TimeZone;

    use super::*;
    use crate::{
        log::MemoryLogger,
        merchant::SecretKey,
        transport::{RequestBody, TransportResponse},
    };

    #[derive(Debug, Default)]
    struct Capture {
        reply: String,
        sent: Mutex<Vec<OutboundRequest>>,
    }

    impl Transport for Capture {
        async fn send(&self, request: OutboundRequest) -> Result<TransportResponse> {
            self.sent.lock().unwrap_or_else(PoisonError::into_inner).push(request);
            Ok(TransportResponse::ok(self.reply.clone()))
        }
    }

    fn notifier(reply: String) -> (Arc<Capture>, InstantNotifier<Arc<Capture>, MemoryLogger>) {
        let capture = Arc::new(Capture { reply, sent: Mutex::new(Vec::new()) });
        let config = GatewayConfig::from_pairs([("HUF_MERCHANT", "M2"), ("HUF_SECRET_KEY", "S2")]).unwrap();
        (Arc::clone(&capture), InstantNotifier::new(&config, capture, MemoryLogger::new()))
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
    }

    fn signed_answer(values: [&str; 4]) -> String {
        let hash = LegacySigner.sign_chain(&SecretKey::from("S2"), values).unwrap();
        format!("<EPAYMENT>{}|{hash}</EPAYMENT>", values.join("|"))
    }

    #[tokio::test]
    async fn test_refund_notice_signed_in_order() {
        let (capture, notifier) = notifier(signed_answer(["5000", "1", "OK", "2024-03-01 10:00:00"]));
        let notice = InstantNotice::refund("101", "5000", "1500", "HUF", "500", at());

        let reply = notifier.send(&notice, Deadline::none()).await.unwrap();
        assert!(reply.hash_valid);
        assert_eq!(reply.response_code, "1");

        let sent = capture.sent.lock().unwrap();
        assert!(sent[0].url.ends_with("order/irn.php"));
        let RequestBody::Form(pairs) = &sent[0].body else { panic!("expected a form body") };
        let names: Vec<&str> = pairs.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            ["MERCHANT", "ORDER_REF", "ORDER_AMOUNT", "ORDER_CURRENCY", "IRN_DATE", "AMOUNT", "ORDER_HASH"]
        );
        let expected = LegacySigner
            .sign_chain(&SecretKey::from("S2"), ["M2", "5000", "1500", "HUF", "2024-03-01 10:00:00", "500"])
            .unwrap();
        assert_eq!(pairs[6].1, expected);
    }

    #[tokio::test]
    async fn test_delivery_notice() {
        let (capture, notifier) = notifier(signed_answer(["5000", "1", "OK", "2024-03-01 10:00:00"]));
        let notice = InstantNotice::delivery("101", "5000", "1500", "HUF", at());

        let reply = notifier.send(&notice, Deadline::none()).await.unwrap();
        assert_eq!(reply.named()[3], ("IDN_DATE", "2024-03-01 10:00:00"));
        assert!(capture.sent.lock().unwrap()[0].url.ends_with("order/idn.php"));
    }

    #[tokio::test]
    async fn test_tampered_answer() {
        let answer = signed_answer(["5000", "1", "OK", "2024-03-01 10:00:00"]).replace("|OK|", "|KO|");
        let (_, notifier) = notifier(answer);
        let reply = notifier
            .send(&InstantNotice::delivery("101", "5000", "1", "HUF", at()), Deadline::none())
            .await
            .unwrap();
        assert!(!reply.hash_valid);
    }

    #[tokio::test]
    async fn test_short_answer_padded() {
        let (_, notifier) = notifier("<EPAYMENT>5000|0</EPAYMENT>".to_owned());
        let reply = notifier
            .send(&InstantNotice::delivery("101", "5000", "1", "HUF", at()), Deadline::none())
            .await
            .unwrap();
        assert!(!reply.hash_valid);
        assert_eq!(reply.response_msg, NOT_AVAILABLE);
        assert_eq!(reply.order_hash, NOT_AVAILABLE);
    }

    #[tokio::test]
    async fn test_answer_without_epayment() {
        let (_, notifier) = notifier("<html>error</html>".to_owned());
        let result = notifier.send(&InstantNotice::delivery("101", "5000", "1", "HUF", at()), Deadline::none()).await;
        assert!(matches!(result, Err(GatewayError::MalformedResponse(_))));
    }

    #[tokio::test]
    async fn test_empty_order_ref_rejected() {
        let (capture, notifier) = notifier(String::new());
        let result = notifier.send(&InstantNotice::delivery("101", "", "1", "HUF", at()), Deadline::none()).await;
        assert!(matches!(result, Err(GatewayError::MissingRequiredFields(_))));
        assert!(capture.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_currency() {
        let (_, notifier) = notifier(String::new());
        let result = notifier.send(&InstantNotice::delivery("101", "5000", "1", "USD", at()), Deadline::none()).await;
        assert!(matches!(result, Err(GatewayError::UnresolvedMerchant(_))));
    }
}
