//! Legacy order status reconciliation (IOS).
//!
//! The gateway may not have recorded an order yet when the browser comes
//! back, so the authoritative status is polled in a bounded loop. Each poll
//! spends part of a unit budget:
//!
//! | Observed status        | Cost                | Then         |
//! |------------------------|---------------------|--------------|
//! | `NOT_FOUND`            | 1                   | wait, retry  |
//! | `CARD_NOTAUTHORIZED`   | 5                   | wait, retry  |
//! | anything else          | the whole budget    | stop         |
//! | unsigned / mis-signed  | the whole budget    | stop         |
//!
//! When the budget runs out the last observed status is returned, even if it
//! is still `NOT_FOUND`. A transport failure or an unparsable answer counts
//! as an unsigned poll.

use std::time::Duration;

use tracing::instrument;

use crate::{
    config::GatewayConfig,
    context::Deadline,
    error::{GatewayError, Result},
    log::{LogRecord, Logger},
    merchant::{MerchantProfile, MerchantResolver},
    signature::LegacySigner,
    status::OrderStatus,
    transport::{OutboundRequest, Transport},
};

/// Path of the status endpoint below the legacy base.
pub const IOS_PATH: &str = "order/ios.php";

/// Status reported when a poll produced no usable answer.
pub const EMPTY_RESULT: &str = "EMPTY RESULT";

/// Outcome of a reconciliation loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOutcome {
    /// Last observed status.
    pub status: OrderStatus,
    /// Fields of the last answer, in document order.
    pub fields: Vec<(String, String)>,
    /// Whether the last answer carried a valid `HASH`.
    pub valid: bool,
    /// Number of polls made.
    pub attempts: u32,
    /// Budget units spent.
    pub consumed: u32,
    /// Status of every poll, in order.
    pub history: Vec<OrderStatus>,
}

impl PollOutcome {
    /// Value of a field of the last answer.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.iter().find(|(key, _)| key == name).map(|(_, value)| value.as_str())
    }

    /// `PAYMETHOD` of the last answer.
    #[must_use]
    pub fn pay_method(&self) -> Option<&str> {
        self.field("PAYMETHOD")
    }
}

/// Budget units a poll with `status` costs.
#[must_use]
pub const fn poll_cost(status: &OrderStatus, budget: u32) -> u32 {
    match status {
        OrderStatus::NotFound => 1,
        OrderStatus::CardNotAuthorized => 5,
        _ => budget,
    }
}

/// Bounded IOS polling loop.
#[derive(Debug)]
pub struct StatusPoller<T, L> {
    transport: T,
    logger: L,
    resolver: MerchantResolver,
    endpoint: String,
    budget: u32,
    delay: Duration,
}

impl<T, L> StatusPoller<T, L>
where
    T: Transport,
    L: Logger,
{
    /// Creates a poller for the environment and limits of `config`.
    #[must_use]
    pub fn new(config: &GatewayConfig, transport: T, logger: L) -> Self {
        Self {
            transport,
            logger,
            resolver: config.resolver(),
            endpoint: format!("{}{IOS_PATH}", config.legacy_base()),
            budget: config.poller.budget.max(1),
            delay: config.poller.delay(),
        }
    }

    /// Overrides the unit budget.
    #[must_use]
    pub fn with_budget(mut self, budget: u32) -> Self {
        self.budget = budget.max(1);
        self
    }

    /// Overrides the wait between polls.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Merchant table the poller resolves currencies against.
    #[must_use]
    pub const fn resolver(&self) -> &MerchantResolver {
        &self.resolver
    }

    pub(crate) const fn logger(&self) -> &L {
        &self.logger
    }

    /// Polls the status of `order_ref` with the merchant of `currency`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnresolvedMerchant`] for an unknown currency,
    /// plus the errors of [`poll_with`](Self::poll_with).
    pub async fn poll(&self, currency: &str, order_ref: &str, deadline: Deadline) -> Result<PollOutcome> {
        let profile = self.resolver.by_currency(currency)?;
        self.poll_with(&profile, order_ref, deadline).await
    }

    /// Polls the status of `order_ref` with explicit credentials.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::MissingRequiredFields`] for an empty order reference.
    /// - [`GatewayError::DeadlineExceeded`] when the deadline passes during a
    ///   poll or a wait.
    #[instrument(skip(self, profile, deadline), fields(merchant = profile.merchant_id()))]
    pub async fn poll_with(
        &self,
        profile: &MerchantProfile,
        order_ref: &str,
        deadline: Deadline,
    ) -> Result<PollOutcome> {
        if order_ref.trim().is_empty() {
            return Err(GatewayError::MissingRequiredFields(vec!["REFNOEXT".to_owned()]));
        }

        let hash = LegacySigner.sign_chain(profile.secret_key(), [profile.merchant_id(), order_ref])?;
        let form = vec![
            ("MERCHANT".to_owned(), profile.merchant_id().to_owned()),
            ("REFNOEXT".to_owned(), order_ref.to_owned()),
            ("HASH".to_owned(), hash),
        ];
        self.logger.log(
            &LogRecord::new("IOS")
                .with_order_ref(order_ref)
                .with_entry("MERCHANT", profile.merchant_id())
                .with_entry("REFNOEXT", order_ref),
        );

        let mut consumed = 0_u32;
        let mut attempts = 0_u32;
        let mut history = Vec::new();

        loop {
            let request = OutboundRequest::form(&self.endpoint, form.clone());
            let fields = match deadline.run(self.transport.send(request)).await {
                Ok(reply) => parse_status_document(&reply.text()).unwrap_or_else(|error| {
                    tracing::warn!(%error, order_ref, "unusable status answer");
                    empty_result()
                }),
                Err(GatewayError::DeadlineExceeded) => return Err(GatewayError::DeadlineExceeded),
                Err(error) => {
                    tracing::warn!(%error, order_ref, "status call failed");
                    empty_result()
                }
            };
            attempts += 1;

            let valid = verify_fields(profile, &fields);
            let status = OrderStatus::parse(field(&fields, "ORDER_STATUS").unwrap_or(EMPTY_RESULT));
            history.push(status.clone());

            let cost = if valid { poll_cost(&status, self.budget) } else { self.budget };
            consumed = consumed.saturating_add(cost);

            tracing::debug!(attempt = attempts, status = %status, valid, consumed, "status polled");
            self.logger.log(
                &fields
                    .iter()
                    .fold(LogRecord::new("IOS").with_order_ref(order_ref), |record, (k, v)| record.with_entry(k, v))
                    .with_entry("IOS_HASH", if valid { "VALID" } else { "INVALID" }),
            );

            if consumed >= self.budget {
                if !valid || status == OrderStatus::NotFound {
                    tracing::warn!(order_ref, status = %status, valid, "status budget exhausted");
                }
                return Ok(PollOutcome { status, fields, valid, attempts, consumed, history });
            }

            deadline.sleep(self.delay).await?;
        }
    }
}

fn field<'a>(fields: &'a [(String, String)], name: &str) -> Option<&'a str> {
    fields.iter().find(|(key, _)| key == name).map(|(_, value)| value.as_str())
}

fn verify_fields(profile: &MerchantProfile, fields: &[(String, String)]) -> bool {
    let Some(received) = field(fields, "HASH") else {
        return false;
    };
    let values: Vec<&str> = fields.iter().filter(|(key, _)| key != "HASH").map(|(_, v)| v.as_str()).collect();
    LegacySigner
        .verify_chain(profile.secret_key(), values, received)
        .is_ok_and(|check| check.valid)
}

fn empty_result() -> Vec<(String, String)> {
    vec![
        ("ORDER_DATE".to_owned(), chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()),
        ("REFNO".to_owned(), "N/A".to_owned()),
        ("REFNOEXT".to_owned(), "N/A".to_owned()),
        ("ORDER_STATUS".to_owned(), EMPTY_RESULT.to_owned()),
        ("PAYMETHOD".to_owned(), "N/A".to_owned()),
        ("HASH".to_owned(), "N/A".to_owned()),
    ]
}

/// Reads the child elements of an IOS answer's root element.
///
/// # Errors
///
/// Returns [`GatewayError::MalformedResponse`] when the text is not XML.
///
/// # Examples
///
/// ```
/// use simplepay::poller::parse_status_document;
///
/// let fields = parse_status_document(
///     "<?xml version=\"1.0\"?><Order><REFNOEXT>101</REFNOEXT><ORDER_STATUS>COMPLETE</ORDER_STATUS></Order>",
/// )?;
/// assert_eq!(fields[1], ("ORDER_STATUS".to_owned(), "COMPLETE".to_owned()));
/// # Ok::<(), simplepay::error::GatewayError>(())
/// ```
pub fn parse_status_document(text: &str) -> Result<Vec<(String, String)>> {
    let document = roxmltree::Document::parse(text.trim())
        .map_err(|e| GatewayError::MalformedResponse(format!("status answer is not XML: {e}")))?;
    Ok(document
        .root_element()
        .children()
        .filter(roxmltree::Node::is_element)
        .map(|node| (node.tag_name().name().to_owned(), node.text().unwrap_or_default().to_owned()))
        .collect())
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex, PoisonError},
    };

    use super::*;
    use crate::{
        log::MemoryLogger,
        merchant::{MerchantEntry, SecretKey},
        transport::TransportResponse,
    };

    #[derive(Debug, Default)]
    struct Script {
        replies: Mutex<VecDeque<Result<TransportResponse>>>,
        calls: Mutex<u32>,
    }

    impl Transport for Script {
        async fn send(&self, _request: OutboundRequest) -> Result<TransportResponse> {
            *self.calls.lock().unwrap_or_else(PoisonError::into_inner) += 1;
            self.replies
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
                .unwrap_or_else(|| Err(GatewayError::TransportFailure("script exhausted".into())))
        }
    }

    fn signed_status(status: &str) -> Result<TransportResponse> {
        let key = SecretKey::from("S1");
        let values = ["2024-03-01 10:00:00", "5000", "101", status, "CCVISAMC"];
        let hash = LegacySigner.sign_chain(&key, values).unwrap();
        Ok(TransportResponse::ok(format!(
            "<?xml version=\"1.0\"?>\n<Order><ORDER_DATE>{}</ORDER_DATE><REFNO>{}</REFNO><REFNOEXT>{}</REFNOEXT>\
             <ORDER_STATUS>{}</ORDER_STATUS><PAYMETHOD>{}</PAYMETHOD><HASH>{hash}</HASH></Order>",
            values[0], values[1], values[2], values[3], values[4]
        )))
    }

    fn poller(replies: Vec<Result<TransportResponse>>) -> (Arc<Script>, StatusPoller<Arc<Script>, MemoryLogger>) {
        let script = Arc::new(Script { replies: Mutex::new(replies.into()), calls: Mutex::new(0) });
        let config = GatewayConfig { merchants: vec![MerchantEntry::new("EUR", "M1", "S1")], ..GatewayConfig::default() };
        let poller = StatusPoller::new(&config, Arc::clone(&script), MemoryLogger::new());
        (script, poller)
    }

    #[test]
    fn test_poll_cost() {
        assert_eq!(poll_cost(&OrderStatus::NotFound, 10), 1);
        assert_eq!(poll_cost(&OrderStatus::CardNotAuthorized, 10), 5);
        assert_eq!(poll_cost(&OrderStatus::Complete, 10), 10);
        assert_eq!(poll_cost(&OrderStatus::Unknown("X".into()), 7), 7);
    }

    #[test]
    fn test_parse_status_document_rejects_garbage() {
        assert!(matches!(parse_status_document("not xml"), Err(GatewayError::MalformedResponse(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_final_status_wins() {
        let (script, poller) = poller(vec![signed_status("COMPLETE")]);
        let outcome = poller.poll("EUR", "101", Deadline::none()).await.unwrap();
        assert_eq!(outcome.status, OrderStatus::Complete);
        assert!(outcome.valid);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.pay_method(), Some("CCVISAMC"));
        assert_eq!(*script.calls.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_declined_then_not_found_keeps_polling() {
        let (_, poller) = poller(vec![
            signed_status("NOT_FOUND"),
            signed_status("NOT_FOUND"),
            signed_status("CARD_NOTAUTHORIZED"),
            signed_status("PAYMENT_AUTHORIZED"),
        ]);
        let outcome = poller.poll("EUR", "101", Deadline::none()).await.unwrap();
        assert_eq!(outcome.attempts, 4);
        assert_eq!(outcome.status, OrderStatus::PaymentAuthorized);
        assert_eq!(outcome.history[2], OrderStatus::CardNotAuthorized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_exhausts_budget() {
        let (script, poller) = poller((0..11).map(|_| signed_status("NOT_FOUND")).collect());
        let outcome = poller.poll("EUR", "101", Deadline::none()).await.unwrap();
        assert_eq!(outcome.status, OrderStatus::NotFound);
        assert_eq!(outcome.attempts, 10);
        assert_eq!(outcome.consumed, 10);
        assert_eq!(*script.calls.lock().unwrap(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_hash_stops_loop() {
        let reply = Ok(TransportResponse::ok(
            "<Order><REFNOEXT>101</REFNOEXT><ORDER_STATUS>NOT_FOUND</ORDER_STATUS><HASH>00</HASH></Order>",
        ));
        let (script, poller) = poller(vec![reply, signed_status("COMPLETE")]);
        let outcome = poller.poll("EUR", "101", Deadline::none()).await.unwrap();
        assert!(!outcome.valid);
        assert_eq!(outcome.status, OrderStatus::NotFound);
        assert_eq!(*script.calls.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_is_empty_result() {
        let (_, poller) = poller(vec![Err(GatewayError::TransportFailure("reset".into()))]);
        let outcome = poller.poll("EUR", "101", Deadline::none()).await.unwrap();
        assert!(!outcome.valid);
        assert_eq!(outcome.status.as_str(), EMPTY_RESULT);
        assert_eq!(outcome.field("PAYMETHOD"), Some("N/A"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_waiting() {
        let (_, poller) = poller((0..11).map(|_| signed_status("NOT_FOUND")).collect());
        let poller = poller.with_delay(Duration::from_secs(1));
        let result = poller.poll("EUR", "101", Deadline::after(Duration::from_millis(2500))).await;
        assert!(matches!(result, Err(GatewayError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_missing_order_ref() {
        let (_, poller) = poller(vec![]);
        let result = poller.poll("EUR", " ", Deadline::none()).await;
        assert!(matches!(result, Err(GatewayError::MissingRequiredFields(fields)) if fields == ["REFNOEXT"]));
    }

    #[tokio::test]
    async fn test_unknown_currency() {
        let (_, poller) = poller(vec![]);
        assert!(matches!(
            poller.poll("USD", "101", Deadline::none()).await,
            Err(GatewayError::UnresolvedMerchant(_))
        ));
    }
}
