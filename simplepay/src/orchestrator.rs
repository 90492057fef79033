//! Outbound transaction lifecycle.
//!
//! [`TransactionOrchestrator`] drives one modern operation through a fixed
//! pipeline:
//!
//! ```text
//! INIT -> CONFIGURED -> SIGNED -> SENT -> RESPONDED -> VERIFIED | REJECTED
//! ```
//!
//! - **CONFIGURED**: merchant resolved, endpoint chosen.
//! - **SIGNED**: body frozen, salted and signed with HMAC-SHA384.
//! - **SENT**: exactly one call through the [`Transport`]. Retries, if any,
//!   happen inside the transport.
//! - **RESPONDED**: payload and signature header extracted.
//! - **VERIFIED / REJECTED**: response signature checked. Fields are parsed
//!   either way so callers can diagnose a rejected answer, but only
//!   [`TransactionResponse::trusted_fields`] hands them out as trusted.
//!
//! Each stage emits a [`LogRecord`] tagged `callState` = `PREPARE`, `RUN` or
//! `RESPONSE`.
//!
//! # Examples
//!
//! ```rust,no_run
//! use simplepay::{
//!     config::GatewayConfig,
//!     context::Deadline,
//!     log::TracingLogger,
//!     orchestrator::TransactionOrchestrator,
//!     request::TransactionRequest,
//!     transport::HttpTransport,
//! };
//!
//! # async fn example() -> simplepay::error::Result<()> {
//! let config = GatewayConfig::from_pairs([("HUF_MERCHANT", "PUBLICTESTHUF"), ("HUF_SECRET_KEY", "FxDa5w314kLlNseq2sKuVwaqZshZT5d6")])?;
//! let orchestrator = TransactionOrchestrator::new(&config, HttpTransport::new()?, TracingLogger);
//!
//! let request = TransactionRequest::start()
//!     .with_currency("HUF")
//!     .add_data("orderRef", "101010514")
//!     .add_data("total", 100);
//! let response = orchestrator.start(request, Deadline::none()).await?;
//!
//! if let Some(fields) = response.trusted_fields() {
//!     println!("pay at {}", fields["paymentUrl"]);
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;

use serde_json::{Map, Value};
use tracing::instrument;

use crate::{
    config::GatewayConfig,
    context::Deadline,
    error::{GatewayError, Result},
    log::{LogRecord, Logger, redact_json_text},
    merchant::MerchantResolver,
    request::{FrozenRequest, Interface, TransactionRequest, new_salt},
    signature::{MISSING_HEADER_SIGNATURE, ModernSigner, Signer, signature_from_headers},
    transport::{OutboundRequest, Transport},
};

/// Stage of one outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    /// Nothing done yet.
    Init,
    /// Merchant and endpoint selected.
    Configured,
    /// Body frozen and signed.
    Signed,
    /// Request handed to the transport.
    Sent,
    /// Answer received and split.
    Responded,
    /// Response signature valid.
    Verified,
    /// Response signature invalid or missing.
    Rejected,
}

impl CallState {
    /// `callState` marker written to the log for this stage.
    #[must_use]
    pub const fn log_marker(&self) -> &'static str {
        match self {
            Self::Init | Self::Configured | Self::Signed => "PREPARE",
            Self::Sent => "RUN",
            Self::Responded | Self::Verified | Self::Rejected => "RESPONSE",
        }
    }

    /// Whether the call ended here.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Verified | Self::Rejected)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Configured => "CONFIGURED",
            Self::Signed => "SIGNED",
            Self::Sent => "SENT",
            Self::Responded => "RESPONDED",
            Self::Verified => "VERIFIED",
            Self::Rejected => "REJECTED",
        };
        f.write_str(name)
    }
}

/// Result of one outbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionResponse {
    /// Operation that was called.
    pub interface: Interface,
    /// HTTP status of the answer.
    pub status: u16,
    /// Payload part of the answer.
    pub raw_body: String,
    /// Received `Signature` header, or the missing-signature sentinel.
    pub signature_header: String,
    /// Whether `signature_header` is a valid MAC of `raw_body`.
    pub signature_valid: bool,
    /// Parsed payload. Untrusted unless `signature_valid`.
    pub fields: Map<String, Value>,
    /// `transactionId`, or `cardId` for card operations.
    pub transaction_id: Option<String>,
    /// `orderRef` of the answer.
    pub order_ref: Option<String>,
    /// Stages passed, in order.
    pub path: Vec<CallState>,
}

impl TransactionResponse {
    /// Final stage reached.
    #[must_use]
    pub fn state(&self) -> CallState {
        self.path.last().copied().unwrap_or(CallState::Init)
    }

    /// Fields, only when the signature verified.
    #[must_use]
    pub fn trusted_fields(&self) -> Option<&Map<String, Value>> {
        self.signature_valid.then_some(&self.fields)
    }

    /// Converts an unverified response into [`GatewayError::SignatureMismatch`].
    ///
    /// # Errors
    ///
    /// Returns the mismatch when the response signature did not verify.
    pub fn require_valid(self) -> Result<Self> {
        if self.signature_valid {
            Ok(self)
        } else {
            Err(GatewayError::SignatureMismatch {
                expected: "valid response signature".to_owned(),
                received: self.signature_header,
            })
        }
    }

    /// `paymentUrl` of a verified `start` answer.
    #[must_use]
    pub fn payment_url(&self) -> Option<&str> {
        self.trusted_fields()?.get("paymentUrl").and_then(Value::as_str)
    }

    /// Gateway error codes, if the answer carries any.
    #[must_use]
    pub fn error_codes(&self) -> Vec<String> {
        self.fields
            .get("errorCodes")
            .and_then(Value::as_array)
            .map(|codes| codes.iter().map(scalar_string).collect())
            .unwrap_or_default()
    }
}

/// Runs modern operations against the gateway.
///
/// Generic over the transport, the log sink and the signer, all injected at
/// construction. The orchestrator itself holds no per-call state and can be
/// shared between tasks.
#[derive(Debug)]
pub struct TransactionOrchestrator<T, L, S = ModernSigner> {
    transport: T,
    logger: L,
    signer: S,
    resolver: MerchantResolver,
    api_base: String,
    language: String,
}

impl<T, L> TransactionOrchestrator<T, L, ModernSigner>
where
    T: Transport,
    L: Logger,
{
    /// Creates an orchestrator for the environment selected by `config`.
    #[must_use]
    pub fn new(config: &GatewayConfig, transport: T, logger: L) -> Self {
        Self {
            transport,
            logger,
            signer: ModernSigner,
            resolver: config.resolver(),
            api_base: config.api_base().trim_end_matches('/').to_owned(),
            language: "EN".to_owned(),
        }
    }
}

impl<T, L, S> TransactionOrchestrator<T, L, S>
where
    T: Transport,
    L: Logger,
    S: Signer,
{
    /// Replaces the signer.
    #[must_use]
    pub fn with_signer<S2: Signer>(self, signer: S2) -> TransactionOrchestrator<T, L, S2> {
        TransactionOrchestrator {
            transport: self.transport,
            logger: self.logger,
            signer,
            resolver: self.resolver,
            api_base: self.api_base,
            language: self.language,
        }
    }

    /// Overrides the `Accept-Language` header, `EN` by default.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Endpoint of an operation.
    #[must_use]
    pub fn endpoint(&self, interface: Interface) -> String {
        format!("{}/v2/{interface}", self.api_base)
    }

    /// Opens a payment.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn start(&self, request: TransactionRequest, deadline: Deadline) -> Result<TransactionResponse> {
        self.execute_as(Interface::Start, request, deadline).await
    }

    /// Captures an authorized payment.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn finish(&self, request: TransactionRequest, deadline: Deadline) -> Result<TransactionResponse> {
        self.execute_as(Interface::Finish, request, deadline).await
    }

    /// Refunds a payment.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn refund(&self, request: TransactionRequest, deadline: Deadline) -> Result<TransactionResponse> {
        self.execute_as(Interface::Refund, request, deadline).await
    }

    /// Queries transactions.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn query(&self, request: TransactionRequest, deadline: Deadline) -> Result<TransactionResponse> {
        self.execute_as(Interface::Query, request, deadline).await
    }

    async fn execute_as(
        &self,
        expected: Interface,
        request: TransactionRequest,
        deadline: Deadline,
    ) -> Result<TransactionResponse> {
        if request.interface() != expected {
            return Err(GatewayError::InvalidInput(format!(
                "{} request passed to {expected}",
                request.interface()
            )));
        }
        self.execute(request, deadline).await
    }

    /// Runs the whole pipeline for `request`.
    ///
    /// An answer whose signature does not verify is not an error: it comes
    /// back with `signature_valid == false` and its fields kept.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::UnresolvedMerchant`] when no credentials match.
    /// - [`GatewayError::MissingSignatureInput`] when there is nothing to sign.
    /// - [`GatewayError::TransportFailure`], [`GatewayError::HttpError`] or
    ///   [`GatewayError::DeadlineExceeded`] when the call fails; the failure
    ///   is logged first.
    #[instrument(skip(self, request, deadline), fields(interface = %request.interface()))]
    pub async fn execute(&self, request: TransactionRequest, deadline: Deadline) -> Result<TransactionResponse> {
        let interface = request.interface();
        let mut path = vec![CallState::Init];

        let profile = self.resolver.resolve(request.currency(), request.merchant_account())?;
        let url = self.endpoint(interface);
        path.push(CallState::Configured);

        let frozen = request.freeze(&profile, &new_salt())?;
        let signature = self.signer.sign(profile.secret_key(), frozen.json().as_bytes())?;
        path.push(CallState::Signed);

        self.logger.log(
            &self
                .record(&frozen, CallState::Signed)
                .with_entry("merchant", profile.merchant_id())
                .with_value("", frozen.body()),
        );

        let outbound = OutboundRequest::json(&url, frozen.json())
            .with_header("Accept-Language", &self.language)
            .with_header("Content-Type", "application/json")
            .with_header("Signature", &signature);

        path.push(CallState::Sent);
        self.logger.log(
            &self
                .record(&frozen, CallState::Sent)
                .with_entry("sendApiUrl", &url)
                .with_entry("sendContent", redact_json_text(frozen.json()))
                .with_entry("sendSignature", &signature),
        );

        let reply = match deadline.run(self.transport.send(outbound)).await {
            Ok(reply) => reply,
            Err(error) => {
                tracing::warn!(%error, %url, "gateway call failed");
                self.logger.log(
                    &self
                        .record(&frozen, CallState::Responded)
                        .with_entry("runCommunicationException", &error),
                );
                return Err(error);
            }
        };

        let text = reply.text();
        let (echoed_headers, payload) = split_payload(&text);
        let mut signature_header = signature_from_headers(reply.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if signature_header == MISSING_HEADER_SIGNATURE {
            signature_header = signature_from_headers(echoed_headers);
        }
        path.push(CallState::Responded);

        let signature_valid = if payload.is_empty() || signature_header == MISSING_HEADER_SIGNATURE {
            false
        } else {
            self.signer.verify(profile.secret_key(), payload.as_bytes(), &signature_header)?.valid
        };

        let fields = match serde_json::from_str::<Value>(payload) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                tracing::warn!(status = reply.status, "response payload is not a JSON object");
                Map::new()
            }
        };

        let transaction_id = fields
            .get("transactionId")
            .or_else(|| fields.get("cardId"))
            .map(scalar_string)
            .filter(|id| !id.is_empty());
        let order_ref = fields.get("orderRef").map(scalar_string).filter(|r| !r.is_empty());

        let outcome = if signature_valid { CallState::Verified } else { CallState::Rejected };
        path.push(outcome);

        if !signature_valid {
            tracing::warn!(interface = %interface, "response signature did not verify");
        }

        let mut record = self
            .record(&frozen, outcome)
            .with_entry("responseBody", redact_json_text(payload))
            .with_entry("responseSignature", &signature_header)
            .with_entry("responseSignatureValid", signature_valid)
            .with_value("", &Value::Object(fields.clone()));
        if let Some(id) = &transaction_id {
            record.transaction_id.clone_from(id);
        }
        if let Some(order) = &order_ref {
            record.order_ref.clone_from(order);
        }
        self.logger.log(&record);

        Ok(TransactionResponse {
            interface,
            status: reply.status,
            raw_body: payload.to_owned(),
            signature_header,
            signature_valid,
            fields,
            transaction_id,
            order_ref,
            path,
        })
    }

    fn record(&self, frozen: &FrozenRequest, state: CallState) -> LogRecord {
        LogRecord::new(frozen.interface().as_str())
            .with_order_ref(frozen.order_ref())
            .with_transaction_id(frozen.transaction_id())
            .with_entry("callState", state.log_marker())
    }
}

/// Splits a reply on `\r\n`. The last segment is the payload; earlier
/// `name: value` segments are echoed headers.
fn split_payload(text: &str) -> (Vec<(&str, &str)>, &str) {
    let mut segments: Vec<&str> = text.split("\r\n").collect();
    let payload = segments.pop().unwrap_or_default();
    let headers = segments
        .into_iter()
        .filter_map(|segment| segment.split_once(':'))
        .map(|(name, value)| (name.trim(), value.trim()))
        .collect();
    (headers, payload)
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
