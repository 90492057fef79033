//! SimplePay: payment gateway integration for merchant backends
//!
//! A Rust library that talks to the SimplePay card payment gateway in both
//! of its protocol generations, signs everything it sends and verifies
//! everything it receives before a merchant backend acts on it.
//!
//! # What does it cover?
//!
//! - **Modern JSON API (v2)**: start, finish, refund and query calls signed
//!   with HMAC-SHA384, plus the `Back` redirect and the JSON IPN.
//! - **Legacy form protocol**: LiveUpdate checkout forms, the `BackRef`
//!   redirect with its bounded status reconciliation (IOS), the form IPN and
//!   the instant refund/delivery notices (IRN/IDN), all signed with the
//!   length-prefixed HMAC-MD5 chain.
//! - **Multi-currency merchants**: one credential pair per currency,
//!   resolved per operation.
//! - **Safe logs**: card secrets and merchant keys never reach a log sink.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ Merchant shop   │  web framework, order storage
//! └────────┬────────┘
//!          │ RequestContext / TransactionRequest
//!          │
//! ┌────────▼────────────────────────────────────────┐
//! │              simplepay (this crate)             │
//! │  ┌──────────────┐  ┌────────────┐  ┌─────────┐  │
//! │  │ Orchestrator │  │ Validators │  │ Poller  │  │
//! │  └──────┬───────┘  └─────┬──────┘  └────┬────┘  │
//! │         └──── Signer ────┴── Logger ────┘       │
//! └────────┬────────────────────────────────────────┘
//!          │ Transport (HTTPS)
//!          │
//! ┌────────▼────────┐
//! │ SimplePay       │  /payment/v2/*, /payment/order/*.php
//! └─────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ## 1. Start a payment
//!
//! ```rust,no_run
//! use simplepay::{
//!     config::GatewayConfig,
//!     context::Deadline,
//!     log::TracingLogger,
//!     orchestrator::TransactionOrchestrator,
//!     request::{Item, TransactionRequest},
//!     transport::HttpTransport,
//! };
//!
//! # async fn example() -> simplepay::error::Result<()> {
//! let config = GatewayConfig::from_file("simplepay.toml")?;
//! let orchestrator = TransactionOrchestrator::new(&config, HttpTransport::new()?, TracingLogger);
//!
//! let request = TransactionRequest::start()
//!     .with_currency("HUF")
//!     .add_data("orderRef", "101010514")
//!     .add_data("customerEmail", "buyer@example.com")
//!     .add_items(Item::new("LAMP-1").with_title("Lamp").with_amount(1));
//!
//! let response = orchestrator.start(request, Deadline::none()).await?.require_valid()?;
//! println!("redirect the browser to {:?}", response.payment_url());
//! # Ok(())
//! # }
//! ```
//!
//! ## 2. Validate an IPN
//!
//! ```rust
//! use simplepay::{
//!     config::GatewayConfig,
//!     context::RequestContext,
//!     log::MemoryLogger,
//!     notification::{BufferedResponse, NotificationValidator},
//! };
//!
//! # fn example() -> simplepay::error::Result<()> {
//! let config = GatewayConfig::from_pairs([("HUF_MERCHANT", "M1"), ("HUF_SECRET_KEY", "S1")])?;
//! let validator = NotificationValidator::new(&config, MemoryLogger::new());
//!
//! let ctx = RequestContext::from_body(r#"{"merchant":"M1","orderRef":"101"}"#);
//! let outcome = validator.validate_ipn(&ctx)?;
//!
//! // Unsigned, so nothing is confirmed.
//! let mut response = BufferedResponse::default();
//! assert!(!validator.confirm_ipn(&outcome, &mut response));
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```
//!
//! # Module Organization
//!
//! - [`signature`]: both signing generations behind the [`Signer`] trait
//! - [`orchestrator`]: outbound modern calls ([`request`] builds them)
//! - [`notification`]: modern and legacy IPN validation and confirmation
//! - [`redirect`]: `BackRef` and `Back` browser redirects
//! - [`poller`]: bounded IOS status reconciliation
//! - [`live_update`]: legacy checkout forms
//! - [`instant`]: IRN and IDN notices
//! - [`merchant`]: per-currency credentials
//! - [`projector`]: order-sensitive legacy field projection
//! - [`log`]: structured, redacted log records
//! - [`transport`]: HTTP abstraction, `reqwest` implementation, retry
//! - [`config`], [`context`], [`status`], [`error`]
//!
//! # Security Considerations
//!
//! - **Untrusted until verified**: redirect and IPN data is only trusted
//!   after its signature checks out; comparisons run in constant time.
//! - **Secrets**: merchant keys are zeroized on drop and never printed by
//!   `Debug`.
//! - **HTTPS only**: endpoint bases must be HTTPS and not loopback.
//!
//! # Error Handling
//!
//! All operations return [`Result<T, GatewayError>`](error::Result):
//!
//! ```rust
//! use simplepay::{GatewayError, merchant::MerchantResolver};
//!
//! let resolver = MerchantResolver::new(Vec::new());
//! match resolver.by_currency("USD") {
//!     Err(GatewayError::UnresolvedMerchant(msg)) => eprintln!("configure USD first: {msg}"),
//!     Err(e) => eprintln!("other error: {e}"),
//!     Ok(_) => unreachable!(),
//! }
//! ```

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![allow(
    clippy::multiple_crate_versions,
    reason = "transitive dependencies from reqwest and criterion"
)]

pub mod config;
pub mod context;
pub mod error;
pub mod instant;
pub mod live_update;
pub mod log;
pub mod merchant;
pub mod notification;
pub mod orchestrator;
pub mod poller;
pub mod projector;
pub mod redirect;
pub mod request;
pub mod signature;
pub mod status;
pub mod transport;

pub use config::GatewayConfig;
pub use context::{Deadline, RequestContext};
pub use error::{GatewayError, Result};
pub use log::{LogRecord, Logger};
pub use merchant::{MerchantProfile, MerchantResolver, SecretKey};
pub use signature::{LegacySigner, ModernSigner, Signer};
pub use transport::{HttpTransport, Transport};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _ = std::marker::PhantomData::<GatewayError>;
        let _ = std::marker::PhantomData::<orchestrator::TransactionOrchestrator<HttpTransport, log::TracingLogger>>;
    }
}
