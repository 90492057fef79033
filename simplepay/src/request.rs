//! Modern transaction requests.
//!
//! A [`TransactionRequest`] is an ordered JSON object built incrementally by
//! the caller. Every interface starts from a skeleton listing the fields the
//! gateway expects, so the key order of the signed body is stable.
//! Once handed to the orchestrator the request is frozen into a
//! [`FrozenRequest`] whose JSON text never changes again.
//!
//! # Examples
//!
//! ```
//! use rust_decimal::Decimal;
//! use simplepay::request::{Item, TransactionRequest};
//!
//! let request = TransactionRequest::start()
//!     .with_currency("EUR")
//!     .add_data("orderRef", "101010514")
//!     .add_data("customerEmail", "sdk_test@example.com")
//!     .add_group_data("invoice", "name", "SimplePay V2 Tester")
//!     .add_items(Item::new("Product ID 1").with_title("Product name 1").with_price(Decimal::new(25, 0)));
//!
//! assert_eq!(request.field("orderRef").and_then(|v| v.as_str()), Some("101010514"));
//! assert_eq!(request.field("items").and_then(|v| v.as_array()).map(Vec::len), Some(1));
//! ```

use std::fmt;

use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::{
    error::{GatewayError, Result},
    merchant::MerchantProfile,
};

/// Crate identifier sent as `sdkVersion`.
pub const SDK_VERSION: &str = concat!("simplepay-rs_", env!("CARGO_PKG_VERSION"));

/// Key used by [`TransactionRequest::add_data`] for an empty key.
const EMPTY_DATA_KEY: &str = "EMPTY_DATA_KEY";

/// Outbound operation of the modern protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interface {
    /// Opens a payment and returns the payment page URL.
    Start,
    /// Captures a previously authorized two-step payment.
    Finish,
    /// Refunds a completed payment.
    Refund,
    /// Reads the state of one or more transactions.
    Query,
}

impl Interface {
    /// Path segment below `{base}/v2/`.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Finish => "finish",
            Self::Refund => "refund",
            Self::Query => "query",
        }
    }

    /// Initial body of a request of this kind.
    #[must_use]
    pub fn skeleton(&self) -> Map<String, Value> {
        let value = match self {
            Self::Start => json!({
                "salt": "",
                "merchant": "",
                "orderRef": "",
                "currency": "",
                "customerEmail": "",
                "language": "",
                "sdkVersion": "",
                "methods": [],
            }),
            Self::Finish => json!({
                "salt": "",
                "merchant": "",
                "orderRef": "",
                "transactionId": "",
                "originalTotal": "",
                "approveTotal": "",
                "currency": "",
            }),
            Self::Refund => json!({
                "salt": "",
                "merchant": "",
                "orderRef": "",
                "transactionId": "",
                "currency": "",
            }),
            Self::Query => json!({
                "salt": "",
                "merchant": "",
                "currency": "",
            }),
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line item of a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Item {
    /// Merchant's item reference.
    #[serde(rename = "ref")]
    pub reference: String,
    /// Display title.
    pub title: String,
    /// Display description.
    pub description: String,
    /// Quantity.
    pub amount: u32,
    /// Unit price.
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    /// Tax per unit.
    #[serde(with = "rust_decimal::serde::float")]
    pub tax: Decimal,
}

impl Item {
    /// Creates an item with zero quantity, price and tax.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            title: String::new(),
            description: String::new(),
            amount: 0,
            price: Decimal::ZERO,
            tax: Decimal::ZERO,
        }
    }

    /// Sets the title.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Sets the description.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the quantity.
    #[must_use]
    pub const fn with_amount(mut self, amount: u32) -> Self {
        self.amount = amount;
        self
    }

    /// Sets the unit price.
    #[must_use]
    pub const fn with_price(mut self, price: Decimal) -> Self {
        self.price = price;
        self
    }

    /// Sets the tax.
    #[must_use]
    pub const fn with_tax(mut self, tax: Decimal) -> Self {
        self.tax = tax;
        self
    }
}

/// Mutable request body of one modern operation.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRequest {
    interface: Interface,
    body: Map<String, Value>,
    merchant_account: Option<String>,
    log_transaction_id: Option<String>,
    log_order_ref: Option<String>,
}

impl TransactionRequest {
    /// Creates a request of the given kind from its skeleton.
    #[must_use]
    pub fn new(interface: Interface) -> Self {
        Self {
            interface,
            body: interface.skeleton(),
            merchant_account: None,
            log_transaction_id: None,
            log_order_ref: None,
        }
    }

    /// New `start` request.
    #[must_use]
    pub fn start() -> Self {
        Self::new(Interface::Start)
    }

    /// New `finish` request.
    #[must_use]
    pub fn finish() -> Self {
        Self::new(Interface::Finish)
    }

    /// New `refund` request.
    #[must_use]
    pub fn refund() -> Self {
        Self::new(Interface::Refund)
    }

    /// New `query` request.
    #[must_use]
    pub fn query() -> Self {
        Self::new(Interface::Query)
    }

    /// Operation of this request.
    #[must_use]
    pub const fn interface(&self) -> Interface {
        self.interface
    }

    /// Sets the `currency` field, which also selects the merchant.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn with_currency(self, currency: impl Into<String>) -> Self {
        self.add_data("currency", currency.into())
    }

    /// Selects the merchant by account token when no currency is set.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn with_merchant_account(mut self, account: impl Into<String>) -> Self {
        self.merchant_account = Some(account.into());
        self
    }

    /// Sets a top-level field. An empty key is stored as `EMPTY_DATA_KEY`.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<Value> is idiomatic for builder methods"
    )]
    pub fn add_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        let key = if key.is_empty() { EMPTY_DATA_KEY } else { key };
        self.body.insert(key.to_owned(), value.into());
        self
    }

    /// Sets `key` inside the object field `group`, creating the group.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<Value> is idiomatic for builder methods"
    )]
    pub fn add_group_data(mut self, group: &str, key: &str, value: impl Into<Value>) -> Self {
        let slot = self.body.entry(group.to_owned()).or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        if let Value::Object(map) = slot {
            map.insert(key.to_owned(), value.into());
        }
        self
    }

    /// Appends a line item to `items`.
    #[must_use]
    pub fn add_items(self, item: Item) -> Self {
        let value = serde_json::to_value(&item).unwrap_or(Value::Null);
        self.push_to_array("items", value)
    }

    /// Adds a gateway transaction id to a query. The first one correlates logs.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn add_simplepay_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if self.log_transaction_id.is_none() {
            self.log_transaction_id = Some(id.clone());
        }
        self.push_to_array("transactionIds", Value::String(id))
    }

    /// Adds a merchant order reference to a query. The first one correlates logs.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn add_merchant_order_id(mut self, order_ref: impl Into<String>) -> Self {
        let order_ref = order_ref.into();
        if self.log_order_ref.is_none() {
            self.log_order_ref = Some(order_ref.clone());
        }
        self.push_to_array("orderRefs", Value::String(order_ref))
    }

    fn push_to_array(mut self, key: &str, value: Value) -> Self {
        let slot = self.body.entry(key.to_owned()).or_insert_with(|| Value::Array(Vec::new()));
        match slot {
            Value::Array(items) => items.push(value),
            other => *other = Value::Array(vec![value]),
        }
        self
    }

    /// Current value of a top-level field.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// Currency the request selects its merchant by, if set.
    #[must_use]
    pub fn currency(&self) -> Option<&str> {
        self.body.get("currency").and_then(Value::as_str).filter(|c| !c.is_empty())
    }

    /// Merchant account token, if set.
    #[must_use]
    pub fn merchant_account(&self) -> Option<&str> {
        self.merchant_account.as_deref().filter(|a| !a.is_empty())
    }

    /// Fills in merchant, salt and SDK version and serializes the body.
    ///
    /// A missing or empty `currency` takes the merchant's currency. A refund
    /// drops empty `orderRef` and `transactionId` fields first.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidInput`] if the body cannot be serialized.
    pub fn freeze(mut self, merchant: &MerchantProfile, salt: &str) -> Result<FrozenRequest> {
        if self.interface == Interface::Refund {
            for key in ["orderRef", "transactionId"] {
                if self.body.get(key).and_then(Value::as_str) == Some("") {
                    self.body.shift_remove(key);
                }
            }
        }

        if self.currency().is_none() {
            self.body.insert("currency".to_owned(), Value::String(merchant.currency().to_owned()));
        }
        self.body.insert("merchant".to_owned(), Value::String(merchant.merchant_id().to_owned()));
        self.body.insert("salt".to_owned(), Value::String(salt.to_owned()));
        self.body.insert("sdkVersion".to_owned(), Value::String(SDK_VERSION.to_owned()));

        let order_ref = self.log_order_ref.or_else(|| string_field(&self.body, "orderRef"));
        let transaction_id =
            self.log_transaction_id.or_else(|| string_field(&self.body, "transactionId"));

        let body = Value::Object(self.body);
        let json = serde_json::to_string(&body)
            .map_err(|e| GatewayError::InvalidInput(format!("request not serializable: {e}")))?;

        Ok(FrozenRequest {
            interface: self.interface,
            body,
            json,
            order_ref: order_ref.unwrap_or_default(),
            transaction_id: transaction_id.unwrap_or_default(),
        })
    }
}

fn string_field(body: &Map<String, Value>, key: &str) -> Option<String> {
    body.get(key).and_then(Value::as_str).filter(|s| !s.is_empty()).map(str::to_owned)
}

/// Request body after merchant, salt and version were filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct FrozenRequest {
    interface: Interface,
    body: Value,
    json: String,
    order_ref: String,
    transaction_id: String,
}

impl FrozenRequest {
    /// Operation of this request.
    #[must_use]
    pub const fn interface(&self) -> Interface {
        self.interface
    }

    /// Body as a JSON value.
    #[must_use]
    pub const fn body(&self) -> &Value {
        &self.body
    }

    /// Exact JSON text that is signed and sent.
    #[must_use]
    pub fn json(&self) -> &str {
        &self.json
    }

    /// Order reference used to correlate logs.
    #[must_use]
    pub fn order_ref(&self) -> &str {
        &self.order_ref
    }

    /// Transaction id used to correlate logs.
    #[must_use]
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }
}

/// Random salt: the MD5 hex digest of a fresh v4 UUID.
#[must_use]
pub fn new_salt() -> String {
    use md5::{Digest, Md5};

    hex::encode(Md5::digest(uuid::Uuid::new_v4().as_bytes()))
}
