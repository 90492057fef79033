//! Legacy checkout start (LiveUpdate).
//!
//! The browser is sent to `order/lu.php` with a signed form. This module
//! builds that form: it validates field names against a fixed schema, fills
//! defaults, cleans values, signs the hash field list with the legacy chain
//! and reports every missing required field at once. Rendering the form as
//! HTML is left to the caller.
//!
//! # Examples
//!
//! ```
//! use simplepay::{
//!     config::GatewayConfig,
//!     live_update::LiveUpdate,
//!     log::MemoryLogger,
//!     projector::Product,
//! };
//!
//! let config = GatewayConfig::from_pairs([("HUF_MERCHANT", "PUBLICTESTHUF"), ("HUF_SECRET_KEY", "S1")])?;
//! let mut order = LiveUpdate::new(&config, "HUF", MemoryLogger::new())?;
//! order.set_field("ORDER_REF", "101")?;
//! order.add_product(Product::new().with("name", "Lamp").with("price", "1200").with("qty", "1"));
//!
//! // Billing and delivery details are still missing.
//! assert!(order.missing_fields().contains(&"BILL_EMAIL".to_owned()));
//! # Ok::<(), simplepay::error::GatewayError>(())
//! ```

use chrono::{DateTime, Utc};

use crate::{
    config::GatewayConfig,
    error::{GatewayError, Result},
    log::{LogRecord, Logger},
    merchant::MerchantProfile,
    projector::{FieldKind, FieldProjector, FieldSpec, FormData, FormValue, LegacyFields, Product, encode_pairs},
    request::SDK_VERSION,
    signature::LegacySigner,
};

/// Path of the checkout endpoint below the legacy base.
pub const LIVE_UPDATE_PATH: &str = "order/lu.php";

/// Characters removed from every value before it is stored.
pub const DENIED_CHARS: [char; 3] = ['\'', '\\', '"'];

/// Field schema of a checkout form.
pub const LIVE_UPDATE_SCHEMA: &[FieldSpec] = &[
    FieldSpec::single("MERCHANT").required(),
    FieldSpec::single("ORDER_REF").required(),
    FieldSpec::single("ORDER_DATE").required(),
    FieldSpec::product("ORDER_PNAME", "name"),
    FieldSpec::product("ORDER_PCODE", "code"),
    FieldSpec::product("ORDER_PINFO", "info"),
    FieldSpec::product("ORDER_PRICE", "price").required(),
    FieldSpec::product("ORDER_QTY", "qty").required(),
    FieldSpec::product("ORDER_VAT", "vat").required().with_default("0"),
    FieldSpec::single("PRICES_CURRENCY").required().with_default("HUF"),
    FieldSpec::single("ORDER_SHIPPING").with_default("0"),
    FieldSpec::single("DISCOUNT").with_default("0"),
    FieldSpec::single("PAY_METHOD").required().with_default("CCVISAMC"),
    FieldSpec::single("LANGUAGE").with_default("HU"),
    FieldSpec::single("ORDER_TIMEOUT").with_default("300"),
    FieldSpec::single("TIMEOUT_URL").required(),
    FieldSpec::single("BACK_REF").required(),
    FieldSpec::single("LU_ENABLE_TOKEN"),
    FieldSpec::single("LU_TOKEN_TYPE"),
    // billing
    FieldSpec::single("BILL_FNAME").required(),
    FieldSpec::single("BILL_LNAME").required(),
    FieldSpec::single("BILL_COMPANY"),
    FieldSpec::single("BILL_FISCALCODE"),
    FieldSpec::single("BILL_EMAIL").required(),
    FieldSpec::single("BILL_PHONE").required(),
    FieldSpec::single("BILL_FAX"),
    FieldSpec::single("BILL_ADDRESS").required(),
    FieldSpec::single("BILL_ADDRESS2"),
    FieldSpec::single("BILL_ZIPCODE").required(),
    FieldSpec::single("BILL_CITY").required(),
    FieldSpec::single("BILL_STATE").required(),
    FieldSpec::single("BILL_COUNTRYCODE").required(),
    // delivery
    FieldSpec::single("DELIVERY_FNAME").required(),
    FieldSpec::single("DELIVERY_LNAME").required(),
    FieldSpec::single("DELIVERY_COMPANY"),
    FieldSpec::single("DELIVERY_EMAIL"),
    FieldSpec::single("DELIVERY_PHONE").required(),
    FieldSpec::single("DELIVERY_ADDRESS").required(),
    FieldSpec::single("DELIVERY_ADDRESS2"),
    FieldSpec::single("DELIVERY_ZIPCODE").required(),
    FieldSpec::single("DELIVERY_CITY").required(),
    FieldSpec::single("DELIVERY_STATE").required(),
    FieldSpec::single("DELIVERY_COUNTRYCODE").required(),
];

/// Fields entering `ORDER_HASH`, in chain order.
pub const LIVE_UPDATE_HASH_FIELDS: &[&str] = &[
    "MERCHANT",
    "ORDER_REF",
    "ORDER_DATE",
    "ORDER_PNAME",
    "ORDER_PCODE",
    "ORDER_PINFO",
    "ORDER_PRICE",
    "ORDER_QTY",
    "ORDER_VAT",
    "ORDER_SHIPPING",
    "PRICES_CURRENCY",
    "DISCOUNT",
    "PAY_METHOD",
];

/// Removes quotes and backslashes from a value.
#[must_use]
pub fn clean_value(value: &str) -> String {
    value.chars().filter(|c| !DENIED_CHARS.contains(c)).collect()
}

/// A signed checkout form, ready to post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveUpdateForm {
    /// Form action.
    pub action: String,
    /// Ordered fields, `ORDER_HASH` and `SDK_VERSION` last.
    pub fields: FormData,
    /// The signature that was added as `ORDER_HASH`.
    pub order_hash: String,
}

impl LiveUpdateForm {
    /// Fields as wire pairs, product lists as repeated `NAME[]` entries.
    #[must_use]
    pub fn pairs(&self) -> Vec<(String, String)> {
        encode_pairs(&self.fields)
    }
}

/// Builder of one checkout form.
#[derive(Debug)]
pub struct LiveUpdate<L> {
    profile: MerchantProfile,
    fields: LegacyFields,
    action: String,
    protocol: String,
    logger: L,
}

impl<L: Logger> LiveUpdate<L> {
    const PROJECTOR: FieldProjector = FieldProjector::new(LIVE_UPDATE_SCHEMA);

    /// Starts a form for `currency` with schema defaults, the merchant of
    /// that currency and the configured return URLs and language.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnresolvedMerchant`] for an unknown currency.
    pub fn new(config: &GatewayConfig, currency: &str, logger: L) -> Result<Self> {
        let profile = config.resolver().by_currency(currency)?;
        let mut fields = LegacyFields::with_defaults(LIVE_UPDATE_SCHEMA);
        fields.set("MERCHANT", profile.merchant_id());
        fields.set("PRICES_CURRENCY", clean_value(profile.currency()));
        fields.set("LANGUAGE", clean_value(&config.language));
        if let Some(back_ref) = &config.back_ref {
            fields.set("BACK_REF", clean_value(back_ref));
        }
        if let Some(timeout_url) = &config.timeout_url {
            fields.set("TIMEOUT_URL", clean_value(timeout_url));
        }

        let mut update = Self {
            profile,
            fields,
            action: format!("{}{LIVE_UPDATE_PATH}", config.legacy_base()),
            protocol: config.protocol.clone(),
            logger,
        };
        update.set_order_date(Utc::now());
        Ok(update)
    }

    /// Sets `ORDER_DATE` from a timestamp.
    pub fn set_order_date(&mut self, at: DateTime<Utc>) {
        self.fields.set("ORDER_DATE", at.format("%Y-%m-%d %H:%M:%S").to_string());
    }

    /// Sets a single field after cleaning its value.
    ///
    /// Enabling `LU_ENABLE_TOKEN` also sets `LU_TOKEN_TYPE` to `PAY_BY_CLICK`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidInput`] for a name outside the schema or
    /// a product field name.
    pub fn set_field(&mut self, name: &str, value: &str) -> Result<()> {
        match LIVE_UPDATE_SCHEMA.iter().find(|spec| spec.name == name) {
            Some(FieldSpec { kind: FieldKind::Single, .. }) => {}
            Some(_) => {
                return Err(GatewayError::InvalidInput(format!("{name} is set through add_product")));
            }
            None => return Err(GatewayError::InvalidInput(format!("unknown LiveUpdate field: {name}"))),
        }

        self.fields.set(name, clean_value(value));
        if name == "LU_ENABLE_TOKEN" && is_truthy(value) {
            self.fields.set("LU_TOKEN_TYPE", "PAY_BY_CLICK");
        }
        Ok(())
    }

    /// Current value of a field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name)
    }

    /// Appends a product line with cleaned values; a missing `vat` defaults to `0`.
    pub fn add_product(&mut self, product: Product) {
        let mut cleaned = Product::new();
        for spec in LIVE_UPDATE_SCHEMA {
            if let FieldKind::Product(attribute) = spec.kind {
                match (product.get(attribute), spec.default) {
                    (Some(value), _) => cleaned = cleaned.with(attribute, clean_value(value)),
                    (None, Some(default)) => cleaned = cleaned.with(attribute, default),
                    (None, None) => {}
                }
            }
        }
        self.fields.push_product(cleaned);
    }

    /// Every required field still missing, in schema order.
    #[must_use]
    pub fn missing_fields(&self) -> Vec<String> {
        Self::PROJECTOR.missing_required(&self.fields)
    }

    /// Signs and returns the form.
    ///
    /// `BACK_REF` and `TIMEOUT_URL` get `order_ref` and `order_currency`
    /// query parameters and the configured scheme. Neither is signed.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::MissingRequiredFields`] listing every missing field.
    /// - [`GatewayError::MissingSignatureInput`] when the merchant secret is empty.
    pub fn prepare(&self) -> Result<LiveUpdateForm> {
        let missing = self.missing_fields();
        if !missing.is_empty() {
            tracing::warn!(?missing, "LiveUpdate form incomplete");
            return Err(GatewayError::MissingRequiredFields(missing));
        }

        let values = Self::PROJECTOR.project(LIVE_UPDATE_HASH_FIELDS, &self.fields)?;
        let order_hash = LegacySigner.sign_chain(self.profile.secret_key(), &values)?;

        let order_ref = self.fields.get("ORDER_REF").unwrap_or_default();
        let currency = self.fields.get("PRICES_CURRENCY").unwrap_or_default();

        let mut fields = Self::PROJECTOR.form_data(&self.fields);
        for (name, value) in &mut fields {
            if let ("BACK_REF" | "TIMEOUT_URL", FormValue::Single(url)) = (name.as_str(), value) {
                let separator = if url.contains('?') { '&' } else { '?' };
                let expanded = format!("{url}{separator}order_ref={order_ref}&order_currency={currency}");
                *url = if expanded.contains("://") { expanded } else { format!("{}://{expanded}", self.protocol) };
            }
        }
        fields.push(("ORDER_HASH".to_owned(), FormValue::Single(order_hash.clone())));
        fields.push(("SDK_VERSION".to_owned(), FormValue::Single(SDK_VERSION.to_owned())));

        let record = encode_pairs(&fields)
            .into_iter()
            .fold(LogRecord::new("LiveUpdate").with_order_ref(order_ref), |record, (name, value)| {
                record.with_entry(name, value)
            });
        self.logger.log(&record);

        Ok(LiveUpdateForm { action: self.action.clone(), fields, order_hash })
    }
}

fn is_truthy(value: &str) -> bool {
    !matches!(value.trim(), "" | "0" | "false")
}
