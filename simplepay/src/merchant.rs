//! Merchant credential table and resolution.
//!
//! The gateway issues one merchant account (id plus secret) per settlement
//! currency. Outbound calls usually know their currency up front; inbound
//! modern notifications only carry the merchant account, so the table also
//! supports a reverse lookup.
//!
//! # Examples
//!
//! ```
//! use simplepay::merchant::{MerchantEntry, MerchantResolver};
//!
//! let resolver = MerchantResolver::new(vec![
//!     MerchantEntry::new("HUF", "PUBLICTESTHUF", "FxDa5w314kLlNseq2sKuVwaqZshZT5d6"),
//!     MerchantEntry::new("EUR", "PUBLICTESTEUR", "JCzbAbR3bd9e8qmVqNkXx2jW4TfkMGtP"),
//! ]);
//!
//! let profile = resolver.by_currency("eur")?;
//! assert_eq!(profile.merchant_id(), "PUBLICTESTEUR");
//!
//! let profile = resolver.by_account("PUBLICTESTHUF")?;
//! assert_eq!(profile.currency(), "HUF");
//! # Ok::<(), simplepay::error::GatewayError>(())
//! ```

use std::fmt;

use serde::Deserialize;
use zeroize::Zeroizing;

use crate::error::{GatewayError, Result};

/// Merchant secret key.
///
/// The buffer is wiped on drop and never printed by `Debug`. Surrounding
/// whitespace is ignored when the key is used for signing.
#[derive(Clone, Deserialize)]
#[serde(from = "String")]
pub struct SecretKey(Zeroizing<String>);

impl SecretKey {
    /// Wraps a raw secret.
    #[must_use]
    pub fn new(raw: String) -> Self {
        Self(Zeroizing::new(raw))
    }

    /// Key material as used for MAC computation (trimmed).
    #[must_use]
    pub fn expose(&self) -> &str {
        self.0.trim()
    }

    /// Returns `true` when nothing but whitespace is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.expose().is_empty()
    }
}

impl From<String> for SecretKey {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl From<&str> for SecretKey {
    fn from(raw: &str) -> Self {
        Self::new(raw.to_owned())
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(***)")
    }
}

/// One row of the credential table, as configured.
#[derive(Debug, Clone, Deserialize)]
pub struct MerchantEntry {
    /// ISO 4217 currency code, e.g. `HUF`.
    pub currency: String,
    /// Merchant account id issued by the gateway.
    pub merchant: String,
    /// Shared secret for that account.
    pub secret_key: SecretKey,
}

impl MerchantEntry {
    /// Creates an entry. The currency is upper-cased.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn new(
        currency: impl Into<String>,
        merchant: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            currency: currency.into().to_uppercase(),
            merchant: merchant.into(),
            secret_key: SecretKey::new(secret_key.into()),
        }
    }
}

/// Credentials resolved for a single operation.
#[derive(Debug, Clone)]
pub struct MerchantProfile {
    merchant_id: String,
    secret_key: SecretKey,
    currency: String,
}

impl MerchantProfile {
    /// Merchant account id.
    #[must_use]
    pub fn merchant_id(&self) -> &str {
        &self.merchant_id
    }

    /// Secret used for every MAC of this operation.
    #[must_use]
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    /// Currency the profile was selected for.
    #[must_use]
    pub fn currency(&self) -> &str {
        &self.currency
    }
}

impl From<&MerchantEntry> for MerchantProfile {
    fn from(entry: &MerchantEntry) -> Self {
        Self {
            merchant_id: entry.merchant.clone(),
            secret_key: entry.secret_key.clone(),
            currency: entry.currency.clone(),
        }
    }
}

/// Selects merchant credentials from the configured table.
#[derive(Debug, Clone, Default)]
pub struct MerchantResolver {
    entries: Vec<MerchantEntry>,
}

impl MerchantResolver {
    /// Creates a resolver over the given table. Table order is kept.
    #[must_use]
    pub fn new(entries: Vec<MerchantEntry>) -> Self {
        Self { entries }
    }

    /// Looks up `{CUR}_MERCHANT` / `{CUR}_SECRET_KEY`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnresolvedMerchant`] when the currency has no
    /// entry, or the entry has an empty id or secret.
    pub fn by_currency(&self, currency: &str) -> Result<MerchantProfile> {
        let wanted = currency.trim().to_uppercase();
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.currency == wanted)
            .ok_or_else(|| {
                GatewayError::UnresolvedMerchant(format!("no merchant configured for {wanted:?}"))
            })?;
        usable(entry)
    }

    /// Reverse lookup by merchant account token.
    ///
    /// The currency comes from the matching entry.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnresolvedMerchant`] when no entry matches, or
    /// when the same account is configured for more than one currency.
    pub fn by_account(&self, account: &str) -> Result<MerchantProfile> {
        let mut matches = self.entries.iter().filter(|entry| entry.merchant == account);
        let Some(entry) = matches.next() else {
            return Err(GatewayError::UnresolvedMerchant(format!(
                "no merchant configured for account {account:?}"
            )));
        };
        if let Some(other) = matches.next() {
            tracing::warn!(
                account,
                first = %entry.currency,
                second = %other.currency,
                "merchant account is configured for several currencies"
            );
            return Err(GatewayError::UnresolvedMerchant(format!(
                "account {account:?} is ambiguous ({} and {})",
                entry.currency, other.currency
            )));
        }
        usable(entry)
    }

    /// Resolves by currency when one is given, by account token otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnresolvedMerchant`] when neither key is given
    /// or the given key does not resolve.
    pub fn resolve(&self, currency: Option<&str>, account: Option<&str>) -> Result<MerchantProfile> {
        match (currency.filter(|c| !c.is_empty()), account.filter(|a| !a.is_empty())) {
            (Some(currency), _) => self.by_currency(currency),
            (None, Some(account)) => self.by_account(account),
            (None, None) => Err(GatewayError::UnresolvedMerchant(
                "neither currency nor merchant account given".to_owned(),
            )),
        }
    }

    /// Configured entries, in table order.
    #[must_use]
    pub fn entries(&self) -> &[MerchantEntry] {
        &self.entries
    }
}

fn usable(entry: &MerchantEntry) -> Result<MerchantProfile> {
    if entry.merchant.trim().is_empty() || entry.secret_key.is_empty() {
        return Err(GatewayError::UnresolvedMerchant(format!(
            "incomplete credentials for {}",
            entry.currency
        )));
    }
    Ok(MerchantProfile::from(entry))
}
