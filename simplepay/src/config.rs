//! Gateway configuration.
//!
//! [`GatewayConfig`] is deserialized from TOML:
//!
//! ```toml
//! sandbox = true
//! back_ref = "https://shop.example.com/backref"
//! timeout_url = "https://shop.example.com/timeout"
//!
//! [[merchants]]
//! currency = "HUF"
//! merchant = "PUBLICTESTHUF"
//! secret_key = "FxDa5w314kLlNseq2sKuVwaqZshZT5d6"
//!
//! [transport]
//! timeout_secs = 60
//!
//! [poller]
//! budget = 10
//! delay_ms = 1000
//! ```
//!
//! Deployments that still keep the flat `HUF_MERCHANT=...` key list can feed
//! it through [`GatewayConfig::from_pairs`], which decodes it once into the
//! same typed structure.

use std::{path::Path, time::Duration};

use serde::Deserialize;
use url::Url;

use crate::{
    error::{GatewayError, Result},
    merchant::{MerchantEntry, MerchantResolver, SecretKey},
    transport::HttpConfig,
};

/// Modern API base on the live system.
pub const LIVE_API_URL: &str = "https://secure.simplepay.hu/payment";
/// Modern API base on the sandbox.
pub const SANDBOX_API_URL: &str = "https://sandbox.simplepay.hu/payment";
/// Legacy endpoint base on the live system.
pub const LEGACY_LIVE_URL: &str = "https://secure.simplepay.hu/payment/";
/// Legacy endpoint base on the sandbox.
pub const LEGACY_SANDBOX_URL: &str = "https://sandbox.simplepay.hu/payment/";

/// Complete configuration of the integration layer.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Talk to the sandbox instead of the live system.
    #[serde(default = "default_sandbox")]
    pub sandbox: bool,

    /// Credential table, one entry per currency.
    #[serde(default)]
    pub merchants: Vec<MerchantEntry>,

    /// Browser return URL for legacy checkouts.
    #[serde(default)]
    pub back_ref: Option<String>,

    /// Browser URL for legacy checkouts that timed out.
    #[serde(default)]
    pub timeout_url: Option<String>,

    /// Scheme prepended to `back_ref`/`timeout_url` when they carry none.
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Payment page language for legacy checkouts.
    #[serde(default = "default_language")]
    pub language: String,

    /// Gateway endpoint bases.
    #[serde(default)]
    pub urls: GatewayUrls,

    /// Settings for the bundled HTTP transport.
    #[serde(default)]
    pub transport: HttpConfig,

    /// Status reconciliation loop settings.
    #[serde(default)]
    pub poller: PollerConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            sandbox: default_sandbox(),
            merchants: Vec::new(),
            back_ref: None,
            timeout_url: None,
            protocol: default_protocol(),
            language: default_language(),
            urls: GatewayUrls::default(),
            transport: HttpConfig::default(),
            poller: PollerConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Parses a TOML document and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ConfigError`] if the document does not parse or
    /// fails [`validate`](Self::validate).
    pub fn from_toml(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| GatewayError::ConfigError(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ConfigError`] if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&source)
    }

    /// Decodes a flat key list into a typed configuration.
    ///
    /// Recognized keys are `{CUR}_MERCHANT`, `{CUR}_SECRET_KEY`, `SANDBOX`,
    /// `BACK_REF`, `TIMEOUT_URL`, `PROTOCOL` and `LANGUAGE`. Other keys are
    /// ignored. Currencies keep the order in which they first appear.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ConfigError`] when a currency has only one half of
    /// its credential pair, or when validation fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use simplepay::config::GatewayConfig;
    ///
    /// let config = GatewayConfig::from_pairs([
    ///     ("EUR_MERCHANT", "M1"),
    ///     ("EUR_SECRET_KEY", "S1"),
    ///     ("SANDBOX", "true"),
    /// ])?;
    /// assert_eq!(config.merchants[0].merchant, "M1");
    /// # Ok::<(), simplepay::error::GatewayError>(())
    /// ```
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Self::default();
        let mut partial: Vec<(String, Option<String>, Option<String>)> = Vec::new();

        for (key, value) in pairs {
            let value = value.trim();
            match key {
                "SANDBOX" => config.sandbox = parse_flag(value),
                "BACK_REF" => config.back_ref = Some(value.to_owned()),
                "TIMEOUT_URL" => config.timeout_url = Some(value.to_owned()),
                "PROTOCOL" => value.clone_into(&mut config.protocol),
                "LANGUAGE" => value.clone_into(&mut config.language),
                _ => {
                    let (currency, is_merchant) = if let Some(cur) = key.strip_suffix("_MERCHANT") {
                        (cur, true)
                    } else if let Some(cur) = key.strip_suffix("_SECRET_KEY") {
                        (cur, false)
                    } else {
                        tracing::debug!(key, "ignoring unknown configuration key");
                        continue;
                    };
                    if currency.len() != 3 {
                        tracing::debug!(key, "ignoring key without a three letter currency prefix");
                        continue;
                    }
                    let currency = currency.to_uppercase();
                    let slot = match partial.iter().position(|(cur, _, _)| *cur == currency) {
                        Some(index) => &mut partial[index],
                        None => {
                            partial.push((currency, None, None));
                            let last = partial.len() - 1;
                            &mut partial[last]
                        }
                    };
                    if is_merchant {
                        slot.1 = Some(value.to_owned());
                    } else {
                        slot.2 = Some(value.to_owned());
                    }
                }
            }
        }

        for (currency, merchant, secret) in partial {
            let (Some(merchant), Some(secret)) = (merchant, secret) else {
                return Err(GatewayError::ConfigError(format!(
                    "{currency}_MERCHANT and {currency}_SECRET_KEY must both be set"
                )));
            };
            config.merchants.push(MerchantEntry {
                currency,
                merchant,
                secret_key: SecretKey::new(secret),
            });
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ConfigError`] for duplicate currencies, endpoint
    /// bases that are not HTTPS or point at a loopback host, or invalid
    /// transport/poller settings.
    pub fn validate(&self) -> Result<()> {
        for (index, entry) in self.merchants.iter().enumerate() {
            if entry.currency.len() != 3 {
                return Err(GatewayError::ConfigError(format!(
                    "currency must be a three letter code, got {:?}",
                    entry.currency
                )));
            }
            if self.merchants[..index]
                .iter()
                .any(|earlier| earlier.currency.eq_ignore_ascii_case(&entry.currency))
            {
                return Err(GatewayError::ConfigError(format!(
                    "currency {} is configured twice",
                    entry.currency
                )));
            }
        }

        self.urls.validate()?;
        self.transport.validate()?;
        self.poller.validate()?;
        Ok(())
    }

    /// Builds the merchant resolver for this configuration.
    #[must_use]
    pub fn resolver(&self) -> MerchantResolver {
        MerchantResolver::new(self.merchants.clone())
    }

    /// Modern API base for the selected environment.
    #[must_use]
    pub fn api_base(&self) -> &str {
        if self.sandbox { &self.urls.sandbox } else { &self.urls.live }
    }

    /// Legacy endpoint base for the selected environment.
    #[must_use]
    pub fn legacy_base(&self) -> &str {
        if self.sandbox { &self.urls.legacy_sandbox } else { &self.urls.legacy_live }
    }

    /// Applies [`protocol`](Self::protocol) to a URL that carries no scheme.
    #[must_use]
    pub fn absolute_url(&self, url: &str) -> String {
        if url.contains("://") { url.to_owned() } else { format!("{}://{url}", self.protocol) }
    }
}

/// Endpoint bases for both protocol generations.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayUrls {
    /// Modern API, live.
    #[serde(default = "default_live")]
    pub live: String,
    /// Modern API, sandbox.
    #[serde(default = "default_sandbox_url")]
    pub sandbox: String,
    /// Legacy endpoints, live.
    #[serde(default = "default_legacy_live")]
    pub legacy_live: String,
    /// Legacy endpoints, sandbox.
    #[serde(default = "default_legacy_sandbox")]
    pub legacy_sandbox: String,
}

impl Default for GatewayUrls {
    fn default() -> Self {
        Self {
            live: default_live(),
            sandbox: default_sandbox_url(),
            legacy_live: default_legacy_live(),
            legacy_sandbox: default_legacy_sandbox(),
        }
    }
}

impl GatewayUrls {
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("live", &self.live),
            ("sandbox", &self.sandbox),
            ("legacy_live", &self.legacy_live),
            ("legacy_sandbox", &self.legacy_sandbox),
        ] {
            validate_base_url(name, value)?;
        }
        Ok(())
    }
}

fn validate_base_url(name: &str, value: &str) -> Result<()> {
    let url = Url::parse(value)
        .map_err(|e| GatewayError::ConfigError(format!("invalid {name} url '{value}': {e}")))?;

    if url.scheme() != "https" {
        return Err(GatewayError::ConfigError(format!(
            "{name} url must use HTTPS, got: {}",
            url.scheme()
        )));
    }

    if let Some(host) = url.host_str() {
        let host = host.to_lowercase();
        if host == "localhost" || host.starts_with("127.") || host == "[::1]" || host == "::1" {
            return Err(GatewayError::ConfigError(format!(
                "{name} url must not be localhost or loopback: {host}"
            )));
        }
    }

    Ok(())
}

/// Settings of the status reconciliation loop.
#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    /// Attempt budget in units.
    #[serde(default = "default_budget")]
    pub budget: u32,

    /// Wait between polls that did not reach a final status.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self { budget: default_budget(), delay_ms: default_delay_ms() }
    }
}

impl PollerConfig {
    /// Checks that the budget allows at least one poll and the delay is sane.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ConfigError`] for a zero budget or a delay above one minute.
    pub fn validate(&self) -> Result<()> {
        if self.budget == 0 {
            return Err(GatewayError::ConfigError("poller budget must be positive".to_owned()));
        }
        if self.delay_ms > 60_000 {
            return Err(GatewayError::ConfigError(
                "poller delay_ms must not exceed 60000".to_owned(),
            ));
        }
        Ok(())
    }

    /// Delay as a [`Duration`].
    #[must_use]
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn default_sandbox() -> bool {
    true
}

fn default_protocol() -> String {
    "https".to_owned()
}

fn default_language() -> String {
    "HU".to_owned()
}

fn default_live() -> String {
    LIVE_API_URL.to_owned()
}

fn default_sandbox_url() -> String {
    SANDBOX_API_URL.to_owned()
}

fn default_legacy_live() -> String {
    LEGACY_LIVE_URL.to_owned()
}

fn default_legacy_sandbox() -> String {
    LEGACY_SANDBOX_URL.to_owned()
}

fn default_budget() -> u32 {
    10
}

fn default_delay_ms() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert!(config.sandbox);
        assert_eq!(config.api_base(), SANDBOX_API_URL);
        assert_eq!(config.legacy_base(), LEGACY_SANDBOX_URL);
        assert_eq!(config.poller.budget, 10);
        assert_eq!(config.poller.delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_from_toml() {
        let config = GatewayConfig::from_toml(
            r#"
            sandbox = false

            [[merchants]]
            currency = "HUF"
            merchant = "PUBLICTESTHUF"
            secret_key = "secret"

            [poller]
            budget = 4
            delay_ms = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.api_base(), LIVE_API_URL);
        assert_eq!(config.merchants.len(), 1);
        assert_eq!(config.poller.budget, 4);
        assert_eq!(config.transport.timeout_secs, 30);
    }

    #[test]
    fn test_from_pairs_keeps_currency_order() {
        let config = GatewayConfig::from_pairs([
            ("HUF_MERCHANT", "H"),
            ("EUR_SECRET_KEY", "S1"),
            ("HUF_SECRET_KEY", "HS"),
            ("EUR_MERCHANT", "M1"),
            ("LOG_PATH", "log"),
            ("SANDBOX", "0"),
        ])
        .unwrap();
        assert!(!config.sandbox);
        let currencies: Vec<_> = config.merchants.iter().map(|m| m.currency.as_str()).collect();
        assert_eq!(currencies, ["HUF", "EUR"]);
        assert_eq!(config.resolver().by_currency("EUR").unwrap().merchant_id(), "M1");
    }

    #[test]
    fn test_from_pairs_half_pair_rejected() {
        let result = GatewayConfig::from_pairs([("USD_MERCHANT", "U")]);
        assert!(matches!(result, Err(GatewayError::ConfigError(_))));
    }

    #[test]
    fn test_duplicate_currency_rejected() {
        let mut config = GatewayConfig::default();
        config.merchants.push(MerchantEntry::new("HUF", "A", "a"));
        config.merchants.push(MerchantEntry::new("huf", "B", "b"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_plain_http_base_rejected() {
        let mut config = GatewayConfig::default();
        config.urls.sandbox = "http://sandbox.simplepay.hu/payment".to_owned();
        assert!(config.validate().is_err());

        config.urls.sandbox = "https://127.0.0.1/payment".to_owned();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_absolute_url() {
        let config = GatewayConfig::default();
        assert_eq!(config.absolute_url("shop.example.com/back"), "https://shop.example.com/back");
        assert_eq!(config.absolute_url("http://shop/back"), "http://shop/back");
    }

    #[test]
    fn test_zero_budget_rejected() {
        let poller = PollerConfig { budget: 0, delay_ms: 0 };
        assert!(poller.validate().is_err());
    }
}
