//! HMAC-SHA384 signatures over JSON documents.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha384;
use tracing::instrument;

use super::{Algorithm, SignatureCheck, Signer, require_input};
use crate::{
    error::{GatewayError, Result},
    merchant::SecretKey,
};

type HmacSha384 = Hmac<Sha384>;

/// Signer for the modern JSON protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModernSigner;

impl ModernSigner {
    fn mac(key: &SecretKey, message: &[u8]) -> Result<HmacSha384> {
        require_input(key, message)?;
        let mut mac = HmacSha384::new_from_slice(key.expose().as_bytes())
            .map_err(|e| GatewayError::MissingSignatureInput(format!("unusable key: {e}")))?;
        mac.update(message);
        Ok(mac)
    }
}

impl Signer for ModernSigner {
    fn algorithm(&self) -> Algorithm {
        Algorithm::HmacSha384Json
    }

    #[instrument(skip_all, fields(len = message.len()))]
    fn sign(&self, key: &SecretKey, message: &[u8]) -> Result<String> {
        let mac = Self::mac(key, message)?;
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    fn verify(&self, key: &SecretKey, message: &[u8], received: &str) -> Result<SignatureCheck> {
        let mac = Self::mac(key, message)?;
        let expected_mac = mac.clone();
        let expected = STANDARD.encode(expected_mac.finalize().into_bytes());

        let valid = match STANDARD.decode(received.trim()) {
            Ok(bytes) => mac.verify_slice(&bytes).is_ok(),
            Err(_) => false,
        };
        if !valid {
            tracing::debug!(received, "modern signature did not verify");
        }

        Ok(SignatureCheck { valid, expected, received: received.to_owned() })
    }
}

/// Serializes a payload into the JSON text that gets signed.
///
/// `null` becomes `{}`. Objects and arrays are serialized as they are, keeping
/// insertion order. A string is treated as JSON text and goes through
/// [`canonical_json_str`].
///
/// # Errors
///
/// Returns [`GatewayError::InvalidInput`] for a string that is not JSON.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use simplepay::signature::canonical_json;
///
/// assert_eq!(canonical_json(&json!(null))?, "{}");
/// assert_eq!(canonical_json(&json!({"b": 1, "a": 2}))?, r#"{"b":1,"a":2}"#);
/// assert!(canonical_json(&json!("not json")).is_err());
/// # Ok::<(), simplepay::error::GatewayError>(())
/// ```
pub fn canonical_json(payload: &Value) -> Result<String> {
    match payload {
        Value::Null => Ok("{}".to_owned()),
        Value::String(text) => canonical_json_str(text),
        other => serde_json::to_string(other)
            .map_err(|e| GatewayError::InvalidInput(format!("payload not serializable: {e}"))),
    }
}

/// Accepts JSON text for signing.
///
/// Blank input becomes `{}`. Valid JSON passes through unchanged, byte for
/// byte, because the peer signed exactly those bytes.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidInput`] when the text is not JSON.
pub fn canonical_json_str(text: &str) -> Result<String> {
    if text.trim().is_empty() {
        return Ok("{}".to_owned());
    }
    serde_json::from_str::<serde::de::IgnoredAny>(text)
        .map_err(|e| GatewayError::InvalidInput(format!("payload is not JSON: {e}")))?;
    Ok(text.to_owned())
}
