//! HMAC-MD5 hash chains of the legacy protocol.
//!
//! A legacy message is an ordered list of scalar values. Each value is
//! written as its UTF-8 byte length in decimal followed by the value itself,
//! and the pairs are concatenated:
//!
//! ```text
//! ["PUBLICTESTHUF", "101"]  ->  "13PUBLICTESTHUF3101"
//! ```
//!
//! The chain is therefore order sensitive: swapping two fields changes the MAC.

use hmac::{Hmac, Mac};
use md5::Md5;
use serde_json::Value;

use super::{Algorithm, SignatureCheck, Signer, require_input};
use crate::{
    error::{GatewayError, Result},
    merchant::SecretKey,
};

type HmacMd5 = Hmac<Md5>;

/// Signer for the legacy positional protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacySigner;

impl LegacySigner {
    fn mac(key: &SecretKey, message: &[u8]) -> Result<HmacMd5> {
        require_input(key, message)?;
        let mut mac = HmacMd5::new_from_slice(key.expose().as_bytes())
            .map_err(|e| GatewayError::MissingSignatureInput(format!("unusable key: {e}")))?;
        mac.update(message);
        Ok(mac)
    }

    /// Builds the chain of `values` and signs it.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::MissingSignatureInput`] for an empty key or an
    /// empty value list.
    ///
    /// # Examples
    ///
    /// ```
    /// use simplepay::{merchant::SecretKey, signature::LegacySigner};
    ///
    /// let key = SecretKey::from("FxDa5w314kLlNseq2sKuVwaqZshZT5d6");
    /// let hash = LegacySigner.sign_chain(&key, ["PUBLICTESTHUF", "101010514"])?;
    /// assert_eq!(hash.len(), 32);
    /// # Ok::<(), simplepay::error::GatewayError>(())
    /// ```
    pub fn sign_chain<I, S>(&self, key: &SecretKey, values: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let message = chain_message(values)?;
        self.sign(key, message.as_bytes())
    }

    /// Builds the chain of `values` and verifies `received` against it.
    ///
    /// # Errors
    ///
    /// Same as [`sign_chain`](Self::sign_chain).
    pub fn verify_chain<I, S>(&self, key: &SecretKey, values: I, received: &str) -> Result<SignatureCheck>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let message = chain_message(values)?;
        self.verify(key, message.as_bytes(), received)
    }
}

impl Signer for LegacySigner {
    fn algorithm(&self) -> Algorithm {
        Algorithm::HmacMd5Positional
    }

    fn sign(&self, key: &SecretKey, message: &[u8]) -> Result<String> {
        let mac = Self::mac(key, message)?;
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn verify(&self, key: &SecretKey, message: &[u8], received: &str) -> Result<SignatureCheck> {
        let mac = Self::mac(key, message)?;
        let expected = hex::encode(mac.clone().finalize().into_bytes());

        let valid = match hex::decode(received.trim()) {
            Ok(bytes) => mac.verify_slice(&bytes).is_ok(),
            Err(_) => false,
        };

        Ok(SignatureCheck { valid, expected, received: received.to_owned() })
    }
}

/// Concatenates `len(value) ++ value` for every value, in order.
///
/// # Errors
///
/// Returns [`GatewayError::MissingSignatureInput`] when `values` is empty.
///
/// # Examples
///
/// ```
/// use simplepay::signature::chain_message;
///
/// assert_eq!(chain_message(["PUBLICTESTHUF", "101"])?, "13PUBLICTESTHUF3101");
/// assert_eq!(chain_message(["árvíz"])?, "7árvíz");
/// # Ok::<(), simplepay::error::GatewayError>(())
/// ```
pub fn chain_message<I, S>(values: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut message = String::new();
    let mut count = 0_usize;
    for value in values {
        let value = value.as_ref();
        message.push_str(&value.len().to_string());
        message.push_str(value);
        count += 1;
    }
    if count == 0 {
        return Err(GatewayError::MissingSignatureInput("empty hash chain".to_owned()));
    }
    Ok(message)
}

/// Renders a JSON scalar the way it appears in a hash chain.
///
/// Strings are taken verbatim, numbers in their shortest form, `true` as `1`,
/// `false` and `null` as the empty string.
///
/// # Errors
///
/// Returns [`GatewayError::NestedFieldError`] for arrays and objects.
pub fn scalar_text(name: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(text) => Ok(text.clone()),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(true) => Ok("1".to_owned()),
        Value::Bool(false) | Value::Null => Ok(String::new()),
        Value::Array(_) | Value::Object(_) => Err(GatewayError::NestedFieldError(name.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_sign_known_vector() {
        // RFC 2202 test case 2
        let key = SecretKey::from("Jefe");
        let hash = LegacySigner.sign(&key, b"what do ya want for nothing?").unwrap();
        assert_eq!(hash, "750c783e6ab0b503eaa86e310a5db738");
    }

    #[test]
    fn test_chain_prefixes_byte_length() {
        assert_eq!(chain_message(["", "a", "ab"]).unwrap(), "01a2ab");
        assert_eq!(chain_message(["ő"]).unwrap(), "2ő");
    }

    #[test]
    fn test_empty_chain_refused() {
        let empty: [&str; 0] = [];
        assert!(matches!(chain_message(empty), Err(GatewayError::MissingSignatureInput(_))));
    }

    #[test]
    fn test_verify_chain_roundtrip() {
        let key = SecretKey::from("secret");
        let hash = LegacySigner.sign_chain(&key, ["M", "101"]).unwrap();
        assert!(LegacySigner.verify_chain(&key, ["M", "101"], &hash).unwrap().valid);
        assert!(!LegacySigner.verify_chain(&key, ["101", "M"], &hash).unwrap().valid);
        assert!(!LegacySigner.verify_chain(&key, ["M", "101"], "N/A").unwrap().valid);
    }

    #[test]
    fn test_uppercase_hex_accepted() {
        let key = SecretKey::from("secret");
        let hash = LegacySigner.sign_chain(&key, ["M"]).unwrap();
        let check = LegacySigner.verify_chain(&key, ["M"], &hash.to_uppercase()).unwrap();
        assert!(check.valid);
    }

    #[test]
    fn test_scalar_text() {
        assert_eq!(scalar_text("a", &json!("x")).unwrap(), "x");
        assert_eq!(scalar_text("a", &json!(12.5)).unwrap(), "12.5");
        assert_eq!(scalar_text("a", &json!(true)).unwrap(), "1");
        assert_eq!(scalar_text("a", &json!(null)).unwrap(), "");
        assert!(matches!(
            scalar_text("IPN_PID", &json!(["1"])),
            Err(GatewayError::NestedFieldError(name)) if name == "IPN_PID"
        ));
    }
}
