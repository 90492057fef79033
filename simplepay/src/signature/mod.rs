//! Message authentication for both gateway protocol generations.
//!
//! The gateway speaks two incompatible dialects:
//!
//! | Generation | Canonical payload                   | MAC          | Encoding        |
//! |------------|-------------------------------------|--------------|-----------------|
//! | Modern     | JSON document, byte for byte        | HMAC-SHA384  | base64          |
//! | Legacy     | length-prefixed chain of scalars    | HMAC-MD5     | lowercase hex   |
//!
//! Both are exposed through the [`Signer`] trait so that the components that
//! sign or verify never care which one they hold. The merchant secret is
//! trimmed of surrounding whitespace before use, and an empty secret or an
//! empty payload is refused with [`GatewayError::MissingSignatureInput`].
//!
//! Verification never returns an error for a wrong signature. It returns a
//! [`SignatureCheck`] carrying both values, so callers can log the mismatch
//! and decide what to do.
//!
//! # Examples
//!
//! ```
//! use simplepay::{
//!     merchant::SecretKey,
//!     signature::{ModernSigner, Signer},
//! };
//!
//! let key = SecretKey::from("S1");
//! let body = br#"{"merchant":"M1","orderRef":"101"}"#;
//!
//! let signature = ModernSigner.sign(&key, body)?;
//! assert!(ModernSigner.verify(&key, body, &signature)?.valid);
//! # Ok::<(), simplepay::error::GatewayError>(())
//! ```

pub mod legacy;
pub mod modern;

pub use legacy::{LegacySigner, chain_message, scalar_text};
pub use modern::{ModernSigner, canonical_json, canonical_json_str};

use crate::{
    error::{GatewayError, Result},
    merchant::SecretKey,
};

/// Value returned by [`signature_from_headers`] when no `Signature` header exists.
pub const MISSING_HEADER_SIGNATURE: &str = "MISSING_HEADER_SIGNATURE";

/// Name of the header carrying modern signatures.
pub const SIGNATURE_HEADER: &str = "Signature";

/// MAC algorithm of a protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// HMAC-SHA384 over a JSON document, base64 encoded.
    HmacSha384Json,
    /// HMAC-MD5 over a length-prefixed value chain, hex encoded.
    HmacMd5Positional,
}

impl Algorithm {
    /// Short name used in log records.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::HmacSha384Json => "HMAC-SHA384-JSON",
            Self::HmacMd5Positional => "HMAC-MD5-POSITIONAL",
        }
    }
}

/// Outcome of a signature verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureCheck {
    /// Whether the received signature matched.
    pub valid: bool,
    /// Signature computed locally.
    pub expected: String,
    /// Signature carried by the message.
    pub received: String,
}

impl SignatureCheck {
    /// Converts a failed check into [`GatewayError::SignatureMismatch`].
    ///
    /// # Errors
    ///
    /// Returns the mismatch error when `valid` is `false`.
    pub fn into_result(self) -> Result<()> {
        if self.valid {
            Ok(())
        } else {
            Err(GatewayError::SignatureMismatch { expected: self.expected, received: self.received })
        }
    }
}

/// Signing capability of one protocol generation.
///
/// Implementations are stateless; the merchant secret is passed per call
/// because it is resolved per operation.
pub trait Signer: Send + Sync + std::fmt::Debug {
    /// Algorithm implemented by this signer.
    fn algorithm(&self) -> Algorithm;

    /// Computes the encoded MAC of `message`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::MissingSignatureInput`] for an empty key or message.
    fn sign(&self, key: &SecretKey, message: &[u8]) -> Result<String>;

    /// Recomputes the MAC of `message` and compares it to `received` in constant time.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::MissingSignatureInput`] for an empty key or
    /// message. A wrong or undecodable `received` value is reported through
    /// [`SignatureCheck::valid`], not as an error.
    fn verify(&self, key: &SecretKey, message: &[u8], received: &str) -> Result<SignatureCheck>;
}

/// Finds the `Signature` header, ignoring name case.
///
/// Returns [`MISSING_HEADER_SIGNATURE`] when the header is absent.
///
/// # Examples
///
/// ```
/// use simplepay::signature::{MISSING_HEADER_SIGNATURE, signature_from_headers};
///
/// let headers = [("content-type", "application/json"), ("SIGNATURE", "abc=")];
/// assert_eq!(signature_from_headers(headers), "abc=");
///
/// let none: [(&str, &str); 0] = [];
/// assert_eq!(signature_from_headers(none), MISSING_HEADER_SIGNATURE);
/// ```
#[must_use]
pub fn signature_from_headers<I, K, V>(headers: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    headers
        .into_iter()
        .find(|(name, _)| name.as_ref().trim().eq_ignore_ascii_case(SIGNATURE_HEADER))
        .map_or_else(|| MISSING_HEADER_SIGNATURE.to_owned(), |(_, value)| value.as_ref().trim().to_owned())
}

pub(crate) fn require_input(key: &SecretKey, message: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(GatewayError::MissingSignatureInput("merchant secret is empty".to_owned()));
    }
    if message.is_empty() {
        return Err(GatewayError::MissingSignatureInput("nothing to sign".to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    mod proptest_signatures;

    use super::*;

    #[test]
    fn test_header_lookup_case_insensitive() {
        let headers = vec![
            ("Date".to_owned(), "today".to_owned()),
            ("signature".to_owned(), " xyz ".to_owned()),
        ];
        assert_eq!(signature_from_headers(headers), "xyz");
    }

    #[test]
    fn test_header_missing_sentinel() {
        let headers = [("Signature-Input", "sig1=()")];
        assert_eq!(signature_from_headers(headers), MISSING_HEADER_SIGNATURE);
    }

    #[test]
    fn test_check_into_result() {
        let ok = SignatureCheck { valid: true, expected: "a".into(), received: "a".into() };
        assert!(ok.into_result().is_ok());

        let bad = SignatureCheck { valid: false, expected: "a".into(), received: "b".into() };
        assert!(matches!(bad.into_result(), Err(GatewayError::SignatureMismatch { .. })));
    }

    #[test]
    fn test_require_input() {
        assert!(require_input(&SecretKey::from(" "), b"x").is_err());
        assert!(require_input(&SecretKey::from("k"), b"").is_err());
        assert!(require_input(&SecretKey::from("k"), b"x").is_ok());
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!(ModernSigner.algorithm().as_str(), "HMAC-SHA384-JSON");
        assert_eq!(LegacySigner.algorithm().as_str(), "HMAC-MD5-POSITIONAL");
    }
}
