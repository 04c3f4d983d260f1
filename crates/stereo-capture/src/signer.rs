//! Record signing.
//!
//! The signature scheme is pluggable through [`Signer`] / [`Verifier`];
//! [`HmacSigner`] (HMAC-SHA256, hex output) is the built-in scheme.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignError {
    #[error("signing key is empty")]
    EmptyKey,
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
    #[error("signature is not valid hex: {0}")]
    MalformedSignature(String),
    #[error("signature does not match")]
    Mismatch,
}

/// Produces a hex signature over canonical record bytes.
pub trait Signer: Send + Sync {
    fn sign(&self, message: &[u8]) -> Result<String, SignError>;
}

pub trait Verifier {
    /// `Ok(())` when `signature` was produced over `message` by the matching key.
    fn verify(&self, message: &[u8], signature: &str) -> Result<(), SignError>;
}

#[derive(Clone)]
pub struct HmacSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for HmacSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSigner").field("key", &"<redacted>").finish()
    }
}

impl HmacSigner {
    pub fn new(key: &[u8]) -> Result<Self, SignError> {
        if key.is_empty() {
            return Err(SignError::EmptyKey);
        }
        Ok(Self { key: key.to_vec() })
    }

    /// Key from a configured secret: hex (optionally `0x`-prefixed) when it
    /// decodes as such, otherwise the raw UTF-8 bytes.
    pub fn from_secret(secret: &str) -> Result<Self, SignError> {
        let trimmed = secret.trim();
        let body = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        match hex::decode(body) {
            Ok(bytes) if !bytes.is_empty() => Self::new(&bytes),
            _ => Self::new(trimmed.as_bytes()),
        }
    }

    fn mac(&self) -> Result<HmacSha256, SignError> {
        HmacSha256::new_from_slice(&self.key).map_err(|e| SignError::InvalidKey(e.to_string()))
    }
}

impl Signer for HmacSigner {
    fn sign(&self, message: &[u8]) -> Result<String, SignError> {
        let mut mac = self.mac()?;
        mac.update(message);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl Verifier for HmacSigner {
    fn verify(&self, message: &[u8], signature: &str) -> Result<(), SignError> {
        let body = signature.strip_prefix("0x").unwrap_or(signature);
        let expected = hex::decode(body).map_err(|e| SignError::MalformedSignature(e.to_string()))?;
        let mut mac = self.mac()?;
        mac.update(message);
        mac.verify_slice(&expected).map_err(|_| SignError::Mismatch)
    }
}
