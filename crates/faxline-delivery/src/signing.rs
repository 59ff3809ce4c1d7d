//! HMAC-SHA256 signing of webhook bodies.
//!
//! The signature is the lowercase hex HMAC of the exact bytes that go on the
//! wire, keyed with the endpoint secret. Receivers recompute it over the raw
//! request body and compare with [`verify`].

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signature.
pub const SIGNATURE_HEADER: &str = "X-Fax-Signature";

/// Signature generation and validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// The key could not initialize the MAC.
    #[error("invalid secret key")]
    InvalidSecret,

    /// The presented signature is not hex.
    #[error("invalid signature format: {0}")]
    InvalidFormat(String),

    /// The signature does not match the payload.
    #[error("signature verification failed")]
    VerificationFailed,
}

fn mac_for(secret: &str) -> Result<HmacSha256, SignatureError> {
    HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidSecret)
}

/// Signs a payload, returning the hex-encoded MAC.
///
/// # Errors
///
/// Returns `InvalidSecret` if the key is rejected by the MAC.
pub fn sign(payload: &[u8], secret: &str) -> Result<String, SignatureError> {
    let mut mac = mac_for(secret)?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verifies a hex signature over a payload in constant time.
///
/// # Errors
///
/// `InvalidFormat` if the signature is not hex, `VerificationFailed` if it
/// does not match.
pub fn verify(payload: &[u8], signature: &str, secret: &str) -> Result<(), SignatureError> {
    let expected = hex::decode(signature.trim())
        .map_err(|e| SignatureError::InvalidFormat(e.to_string()))?;

    let mut mac = mac_for(secret)?;
    mac.update(payload);
    mac.verify_slice(&expected).map_err(|_| SignatureError::VerificationFailed)
}
