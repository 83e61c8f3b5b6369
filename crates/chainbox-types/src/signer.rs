//! HMAC request signing for node-to-node mesh traffic.
//!
//! The signature covers `"<timestamp>:<canonical_json(payload)>"` so both
//! ends agree on the bytes regardless of field ordering. Verification is
//! constant-time and bounds the timestamp to a freshness window on both
//! sides of the clock.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::canonical::canonical_json;
use crate::error::FabricError;
use crate::frame::epoch_ms;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex-encoded HMAC.
pub const SIGNATURE_HEADER: &str = "x-chainbox-signature";
/// Header carrying the epoch-millisecond timestamp the signature covers.
pub const TIMESTAMP_HEADER: &str = "x-chainbox-timestamp";

/// Default freshness window for signatures, in milliseconds.
pub const DEFAULT_SIGNATURE_TTL_MS: u64 = 60_000;

/// Signature material attached to one outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureParts {
    /// Hex-encoded HMAC-SHA256.
    pub signature: String,
    /// Epoch milliseconds the signature was produced at.
    pub timestamp: u64,
}

/// Signs and verifies mesh payloads with a shared symmetric secret.
///
/// With no secret configured, signing is a no-op and verification accepts
/// everything; a mesh is either fully signed or fully open.
#[derive(Debug, Clone)]
pub struct RequestSigner {
    secret: Option<Vec<u8>>,
    ttl_ms: u64,
}

impl RequestSigner {
    pub fn new(secret: Option<Vec<u8>>, ttl_ms: u64) -> Self {
        Self { secret, ttl_ms }
    }

    /// A signer that neither signs nor rejects.
    pub fn disabled() -> Self {
        Self::new(None, DEFAULT_SIGNATURE_TTL_MS)
    }

    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    /// Sign a payload at the current time. `None` when signing is disabled.
    pub fn sign(&self, payload: &Value) -> Option<SignatureParts> {
        self.sign_at(payload, epoch_ms())
    }

    /// Sign a payload at an explicit timestamp.
    pub fn sign_at(&self, payload: &Value, timestamp: u64) -> Option<SignatureParts> {
        let secret = self.secret.as_deref()?;
        Some(SignatureParts {
            signature: hex::encode(mac_bytes(secret, timestamp, payload)),
            timestamp,
        })
    }

    /// Verify a signature against a payload at the current time.
    pub fn verify(
        &self,
        payload: &Value,
        signature_hex: &str,
        timestamp: u64,
    ) -> Result<(), FabricError> {
        self.verify_at(payload, signature_hex, timestamp, epoch_ms())
    }

    /// Verify at an explicit "now", for deterministic tests.
    pub fn verify_at(
        &self,
        payload: &Value,
        signature_hex: &str,
        timestamp: u64,
        now: u64,
    ) -> Result<(), FabricError> {
        let Some(secret) = self.secret.as_deref() else {
            return Ok(());
        };

        if now.abs_diff(timestamp) > self.ttl_ms {
            return Err(FabricError::invalid_signature(
                "signature timestamp outside the freshness window",
            ));
        }

        let presented = hex::decode(signature_hex)
            .map_err(|_| FabricError::invalid_signature("signature is not valid hex"))?;
        let expected = mac_bytes(secret, timestamp, payload);

        if presented.len() != expected.len()
            || presented.ct_eq(&expected).unwrap_u8() == 0
        {
            return Err(FabricError::invalid_signature("signature mismatch"));
        }
        Ok(())
    }
}

fn mac_bytes(secret: &[u8], timestamp: u64, payload: &Value) -> Vec<u8> {
    // HMAC accepts keys of any length; new_from_slice cannot fail.
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(m) => m,
        Err(_) => return Vec::new(),
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b":");
    mac.update(canonical_json(payload).as_bytes());
    mac.finalize().into_bytes().to_vec()
}
