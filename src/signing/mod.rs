//! Request signing for the reward, verify and notification endpoints.
//!
//! The backend recomputes `HMAC_SHA256(secret, "{timestamp}.{body}")` over the
//! raw bytes it received, so the digest must be taken over the exact bytes
//! that go on the wire. [`SignedRequest`] keeps the signed body next to the
//! signature so callers never re-serialize between signing and sending.

use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
pub const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";

/// Compact, insertion-ordered JSON with non-ASCII characters left as-is.
pub fn canonical_json(payload: &Map<String, Value>) -> String {
    // Map<String, Value> serialization cannot fail.
    serde_json::to_string(payload).unwrap_or_default()
}

pub fn sign(secret: &str, timestamp_ms: u64, body: &str) -> String {
    hex::encode(mac_for(secret, timestamp_ms, body).finalize().into_bytes())
}

pub fn verify(secret: &str, timestamp_ms: u64, body: &str, signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    mac_for(secret, timestamp_ms, body)
        .verify_slice(&expected)
        .is_ok()
}

fn mac_for(secret: &str, timestamp_ms: u64, body: &str) -> HmacSha256 {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac key length is unbounded"));
    mac.update(timestamp_ms.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    mac
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub action: String,
    pub timestamp: u64,
    pub payload: Map<String, Value>,
    pub signature: String,
    body: String,
}

impl SignedRequest {
    pub fn new(secret: &str, payload: Map<String, Value>, timestamp: u64) -> Self {
        let action = payload
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let body = canonical_json(&payload);
        let signature = sign(secret, timestamp, &body);
        Self {
            action,
            timestamp,
            payload,
            signature,
            body,
        }
    }

    /// The exact bytes the signature covers.
    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body.into_bytes()
    }
}
