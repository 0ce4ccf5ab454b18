//! HMAC-SHA256 signatures for outbound deliveries.
//!
//! The signed message is `"{timestamp}.{payload}"`, so receivers can reject
//! replays by checking the timestamp header as well as the signature.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, Result};

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";

const SCHEME_PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

fn mac_for(secret: &[u8], timestamp: &str, payload: &[u8]) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| Error::Config(format!("invalid signing key: {e}")))?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

/// Signature header value: `sha256=<lowercase hex>`.
pub fn compute_signature(secret: &[u8], timestamp: &str, payload: &[u8]) -> Result<String> {
    let digest = mac_for(secret, timestamp, payload)?.finalize().into_bytes();
    Ok(format!("{SCHEME_PREFIX}{}", hex::encode(digest)))
}

/// Check a received signature header value in constant time.
pub fn verify_signature(secret: &[u8], timestamp: &str, payload: &[u8], header: &str) -> bool {
    let Some(hex_part) = header.trim().strip_prefix(SCHEME_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_part) else {
        return false;
    };
    mac_for(secret, timestamp, payload)
        .is_ok_and(|mac| mac.verify_slice(&expected).is_ok())
}
