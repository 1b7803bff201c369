//! Cryptographic helpers for webhook and API key verification.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Compute HMAC-SHA256 and return the hex-encoded digest (64 characters).
///
/// # Errors
///
/// Returns `hmac::digest::InvalidLength` if the key is rejected. HMAC accepts
/// keys of any length, so this does not happen with `Hmac<Sha256>`.
pub fn hmac_sha256_hex(secret: &str, message: &str) -> Result<String, hmac::digest::InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time string comparison.
///
/// Only the length is leaked; the content comparison does not short-circuit.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}
