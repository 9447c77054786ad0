//! HMAC-SHA256 per-message authentication codes.
//!
//! Every authenticated overlay message carries a MAC computed over the
//! sender's sequence counter concatenated with the encoded message body,
//! keyed with the per-direction session key.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// A 32-byte per-direction MAC key.
pub type MacKey = [u8; 32];

/// Compute the HMAC-SHA256 of `sequence || body` under `key`.
pub fn hmac_sha256(key: &MacKey, sequence: u64, body: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(&sequence.to_be_bytes());
    mac.update(body);
    let result = mac.finalize().into_bytes();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    output
}

/// Verify an HMAC-SHA256 over `sequence || body` in constant time.
pub fn hmac_sha256_verify(expected: &[u8; 32], key: &MacKey, sequence: u64, body: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(&sequence.to_be_bytes());
    mac.update(body);
    mac.verify_slice(expected).is_ok()
}
