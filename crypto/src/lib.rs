//! Cryptographic primitives for the keel validator overlay.
//!
//! - **Ed25519** for node identity signatures (auth certificates)
//! - **Blake2b** for content hashes and key expansion
//! - **X25519** for the per-connection ephemeral Diffie-Hellman exchange
//! - **HMAC-SHA256** for the per-message authentication codes

pub mod cert;
pub mod hash;
pub mod keys;
pub mod mac;
pub mod session;
pub mod sign;

pub use cert::{make_auth_cert, verify_auth_cert, AuthCert, AUTH_CERT_LIFETIME_SECS};
pub use hash::{blake2b_256, blake2b_256_multi, hash_content};
pub use keys::{generate_keypair, keypair_from_seed, public_from_private};
pub use mac::{hmac_sha256, hmac_sha256_verify, MacKey};
pub use session::{derive_mac_keys, EphemeralKeys, SessionMacKeys};
pub use sign::{sign_message, verify_signature};
