//! Auth certificates — binding an ephemeral session key to a node identity.
//!
//! A certificate is the node's Ed25519 signature over its ephemeral X25519
//! public key, an expiration timestamp, and the network identifier. Peers
//! verify the certificate in HELLO before deriving session keys, so a
//! man-in-the-middle cannot substitute its own ephemeral key.

use crate::hash::blake2b_256_multi;
use crate::sign::{sign_message, verify_signature};
use keel_types::{KeyPair, NetworkId, NodeId, Signature, Timestamp};
use serde::{Deserialize, Serialize};

/// How long an issued certificate stays valid.
pub const AUTH_CERT_LIFETIME_SECS: u64 = 60 * 60;

/// Domain separator for certificate signatures.
const CERT_CONTEXT: &[u8] = b"keel-auth-cert";

/// A signed binding of an ephemeral session public key to a node identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthCert {
    /// The ephemeral X25519 public key.
    pub session_public: [u8; 32],
    /// Unix time after which the certificate is invalid.
    pub expiration: Timestamp,
    /// Ed25519 signature by the node's long-term key.
    pub sig: Signature,
}

fn cert_digest(network: NetworkId, session_public: &[u8; 32], expiration: Timestamp) -> [u8; 32] {
    blake2b_256_multi(&[
        CERT_CONTEXT,
        network.as_str().as_bytes(),
        &expiration.as_secs().to_be_bytes(),
        session_public,
    ])
}

/// Issue a certificate over `session_public`, signed by `identity`.
pub fn make_auth_cert(
    network: NetworkId,
    identity: &KeyPair,
    session_public: [u8; 32],
    now: Timestamp,
) -> AuthCert {
    let expiration = now.plus(AUTH_CERT_LIFETIME_SECS);
    let digest = cert_digest(network, &session_public, expiration);
    AuthCert {
        session_public,
        expiration,
        sig: sign_message(&digest, &identity.private),
    }
}

/// Verify a peer's certificate against its claimed identity.
///
/// Checks the signature and that the certificate has not expired.
pub fn verify_auth_cert(
    network: NetworkId,
    claimed_id: &NodeId,
    cert: &AuthCert,
    now: Timestamp,
) -> bool {
    if cert.expiration <= now {
        return false;
    }
    let digest = cert_digest(network, &cert.session_public, cert.expiration);
    verify_signature(&digest, &cert.sig, claimed_id)
}
