//! Per-connection session key agreement.
//!
//! Each side generates an ephemeral X25519 key, binds it to its long-term
//! identity via an auth certificate (see [`crate::cert`]), and exchanges the
//! public half in HELLO. Both MAC keys are derived from the shared ECDH
//! secret expanded with a direction tag and the two handshake nonces, so the
//! two directions necessarily yield distinct keys and the initiator's send
//! key equals the responder's receive key.

use crate::hash::blake2b_256_multi;
use crate::mac::MacKey;
use keel_types::PeerRole;
use rand::RngCore;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Context string mixed into every session key expansion.
const MAC_KEY_CONTEXT: &[u8] = b"keel-overlay-session-mac";

/// Direction tag for traffic flowing initiator -> responder.
const TAG_INITIATOR_TO_RESPONDER: &[u8] = b"i2r";
/// Direction tag for traffic flowing responder -> initiator.
const TAG_RESPONDER_TO_INITIATOR: &[u8] = b"r2i";

/// An ephemeral X25519 key pair, generated once per connection.
///
/// The secret half is zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct EphemeralKeys {
    secret: [u8; 32],
    /// The public half, conveyed to the peer inside the auth certificate.
    pub public: [u8; 32],
}

impl EphemeralKeys {
    /// Generate a fresh ephemeral key pair from a secure random source.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        Self::from_secret(secret)
    }

    /// Build the pair from raw secret bytes (deterministic, for tests).
    pub fn from_secret(secret: [u8; 32]) -> Self {
        let public = *X25519Public::from(&StaticSecret::from(secret)).as_bytes();
        Self { secret, public }
    }
}

/// The two per-direction MAC keys of an established session.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionMacKeys {
    /// Key for messages we send.
    pub send: MacKey,
    /// Key for messages we receive.
    pub recv: MacKey,
}

/// Derive both MAC keys from the ECDH shared secret and handshake nonces.
///
/// The expansion orders the nonces initiator-first regardless of which side
/// computes it, so both sides agree on the same pair of directional keys.
pub fn derive_mac_keys(
    local: &EphemeralKeys,
    remote_public: &[u8; 32],
    role: PeerRole,
    local_nonce: &[u8; 32],
    remote_nonce: &[u8; 32],
) -> SessionMacKeys {
    let secret = StaticSecret::from(local.secret);
    let shared = secret.diffie_hellman(&X25519Public::from(*remote_public));

    let (initiator_nonce, responder_nonce) = match role {
        PeerRole::WeCalledRemote => (local_nonce, remote_nonce),
        PeerRole::RemoteCalledUs => (remote_nonce, local_nonce),
    };

    let key_i2r = blake2b_256_multi(&[
        MAC_KEY_CONTEXT,
        shared.as_bytes(),
        TAG_INITIATOR_TO_RESPONDER,
        initiator_nonce,
        responder_nonce,
    ]);
    let key_r2i = blake2b_256_multi(&[
        MAC_KEY_CONTEXT,
        shared.as_bytes(),
        TAG_RESPONDER_TO_INITIATOR,
        initiator_nonce,
        responder_nonce,
    ]);

    match role {
        PeerRole::WeCalledRemote => SessionMacKeys {
            send: key_i2r,
            recv: key_r2i,
        },
        PeerRole::RemoteCalledUs => SessionMacKeys {
            send: key_r2i,
            recv: key_i2r,
        },
    }
}
