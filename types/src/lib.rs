//! Fundamental types for the keel validator overlay.
//!
//! This crate defines the core types shared across every other crate in the
//! workspace: content hashes, node identity keys, network identifiers, the
//! connection role, and wall-clock timestamps.

pub mod hash;
pub mod keys;
pub mod network;
pub mod role;
pub mod time;

pub use hash::Hash;
pub use keys::{KeyPair, NodeId, PrivateKey, PublicKey, Signature};
pub use network::NetworkId;
pub use role::PeerRole;
pub use time::Timestamp;
