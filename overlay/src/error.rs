use keel_wire::{MessageKind, WireError};
use thiserror::Error;

/// Overlay error taxonomy. Every variant is connection-fatal.
#[derive(Debug, Error)]
pub enum OverlayError {
    // Handshake
    #[error("failed to verify auth cert")]
    BadCert,

    #[error("node is banned")]
    BannedPeer,

    #[error("wrong network passphrase")]
    WrongNetwork,

    #[error("wrong protocol version")]
    VersionMismatch,

    #[error("connecting to self")]
    SelfConnect,

    #[error("already-connected peer: {0}")]
    DuplicatePeer(String),

    #[error("bad address")]
    BadAddress,

    // Authentication
    #[error("unexpected auth sequence")]
    OutOfOrderMessage,

    #[error("unexpected MAC")]
    MacMismatch,

    // Protocol
    #[error("received {0} before completed handshake")]
    BeforeHandshake(MessageKind),

    #[error("unexpected flood message, peer at capacity")]
    FloodOverrun,

    #[error("malformed SEND_MORE: {0}")]
    MalformedSendMore(String),

    #[error("received unexpected HELLO")]
    UnexpectedHello,

    #[error("out-of-order AUTH message")]
    OutOfOrderAuth,

    // Policy
    #[error("peer rejected")]
    PeerRejected,

    #[error("illegal state transition {from} -> {to}")]
    IllegalStateTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("config error: {0}")]
    Config(String),

    // Transport
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
