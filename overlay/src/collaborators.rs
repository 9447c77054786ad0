//! Collaborator interfaces.
//!
//! The overlay core reaches the rest of the validator exclusively through
//! these traits: the ban list, the peer directory, the consensus engine, the
//! ledger, the survey manager, and the roster of authenticated connections.
//! Implementations are injected at session construction; tests use in-memory
//! doubles.

use keel_types::{Hash, NodeId};
use keel_wire::{
    GeneralizedTxSetPayload, Message, MessageKind, PeerAddress, QuorumSetPayload, ScpEnvelope,
    SurveyRequest, SurveyResponse, TxEnvelope, TxSetPayload,
};

use crate::registry::SessionToken;

/// Outcome of handing an SCP envelope to the consensus engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvelopeStatus {
    Processed,
    Discarded,
}

/// Outcome of handing a transaction to the consensus engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxAddResult {
    /// New and valid, now pending.
    Pending,
    /// Already known.
    Duplicate,
    /// Invalid or unwanted.
    Rejected,
}

/// How a peer connection came to exist, for directory records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerKind {
    Inbound,
    Outbound,
    Preferred,
}

/// Directory back-off adjustment after connection lifecycle events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackOffUpdate {
    /// Connection failed or was dropped: back off further.
    Increase,
    /// Connection fully authenticated: reset the back-off.
    Reset,
}

/// The last closed ledger, as much of it as the overlay needs.
#[derive(Clone, Debug)]
pub struct LedgerHeader {
    pub seq: u32,
    pub hash: Hash,
    pub ledger_version: u32,
}

/// A transaction set in either wire representation.
///
/// The overlay treats both identically; only the wire variant differs.
#[derive(Clone, Debug)]
pub enum TxSetFrame {
    Classic(TxSetPayload),
    Generalized(GeneralizedTxSetPayload),
}

impl TxSetFrame {
    pub fn content_hash(&self) -> Hash {
        match self {
            Self::Classic(set) => set.content_hash(),
            Self::Generalized(set) => set.content_hash(),
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            Self::Classic(set) => Message::TxSet(set),
            Self::Generalized(set) => Message::GeneralizedTxSet(set),
        }
    }
}

/// Node-level ban decisions.
pub trait BanList: Send + Sync {
    fn is_banned(&self, id: &NodeId) -> bool;
}

/// Persistent knowledge about peer addresses.
pub trait PeerDirectory: Send + Sync {
    /// Record (or refresh) a peer address with its connection kind.
    fn update(&self, address: &PeerAddress, kind: PeerKind);

    /// Adjust the reconnect back-off for an address.
    fn update_backoff(&self, address: &PeerAddress, update: BackOffUpdate);

    /// Make sure an address learned from a PEERS message exists.
    fn ensure_exists(&self, address: &PeerAddress);

    /// Up to `max` addresses worth advertising, excluding `exclude`.
    fn peers_to_send(&self, max: usize, exclude: &PeerAddress) -> Vec<PeerAddress>;
}

/// The consensus engine surface the overlay consumes.
pub trait ConsensusEngine: Send + Sync {
    fn recv_scp_envelope(&self, envelope: &ScpEnvelope) -> EnvelopeStatus;

    fn recv_tx_set(&self, hash: Hash, frame: TxSetFrame);

    fn recv_quorum_set(&self, hash: Hash, qset: &QuorumSetPayload);

    fn recv_transaction(&self, tx: &TxEnvelope) -> TxAddResult;

    fn get_tx_set(&self, hash: &Hash) -> Option<TxSetFrame>;

    fn get_quorum_set(&self, hash: &Hash) -> Option<QuorumSetPayload>;

    fn get_tx(&self, hash: &Hash) -> Option<TxEnvelope>;

    fn is_banned_tx(&self, hash: &Hash) -> bool;

    /// Messages carrying our SCP state from `ledger_seq` onward, to be sent
    /// to the requesting peer.
    fn scp_state_for_peer(&self, ledger_seq: u32) -> Vec<Message>;

    /// The lowest ledger sequence worth asking peers about.
    fn min_ledger_seq_to_ask_peers(&self) -> u32;

    /// The consensus ledger index currently being tracked.
    fn tracking_consensus_ledger_index(&self) -> u32;

    /// A peer answered DONT_HAVE for an item we asked it for.
    fn peer_doesnt_have(&self, kind: MessageKind, hash: &Hash, peer: &NodeId);
}

/// The ledger surface the overlay consumes.
pub trait Ledger: Send + Sync {
    fn is_synced(&self) -> bool;

    fn last_closed_header(&self) -> LedgerHeader;
}

/// Relay point for network survey traffic.
pub trait SurveyManager: Send + Sync {
    fn relay_or_process_request(&self, request: &SurveyRequest, peer: &NodeId);

    fn relay_or_process_response(&self, response: &SurveyResponse, peer: &NodeId);
}

/// The set of authenticated connections, for duplicate detection and
/// connection-count policy.
pub trait PeerRoster: Send + Sync {
    /// Whether some *other* live session is already authenticated for `id`.
    /// Sessions are compared by token, never by identity value address.
    fn is_duplicate(&self, id: &NodeId, own: SessionToken) -> bool;

    /// Try to admit an authenticated session. Returns `false` when the node
    /// is at capacity and the connection must be rejected with ERR_LOAD.
    fn accept_authenticated(&self, id: &NodeId, token: SessionToken) -> bool;

    /// Remove a session from the roster (drop path; idempotent).
    fn release(&self, token: SessionToken);
}
