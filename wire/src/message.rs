//! Top-level overlay wire message union and payload types.
//!
//! Every frame sent between keel nodes carries one [`Message`] variant inside
//! the [`crate::AuthenticatedMessage`] envelope. The read loop deserializes
//! the envelope, verifies its MAC, and dispatches on the inner variant.

use keel_crypto::cert::AuthCert;
use keel_crypto::hash_content;
use keel_types::{Hash, NetworkId, NodeId, PublicKey, Signature};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound on the number of hashes in a single FLOOD_ADVERT.
pub const TX_ADVERT_VECTOR_MAX_SIZE: usize = 1000;

/// Upper bound on the number of hashes in a single FLOOD_DEMAND.
pub const TX_DEMAND_VECTOR_MAX_SIZE: usize = 1000;

/// Upper bound on the number of addresses in a PEERS message.
pub const PEERS_VECTOR_MAX_SIZE: usize = 100;

/// AUTH flags bit requesting byte-axis flow control.
pub const AUTH_FLAG_FLOW_CONTROL_BYTES_REQUESTED: u32 = 200;

/// Wire error codes carried in ERROR_MSG.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Unspecific error.
    Misc,
    /// Malformed data.
    Data,
    /// Configuration conflict (network, version, identity).
    Conf,
    /// Authentication failure.
    Auth,
    /// Load shedding — no capacity for this peer.
    Load,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Misc => "ERR_MISC",
            Self::Data => "ERR_DATA",
            Self::Conf => "ERR_CONF",
            Self::Auth => "ERR_AUTH",
            Self::Load => "ERR_LOAD",
        }
    }
}

/// Discriminant-only view of [`Message`], used for metrics labels, DONT_HAVE
/// payloads, and trace logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Error,
    Hello,
    Auth,
    DontHave,
    GetPeers,
    Peers,
    GetTxSet,
    TxSet,
    GeneralizedTxSet,
    Transaction,
    GetScpQuorumSet,
    ScpQuorumSet,
    ScpMessage,
    GetScpState,
    SurveyRequest,
    SurveyResponse,
    SendMore,
    SendMoreExtended,
    FloodAdvert,
    FloodDemand,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "ERROR_MSG",
            Self::Hello => "HELLO",
            Self::Auth => "AUTH",
            Self::DontHave => "DONT_HAVE",
            Self::GetPeers => "GET_PEERS",
            Self::Peers => "PEERS",
            Self::GetTxSet => "GET_TX_SET",
            Self::TxSet => "TX_SET",
            Self::GeneralizedTxSet => "GENERALIZED_TX_SET",
            Self::Transaction => "TRANSACTION",
            Self::GetScpQuorumSet => "GET_SCP_QUORUMSET",
            Self::ScpQuorumSet => "SCP_QUORUMSET",
            Self::ScpMessage => "SCP_MESSAGE",
            Self::GetScpState => "GET_SCP_STATE",
            Self::SurveyRequest => "SURVEY_REQUEST",
            Self::SurveyResponse => "SURVEY_RESPONSE",
            Self::SendMore => "SEND_MORE",
            Self::SendMoreExtended => "SEND_MORE_EXTENDED",
            Self::FloodAdvert => "FLOOD_ADVERT",
            Self::FloodDemand => "FLOOD_DEMAND",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ERROR_MSG payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorMsg {
    pub code: ErrorCode,
    pub msg: String,
}

/// HELLO — the first message on any connection, unauthenticated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hello {
    /// Ledger protocol version this node runs.
    pub ledger_version: u32,
    /// Oldest overlay version this node still speaks.
    pub overlay_min_version: u32,
    /// Current overlay version of this node.
    pub overlay_version: u32,
    /// Free-form software version string.
    pub version_str: String,
    /// Network this node belongs to.
    pub network_id: NetworkId,
    /// Port the node accepts connections on.
    pub listening_port: u16,
    /// The node's long-term identity.
    pub peer_id: NodeId,
    /// Certificate binding an ephemeral session key to `peer_id`.
    pub cert: AuthCert,
    /// Random per-connection nonce mixed into MAC key derivation.
    pub nonce: [u8; 32],
}

/// AUTH — completes the handshake; `flags` advertises optional capabilities.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthPayload {
    pub flags: u32,
}

/// DONT_HAVE — negative answer to a fetch request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DontHave {
    pub kind: MessageKind,
    pub req_hash: Hash,
}

/// A peer's advertised network address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub ip: String,
    pub port: u16,
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// An opaque transaction envelope as it travels the overlay.
///
/// The overlay never interprets transaction contents; it hashes and forwards
/// them. Validation belongs to the consensus engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxEnvelope {
    pub payload: Vec<u8>,
}

impl TxEnvelope {
    /// Content hash identifying this transaction on the flood network.
    pub fn hash(&self) -> Hash {
        hash_content(&self.payload)
    }
}

/// A classic transaction set for one ledger slot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxSetPayload {
    pub previous_ledger_hash: Hash,
    pub txs: Vec<TxEnvelope>,
}

impl TxSetPayload {
    /// Deterministic content hash of the whole set.
    pub fn content_hash(&self) -> Hash {
        let bytes = bincode::serialize(self).expect("tx set is always serializable");
        hash_content(&bytes)
    }
}

/// A phased (generalized) transaction set for one ledger slot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GeneralizedTxSetPayload {
    pub previous_ledger_hash: Hash,
    pub phases: Vec<Vec<TxEnvelope>>,
}

impl GeneralizedTxSetPayload {
    /// Deterministic content hash of the whole set.
    pub fn content_hash(&self) -> Hash {
        let bytes = bincode::serialize(self).expect("tx set is always serializable");
        hash_content(&bytes)
    }
}

/// A quorum set description: threshold over validators and nested sets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumSetPayload {
    pub threshold: u32,
    pub validators: Vec<NodeId>,
    pub inner_sets: Vec<QuorumSetPayload>,
}

impl QuorumSetPayload {
    /// Deterministic content hash; used to request and dedupe quorum sets.
    pub fn hash(&self) -> Hash {
        let bytes = bincode::serialize(self).expect("quorum set is always serializable");
        hash_content(&bytes)
    }
}

/// Which consensus statement an SCP envelope carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScpStatementKind {
    Nominate,
    Prepare,
    Confirm,
    Externalize,
}

impl ScpStatementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nominate => "SCP::NOMINATE",
            Self::Prepare => "SCP::PREPARE",
            Self::Confirm => "SCP::CONFIRM",
            Self::Externalize => "SCP::EXTERNALIZE",
        }
    }
}

/// A signed consensus statement from one validator for one slot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScpEnvelope {
    pub node_id: NodeId,
    pub slot_index: u32,
    pub kind: ScpStatementKind,
    pub statement: Vec<u8>,
    pub sig: Signature,
}

/// A relayed network-survey request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SurveyRequest {
    pub surveyor: NodeId,
    pub surveyed: NodeId,
    pub ledger_num: u32,
    pub payload: Vec<u8>,
}

/// A relayed network-survey response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SurveyResponse {
    pub surveyor: NodeId,
    pub surveyed: NodeId,
    pub ledger_num: u32,
    pub payload: Vec<u8>,
}

/// An advert: "I have these transactions, demand the ones you want".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FloodAdvert {
    pub tx_hashes: Vec<Hash>,
}

/// A demand: "send me the bodies for these hashes".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FloodDemand {
    pub tx_hashes: Vec<Hash>,
}

/// Top-level overlay message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    Error(ErrorMsg),
    Hello(Hello),
    Auth(AuthPayload),
    DontHave(DontHave),
    GetPeers,
    Peers(Vec<PeerAddress>),
    GetTxSet(Hash),
    TxSet(TxSetPayload),
    GeneralizedTxSet(GeneralizedTxSetPayload),
    Transaction(TxEnvelope),
    GetScpQuorumSet(Hash),
    ScpQuorumSet(QuorumSetPayload),
    ScpMessage(ScpEnvelope),
    GetScpState(u32),
    SurveyRequest(SurveyRequest),
    SurveyResponse(SurveyResponse),
    SendMore { num_messages: u64 },
    SendMoreExtended { num_messages: u64, num_bytes: u64 },
    FloodAdvert(FloodAdvert),
    FloodDemand(FloodDemand),
}

impl Message {
    /// The discriminant of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Error(_) => MessageKind::Error,
            Self::Hello(_) => MessageKind::Hello,
            Self::Auth(_) => MessageKind::Auth,
            Self::DontHave(_) => MessageKind::DontHave,
            Self::GetPeers => MessageKind::GetPeers,
            Self::Peers(_) => MessageKind::Peers,
            Self::GetTxSet(_) => MessageKind::GetTxSet,
            Self::TxSet(_) => MessageKind::TxSet,
            Self::GeneralizedTxSet(_) => MessageKind::GeneralizedTxSet,
            Self::Transaction(_) => MessageKind::Transaction,
            Self::GetScpQuorumSet(_) => MessageKind::GetScpQuorumSet,
            Self::ScpQuorumSet(_) => MessageKind::ScpQuorumSet,
            Self::ScpMessage(_) => MessageKind::ScpMessage,
            Self::GetScpState(_) => MessageKind::GetScpState,
            Self::SurveyRequest(_) => MessageKind::SurveyRequest,
            Self::SurveyResponse(_) => MessageKind::SurveyResponse,
            Self::SendMore { .. } => MessageKind::SendMore,
            Self::SendMoreExtended { .. } => MessageKind::SendMoreExtended,
            Self::FloodAdvert(_) => MessageKind::FloodAdvert,
            Self::FloodDemand(_) => MessageKind::FloodDemand,
        }
    }

    /// Whether this message is flood-class and therefore subject to
    /// flow-control credit.
    pub fn is_flood(&self) -> bool {
        matches!(
            self,
            Self::Transaction(_) | Self::ScpMessage(_) | Self::FloodAdvert(_) | Self::FloodDemand(_)
        )
    }

    /// Compact one-line description for trace logging.
    pub fn summary(&self) -> String {
        match self {
            Self::Error(e) => format!("{} ({})", e.code.as_str(), e.msg),
            Self::Hello(_) => "HELLO".into(),
            Self::Auth(_) => "AUTH".into(),
            Self::DontHave(dh) => format!("DONTHAVE {}:{}", dh.kind, dh.req_hash.abbrev()),
            Self::GetPeers => "GETPEERS".into(),
            Self::Peers(p) => format!("PEERS {}", p.len()),
            Self::GetTxSet(h) => format!("GETTXSET {}", h.abbrev()),
            Self::TxSet(_) | Self::GeneralizedTxSet(_) => "TXSET".into(),
            Self::Transaction(_) => "TRANSACTION".into(),
            Self::GetScpQuorumSet(h) => format!("GET_SCP_QSET {}", h.abbrev()),
            Self::ScpQuorumSet(_) => "SCP_QSET".into(),
            Self::ScpMessage(env) => format!("{} ({})", env.kind.as_str(), env.node_id),
            Self::GetScpState(seq) => format!("GET_SCP_STATE {}", seq),
            Self::SurveyRequest(_) => "SURVEY_REQUEST".into(),
            Self::SurveyResponse(_) => "SURVEY_RESPONSE".into(),
            Self::SendMore { num_messages } => format!("SENDMORE {}", num_messages),
            Self::SendMoreExtended {
                num_messages,
                num_bytes,
            } => format!("SENDMORE_EXTENDED {} {}b", num_messages, num_bytes),
            Self::FloodAdvert(adv) => format!("FLOODADVERT {}", adv.tx_hashes.len()),
            Self::FloodDemand(dmd) => format!("FLOODDEMAND {}", dmd.tx_hashes.len()),
        }
    }
}
