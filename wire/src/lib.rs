//! Wire protocol for the keel validator overlay.
//!
//! Defines the `Message` union every overlay frame carries, the
//! `AuthenticatedMessage` envelope that wraps it with a MAC sequence, and the
//! length-prefixed binary codec used on the socket.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod message;

pub use codec::{
    decode_envelope, encode_frame, encoded_body_size, read_frame, write_frame, MAX_MESSAGE_SIZE,
};
pub use envelope::AuthenticatedMessage;
pub use error::WireError;
pub use message::{
    AuthPayload, DontHave, ErrorCode, ErrorMsg, FloodAdvert, FloodDemand, GeneralizedTxSetPayload,
    Hello, Message, MessageKind, PeerAddress, QuorumSetPayload, ScpEnvelope, ScpStatementKind,
    SurveyRequest, SurveyResponse, TxEnvelope, TxSetPayload,
    AUTH_FLAG_FLOW_CONTROL_BYTES_REQUESTED, PEERS_VECTOR_MAX_SIZE, TX_ADVERT_VECTOR_MAX_SIZE,
    TX_DEMAND_VECTOR_MAX_SIZE,
};
