//! The authenticated envelope every frame carries.

use crate::message::Message;
use serde::{Deserialize, Serialize};

/// A wire frame: a message plus its MAC sequence and MAC.
///
/// HELLO and ERROR_MSG travel with `sequence = 0` and an all-zero MAC; every
/// other message is authenticated with the per-direction session key over
/// `(sequence || encoded message)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthenticatedMessage {
    pub sequence: u64,
    pub mac: [u8; 32],
    pub message: Message,
}

impl AuthenticatedMessage {
    /// Wrap a message that is sent outside the MAC sequence (HELLO,
    /// ERROR_MSG).
    pub fn unauthenticated(message: Message) -> Self {
        Self {
            sequence: 0,
            mac: [0u8; 32],
            message,
        }
    }
}
