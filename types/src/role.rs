//! Connection role — who dialed whom.

use serde::{Deserialize, Serialize};

/// The role this node played when the connection was established.
///
/// The role decides handshake sequencing (the dialer speaks first) and the
/// direction tag mixed into MAC key derivation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    /// We dialed the remote node.
    WeCalledRemote,
    /// The remote node dialed us.
    RemoteCalledUs,
}

impl PeerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WeCalledRemote => "WE_CALLED_REMOTE",
            Self::RemoteCalledUs => "REMOTE_CALLED_US",
        }
    }

    /// Whether this side initiated the TCP connection.
    pub fn is_initiator(&self) -> bool {
        matches!(self, Self::WeCalledRemote)
    }
}
