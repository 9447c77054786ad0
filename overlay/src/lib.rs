//! Peer-to-peer overlay core for the keel validator.
//!
//! Turns a raw duplex byte stream into an authenticated, flow-controlled,
//! ordered stream of typed protocol messages. The overlay owns the handshake,
//! the per-message MAC sequence, two-axis credit flow control, the pull-based
//! transaction flood protocol, and connection liveness; everything else
//! (consensus, ledger, peer discovery) is reached through the collaborator
//! traits in [`collaborators`].

pub mod advert;
pub mod collaborators;
pub mod config;
pub mod driver;
pub mod error;
pub mod flow_control;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod session;
pub mod state;

pub use config::OverlayConfig;
pub use error::OverlayError;
pub use session::{DropDirection, DropMode, PeerSession};
pub use state::PeerState;
