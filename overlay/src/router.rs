//! Inbound message categorization.
//!
//! Every authenticated inbound message is assigned a category that decides
//! how it is dispatched: handshake messages run inline on the read path,
//! everything else is posted to the scheduler under a task class. Flood
//! traffic is droppable and discarded outright while the ledger is out of
//! sync.

use keel_wire::MessageKind;

/// Scheduler task class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskClass {
    /// Must run; queued without bound.
    Normal,
    /// May be shed under load.
    Droppable,
}

/// Dispatch category for an inbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageCategory {
    /// HELLO / AUTH — processed synchronously on the receiving task.
    Handshake,
    /// Peer management and credit grants.
    Control,
    /// High-volume transaction flooding.
    FloodTx,
    /// Fetch requests from the peer (they want data from us).
    ConsensusFetch,
    /// Consensus data addressed to us.
    Consensus,
    /// Network survey relay.
    Survey,
}

/// Routing decision for one message kind.
#[derive(Clone, Copy, Debug)]
pub struct Route {
    pub category: MessageCategory,
    pub class: TaskClass,
    /// Discard without processing when the ledger is not synced.
    pub ignore_if_out_of_sync: bool,
    /// Short label used in task names and trace logs.
    pub label: &'static str,
}

/// Categorize a message kind.
///
/// TX_SET and GENERALIZED_TX_SET are deliberately routed identically: both
/// are consensus data and both feed the same collaborator entry point.
pub fn route(kind: MessageKind) -> Route {
    match kind {
        MessageKind::Hello | MessageKind::Auth => Route {
            category: MessageCategory::Handshake,
            class: TaskClass::Normal,
            ignore_if_out_of_sync: false,
            label: "HSK",
        },
        MessageKind::GetPeers
        | MessageKind::Peers
        | MessageKind::Error
        | MessageKind::SendMore
        | MessageKind::SendMoreExtended => Route {
            category: MessageCategory::Control,
            class: TaskClass::Normal,
            ignore_if_out_of_sync: false,
            label: "CTRL",
        },
        MessageKind::Transaction | MessageKind::FloodAdvert | MessageKind::FloodDemand => Route {
            category: MessageCategory::FloodTx,
            class: TaskClass::Droppable,
            ignore_if_out_of_sync: true,
            label: "TX",
        },
        MessageKind::GetTxSet | MessageKind::GetScpQuorumSet | MessageKind::GetScpState => Route {
            category: MessageCategory::ConsensusFetch,
            class: TaskClass::Droppable,
            ignore_if_out_of_sync: false,
            label: "SCPQ",
        },
        MessageKind::DontHave
        | MessageKind::TxSet
        | MessageKind::GeneralizedTxSet
        | MessageKind::ScpQuorumSet
        | MessageKind::ScpMessage => Route {
            category: MessageCategory::Consensus,
            class: TaskClass::Normal,
            ignore_if_out_of_sync: false,
            label: "SCP",
        },
        MessageKind::SurveyRequest | MessageKind::SurveyResponse => Route {
            category: MessageCategory::Survey,
            class: TaskClass::Normal,
            ignore_if_out_of_sync: false,
            label: "SURV",
        },
    }
}
