//! Prometheus metrics for the overlay.
//!
//! [`OverlayMetrics`] owns a dedicated [`Registry`] covering traffic volume,
//! flow control, flood fulfillment, and drop causes across all connections.
//! Per-peer counters live in the lightweight [`PeerMetrics`] struct inside
//! each session and are snapshotted on demand.

use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, Histogram, HistogramOpts, IntCounter, IntCounterVec,
    Opts, Registry,
};
use serde::Serialize;

/// Central collection of overlay-level Prometheus metrics.
pub struct OverlayMetrics {
    /// The Prometheus registry that owns every metric below.
    pub registry: Registry,

    // ── Traffic ─────────────────────────────────────────────────────────
    /// Total messages read from peers.
    pub message_read: IntCounter,
    /// Total messages written to peers.
    pub message_write: IntCounter,
    /// Messages read, labeled by wire message type.
    pub message_read_by_type: IntCounterVec,
    /// Messages written, labeled by wire message type.
    pub message_write_by_type: IntCounterVec,
    /// Total bytes read from peers.
    pub byte_read: IntCounter,
    /// Total bytes written to peers.
    pub byte_write: IntCounter,
    /// Messages dropped by outbound load shedding.
    pub message_drop: IntCounter,

    // ── Liveness ────────────────────────────────────────────────────────
    /// Connections dropped for plain idleness.
    pub timeout_idle: IntCounter,
    /// Connections dropped for flow-control idleness.
    pub timeout_flow_idle: IntCounter,
    /// Connections dropped as stragglers.
    pub timeout_straggler: IntCounter,

    // ── Flood fulfillment ───────────────────────────────────────────────
    /// Demands answered with a transaction.
    pub flood_fulfilled: IntCounter,
    /// Demands for transactions we have banned.
    pub flood_unfulfilled_banned: IntCounter,
    /// Demands for transactions we do not know.
    pub flood_unfulfilled_unknown: IntCounter,
    /// Transaction hashes demanded from peers.
    pub messages_demanded: IntCounter,

    // ── Flood reception ─────────────────────────────────────────────────
    /// Pulled transactions the consensus engine accepted as new.
    pub pulled_relevant_txs: IntCounter,
    /// Pulled transactions that were duplicates or rejected.
    pub pulled_irrelevant_txs: IntCounter,

    // ── Flow control ────────────────────────────────────────────────────
    /// SEND_MORE / SEND_MORE_EXTENDED grants sent.
    pub send_more_sent: IntCounter,
    /// Times reading from a peer was suspended for lack of capacity.
    pub reads_throttled: IntCounter,

    // ── Histograms ──────────────────────────────────────────────────────
    /// Ping round-trip time, in milliseconds.
    pub connection_latency_ms: Histogram,
    /// Time flood messages waited in the outbound queue for credit, in
    /// milliseconds.
    pub flow_control_queue_delay_ms: Histogram,
}

impl OverlayMetrics {
    /// Create a fresh set of metrics, all registered under a new
    /// [`Registry`].
    pub fn new() -> Self {
        let registry = Registry::new();

        let message_read = register_int_counter_with_registry!(
            Opts::new("overlay_message_read_total", "Messages read from peers"),
            registry
        )
        .expect("failed to register message_read counter");

        let message_write = register_int_counter_with_registry!(
            Opts::new("overlay_message_write_total", "Messages written to peers"),
            registry
        )
        .expect("failed to register message_write counter");

        let message_read_by_type = register_int_counter_vec_with_registry!(
            Opts::new("overlay_message_read_by_type", "Messages read, per type"),
            &["type"],
            registry
        )
        .expect("failed to register message_read_by_type counter");

        let message_write_by_type = register_int_counter_vec_with_registry!(
            Opts::new("overlay_message_write_by_type", "Messages written, per type"),
            &["type"],
            registry
        )
        .expect("failed to register message_write_by_type counter");

        let byte_read = register_int_counter_with_registry!(
            Opts::new("overlay_byte_read_total", "Bytes read from peers"),
            registry
        )
        .expect("failed to register byte_read counter");

        let byte_write = register_int_counter_with_registry!(
            Opts::new("overlay_byte_write_total", "Bytes written to peers"),
            registry
        )
        .expect("failed to register byte_write counter");

        let message_drop = register_int_counter_with_registry!(
            Opts::new(
                "overlay_message_drop_total",
                "Outbound messages dropped by load shedding"
            ),
            registry
        )
        .expect("failed to register message_drop counter");

        let timeout_idle = register_int_counter_with_registry!(
            Opts::new("overlay_timeout_idle_total", "Idle-timeout drops"),
            registry
        )
        .expect("failed to register timeout_idle counter");

        let timeout_flow_idle = register_int_counter_with_registry!(
            Opts::new(
                "overlay_timeout_flow_idle_total",
                "Flow-control idle-timeout drops"
            ),
            registry
        )
        .expect("failed to register timeout_flow_idle counter");

        let timeout_straggler = register_int_counter_with_registry!(
            Opts::new("overlay_timeout_straggler_total", "Straggler drops"),
            registry
        )
        .expect("failed to register timeout_straggler counter");

        let flood_fulfilled = register_int_counter_with_registry!(
            Opts::new(
                "overlay_flood_fulfilled_total",
                "Demands answered with a transaction"
            ),
            registry
        )
        .expect("failed to register flood_fulfilled counter");

        let flood_unfulfilled_banned = register_int_counter_with_registry!(
            Opts::new(
                "overlay_flood_unfulfilled_banned_total",
                "Demands for banned transactions"
            ),
            registry
        )
        .expect("failed to register flood_unfulfilled_banned counter");

        let flood_unfulfilled_unknown = register_int_counter_with_registry!(
            Opts::new(
                "overlay_flood_unfulfilled_unknown_total",
                "Demands for unknown transactions"
            ),
            registry
        )
        .expect("failed to register flood_unfulfilled_unknown counter");

        let messages_demanded = register_int_counter_with_registry!(
            Opts::new(
                "overlay_messages_demanded_total",
                "Transaction hashes demanded from peers"
            ),
            registry
        )
        .expect("failed to register messages_demanded counter");

        let pulled_relevant_txs = register_int_counter_with_registry!(
            Opts::new(
                "overlay_pulled_relevant_txs_total",
                "Pulled transactions accepted as new"
            ),
            registry
        )
        .expect("failed to register pulled_relevant_txs counter");

        let pulled_irrelevant_txs = register_int_counter_with_registry!(
            Opts::new(
                "overlay_pulled_irrelevant_txs_total",
                "Pulled transactions that were duplicate or rejected"
            ),
            registry
        )
        .expect("failed to register pulled_irrelevant_txs counter");

        let send_more_sent = register_int_counter_with_registry!(
            Opts::new("overlay_send_more_sent_total", "Credit grants sent"),
            registry
        )
        .expect("failed to register send_more_sent counter");

        let reads_throttled = register_int_counter_with_registry!(
            Opts::new(
                "overlay_reads_throttled_total",
                "Reads suspended for lack of flow-control capacity"
            ),
            registry
        )
        .expect("failed to register reads_throttled counter");

        let connection_latency_ms = register_histogram_with_registry!(
            HistogramOpts::new(
                "overlay_connection_latency_ms",
                "Ping round-trip time in milliseconds"
            )
            .buckets(prometheus::exponential_buckets(1.0, 2.0, 12).unwrap()),
            registry
        )
        .expect("failed to register connection_latency_ms histogram");

        let flow_control_queue_delay_ms = register_histogram_with_registry!(
            HistogramOpts::new(
                "overlay_flow_control_queue_delay_ms",
                "Outbound credit-wait time in milliseconds"
            )
            .buckets(prometheus::exponential_buckets(0.1, 2.0, 15).unwrap()),
            registry
        )
        .expect("failed to register flow_control_queue_delay_ms histogram");

        Self {
            registry,
            message_read,
            message_write,
            message_read_by_type,
            message_write_by_type,
            byte_read,
            byte_write,
            message_drop,
            timeout_idle,
            timeout_flow_idle,
            timeout_straggler,
            flood_fulfilled,
            flood_unfulfilled_banned,
            flood_unfulfilled_unknown,
            messages_demanded,
            pulled_relevant_txs,
            pulled_irrelevant_txs,
            send_more_sent,
            reads_throttled,
            connection_latency_ms,
            flow_control_queue_delay_ms,
        }
    }
}

impl Default for OverlayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain per-peer counters, owned by the session.
#[derive(Debug, Default)]
pub struct PeerMetrics {
    pub message_read: u64,
    pub message_write: u64,
    pub byte_read: u64,
    pub byte_write: u64,
    pub message_drop: u64,
    pub tx_hashes_received: u64,
    pub tx_demands_sent: u64,
    pub messages_fulfilled: u64,
    pub banned_unfulfilled: u64,
    pub unknown_unfulfilled: u64,
}

/// Serializable snapshot of one connection, for diagnostics endpoints.
#[derive(Debug, Serialize)]
pub struct PeerInfoSnapshot {
    pub address: String,
    pub state: &'static str,
    pub elapsed_secs: u64,
    pub latency_ms: Option<u64>,
    pub remote_version: Option<String>,
    pub remote_overlay_version: Option<u32>,
    pub message_read: u64,
    pub message_write: u64,
    pub byte_read: u64,
    pub byte_write: u64,
    pub message_drop: u64,
    pub tx_hashes_received: u64,
    pub tx_demands_sent: u64,
    pub messages_fulfilled: u64,
    pub banned_unfulfilled: u64,
    pub unknown_unfulfilled: u64,
    pub flow_queued: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_cleanly() {
        let metrics = OverlayMetrics::new();
        metrics.message_read.inc();
        metrics.byte_read.inc_by(128);
        metrics.connection_latency_ms.observe(42.0);
        assert_eq!(metrics.message_read.get(), 1);
        assert_eq!(metrics.byte_read.get(), 128);
    }

    #[test]
    fn gathered_families_use_overlay_prefix() {
        let metrics = OverlayMetrics::new();
        metrics.flood_fulfilled.inc();
        for family in metrics.registry.gather() {
            assert!(family.get_name().starts_with("overlay_"));
        }
    }
}
