//! Overlay configuration with TOML file support.

use keel_types::NetworkId;
use serde::{Deserialize, Serialize};

use crate::OverlayError;

/// Configuration for the overlay core.
///
/// Can be loaded from a TOML file via [`OverlayConfig::from_toml_file`] or
/// built programmatically (e.g. for tests). Every field has a serde default
/// so partial files work.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Which network this node belongs to.
    #[serde(default = "default_network")]
    pub network: NetworkId,

    /// Ledger protocol version advertised in HELLO.
    #[serde(default = "default_ledger_version")]
    pub ledger_version: u32,

    /// Current overlay protocol version.
    #[serde(default = "default_overlay_version")]
    pub overlay_version: u32,

    /// Oldest overlay protocol version this node still speaks.
    #[serde(default = "default_overlay_min_version")]
    pub overlay_min_version: u32,

    /// Free-form software version string advertised in HELLO.
    #[serde(default = "default_version_str")]
    pub version_str: String,

    /// Port this node accepts overlay connections on.
    #[serde(default = "default_listening_port")]
    pub listening_port: u16,

    /// Initial (and maximum outstanding) flood-message credit granted to a
    /// peer.
    #[serde(default = "default_flood_reading_capacity")]
    pub peer_flood_reading_capacity: u64,

    /// Total in-flight message budget per peer (flood + non-flood).
    #[serde(default = "default_reading_capacity")]
    pub peer_reading_capacity: u64,

    /// Processed-message count that triggers a SEND_MORE grant.
    #[serde(default = "default_send_more_batch_size")]
    pub flow_control_send_more_batch_size: u64,

    /// Initial flood-byte credit granted to a peer when the byte axis is
    /// negotiated.
    #[serde(default = "default_flood_reading_capacity_bytes")]
    pub peer_flood_reading_capacity_bytes: u64,

    /// Processed-byte count that triggers a SEND_MORE_EXTENDED grant.
    #[serde(default = "default_send_more_batch_size_bytes")]
    pub flow_control_send_more_batch_size_bytes: u64,

    /// Whether this node requests byte-axis flow control in AUTH.
    #[serde(default = "default_true")]
    pub enable_flow_control_bytes: bool,

    /// IO idle timeout for authenticated peers, in seconds.
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_secs: u64,

    /// IO idle timeout during the handshake, in seconds.
    #[serde(default = "default_auth_timeout")]
    pub peer_auth_timeout_secs: u64,

    /// How long a peer may fail to drain our write queue before it is
    /// dropped as a straggler, in seconds.
    #[serde(default = "default_straggler_timeout")]
    pub peer_straggler_timeout_secs: u64,

    /// How long the peer may go without granting outbound credit after AUTH
    /// before the connection is considered flow-idle, in seconds.
    #[serde(default = "default_flow_idle_timeout")]
    pub flow_idle_timeout_secs: u64,

    /// How long adverts accumulate before a batch is flushed, in
    /// milliseconds.
    #[serde(default = "default_advert_period_ms")]
    pub flood_advert_period_ms: u64,

    /// Advert batch size that triggers an immediate flush.
    #[serde(default = "default_max_advert_size")]
    pub max_advert_size: usize,

    /// Bound on the per-peer advert history cache.
    #[serde(default = "default_advert_cache_size")]
    pub advert_cache_size: usize,

    /// Bound on the buffered incoming adverts awaiting the tx fetcher.
    #[serde(default = "default_incoming_advert_buffer")]
    pub incoming_advert_buffer: usize,

    /// Write-queue length at which the outbound path is considered
    /// overloaded and droppable-class sends are shed.
    #[serde(default = "default_send_queue_overload_len")]
    pub send_queue_overload_len: usize,

    /// Bound on queued droppable-class scheduler tasks before load shedding.
    #[serde(default = "default_droppable_task_limit")]
    pub droppable_task_queue_limit: usize,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_network() -> NetworkId {
    NetworkId::Dev
}

fn default_ledger_version() -> u32 {
    20
}

fn default_overlay_version() -> u32 {
    30
}

fn default_overlay_min_version() -> u32 {
    27
}

fn default_version_str() -> String {
    "keel-core dev".to_string()
}

fn default_listening_port() -> u16 {
    NetworkId::Dev.default_port()
}

fn default_flood_reading_capacity() -> u64 {
    200
}

fn default_reading_capacity() -> u64 {
    300
}

fn default_send_more_batch_size() -> u64 {
    40
}

fn default_flood_reading_capacity_bytes() -> u64 {
    300_000
}

fn default_send_more_batch_size_bytes() -> u64 {
    100_000
}

fn default_true() -> bool {
    true
}

fn default_peer_timeout() -> u64 {
    30
}

fn default_auth_timeout() -> u64 {
    2
}

fn default_straggler_timeout() -> u64 {
    120
}

fn default_flow_idle_timeout() -> u64 {
    60
}

fn default_advert_period_ms() -> u64 {
    100
}

fn default_max_advert_size() -> usize {
    100
}

fn default_advert_cache_size() -> usize {
    50_000
}

fn default_incoming_advert_buffer() -> usize {
    4096
}

fn default_send_queue_overload_len() -> usize {
    128
}

fn default_droppable_task_limit() -> usize {
    1000
}

// ── Impl ───────────────────────────────────────────────────────────────

impl OverlayConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &str) -> Result<Self, OverlayError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| OverlayError::Config(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, OverlayError> {
        toml::from_str(s).map_err(|e| OverlayError::Config(e.to_string()))
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml_string(&self) -> String {
        toml::to_string_pretty(self).expect("OverlayConfig is always serializable to TOML")
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            ledger_version: default_ledger_version(),
            overlay_version: default_overlay_version(),
            overlay_min_version: default_overlay_min_version(),
            version_str: default_version_str(),
            listening_port: default_listening_port(),
            peer_flood_reading_capacity: default_flood_reading_capacity(),
            peer_reading_capacity: default_reading_capacity(),
            flow_control_send_more_batch_size: default_send_more_batch_size(),
            peer_flood_reading_capacity_bytes: default_flood_reading_capacity_bytes(),
            flow_control_send_more_batch_size_bytes: default_send_more_batch_size_bytes(),
            enable_flow_control_bytes: default_true(),
            peer_timeout_secs: default_peer_timeout(),
            peer_auth_timeout_secs: default_auth_timeout(),
            peer_straggler_timeout_secs: default_straggler_timeout(),
            flow_idle_timeout_secs: default_flow_idle_timeout(),
            flood_advert_period_ms: default_advert_period_ms(),
            max_advert_size: default_max_advert_size(),
            advert_cache_size: default_advert_cache_size(),
            incoming_advert_buffer: default_incoming_advert_buffer(),
            send_queue_overload_len: default_send_queue_overload_len(),
            droppable_task_queue_limit: default_droppable_task_limit(),
        }
    }
}
