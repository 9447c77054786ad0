//! Peer session — composition of handshake, flow control, routing, adverts,
//! timers, and drop semantics for one connection.
//!
//! The session is a sans-IO core: inbound frames are fed to
//! [`PeerSession::handle_frame`], outbound frames accumulate in an internal
//! queue that the driver writes to the socket, and timer callbacks are
//! explicit methods taking `now`. All state mutation happens under the
//! session lock; deferred work re-enters through the epoch-guarded registry.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_crypto::{
    derive_mac_keys, hash_content, hmac_sha256, hmac_sha256_verify, make_auth_cert,
    verify_auth_cert, EphemeralKeys, SessionMacKeys,
};
use keel_types::{Hash, KeyPair, NodeId, PeerRole, Timestamp};
use keel_wire::{
    decode_envelope, encode_frame, AuthenticatedMessage, AuthPayload, DontHave, ErrorCode,
    ErrorMsg, FloodAdvert, FloodDemand, Hello, Message, MessageKind, PeerAddress,
    QuorumSetPayload, ScpEnvelope, TxEnvelope, AUTH_FLAG_FLOW_CONTROL_BYTES_REQUESTED,
    PEERS_VECTOR_MAX_SIZE,
};
use rand::RngCore;
use tokio::sync::Notify;

use crate::advert::AdvertEngine;
use crate::collaborators::{
    BackOffUpdate, BanList, ConsensusEngine, EnvelopeStatus, Ledger, PeerDirectory, PeerKind,
    PeerRoster, SurveyManager, TxAddResult, TxSetFrame,
};
use crate::config::OverlayConfig;
use crate::error::OverlayError;
use crate::flow_control::{FlowController, FIRST_VERSION_SUPPORTING_FLOW_CONTROL_IN_BYTES};
use crate::metrics::{OverlayMetrics, PeerInfoSnapshot, PeerMetrics};
use crate::registry::SessionToken;
use crate::router::{route, MessageCategory, TaskClass};
use crate::state::PeerState;

/// Period of the session's recurring liveness timer.
pub const RECURRENT_TIMER_PERIOD: Duration = Duration::from_secs(5);

/// Cap on addresses we volunteer in a PEERS message.
const PEERS_TO_SEND_MAX: usize = 50;

/// Ledger protocol era from which missing tx sets are reported as
/// GENERALIZED_TX_SET in DONT_HAVE.
const FIRST_LEDGER_VERSION_WITH_GENERALIZED_TX_SET: u32 = 20;

/// What to do with queued writes when dropping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropMode {
    /// Drain the write queue first (the peer should see a final ERROR).
    FlushWriteQueue,
    /// Close immediately, abandoning queued writes.
    IgnoreWriteQueue,
}

/// Who initiated the teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropDirection {
    WeDroppedRemote,
    RemoteDroppedUs,
}

/// Teardown record, set exactly once.
#[derive(Clone, Debug)]
pub struct DropInfo {
    pub reason: String,
    pub direction: DropDirection,
    pub mode: DropMode,
}

/// Everything the overlay reaches outside itself.
#[derive(Clone)]
pub struct Collaborators {
    pub ban_list: Arc<dyn BanList>,
    pub directory: Arc<dyn PeerDirectory>,
    pub consensus: Arc<dyn ConsensusEngine>,
    pub ledger: Arc<dyn Ledger>,
    pub survey: Arc<dyn SurveyManager>,
    pub roster: Arc<dyn PeerRoster>,
}

/// What we learned about the remote node from its HELLO.
struct RemoteInfo {
    node_id: NodeId,
    overlay_version: u32,
    version_str: String,
    address: PeerAddress,
}

/// A frame ready for the socket, stamped with its enqueue time.
pub struct OutboundFrame {
    pub bytes: Vec<u8>,
    pub enqueued_at: Instant,
}

/// An inbound message that must be posted to the scheduler.
pub struct PendingDispatch {
    pub message: Message,
    pub class: TaskClass,
    pub label: &'static str,
}

/// Wake handles for the driver and writer tasks of a session.
///
/// `notify_one` stores a permit, so a wake issued while the task is between
/// waits is not lost.
#[derive(Clone, Default)]
pub struct SessionWaker {
    pub driver: Arc<Notify>,
    pub writer: Arc<Notify>,
}

impl SessionWaker {
    pub fn new() -> Self {
        Self::default()
    }

    fn wake_all(&self) {
        self.driver.notify_one();
        self.writer.notify_one();
    }
}

/// One authenticated, flow-controlled peer connection.
pub struct PeerSession {
    cfg: OverlayConfig,
    role: PeerRole,
    state: PeerState,
    identity: Arc<KeyPair>,
    eph: EphemeralKeys,
    local_nonce: [u8; 32],
    mac_keys: Option<SessionMacKeys>,
    send_mac_seq: u64,
    recv_mac_seq: u64,
    flow: FlowController,
    advert: AdvertEngine,
    remote: Option<RemoteInfo>,
    peer_ip: String,
    deps: Collaborators,
    metrics: Arc<OverlayMetrics>,
    peer_metrics: PeerMetrics,
    token: Option<SessionToken>,
    outbound: VecDeque<OutboundFrame>,
    created_at: Instant,
    last_read: Instant,
    last_write: Instant,
    /// Enqueue time of the most recently completed write; ages while the
    /// peer fails to drain our queue.
    last_write_enqueued: Instant,
    ping_sent: Option<Instant>,
    last_ping: Option<Duration>,
    throttled: bool,
    shutting_down: bool,
    drop_info: Option<DropInfo>,
    waker: Option<SessionWaker>,
}

impl PeerSession {
    pub fn new(
        cfg: OverlayConfig,
        role: PeerRole,
        peer_ip: String,
        identity: Arc<KeyPair>,
        deps: Collaborators,
        metrics: Arc<OverlayMetrics>,
        now: Instant,
    ) -> Self {
        let mut local_nonce = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut local_nonce);
        let flow = FlowController::new(&cfg);
        let advert = AdvertEngine::new(
            cfg.advert_cache_size,
            cfg.max_advert_size,
            Duration::from_millis(cfg.flood_advert_period_ms),
            cfg.incoming_advert_buffer,
        );
        Self {
            role,
            state: match role {
                PeerRole::WeCalledRemote => PeerState::Connecting,
                PeerRole::RemoteCalledUs => PeerState::Connected,
            },
            identity,
            eph: EphemeralKeys::generate(),
            local_nonce,
            mac_keys: None,
            send_mac_seq: 0,
            recv_mac_seq: 0,
            flow,
            advert,
            remote: None,
            peer_ip,
            deps,
            metrics,
            peer_metrics: PeerMetrics::default(),
            token: None,
            outbound: VecDeque::new(),
            created_at: now,
            last_read: now,
            last_write: now,
            last_write_enqueued: now,
            ping_sent: None,
            last_ping: None,
            throttled: false,
            shutting_down: false,
            drop_info: None,
            waker: None,
            cfg,
        }
    }

    /// Attach the driver/writer wake handles.
    pub fn set_waker(&mut self, waker: SessionWaker) {
        self.waker = Some(waker);
    }

    fn wake(&self) {
        if let Some(waker) = &self.waker {
            waker.wake_all();
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == PeerState::GotAuth
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self.state, PeerState::Connecting | PeerState::Closing)
    }

    pub fn should_abort(&self) -> bool {
        self.state == PeerState::Closing || self.shutting_down
    }

    pub fn remote_node_id(&self) -> Option<&NodeId> {
        self.remote.as_ref().map(|r| &r.node_id)
    }

    pub fn remote_address(&self) -> Option<&PeerAddress> {
        self.remote.as_ref().map(|r| &r.address)
    }

    pub fn drop_info(&self) -> Option<&DropInfo> {
        self.drop_info.as_ref()
    }

    pub fn last_ping(&self) -> Option<Duration> {
        self.last_ping
    }

    pub fn is_throttled(&self) -> bool {
        self.throttled
    }

    /// Sequence number the next authenticated send will carry.
    pub fn send_mac_seq(&self) -> u64 {
        self.send_mac_seq
    }

    /// Sequence number the next authenticated receive must carry.
    pub fn recv_mac_seq(&self) -> u64 {
        self.recv_mac_seq
    }

    pub fn set_token(&mut self, token: SessionToken) {
        self.token = Some(token);
    }

    pub fn token(&self) -> Option<SessionToken> {
        self.token
    }

    fn peer_tag(&self) -> String {
        match &self.remote {
            Some(r) => format!("{}@{}", r.node_id, r.address),
            None => self.peer_ip.clone(),
        }
    }

    /// Diagnostics snapshot of this connection.
    pub fn info(&self, now: Instant) -> PeerInfoSnapshot {
        PeerInfoSnapshot {
            address: self
                .remote
                .as_ref()
                .map(|r| r.address.to_string())
                .unwrap_or_else(|| self.peer_ip.clone()),
            state: self.state.as_str(),
            elapsed_secs: now.saturating_duration_since(self.created_at).as_secs(),
            latency_ms: self.last_ping.map(|d| d.as_millis() as u64),
            remote_version: self.remote.as_ref().map(|r| r.version_str.clone()),
            remote_overlay_version: self.remote.as_ref().map(|r| r.overlay_version),
            message_read: self.peer_metrics.message_read,
            message_write: self.peer_metrics.message_write,
            byte_read: self.peer_metrics.byte_read,
            byte_write: self.peer_metrics.byte_write,
            message_drop: self.peer_metrics.message_drop,
            tx_hashes_received: self.peer_metrics.tx_hashes_received,
            tx_demands_sent: self.peer_metrics.tx_demands_sent,
            messages_fulfilled: self.peer_metrics.messages_fulfilled,
            banned_unfulfilled: self.peer_metrics.banned_unfulfilled,
            unknown_unfulfilled: self.peer_metrics.unknown_unfulfilled,
            flow_queued: self.flow.queued_len(),
        }
    }

    // ── Outbound plumbing ───────────────────────────────────────────────

    /// Next frame for the socket writer, if any.
    pub fn take_outbound(&mut self) -> Option<OutboundFrame> {
        self.outbound.pop_front()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    /// The driver reports a completed socket write.
    pub fn on_frame_written(&mut self, frame_enqueued_at: Instant, now: Instant) {
        self.last_write = now;
        self.last_write_enqueued = frame_enqueued_at;
    }

    fn send_queue_is_overloaded(&self) -> bool {
        self.outbound.len() >= self.cfg.send_queue_overload_len
    }

    /// Whether flow control permits reading another frame.
    pub fn can_read(&self) -> bool {
        self.flow.can_read()
    }

    // ── Connection start ────────────────────────────────────────────────

    /// The outbound dial completed; say HELLO.
    pub fn on_connected(&mut self, now: Instant) {
        if self.should_abort() {
            return;
        }
        if self.role == PeerRole::WeCalledRemote {
            tracing::debug!(peer = %self.peer_tag(), "connected");
            self.state = PeerState::Connected;
            self.send_hello(now);
        }
    }

    fn send_hello(&mut self, now: Instant) {
        tracing::debug!(peer = %self.peer_tag(), "sending HELLO");
        let cert = make_auth_cert(
            self.cfg.network,
            &self.identity,
            self.eph.public,
            Timestamp::now(),
        );
        let hello = Message::Hello(Hello {
            ledger_version: self.cfg.ledger_version,
            overlay_min_version: self.cfg.overlay_min_version,
            overlay_version: self.cfg.overlay_version,
            version_str: self.cfg.version_str.clone(),
            network_id: self.cfg.network,
            listening_port: self.cfg.listening_port,
            peer_id: self.identity.public.clone(),
            cert,
            nonce: self.local_nonce,
        });
        self.send_message(hello, TaskClass::Normal, now);
    }

    fn send_auth(&mut self, now: Instant) {
        let flags = if self.flow.bytes_requested() {
            AUTH_FLAG_FLOW_CONTROL_BYTES_REQUESTED
        } else {
            0
        };
        self.send_message(Message::Auth(AuthPayload { flags }), TaskClass::Normal, now);
    }

    // ── Sending ─────────────────────────────────────────────────────────

    /// Public send path. Applies load shedding, then flow control, then the
    /// MAC and framing. Never blocks; messages without credit queue inside
    /// the flow controller.
    pub fn send_message(&mut self, message: Message, class: TaskClass, now: Instant) {
        if self.shutting_down {
            return;
        }
        if class == TaskClass::Droppable && self.send_queue_is_overloaded() {
            self.metrics.message_drop.inc();
            self.peer_metrics.message_drop += 1;
            return;
        }
        tracing::trace!(peer = %self.peer_tag(), msg = %message.summary(), "send");

        let released = self.flow.submit(message, now);
        for item in released {
            self.metrics
                .flow_control_queue_delay_ms
                .observe(item.queue_delay.as_secs_f64() * 1000.0);
            self.send_authenticated(item.message, now);
        }
    }

    /// MAC, frame, and enqueue one message for the wire.
    fn send_authenticated(&mut self, message: Message, now: Instant) {
        let kind = message.kind();
        let envelope = if matches!(kind, MessageKind::Hello | MessageKind::Error) {
            AuthenticatedMessage::unauthenticated(message)
        } else {
            let Some(keys) = &self.mac_keys else {
                tracing::warn!(peer = %self.peer_tag(), msg = %kind, "no session keys for authenticated send");
                return;
            };
            let body = match bincode_body(&message) {
                Some(body) => body,
                None => return,
            };
            let sequence = self.send_mac_seq;
            let mac = hmac_sha256(&keys.send, sequence, &body);
            self.send_mac_seq += 1;
            AuthenticatedMessage {
                sequence,
                mac,
                message,
            }
        };

        match encode_frame(&envelope) {
            Ok(bytes) => {
                self.metrics.message_write.inc();
                self.metrics
                    .message_write_by_type
                    .with_label_values(&[kind.as_str()])
                    .inc();
                self.metrics.byte_write.inc_by(bytes.len() as u64);
                self.peer_metrics.message_write += 1;
                self.peer_metrics.byte_write += bytes.len() as u64;
                self.outbound.push_back(OutboundFrame {
                    bytes,
                    enqueued_at: now,
                });
                self.wake();
            }
            Err(e) => {
                tracing::warn!(peer = %self.peer_tag(), error = %e, "failed to frame message");
                self.drop_peer(
                    &format!("unable to frame message: {e}"),
                    DropDirection::WeDroppedRemote,
                    DropMode::IgnoreWriteQueue,
                );
            }
        }
    }

    fn send_error(&mut self, code: ErrorCode, msg: &str, now: Instant) {
        self.send_message(
            Message::Error(ErrorMsg {
                code,
                msg: msg.to_string(),
            }),
            TaskClass::Normal,
            now,
        );
    }

    /// Send ERROR_MSG, then drop with the same reason.
    pub fn send_error_and_drop(
        &mut self,
        code: ErrorCode,
        msg: &str,
        mode: DropMode,
        now: Instant,
    ) {
        self.send_error(code, msg, now);
        self.drop_peer(msg, DropDirection::WeDroppedRemote, mode);
    }

    fn send_dont_have(
        &mut self,
        kind: MessageKind,
        req_hash: Hash,
        class: TaskClass,
        now: Instant,
    ) {
        self.send_message(Message::DontHave(DontHave { kind, req_hash }), class, now);
    }

    fn send_peers(&mut self, now: Instant) {
        let Some(remote) = &self.remote else {
            return;
        };
        let exclude = remote.address.clone();
        let mut peers = self
            .deps
            .directory
            .peers_to_send(PEERS_TO_SEND_MAX.min(PEERS_VECTOR_MAX_SIZE), &exclude);
        peers.truncate(PEERS_VECTOR_MAX_SIZE);
        if !peers.is_empty() {
            self.send_message(Message::Peers(peers), TaskClass::Normal, now);
        }
    }

    // ── Inbound path ────────────────────────────────────────────────────

    fn mac_required(&self) -> bool {
        matches!(self.state, PeerState::GotHello | PeerState::GotAuth)
    }

    /// Feed one raw frame body from the socket.
    ///
    /// Verifies the MAC sequence, accounts flow-control credit, and either
    /// processes handshake messages inline or returns a dispatch for the
    /// scheduler. `None` means the frame was fully handled here (or the
    /// connection is now dropping — check [`Self::drop_info`]).
    pub fn handle_frame(&mut self, bytes: &[u8], now: Instant) -> Option<PendingDispatch> {
        if self.should_abort() {
            return None;
        }
        self.last_read = now;
        self.metrics.message_read.inc();
        self.metrics.byte_read.inc_by(bytes.len() as u64);
        self.peer_metrics.message_read += 1;
        self.peer_metrics.byte_read += bytes.len() as u64;

        let envelope = match decode_envelope(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.drop_peer(
                    &format!("malformed frame: {e}"),
                    DropDirection::WeDroppedRemote,
                    DropMode::IgnoreWriteQueue,
                );
                return None;
            }
        };

        let kind = envelope.message.kind();
        self.metrics
            .message_read_by_type
            .with_label_values(&[kind.as_str()])
            .inc();
        if self.mac_required() && kind != MessageKind::Error {
            if envelope.sequence != self.recv_mac_seq {
                self.recv_mac_seq += 1;
                self.send_error_and_drop(
                    ErrorCode::Auth,
                    &OverlayError::OutOfOrderMessage.to_string(),
                    DropMode::IgnoreWriteQueue,
                    now,
                );
                return None;
            }
            let verified = match (&self.mac_keys, bincode_body(&envelope.message)) {
                (Some(keys), Some(body)) => {
                    hmac_sha256_verify(&envelope.mac, &keys.recv, envelope.sequence, &body)
                }
                _ => false,
            };
            if !verified {
                self.recv_mac_seq += 1;
                self.send_error_and_drop(
                    ErrorCode::Auth,
                    &OverlayError::MacMismatch.to_string(),
                    DropMode::IgnoreWriteQueue,
                    now,
                );
                return None;
            }
            self.recv_mac_seq += 1;
        }

        let message = envelope.message;
        let r = route(kind);
        if r.category == MessageCategory::Handshake {
            self.recv_raw_message(&message, TaskClass::Normal, now);
            return None;
        }

        if let Err(e) = self.flow.begin_message_processing(&message) {
            self.drop_peer(
                &e.to_string(),
                DropDirection::WeDroppedRemote,
                DropMode::IgnoreWriteQueue,
            );
            return None;
        }
        if !self.flow.can_read() && !self.throttled {
            self.throttled = true;
            self.metrics.reads_throttled.inc();
            tracing::debug!(peer = %self.peer_tag(), "throttling reads, no flow-control capacity");
        }

        if r.ignore_if_out_of_sync && !self.deps.ledger.is_synced() {
            // Cannot verify flood traffic while rebuilding state; the credit
            // still goes back.
            self.finish_message_processing(&message, now);
            return None;
        }

        Some(PendingDispatch {
            message,
            class: r.class,
            label: r.label,
        })
    }

    /// Execute a dispatched message and return its flow-control credit.
    pub fn process_message(&mut self, message: &Message, class: TaskClass, now: Instant) {
        self.recv_raw_message(message, class, now);
        self.finish_message_processing(message, now);
    }

    /// Return the credit of a dispatch that will never execute (shed by the
    /// scheduler).
    pub fn discard_dispatch(&mut self, message: &Message, now: Instant) {
        self.finish_message_processing(message, now);
    }

    fn finish_message_processing(&mut self, message: &Message, now: Instant) {
        if self.should_abort() {
            return;
        }
        if let Some(grant) = self.flow.end_message_processing(message) {
            self.metrics.send_more_sent.inc();
            self.send_message(grant, TaskClass::Normal, now);
        }
        if self.throttled && self.flow.can_read() {
            self.throttled = false;
            tracing::debug!(peer = %self.peer_tag(), "stop throttling reads");
            self.wake();
        }
    }

    fn recv_raw_message(&mut self, message: &Message, class: TaskClass, now: Instant) {
        if self.should_abort() {
            return;
        }
        let kind = message.kind();
        if !self.is_authenticated()
            && !matches!(
                kind,
                MessageKind::Hello | MessageKind::Auth | MessageKind::Error
            )
        {
            self.drop_peer(
                &OverlayError::BeforeHandshake(kind).to_string(),
                DropDirection::WeDroppedRemote,
                DropMode::IgnoreWriteQueue,
            );
            return;
        }
        tracing::trace!(peer = %self.peer_tag(), msg = %message.summary(), "recv");

        match message {
            Message::Error(e) => self.recv_error(e),
            Message::Hello(hello) => self.recv_hello(hello, now),
            Message::Auth(auth) => self.recv_auth(auth, now),
            Message::DontHave(dh) => self.recv_dont_have(dh, now),
            Message::GetPeers => self.send_peers(now),
            Message::Peers(list) => self.recv_peers(list),
            Message::GetTxSet(hash) => self.recv_get_tx_set(*hash, class, now),
            Message::TxSet(set) => {
                let frame = TxSetFrame::Classic(set.clone());
                self.deps.consensus.recv_tx_set(frame.content_hash(), frame);
            }
            Message::GeneralizedTxSet(set) => {
                let frame = TxSetFrame::Generalized(set.clone());
                self.deps.consensus.recv_tx_set(frame.content_hash(), frame);
            }
            Message::Transaction(tx) => self.recv_transaction(tx),
            Message::GetScpQuorumSet(hash) => self.recv_get_scp_quorumset(*hash, class, now),
            Message::ScpQuorumSet(qset) => self.recv_scp_quorumset(qset, now),
            Message::ScpMessage(envelope) => self.recv_scp_message(envelope),
            Message::GetScpState(seq) => self.recv_get_scp_state(*seq, class, now),
            Message::SurveyRequest(req) => {
                if let Some(remote) = &self.remote {
                    self.deps.survey.relay_or_process_request(req, &remote.node_id);
                }
            }
            Message::SurveyResponse(resp) => {
                if let Some(remote) = &self.remote {
                    self.deps
                        .survey
                        .relay_or_process_response(resp, &remote.node_id);
                }
            }
            Message::SendMore { .. } | Message::SendMoreExtended { .. } => {
                self.recv_send_more(message, now)
            }
            Message::FloodAdvert(advert) => self.recv_flood_advert(advert),
            Message::FloodDemand(demand) => self.recv_flood_demand(demand, class, now),
        }
    }

    // ── Handshake handlers ──────────────────────────────────────────────

    fn recv_hello(&mut self, hello: &Hello, now: Instant) {
        if matches!(self.state, PeerState::GotHello | PeerState::GotAuth) {
            self.drop_peer(
                &OverlayError::UnexpectedHello.to_string(),
                DropDirection::WeDroppedRemote,
                DropMode::IgnoreWriteQueue,
            );
            return;
        }
        if !verify_auth_cert(self.cfg.network, &hello.peer_id, &hello.cert, Timestamp::now()) {
            self.drop_peer(
                &OverlayError::BadCert.to_string(),
                DropDirection::WeDroppedRemote,
                DropMode::IgnoreWriteQueue,
            );
            return;
        }
        if self.deps.ban_list.is_banned(&hello.peer_id) {
            self.drop_peer(
                &OverlayError::BannedPeer.to_string(),
                DropDirection::WeDroppedRemote,
                DropMode::IgnoreWriteQueue,
            );
            return;
        }

        self.mac_keys = Some(derive_mac_keys(
            &self.eph,
            &hello.cert.session_public,
            self.role,
            &self.local_nonce,
            &hello.nonce,
        ));
        self.send_mac_seq = 0;
        self.recv_mac_seq = 0;

        let address = PeerAddress {
            ip: self.peer_ip.clone(),
            port: hello.listening_port,
        };
        self.remote = Some(RemoteInfo {
            node_id: hello.peer_id.clone(),
            overlay_version: hello.overlay_version,
            version_str: hello.version_str.clone(),
            address: address.clone(),
        });
        self.state = match self.state.advance(PeerState::GotHello) {
            Ok(state) => state,
            Err(e) => {
                self.drop_peer(
                    &e.to_string(),
                    DropDirection::WeDroppedRemote,
                    DropMode::IgnoreWriteQueue,
                );
                return;
            }
        };
        tracing::debug!(peer = %self.peer_tag(), "received HELLO");

        let mut drop_mode = DropMode::IgnoreWriteQueue;
        if self.role == PeerRole::RemoteCalledUs {
            // Echo HELLO even if an error follows: ERROR is an authenticated
            // type and the dialer cannot decode it while still expecting an
            // unauthenticated HELLO.
            self.send_hello(now);
            drop_mode = DropMode::FlushWriteQueue;
        }

        if hello.overlay_min_version > hello.overlay_version
            || hello.overlay_version < self.cfg.overlay_min_version
            || hello.overlay_min_version > self.cfg.overlay_version
        {
            tracing::debug!(
                peer = %self.peer_tag(),
                remote_min = hello.overlay_min_version,
                remote = hello.overlay_version,
                local_min = self.cfg.overlay_min_version,
                local = self.cfg.overlay_version,
                "overlay version ranges do not overlap"
            );
            self.send_error_and_drop(
                ErrorCode::Conf,
                &OverlayError::VersionMismatch.to_string(),
                drop_mode,
                now,
            );
            return;
        }
        if hello.peer_id == self.identity.public {
            self.send_error_and_drop(
                ErrorCode::Conf,
                &OverlayError::SelfConnect.to_string(),
                drop_mode,
                now,
            );
            return;
        }
        if hello.network_id != self.cfg.network {
            tracing::warn!(
                peer = %self.peer_tag(),
                remote_network = hello.network_id.as_str(),
                "connection from peer on a different network"
            );
            self.send_error_and_drop(
                ErrorCode::Conf,
                &OverlayError::WrongNetwork.to_string(),
                drop_mode,
                now,
            );
            return;
        }
        if hello.listening_port == 0 {
            self.send_error_and_drop(
                ErrorCode::Conf,
                &OverlayError::BadAddress.to_string(),
                DropMode::IgnoreWriteQueue,
                now,
            );
            return;
        }

        let kind = if self.role == PeerRole::WeCalledRemote {
            PeerKind::Outbound
        } else {
            PeerKind::Inbound
        };
        self.deps.directory.update(&address, kind);

        if let Some(token) = self.token {
            if self.deps.roster.is_duplicate(&hello.peer_id, token) {
                let msg = OverlayError::DuplicatePeer(hello.peer_id.to_string()).to_string();
                self.send_error_and_drop(ErrorCode::Conf, &msg, drop_mode, now);
                return;
            }
        }

        if self.role == PeerRole::WeCalledRemote {
            self.send_auth(now);
        }
    }

    fn recv_auth(&mut self, auth: &AuthPayload, now: Instant) {
        if self.state != PeerState::GotHello {
            self.send_error_and_drop(
                ErrorCode::Misc,
                &OverlayError::OutOfOrderAuth.to_string(),
                DropMode::IgnoreWriteQueue,
                now,
            );
            return;
        }
        self.state = match self.state.advance(PeerState::GotAuth) {
            Ok(state) => state,
            Err(e) => {
                self.drop_peer(
                    &e.to_string(),
                    DropDirection::WeDroppedRemote,
                    DropMode::IgnoreWriteQueue,
                );
                return;
            }
        };

        if self.role == PeerRole::RemoteCalledUs {
            self.send_auth(now);
            self.send_peers(now);
        }

        let (remote_version, remote_id, address) = match &self.remote {
            Some(r) => (r.overlay_version, r.node_id.clone(), r.address.clone()),
            None => {
                self.drop_peer(
                    "AUTH without HELLO state",
                    DropDirection::WeDroppedRemote,
                    DropMode::IgnoreWriteQueue,
                );
                return;
            }
        };
        if self.role == PeerRole::WeCalledRemote {
            self.deps
                .directory
                .update_backoff(&address, BackOffUpdate::Reset);
        }
        tracing::debug!(peer = %self.peer_tag(), "successful handshake");

        if let Some(token) = self.token {
            if !self.deps.roster.accept_authenticated(&remote_id, token) {
                self.send_error_and_drop(
                    ErrorCode::Load,
                    &OverlayError::PeerRejected.to_string(),
                    DropMode::FlushWriteQueue,
                    now,
                );
                return;
            }
        }

        // After successful auth the initial credit grant goes out first, so
        // the peer learns our reading capacity before any other traffic.
        let both_support = self.cfg.overlay_version
            >= FIRST_VERSION_SUPPORTING_FLOW_CONTROL_IN_BYTES
            && remote_version >= FIRST_VERSION_SUPPORTING_FLOW_CONTROL_IN_BYTES;
        let enable_bytes = both_support
            && auth.flags == AUTH_FLAG_FLOW_CONTROL_BYTES_REQUESTED
            && self.flow.bytes_requested();
        let grant = self.flow.start(enable_bytes, now);
        self.metrics.send_more_sent.inc();
        self.send_message(grant, TaskClass::Normal, now);

        let low = self.deps.consensus.min_ledger_seq_to_ask_peers();
        self.send_message(Message::GetScpState(low), TaskClass::Normal, now);
    }

    fn recv_error(&mut self, error: &ErrorMsg) {
        let sanitized: String = error
            .msg
            .chars()
            .map(|c| if c.is_alphanumeric() || c == ' ' { c } else { '*' })
            .collect();
        self.drop_peer(
            &format!("{} ({})", error.code.as_str(), sanitized),
            DropDirection::RemoteDroppedUs,
            DropMode::IgnoreWriteQueue,
        );
    }

    // ── Control handlers ────────────────────────────────────────────────

    fn recv_send_more(&mut self, message: &Message, now: Instant) {
        match self.flow.on_send_more(message, now) {
            Ok(released) => {
                for item in released {
                    self.metrics
                        .flow_control_queue_delay_ms
                        .observe(item.queue_delay.as_secs_f64() * 1000.0);
                    self.send_authenticated(item.message, now);
                }
            }
            Err(e) => {
                self.drop_peer(
                    &e.to_string(),
                    DropDirection::WeDroppedRemote,
                    DropMode::IgnoreWriteQueue,
                );
            }
        }
    }

    fn recv_peers(&mut self, peers: &[PeerAddress]) {
        for peer in peers {
            if peer.port == 0 {
                tracing::debug!(peer = %self.peer_tag(), addr = %peer, "ignoring received peer with bad port");
                continue;
            }
            if peer.ip == self.peer_ip && peer.port == self.cfg.listening_port {
                tracing::debug!(peer = %self.peer_tag(), addr = %peer, "ignoring received self-address");
                continue;
            }
            self.deps.directory.ensure_exists(peer);
        }
    }

    // ── Consensus handlers ──────────────────────────────────────────────

    fn recv_dont_have(&mut self, dont_have: &DontHave, now: Instant) {
        self.maybe_process_ping_response(&dont_have.req_hash, now);
        if let Some(remote) = &self.remote {
            self.deps
                .consensus
                .peer_doesnt_have(dont_have.kind, &dont_have.req_hash, &remote.node_id);
        }
    }

    fn recv_get_tx_set(&mut self, hash: Hash, class: TaskClass, now: Instant) {
        match self.deps.consensus.get_tx_set(&hash) {
            Some(frame) => {
                let message = frame.into_message();
                self.send_message(message, class, now);
            }
            None => {
                // The exact kind of the missing set is unknown; answer with
                // the kind matching the current ledger protocol era.
                let kind = if self.deps.ledger.last_closed_header().ledger_version
                    >= FIRST_LEDGER_VERSION_WITH_GENERALIZED_TX_SET
                {
                    MessageKind::GeneralizedTxSet
                } else {
                    MessageKind::TxSet
                };
                self.send_dont_have(kind, hash, class, now);
            }
        }
    }

    fn recv_transaction(&mut self, tx: &TxEnvelope) {
        match self.deps.consensus.recv_transaction(tx) {
            TxAddResult::Pending => {
                tracing::trace!(peer = %self.peer_tag(), hash = %tx.hash().abbrev(), "received unique transaction");
                self.metrics.pulled_relevant_txs.inc();
            }
            TxAddResult::Duplicate => {
                tracing::trace!(peer = %self.peer_tag(), hash = %tx.hash().abbrev(), "received duplicate transaction");
                self.metrics.pulled_irrelevant_txs.inc();
            }
            TxAddResult::Rejected => {
                tracing::debug!(peer = %self.peer_tag(), hash = %tx.hash().abbrev(), "discarded transaction");
                self.metrics.pulled_irrelevant_txs.inc();
            }
        }
    }

    fn recv_get_scp_quorumset(&mut self, hash: Hash, class: TaskClass, now: Instant) {
        match self.deps.consensus.get_quorum_set(&hash) {
            Some(qset) => self.send_message(Message::ScpQuorumSet(qset), class, now),
            None => {
                tracing::trace!(peer = %self.peer_tag(), hash = %hash.abbrev(), "no quorum set");
                self.send_dont_have(MessageKind::ScpQuorumSet, hash, class, now);
            }
        }
    }

    fn recv_scp_quorumset(&mut self, qset: &QuorumSetPayload, now: Instant) {
        let hash = qset.hash();
        self.maybe_process_ping_response(&hash, now);
        self.deps.consensus.recv_quorum_set(hash, qset);
    }

    fn recv_scp_message(&mut self, envelope: &ScpEnvelope) {
        let status = self.deps.consensus.recv_scp_envelope(envelope);
        if status == EnvelopeStatus::Discarded {
            tracing::trace!(
                peer = %self.peer_tag(),
                slot = envelope.slot_index,
                "SCP envelope discarded"
            );
        }
    }

    fn recv_get_scp_state(&mut self, ledger_seq: u32, class: TaskClass, now: Instant) {
        let messages = self.deps.consensus.scp_state_for_peer(ledger_seq);
        for message in messages {
            self.send_message(message, class, now);
        }
    }

    // ── Flood handlers ──────────────────────────────────────────────────

    fn recv_flood_advert(&mut self, advert: &FloodAdvert) {
        let seq = self.deps.consensus.tracking_consensus_ledger_index();
        self.peer_metrics.tx_hashes_received += advert.tx_hashes.len() as u64;
        let queued = self.advert.record_incoming(&advert.tx_hashes, seq);
        tracing::trace!(
            peer = %self.peer_tag(),
            received = advert.tx_hashes.len(),
            queued,
            "received flood advert"
        );
    }

    fn recv_flood_demand(&mut self, demand: &FloodDemand, class: TaskClass, now: Instant) {
        for hash in &demand.tx_hashes {
            if let Some(tx) = self.deps.consensus.get_tx(hash) {
                tracing::trace!(peer = %self.peer_tag(), hash = %hash.abbrev(), "fulfilled demand");
                self.metrics.flood_fulfilled.inc();
                self.peer_metrics.messages_fulfilled += 1;
                self.send_message(Message::Transaction(tx), class, now);
            } else if self.deps.consensus.is_banned_tx(hash) {
                tracing::trace!(peer = %self.peer_tag(), hash = %hash.abbrev(), "demand for banned tx");
                self.metrics.flood_unfulfilled_banned.inc();
                self.peer_metrics.banned_unfulfilled += 1;
            } else {
                tracing::trace!(peer = %self.peer_tag(), hash = %hash.abbrev(), "demand for unknown tx");
                self.metrics.flood_unfulfilled_unknown.inc();
                self.peer_metrics.unknown_unfulfilled += 1;
            }
        }
    }

    // ── Advert API ──────────────────────────────────────────────────────

    /// The local transaction pool has a new hash for this peer.
    pub fn queue_tx_hash_to_advertise(&mut self, hash: Hash, now: Instant) {
        if self.should_abort() || !self.is_authenticated() {
            return;
        }
        if self.advert.peer_knows(&hash) {
            return;
        }
        if let Some(message) = self.advert.queue_outgoing(hash, now) {
            self.send_advert(message, now);
        }
    }

    /// When the advert flush timer should next fire.
    pub fn advert_flush_deadline(&self) -> Option<Instant> {
        if self.should_abort() {
            None
        } else {
            self.advert.flush_deadline()
        }
    }

    /// Flush the pending advert batch.
    pub fn flush_advert(&mut self, now: Instant) {
        if self.should_abort() {
            return;
        }
        if let Some(message) = self.advert.flush() {
            self.send_advert(message, now);
        }
    }

    fn send_advert(&mut self, message: Message, now: Instant) {
        let seq = self.deps.consensus.tracking_consensus_ledger_index();
        if let Message::FloodAdvert(advert) = &message {
            for hash in &advert.tx_hashes {
                self.advert.remember(*hash, seq);
            }
        }
        self.send_message(message, TaskClass::Normal, now);
    }

    /// Demand transaction bodies from this peer (called by the tx fetcher).
    pub fn send_tx_demand(&mut self, tx_hashes: Vec<Hash>, now: Instant) {
        if tx_hashes.is_empty() || self.should_abort() {
            return;
        }
        self.metrics.messages_demanded.inc_by(tx_hashes.len() as u64);
        self.peer_metrics.tx_demands_sent += 1;
        self.send_message(
            Message::FloodDemand(FloodDemand { tx_hashes }),
            TaskClass::Normal,
            now,
        );
    }

    /// Next advertised hash awaiting the transaction fetcher.
    pub fn pop_incoming_advert(&mut self) -> Option<Hash> {
        self.advert.pop_incoming()
    }

    /// Whether this peer is known to have seen `hash`.
    pub fn peer_knows_hash(&self, hash: &Hash) -> bool {
        self.advert.peer_knows(hash)
    }

    /// Prune advert memory below a sealed ledger.
    pub fn clear_advert_history_below(&mut self, ledger_seq: u32) {
        self.advert.clear_below(ledger_seq);
    }

    /// The network raised the maximum transaction size; widen the byte axis.
    pub fn handle_max_tx_size_increase(&mut self, increase: u32, now: Instant) {
        if increase == 0 || self.should_abort() {
            return;
        }
        if let Some(grant) = self.flow.handle_tx_size_increase(increase) {
            self.metrics.send_more_sent.inc();
            self.send_message(grant, TaskClass::Normal, now);
        }
    }

    // ── Ping ────────────────────────────────────────────────────────────

    fn ping_id(&self, at: Instant) -> Hash {
        let nanos = at.saturating_duration_since(self.created_at).as_nanos() as u64;
        hash_content(&nanos.to_be_bytes())
    }

    fn maybe_ping(&mut self, now: Instant) {
        if self.is_authenticated() && self.ping_sent.is_none() {
            self.ping_sent = Some(now);
            let id = self.ping_id(now);
            self.send_message(Message::GetScpQuorumSet(id), TaskClass::Normal, now);
        }
    }

    fn maybe_process_ping_response(&mut self, id: &Hash, now: Instant) {
        let Some(sent) = self.ping_sent else {
            return;
        };
        if self.ping_id(sent) != *id {
            return;
        }
        let rtt = now.saturating_duration_since(sent);
        self.last_ping = Some(rtt);
        self.ping_sent = None;
        self.metrics
            .connection_latency_ms
            .observe(rtt.as_secs_f64() * 1000.0);
        tracing::debug!(peer = %self.peer_tag(), latency_ms = rtt.as_millis() as u64, "measured ping");
    }

    // ── Timers, drop, shutdown ──────────────────────────────────────────

    /// Recurring liveness check; the driver calls this every
    /// [`RECURRENT_TIMER_PERIOD`].
    pub fn tick(&mut self, now: Instant) {
        if self.should_abort() {
            return;
        }
        self.maybe_ping(now);

        let io_timeout = if self.is_authenticated() {
            Duration::from_secs(self.cfg.peer_timeout_secs)
        } else {
            Duration::from_secs(self.cfg.peer_auth_timeout_secs)
        };
        let straggler_timeout = Duration::from_secs(self.cfg.peer_straggler_timeout_secs);
        let flow_idle_timeout = Duration::from_secs(self.cfg.flow_idle_timeout_secs);

        if now.saturating_duration_since(self.last_read) >= io_timeout
            && now.saturating_duration_since(self.last_write) >= io_timeout
        {
            self.metrics.timeout_idle.inc();
            self.drop_peer(
                "idle timeout",
                DropDirection::WeDroppedRemote,
                DropMode::IgnoreWriteQueue,
            );
        } else if self.is_authenticated() && self.flow.is_flow_idle(now, flow_idle_timeout) {
            self.metrics.timeout_flow_idle.inc();
            self.drop_peer(
                "idle timeout (no new flood requests)",
                DropDirection::WeDroppedRemote,
                DropMode::IgnoreWriteQueue,
            );
        } else if now.saturating_duration_since(self.last_write_enqueued) >= straggler_timeout {
            self.metrics.timeout_straggler.inc();
            self.drop_peer(
                "straggling (cannot keep up)",
                DropDirection::WeDroppedRemote,
                DropMode::IgnoreWriteQueue,
            );
        }
    }

    /// Tear the connection down. Idempotent; the first call wins.
    ///
    /// Queued writes stay in place — the driver drains them for
    /// [`DropMode::FlushWriteQueue`] and abandons them for
    /// [`DropMode::IgnoreWriteQueue`].
    pub fn drop_peer(&mut self, reason: &str, direction: DropDirection, mode: DropMode) {
        if self.state == PeerState::Closing {
            return;
        }
        tracing::info!(
            peer = %self.peer_tag(),
            %reason,
            direction = ?direction,
            "dropping connection"
        );
        self.state = PeerState::Closing;
        self.shutting_down = true;
        self.drop_info = Some(DropInfo {
            reason: reason.to_string(),
            direction,
            mode,
        });
        if let Some(token) = self.token {
            self.deps.roster.release(token);
        }
        if self.role == PeerRole::WeCalledRemote && direction == DropDirection::WeDroppedRemote {
            if let Some(remote) = &self.remote {
                self.deps
                    .directory
                    .update_backoff(&remote.address, BackOffUpdate::Increase);
            }
        }
        self.wake();
    }

    /// Stop all timer-driven activity. After this, no tick, flush, or ping
    /// will do anything.
    pub fn shutdown(&mut self) {
        self.shutting_down = true;
    }
}

fn bincode_body(message: &Message) -> Option<Vec<u8>> {
    match bincode::serialize(message) {
        Ok(body) => Some(body),
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode message body");
            None
        }
    }
}
