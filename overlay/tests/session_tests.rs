//! End-to-end session tests: two in-memory peers exchanging frames directly,
//! with collaborator doubles and a manual clock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use keel_crypto::generate_keypair;
use keel_types::{Hash, KeyPair, NodeId, PeerRole};
use keel_wire::{
    decode_envelope, encode_frame, AuthenticatedMessage, ErrorCode, Message, MessageKind,
    PeerAddress, QuorumSetPayload, ScpEnvelope, ScpStatementKind, SurveyRequest, SurveyResponse,
    TxEnvelope,
};

use keel_overlay::collaborators::{
    BackOffUpdate, BanList, ConsensusEngine, EnvelopeStatus, Ledger, LedgerHeader, PeerDirectory,
    PeerKind, PeerRoster, SurveyManager, TxAddResult, TxSetFrame,
};
use keel_overlay::metrics::OverlayMetrics;
use keel_overlay::registry::{SessionHandle, SessionRegistry, SessionToken};
use keel_overlay::router::TaskClass;
use keel_overlay::session::{Collaborators, DropDirection, DropMode, PeerSession};
use keel_overlay::{OverlayConfig, PeerState};

// ── Collaborator doubles ───────────────────────────────────────────────

#[derive(Default)]
struct MockBanList {
    banned: Mutex<HashSet<NodeId>>,
}

impl BanList for MockBanList {
    fn is_banned(&self, id: &NodeId) -> bool {
        self.banned.lock().unwrap().contains(id)
    }
}

#[derive(Default)]
struct MockDirectory {
    updates: Mutex<Vec<(PeerAddress, PeerKind)>>,
    backoffs: Mutex<Vec<(PeerAddress, BackOffUpdate)>>,
    known: Mutex<Vec<PeerAddress>>,
    to_send: Mutex<Vec<PeerAddress>>,
}

impl PeerDirectory for MockDirectory {
    fn update(&self, address: &PeerAddress, kind: PeerKind) {
        self.updates.lock().unwrap().push((address.clone(), kind));
    }

    fn update_backoff(&self, address: &PeerAddress, update: BackOffUpdate) {
        self.backoffs.lock().unwrap().push((address.clone(), update));
    }

    fn ensure_exists(&self, address: &PeerAddress) {
        self.known.lock().unwrap().push(address.clone());
    }

    fn peers_to_send(&self, max: usize, exclude: &PeerAddress) -> Vec<PeerAddress> {
        self.to_send
            .lock()
            .unwrap()
            .iter()
            .filter(|a| *a != exclude)
            .take(max)
            .cloned()
            .collect()
    }
}

#[derive(Default)]
struct MockConsensus {
    txs: Mutex<HashMap<Hash, TxEnvelope>>,
    banned_txs: Mutex<HashSet<Hash>>,
    received_txs: Mutex<Vec<Hash>>,
    received_envelopes: Mutex<Vec<u32>>,
    quorum_sets: Mutex<HashMap<Hash, QuorumSetPayload>>,
    dont_haves: Mutex<Vec<(MessageKind, Hash)>>,
    tracking_seq: Mutex<u32>,
}

impl ConsensusEngine for MockConsensus {
    fn recv_scp_envelope(&self, envelope: &ScpEnvelope) -> EnvelopeStatus {
        self.received_envelopes
            .lock()
            .unwrap()
            .push(envelope.slot_index);
        EnvelopeStatus::Processed
    }

    fn recv_tx_set(&self, _hash: Hash, _frame: TxSetFrame) {}

    fn recv_quorum_set(&self, _hash: Hash, _qset: &QuorumSetPayload) {}

    fn recv_transaction(&self, tx: &TxEnvelope) -> TxAddResult {
        let hash = tx.hash();
        let mut seen = self.received_txs.lock().unwrap();
        if seen.contains(&hash) {
            TxAddResult::Duplicate
        } else {
            seen.push(hash);
            TxAddResult::Pending
        }
    }

    fn get_tx_set(&self, _hash: &Hash) -> Option<TxSetFrame> {
        None
    }

    fn get_quorum_set(&self, hash: &Hash) -> Option<QuorumSetPayload> {
        self.quorum_sets.lock().unwrap().get(hash).cloned()
    }

    fn get_tx(&self, hash: &Hash) -> Option<TxEnvelope> {
        self.txs.lock().unwrap().get(hash).cloned()
    }

    fn is_banned_tx(&self, hash: &Hash) -> bool {
        self.banned_txs.lock().unwrap().contains(hash)
    }

    fn scp_state_for_peer(&self, _ledger_seq: u32) -> Vec<Message> {
        Vec::new()
    }

    fn min_ledger_seq_to_ask_peers(&self) -> u32 {
        1
    }

    fn tracking_consensus_ledger_index(&self) -> u32 {
        *self.tracking_seq.lock().unwrap()
    }

    fn peer_doesnt_have(&self, kind: MessageKind, hash: &Hash, _peer: &NodeId) {
        self.dont_haves.lock().unwrap().push((kind, *hash));
    }
}

struct MockLedger {
    synced: Mutex<bool>,
}

impl Default for MockLedger {
    fn default() -> Self {
        Self {
            synced: Mutex::new(true),
        }
    }
}

impl Ledger for MockLedger {
    fn is_synced(&self) -> bool {
        *self.synced.lock().unwrap()
    }

    fn last_closed_header(&self) -> LedgerHeader {
        LedgerHeader {
            seq: 100,
            hash: Hash::new([9; 32]),
            ledger_version: 20,
        }
    }
}

#[derive(Default)]
struct MockSurvey {
    requests: Mutex<Vec<SurveyRequest>>,
    responses: Mutex<Vec<SurveyResponse>>,
}

impl SurveyManager for MockSurvey {
    fn relay_or_process_request(&self, request: &SurveyRequest, _peer: &NodeId) {
        self.requests.lock().unwrap().push(request.clone());
    }

    fn relay_or_process_response(&self, response: &SurveyResponse, _peer: &NodeId) {
        self.responses.lock().unwrap().push(response.clone());
    }
}

struct MockRoster {
    accept: Mutex<bool>,
    duplicates: Mutex<HashSet<NodeId>>,
    released: Mutex<Vec<SessionToken>>,
}

impl Default for MockRoster {
    fn default() -> Self {
        Self {
            accept: Mutex::new(true),
            duplicates: Mutex::new(HashSet::new()),
            released: Mutex::new(Vec::new()),
        }
    }
}

impl PeerRoster for MockRoster {
    fn is_duplicate(&self, id: &NodeId, _own: SessionToken) -> bool {
        self.duplicates.lock().unwrap().contains(id)
    }

    fn accept_authenticated(&self, _id: &NodeId, _token: SessionToken) -> bool {
        *self.accept.lock().unwrap()
    }

    fn release(&self, token: SessionToken) {
        self.released.lock().unwrap().push(token);
    }
}

// ── Harness ────────────────────────────────────────────────────────────

struct Peer {
    session: PeerSession,
    node_id: NodeId,
    consensus: Arc<MockConsensus>,
    directory: Arc<MockDirectory>,
    ban_list: Arc<MockBanList>,
    roster: Arc<MockRoster>,
    survey: Arc<MockSurvey>,
    ledger: Arc<MockLedger>,
    metrics: Arc<OverlayMetrics>,
}

fn test_cfg(bytes: bool) -> OverlayConfig {
    OverlayConfig {
        enable_flow_control_bytes: bytes,
        peer_flood_reading_capacity: 50,
        peer_reading_capacity: 100,
        flow_control_send_more_batch_size: 10,
        ..OverlayConfig::default()
    }
}

fn make_peer(role: PeerRole, cfg: OverlayConfig, identity: Arc<KeyPair>, now: Instant) -> Peer {
    let ban_list = Arc::new(MockBanList::default());
    let directory = Arc::new(MockDirectory::default());
    let consensus = Arc::new(MockConsensus::default());
    let ledger = Arc::new(MockLedger::default());
    let survey = Arc::new(MockSurvey::default());
    let roster = Arc::new(MockRoster::default());
    let metrics = Arc::new(OverlayMetrics::new());
    let deps = Collaborators {
        ban_list: ban_list.clone(),
        directory: directory.clone(),
        consensus: consensus.clone(),
        ledger: ledger.clone(),
        survey: survey.clone(),
        roster: roster.clone(),
    };
    let node_id = identity.public.clone();
    let session = PeerSession::new(
        cfg,
        role,
        "192.0.2.1".to_string(),
        identity,
        deps,
        metrics.clone(),
        now,
    );
    Peer {
        session,
        node_id,
        consensus,
        directory,
        ban_list,
        roster,
        survey,
        ledger,
        metrics,
    }
}

fn pair(bytes: bool, now: Instant) -> (Peer, Peer) {
    let a = make_peer(
        PeerRole::WeCalledRemote,
        test_cfg(bytes),
        Arc::new(generate_keypair()),
        now,
    );
    let b = make_peer(
        PeerRole::RemoteCalledUs,
        test_cfg(bytes),
        Arc::new(generate_keypair()),
        now,
    );
    (a, b)
}

/// Move every queued frame from `from` to `to`, processing dispatches
/// immediately (preserving the per-connection FIFO).
fn deliver(from: &mut PeerSession, to: &mut PeerSession, now: Instant) -> usize {
    let mut moved = 0;
    while let Some(frame) = from.take_outbound() {
        from.on_frame_written(frame.enqueued_at, now);
        if let Some(dispatch) = to.handle_frame(&frame.bytes, now) {
            to.process_message(&dispatch.message, dispatch.class, now);
        }
        moved += 1;
    }
    moved
}

/// Shuttle frames both ways until neither side has anything queued.
fn pump(a: &mut PeerSession, b: &mut PeerSession, now: Instant) {
    loop {
        let moved = deliver(a, b, now) + deliver(b, a, now);
        if moved == 0 {
            break;
        }
    }
}

fn handshake(a: &mut Peer, b: &mut Peer, now: Instant) {
    a.session.on_connected(now);
    pump(&mut a.session, &mut b.session, now);
    assert!(a.session.is_authenticated(), "initiator not authenticated");
    assert!(b.session.is_authenticated(), "responder not authenticated");
}

fn tx(n: u8) -> TxEnvelope {
    TxEnvelope {
        payload: vec![n; 16],
    }
}

/// Drain a session's outbound queue and return the message kinds in order.
fn drain_kinds(session: &mut PeerSession) -> Vec<MessageKind> {
    let mut kinds = Vec::new();
    while let Some(frame) = session.take_outbound() {
        let envelope = decode_envelope(&frame.bytes[4..]).expect("decodable frame");
        kinds.push(envelope.message.kind());
    }
    kinds
}

/// Mint a token backed by a throwaway registry entry, so roster policy
/// applies to the session under test.
fn give_token(peer: &mut Peer, now: Instant) -> Arc<Mutex<SessionRegistry>> {
    let registry = Arc::new(Mutex::new(SessionRegistry::new()));
    let filler = make_peer(
        PeerRole::RemoteCalledUs,
        test_cfg(true),
        Arc::new(generate_keypair()),
        now,
    );
    let handle: SessionHandle = Arc::new(Mutex::new(filler.session));
    let token = registry.lock().unwrap().insert(handle);
    peer.session.set_token(token);
    registry
}

// ── Scenario 1: happy handshake ────────────────────────────────────────

#[test]
fn happy_handshake_reaches_got_auth_on_both_sides() {
    let now = Instant::now();
    let (mut a, mut b) = pair(true, now);
    handshake(&mut a, &mut b, now);

    // Each side granted the other its full starting credit: a flood send is
    // released immediately.
    a.session
        .send_message(Message::Transaction(tx(1)), TaskClass::Normal, now);
    assert_eq!(a.session.outbound_len(), 1);

    // The responder recorded the initiator's address; the initiator reset
    // its back-off after full authentication.
    assert!(!b.directory.updates.lock().unwrap().is_empty());
    assert!(a
        .directory
        .backoffs
        .lock()
        .unwrap()
        .iter()
        .any(|(_, u)| *u == BackOffUpdate::Reset));

    // Both sides know each other's identity.
    assert_eq!(a.session.remote_node_id(), Some(&b.node_id));
    assert_eq!(b.session.remote_node_id(), Some(&a.node_id));
}

#[test]
fn handshake_without_byte_axis_still_completes() {
    let now = Instant::now();
    let (mut a, mut b) = pair(false, now);
    handshake(&mut a, &mut b, now);
}

#[test]
fn mixed_byte_axis_negotiates_down_to_messages() {
    let now = Instant::now();
    let mut a = make_peer(
        PeerRole::WeCalledRemote,
        test_cfg(true),
        Arc::new(generate_keypair()),
        now,
    );
    let mut b = make_peer(
        PeerRole::RemoteCalledUs,
        test_cfg(false),
        Arc::new(generate_keypair()),
        now,
    );
    handshake(&mut a, &mut b, now);
}

// ── Scenario 2: self-connect ───────────────────────────────────────────

#[test]
fn self_connect_is_rejected_with_hello_then_err_conf() {
    let now = Instant::now();
    let identity = Arc::new(generate_keypair());
    let mut a = make_peer(
        PeerRole::WeCalledRemote,
        test_cfg(true),
        identity.clone(),
        now,
    );
    let mut b = make_peer(PeerRole::RemoteCalledUs, test_cfg(true), identity, now);

    a.session.on_connected(now);
    deliver(&mut a.session, &mut b.session, now);

    let info = b.session.drop_info().expect("responder must drop").clone();
    assert_eq!(info.reason, "connecting to self");
    assert_eq!(info.mode, DropMode::FlushWriteQueue);
    assert_eq!(info.direction, DropDirection::WeDroppedRemote);

    // HELLO goes out before the error so the dialer can decode it.
    let kinds = drain_kinds(&mut b.session);
    assert_eq!(kinds, vec![MessageKind::Hello, MessageKind::Error]);
}

// ── Scenario 3: MAC tampering ──────────────────────────────────────────

#[test]
fn tampered_mac_sends_err_auth_and_drops() {
    let now = Instant::now();
    let (mut a, mut b) = pair(true, now);
    handshake(&mut a, &mut b, now);

    a.session
        .send_message(Message::Transaction(tx(7)), TaskClass::Normal, now);
    let frame = a.session.take_outbound().expect("transaction frame");
    let mut envelope = decode_envelope(&frame.bytes[4..]).expect("decodable");
    envelope.mac[0] ^= 0x01;
    let tampered = encode_frame(&envelope).expect("re-encodable");

    let seq_before = b.session.recv_mac_seq();
    let dispatch = b.session.handle_frame(&tampered, now);
    assert!(dispatch.is_none());

    let info = b.session.drop_info().expect("tampering must drop").clone();
    assert_eq!(info.reason, "unexpected MAC");
    assert_eq!(b.session.state(), PeerState::Closing);
    // The receive counter still advances past the bad message.
    assert_eq!(b.session.recv_mac_seq(), seq_before + 1);

    // ERR_AUTH was queued for the peer.
    let kinds = drain_kinds(&mut b.session);
    assert!(kinds.contains(&MessageKind::Error));
}

#[test]
fn wrong_sequence_is_fatal() {
    let now = Instant::now();
    let (mut a, mut b) = pair(true, now);
    handshake(&mut a, &mut b, now);

    a.session
        .send_message(Message::Transaction(tx(7)), TaskClass::Normal, now);
    let frame = a.session.take_outbound().expect("transaction frame");
    let mut envelope = decode_envelope(&frame.bytes[4..]).expect("decodable");
    envelope.sequence += 5;
    let reordered = encode_frame(&envelope).expect("re-encodable");

    assert!(b.session.handle_frame(&reordered, now).is_none());
    let info = b.session.drop_info().expect("gap must drop");
    assert_eq!(info.reason, "unexpected auth sequence");
}

// ── Scenario 4: advert / demand ────────────────────────────────────────

#[test]
fn advert_demand_fulfillment_and_metrics() {
    let now = Instant::now();
    let (mut a, mut b) = pair(true, now);
    handshake(&mut a, &mut b, now);

    // A holds tx2 but not the transaction behind h1.
    let tx2 = tx(2);
    let h2 = tx2.hash();
    let h1 = Hash::new([0xAA; 32]);
    a.consensus.txs.lock().unwrap().insert(h2, tx2);

    // A advertises both hashes.
    a.session.queue_tx_hash_to_advertise(h1, now);
    a.session.queue_tx_hash_to_advertise(h2, now);
    a.session.flush_advert(now);
    pump(&mut a.session, &mut b.session, now);

    // B saw the advert and queued both hashes for its fetcher.
    assert_eq!(b.session.pop_incoming_advert(), Some(h1));
    assert_eq!(b.session.pop_incoming_advert(), Some(h2));
    assert!(b.session.peer_knows_hash(&h1));

    // B demands both; A fulfills h2 and stays silent about h1.
    b.session.send_tx_demand(vec![h1, h2], now);
    pump(&mut b.session, &mut a.session, now);

    assert_eq!(a.metrics.flood_fulfilled.get(), 1);
    assert_eq!(a.metrics.flood_unfulfilled_unknown.get(), 1);
    assert_eq!(a.metrics.flood_unfulfilled_banned.get(), 0);

    // The body of h2 arrived at B.
    assert_eq!(b.consensus.received_txs.lock().unwrap().as_slice(), &[h2]);
}

#[test]
fn demand_for_banned_tx_counts_separately() {
    let now = Instant::now();
    let (mut a, mut b) = pair(true, now);
    handshake(&mut a, &mut b, now);

    let banned = Hash::new([0xBB; 32]);
    a.consensus.banned_txs.lock().unwrap().insert(banned);

    b.session.send_tx_demand(vec![banned], now);
    pump(&mut b.session, &mut a.session, now);

    assert_eq!(a.metrics.flood_unfulfilled_banned.get(), 1);
    assert_eq!(a.metrics.flood_fulfilled.get(), 0);
}

#[test]
fn known_hashes_are_not_readvertised() {
    let now = Instant::now();
    let (mut a, mut b) = pair(true, now);
    handshake(&mut a, &mut b, now);

    let h = Hash::new([0xCC; 32]);
    a.session.queue_tx_hash_to_advertise(h, now);
    a.session.flush_advert(now);
    pump(&mut a.session, &mut b.session, now);

    // The flush recorded h in the advert history; re-queueing it is
    // suppressed.
    assert!(a.session.peer_knows_hash(&h));
    a.session.queue_tx_hash_to_advertise(h, now);
    a.session.flush_advert(now);
    assert_eq!(a.session.outbound_len(), 0);
}

// ── Scenario 5: straggler ──────────────────────────────────────────────

#[test]
fn straggling_peer_is_dropped() {
    let t0 = Instant::now();
    let (mut a, mut b) = pair(true, t0);
    handshake(&mut a, &mut b, t0);

    // A queues a write that B never drains.
    a.session
        .send_message(Message::Transaction(tx(3)), TaskClass::Normal, t0);
    assert!(a.session.outbound_len() > 0);

    // B keeps talking (grants keep reads and the flow-idle clock fresh) but
    // A's writes never complete, so the enqueue time of the last completed
    // write ages past the straggler timeout.
    let straggler_secs = test_cfg(true).peer_straggler_timeout_secs;
    let mut t = t0;
    for _ in 0..=(straggler_secs / 10) {
        t += Duration::from_secs(10);
        b.session.send_message(
            Message::SendMoreExtended {
                num_messages: 1,
                num_bytes: 64,
            },
            TaskClass::Normal,
            t,
        );
        deliver(&mut b.session, &mut a.session, t);
        a.session.tick(t);
        if a.session.drop_info().is_some() {
            break;
        }
    }

    let info = a.session.drop_info().expect("straggler must drop");
    assert_eq!(info.reason, "straggling (cannot keep up)");
    assert_eq!(a.metrics.timeout_straggler.get(), 1);
}

// ── Scenario 6: flow idle ──────────────────────────────────────────────

#[test]
fn peer_granting_no_credit_is_dropped_flow_idle() {
    let t0 = Instant::now();
    let (mut a, mut b) = pair(true, t0);
    handshake(&mut a, &mut b, t0);

    // B keeps the connection readable (GET_PEERS chatter) but never sends
    // another credit grant.
    let mut t = t0;
    for _ in 0..3 {
        t += Duration::from_secs(20);
        b.session
            .send_message(Message::GetPeers, TaskClass::Normal, t);
        deliver(&mut b.session, &mut a.session, t);
        a.session.tick(t);
        if a.session.drop_info().is_some() {
            break;
        }
    }

    let info = a.session.drop_info().expect("flow idle must drop");
    assert_eq!(info.reason, "idle timeout (no new flood requests)");
    assert_eq!(a.metrics.timeout_flow_idle.get(), 1);
}

#[test]
fn fully_idle_peer_is_dropped() {
    let t0 = Instant::now();
    let (mut a, mut b) = pair(true, t0);
    handshake(&mut a, &mut b, t0);

    let t = t0 + Duration::from_secs(31);
    a.session.tick(t);
    let info = a.session.drop_info().expect("idle must drop");
    assert_eq!(info.reason, "idle timeout");
    assert_eq!(a.metrics.timeout_idle.get(), 1);
}

#[test]
fn handshake_timeout_is_short() {
    let t0 = Instant::now();
    let (mut a, _b) = pair(true, t0);
    a.session.on_connected(t0);

    // Unauthenticated connections get the short auth timeout.
    a.session.tick(t0 + Duration::from_secs(3));
    let info = a.session.drop_info().expect("handshake timeout must drop");
    assert_eq!(info.reason, "idle timeout");
}

// ── Handshake failure paths ────────────────────────────────────────────

#[test]
fn banned_peer_is_dropped_at_hello() {
    let now = Instant::now();
    let (mut a, mut b) = pair(true, now);
    b.ban_list.banned.lock().unwrap().insert(a.node_id.clone());

    a.session.on_connected(now);
    deliver(&mut a.session, &mut b.session, now);
    let info = b.session.drop_info().expect("banned peer must drop");
    assert_eq!(info.reason, "node is banned");
}

#[test]
fn version_mismatch_is_rejected() {
    let now = Instant::now();
    let mut old_cfg = test_cfg(true);
    old_cfg.overlay_version = 5;
    old_cfg.overlay_min_version = 5;
    let mut a = make_peer(
        PeerRole::WeCalledRemote,
        old_cfg,
        Arc::new(generate_keypair()),
        now,
    );
    let mut b = make_peer(
        PeerRole::RemoteCalledUs,
        test_cfg(true),
        Arc::new(generate_keypair()),
        now,
    );

    a.session.on_connected(now);
    deliver(&mut a.session, &mut b.session, now);
    let info = b.session.drop_info().expect("version skew must drop");
    assert_eq!(info.reason, "wrong protocol version");
}

#[test]
fn load_rejected_peer_gets_err_load() {
    let now = Instant::now();
    let (mut a, mut b) = pair(true, now);
    *b.roster.accept.lock().unwrap() = false;
    let _registry = give_token(&mut b, now);

    a.session.on_connected(now);
    pump(&mut a.session, &mut b.session, now);

    let info = b.session.drop_info().expect("load rejection must drop");
    assert_eq!(info.reason, "peer rejected");
    assert_eq!(info.mode, DropMode::FlushWriteQueue);
    assert!(!b.roster.released.lock().unwrap().is_empty());
}

#[test]
fn duplicate_peer_is_rejected() {
    let now = Instant::now();
    let (mut a, mut b) = pair(true, now);
    b.roster
        .duplicates
        .lock()
        .unwrap()
        .insert(a.node_id.clone());
    let _registry = give_token(&mut b, now);

    a.session.on_connected(now);
    deliver(&mut a.session, &mut b.session, now);
    let info = b.session.drop_info().expect("duplicate must drop");
    assert!(info.reason.starts_with("already-connected peer"));
}

#[test]
fn message_before_handshake_is_fatal() {
    let now = Instant::now();
    let mut c = make_peer(
        PeerRole::RemoteCalledUs,
        test_cfg(true),
        Arc::new(generate_keypair()),
        now,
    );

    let early = AuthenticatedMessage::unauthenticated(Message::GetPeers);
    let frame = encode_frame(&early).unwrap();
    if let Some(dispatch) = c.session.handle_frame(&frame, now) {
        c.session
            .process_message(&dispatch.message, dispatch.class, now);
    }
    let info = c.session.drop_info().expect("early message must drop");
    assert!(info.reason.contains("before completed handshake"));
}

// ── Drop semantics ─────────────────────────────────────────────────────

#[test]
fn drop_is_idempotent() {
    let now = Instant::now();
    let (mut a, mut b) = pair(true, now);
    handshake(&mut a, &mut b, now);

    a.session.drop_peer(
        "first reason",
        DropDirection::WeDroppedRemote,
        DropMode::IgnoreWriteQueue,
    );
    a.session.drop_peer(
        "second reason",
        DropDirection::RemoteDroppedUs,
        DropMode::FlushWriteQueue,
    );
    let info = a.session.drop_info().unwrap();
    assert_eq!(info.reason, "first reason");
    assert_eq!(info.mode, DropMode::IgnoreWriteQueue);
    assert_eq!(a.session.state(), PeerState::Closing);
}

#[test]
fn shutdown_silences_every_timer() {
    let now = Instant::now();
    let (mut a, mut b) = pair(true, now);
    handshake(&mut a, &mut b, now);

    a.session.queue_tx_hash_to_advertise(Hash::new([1; 32]), now);
    assert!(a.session.advert_flush_deadline().is_some());

    a.session.shutdown();
    assert!(a.session.advert_flush_deadline().is_none());

    // Ticks far in the future do nothing after shutdown.
    a.session.tick(now + Duration::from_secs(3600));
    assert!(a.session.drop_info().is_none());

    // Sends are swallowed too.
    let before = a.session.outbound_len();
    a.session
        .send_message(Message::GetPeers, TaskClass::Normal, now);
    assert_eq!(a.session.outbound_len(), before);
}

#[test]
fn remote_error_drops_with_sanitized_reason() {
    let now = Instant::now();
    let (mut a, mut b) = pair(true, now);
    handshake(&mut a, &mut b, now);

    b.session.send_error_and_drop(
        ErrorCode::Conf,
        "bad\npeer\x07!!",
        DropMode::FlushWriteQueue,
        now,
    );
    deliver(&mut b.session, &mut a.session, now);

    let info = a.session.drop_info().expect("remote error must drop");
    assert_eq!(info.direction, DropDirection::RemoteDroppedUs);
    assert!(info.reason.starts_with("ERR_CONF"));
    assert!(!info.reason.contains('\n'));
    assert!(!info.reason.contains('\x07'));
}

// ── Flow control integration ───────────────────────────────────────────

#[test]
fn flood_capacity_one_throttles_reads() {
    let now = Instant::now();
    let mut small = test_cfg(false);
    small.peer_flood_reading_capacity = 1;
    small.peer_reading_capacity = 10;
    let mut a = make_peer(
        PeerRole::WeCalledRemote,
        small.clone(),
        Arc::new(generate_keypair()),
        now,
    );
    let mut b = make_peer(
        PeerRole::RemoteCalledUs,
        small,
        Arc::new(generate_keypair()),
        now,
    );
    handshake(&mut a, &mut b, now);

    a.session
        .send_message(Message::Transaction(tx(1)), TaskClass::Normal, now);
    let frame = a.session.take_outbound().expect("released by credit");
    let dispatch = b.session.handle_frame(&frame.bytes, now).expect("dispatch");

    // Capacity dropped from one to zero: reads suspend.
    assert!(!b.session.can_read());
    assert!(b.session.is_throttled());

    // Processing returns the credit and resumes reads.
    b.session
        .process_message(&dispatch.message, dispatch.class, now);
    assert!(b.session.can_read());
    assert!(!b.session.is_throttled());
}

#[test]
fn out_of_sync_flood_is_discarded_with_credit_returned() {
    let now = Instant::now();
    let (mut a, mut b) = pair(true, now);
    handshake(&mut a, &mut b, now);
    *b.ledger.synced.lock().unwrap() = false;

    a.session
        .send_message(Message::Transaction(tx(5)), TaskClass::Normal, now);
    let frame = a.session.take_outbound().expect("frame");
    let dispatch = b.session.handle_frame(&frame.bytes, now);

    // Discarded before dispatch, connection intact, credit returned.
    assert!(dispatch.is_none());
    assert!(b.session.drop_info().is_none());
    assert!(b.session.can_read());
    assert!(b.consensus.received_txs.lock().unwrap().is_empty());
}

#[test]
fn droppable_sends_are_shed_when_write_queue_overloaded() {
    let now = Instant::now();
    let mut cfg = test_cfg(true);
    cfg.send_queue_overload_len = 2;
    let mut a = make_peer(
        PeerRole::WeCalledRemote,
        cfg,
        Arc::new(generate_keypair()),
        now,
    );
    let mut b = make_peer(
        PeerRole::RemoteCalledUs,
        test_cfg(true),
        Arc::new(generate_keypair()),
        now,
    );
    handshake(&mut a, &mut b, now);

    // Fill the write queue past the overload threshold.
    a.session
        .send_message(Message::GetPeers, TaskClass::Normal, now);
    a.session
        .send_message(Message::GetPeers, TaskClass::Normal, now);
    assert!(a.session.outbound_len() >= 2);

    let before = a.session.outbound_len();
    a.session
        .send_message(Message::Transaction(tx(9)), TaskClass::Droppable, now);
    assert_eq!(a.session.outbound_len(), before);
    assert_eq!(a.metrics.message_drop.get(), 1);

    // Normal-class sends still go through.
    a.session
        .send_message(Message::GetPeers, TaskClass::Normal, now);
    assert_eq!(a.session.outbound_len(), before + 1);
}

// ── Consensus plumbing ─────────────────────────────────────────────────

#[test]
fn scp_messages_reach_the_consensus_engine() {
    let now = Instant::now();
    let (mut a, mut b) = pair(true, now);
    handshake(&mut a, &mut b, now);

    let envelope = ScpEnvelope {
        node_id: a.node_id.clone(),
        slot_index: 42,
        kind: ScpStatementKind::Externalize,
        statement: vec![1, 2, 3],
        sig: keel_types::Signature([0; 64]),
    };
    a.session
        .send_message(Message::ScpMessage(envelope), TaskClass::Normal, now);
    pump(&mut a.session, &mut b.session, now);

    assert_eq!(
        b.consensus.received_envelopes.lock().unwrap().as_slice(),
        &[42]
    );
}

#[test]
fn get_quorum_set_answers_or_dont_have() {
    let now = Instant::now();
    let (mut a, mut b) = pair(true, now);
    handshake(&mut a, &mut b, now);

    let qset = QuorumSetPayload {
        threshold: 1,
        validators: vec![b.node_id.clone()],
        inner_sets: vec![],
    };
    let known = qset.hash();
    b.consensus.quorum_sets.lock().unwrap().insert(known, qset);

    // Known hash: B answers with the quorum set.
    a.session
        .send_message(Message::GetScpQuorumSet(known), TaskClass::Normal, now);
    pump(&mut a.session, &mut b.session, now);

    // Unknown hash: B answers DONT_HAVE, which A forwards to consensus.
    let unknown = Hash::new([0x77; 32]);
    a.session
        .send_message(Message::GetScpQuorumSet(unknown), TaskClass::Normal, now);
    pump(&mut a.session, &mut b.session, now);

    assert!(a
        .consensus
        .dont_haves
        .lock()
        .unwrap()
        .iter()
        .any(|(kind, hash)| *kind == MessageKind::ScpQuorumSet && *hash == unknown));
}

#[test]
fn survey_messages_are_relayed() {
    let now = Instant::now();
    let (mut a, mut b) = pair(true, now);
    handshake(&mut a, &mut b, now);

    let request = SurveyRequest {
        surveyor: a.node_id.clone(),
        surveyed: b.node_id.clone(),
        ledger_num: 5,
        payload: vec![9],
    };
    a.session
        .send_message(Message::SurveyRequest(request), TaskClass::Normal, now);
    pump(&mut a.session, &mut b.session, now);

    assert_eq!(b.survey.requests.lock().unwrap().len(), 1);
}

#[test]
fn received_peer_addresses_flow_to_the_directory() {
    let now = Instant::now();
    let (mut a, mut b) = pair(true, now);
    handshake(&mut a, &mut b, now);

    let peers = vec![
        PeerAddress {
            ip: "198.51.100.7".into(),
            port: 7061,
        },
        PeerAddress {
            ip: "198.51.100.8".into(),
            port: 0, // invalid, skipped
        },
    ];
    b.session
        .send_message(Message::Peers(peers), TaskClass::Normal, now);
    deliver(&mut b.session, &mut a.session, now);

    let known = a.directory.known.lock().unwrap();
    assert_eq!(known.len(), 1);
    assert_eq!(known[0].ip, "198.51.100.7");
}

// ── Registry ───────────────────────────────────────────────────────────

#[test]
fn registry_tokens_stop_resolving_after_removal() {
    let now = Instant::now();
    let mut registry = SessionRegistry::new();
    let peer = make_peer(
        PeerRole::RemoteCalledUs,
        test_cfg(true),
        Arc::new(generate_keypair()),
        now,
    );
    let handle: SessionHandle = Arc::new(Mutex::new(peer.session));
    let token = registry.insert(handle);
    assert!(registry.get(token).is_some());

    registry.remove(token);
    assert!(registry.get(token).is_none());

    // Slot reuse must not resurrect the old token.
    let other = make_peer(
        PeerRole::RemoteCalledUs,
        test_cfg(true),
        Arc::new(generate_keypair()),
        now,
    );
    let token2 = registry.insert(Arc::new(Mutex::new(other.session)));
    assert_ne!(token, token2);
    assert!(registry.get(token).is_none());
    assert!(registry.get(token2).is_some());
}

#[test]
fn registry_remove_is_idempotent() {
    let now = Instant::now();
    let mut registry = SessionRegistry::new();
    let peer = make_peer(
        PeerRole::RemoteCalledUs,
        test_cfg(true),
        Arc::new(generate_keypair()),
        now,
    );
    let token = registry.insert(Arc::new(Mutex::new(peer.session)));
    assert!(registry.remove(token).is_some());
    assert!(registry.remove(token).is_none());
    assert!(registry.is_empty());
}

// ── Advert history pruning ─────────────────────────────────────────────

#[test]
fn ledger_close_prunes_advert_history() {
    let now = Instant::now();
    let (mut a, mut b) = pair(true, now);
    handshake(&mut a, &mut b, now);

    *a.consensus.tracking_seq.lock().unwrap() = 10;
    let h_old = Hash::new([1; 32]);
    a.session.queue_tx_hash_to_advertise(h_old, now);
    a.session.flush_advert(now);
    assert!(a.session.peer_knows_hash(&h_old));

    *a.consensus.tracking_seq.lock().unwrap() = 20;
    let h_new = Hash::new([2; 32]);
    a.session.queue_tx_hash_to_advertise(h_new, now);
    a.session.flush_advert(now);

    a.session.clear_advert_history_below(15);
    assert!(!a.session.peer_knows_hash(&h_old));
    assert!(a.session.peer_knows_hash(&h_new));
}
