//! Two-axis credit flow control.
//!
//! Each direction of a connection carries independent credit on a message
//! axis (always on) and an optional byte axis (negotiated in AUTH). Inbound
//! credit is consumed when a message enters processing and returned when the
//! consumer finishes; returns are coalesced into periodic SEND_MORE grants.
//! Outbound flood messages wait in per-class queues until the peer has
//! granted enough credit on every enabled axis.
//!
//! The controller never calls back into the session: methods return the
//! messages that became sendable (queued releases, grants) and the session
//! performs the authenticated writes.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use keel_wire::{encoded_body_size, Message, MessageKind};

use crate::config::OverlayConfig;
use crate::OverlayError;

/// Overlay version at which byte-axis flow control becomes available.
pub const FIRST_VERSION_SUPPORTING_FLOW_CONTROL_IN_BYTES: u32 = 28;

/// Credit state for one axis of one direction pair.
///
/// `flood`/`total` are local reading capacity (what we allow the peer to have
/// in flight); `outbound` is what the peer has granted us.
#[derive(Debug)]
struct FlowCapacity {
    flood: u64,
    total: Option<u64>,
    limit_flood: u64,
    limit_total: Option<u64>,
    outbound: u64,
}

impl FlowCapacity {
    fn message_axis(cfg: &OverlayConfig) -> Self {
        Self {
            flood: cfg.peer_flood_reading_capacity,
            total: Some(cfg.peer_reading_capacity),
            limit_flood: cfg.peer_flood_reading_capacity,
            limit_total: Some(cfg.peer_reading_capacity),
            outbound: 0,
        }
    }

    fn byte_axis(cfg: &OverlayConfig) -> Self {
        Self {
            flood: cfg.peer_flood_reading_capacity_bytes,
            total: None,
            limit_flood: cfg.peer_flood_reading_capacity_bytes,
            limit_total: None,
            outbound: 0,
        }
    }

    fn check_invariants(&self) {
        debug_assert!(self.flood <= self.limit_flood);
        if let (Some(total), Some(limit)) = (self.total, self.limit_total) {
            debug_assert!(total <= limit);
        }
    }

    /// Consume local capacity for an inbound message. Fails when the peer
    /// overran its flood grant.
    fn lock_local(&mut self, cost: u64, is_flood: bool) -> Result<(), OverlayError> {
        if let Some(total) = self.total.as_mut() {
            if *total < cost {
                return Err(OverlayError::FloodOverrun);
            }
            *total -= cost;
        }
        if is_flood {
            if self.flood < cost {
                return Err(OverlayError::FloodOverrun);
            }
            self.flood -= cost;
        }
        Ok(())
    }

    /// Return local capacity after processing. Returns the flood amount
    /// freed (0 for non-flood messages).
    fn release_local(&mut self, cost: u64, is_flood: bool) -> u64 {
        if let Some(total) = self.total.as_mut() {
            *total += cost;
        }
        let mut freed = 0;
        if is_flood {
            self.flood += cost;
            freed = cost;
        }
        self.check_invariants();
        freed
    }

    fn has_outbound(&self, cost: u64) -> bool {
        self.outbound >= cost
    }

    fn lock_outbound(&mut self, cost: u64) {
        debug_assert!(self.outbound >= cost);
        self.outbound -= cost;
    }

    fn release_outbound(&mut self, amount: u64) -> Result<(), OverlayError> {
        self.outbound = self.outbound.checked_add(amount).ok_or_else(|| {
            OverlayError::MalformedSendMore("credit increment overflows window".into())
        })?;
        Ok(())
    }

    fn can_read(&self) -> bool {
        if let Some(total) = self.total {
            if total == 0 {
                return false;
            }
        }
        self.flood > 0
    }
}

/// Outbound queue classes, drained in declaration order.
const QUEUE_COUNT: usize = 4;

fn queue_index(msg: &Message) -> usize {
    match msg.kind() {
        MessageKind::ScpMessage => 0,
        MessageKind::Transaction => 1,
        MessageKind::FloodDemand => 2,
        MessageKind::FloodAdvert => 3,
        other => unreachable!("non-flood message {} has no outbound queue", other),
    }
}

struct QueuedMessage {
    message: Message,
    enqueued_at: Instant,
}

/// A message released from the outbound queues together with how long it
/// waited for credit.
#[derive(Debug)]
pub struct ReleasedMessage {
    pub message: Message,
    pub queue_delay: Duration,
}

/// Per-connection two-axis flow controller.
pub struct FlowController {
    msg_axis: FlowCapacity,
    byte_axis: Option<FlowCapacity>,
    queues: [VecDeque<QueuedMessage>; QUEUE_COUNT],
    started: bool,
    flood_msgs_processed: u64,
    flood_bytes_processed: u64,
    last_outbound_grant: Option<Instant>,
    batch_size_messages: u64,
    batch_size_bytes: u64,
    bytes_requested: bool,
}

impl FlowController {
    pub fn new(cfg: &OverlayConfig) -> Self {
        Self {
            msg_axis: FlowCapacity::message_axis(cfg),
            byte_axis: cfg
                .enable_flow_control_bytes
                .then(|| FlowCapacity::byte_axis(cfg)),
            queues: std::array::from_fn(|_| VecDeque::new()),
            started: false,
            flood_msgs_processed: 0,
            flood_bytes_processed: 0,
            last_outbound_grant: None,
            batch_size_messages: cfg.flow_control_send_more_batch_size,
            batch_size_bytes: cfg.flow_control_send_more_batch_size_bytes,
            bytes_requested: cfg.enable_flow_control_bytes,
        }
    }

    /// Whether the byte axis was configured locally (decides the AUTH flag).
    pub fn bytes_requested(&self) -> bool {
        self.bytes_requested
    }

    /// Whether the byte axis is active after negotiation.
    pub fn bytes_enabled(&self) -> bool {
        self.started && self.byte_axis.is_some()
    }

    /// Activate flow control after AUTH; returns the initial credit grant to
    /// send to the peer.
    ///
    /// `enable_bytes` is the negotiated outcome (both versions recent enough
    /// and both AUTH flags set); when false the byte axis is discarded even
    /// if configured.
    pub fn start(&mut self, enable_bytes: bool, now: Instant) -> Message {
        debug_assert!(!self.started);
        if !enable_bytes {
            self.byte_axis = None;
        }
        self.started = true;
        self.last_outbound_grant = Some(now);
        match &self.byte_axis {
            Some(bytes) => Message::SendMoreExtended {
                num_messages: self.msg_axis.limit_flood,
                num_bytes: bytes.limit_flood,
            },
            None => Message::SendMore {
                num_messages: self.msg_axis.limit_flood,
            },
        }
    }

    /// Queue an outgoing message behind credit, then release everything the
    /// current credit allows, in class-priority and enqueue order.
    ///
    /// Non-flood messages bypass credit entirely and come back immediately.
    pub fn submit(&mut self, message: Message, now: Instant) -> Vec<ReleasedMessage> {
        if !message.is_flood() {
            return vec![ReleasedMessage {
                message,
                queue_delay: Duration::ZERO,
            }];
        }
        let idx = queue_index(&message);
        self.queues[idx].push_back(QueuedMessage {
            message,
            enqueued_at: now,
        });
        self.release_ready(now)
    }

    fn has_outbound_for(&self, message: &Message) -> bool {
        if !self.msg_axis.has_outbound(1) {
            return false;
        }
        if let Some(bytes) = &self.byte_axis {
            if !bytes.has_outbound(encoded_body_size(message)) {
                return false;
            }
        }
        true
    }

    fn release_ready(&mut self, now: Instant) -> Vec<ReleasedMessage> {
        let mut released = Vec::new();
        for idx in 0..QUEUE_COUNT {
            loop {
                let Some(front) = self.queues[idx].front() else {
                    break;
                };
                if !self.has_outbound_for(&front.message) {
                    break;
                }
                let queued = self.queues[idx].pop_front().expect("front exists");
                self.msg_axis.lock_outbound(1);
                if let Some(bytes) = self.byte_axis.as_mut() {
                    bytes.lock_outbound(encoded_body_size(&queued.message));
                }
                released.push(ReleasedMessage {
                    message: queued.message,
                    queue_delay: now.saturating_duration_since(queued.enqueued_at),
                });
            }
        }
        released
    }

    /// Check an inbound SEND_MORE / SEND_MORE_EXTENDED for protocol validity.
    pub fn validate_send_more(&self, message: &Message) -> Result<(), OverlayError> {
        match message {
            Message::SendMore { .. } if self.byte_axis.is_some() => Err(
                OverlayError::MalformedSendMore("got SEND_MORE but byte axis is negotiated".into()),
            ),
            Message::SendMoreExtended { .. } if self.byte_axis.is_none() => {
                Err(OverlayError::MalformedSendMore(
                    "got SEND_MORE_EXTENDED without byte axis".into(),
                ))
            }
            Message::SendMore { .. } | Message::SendMoreExtended { .. } => Ok(()),
            other => Err(OverlayError::MalformedSendMore(format!(
                "expected a credit grant, got {}",
                other.kind()
            ))),
        }
    }

    /// Apply an inbound credit grant and release newly sendable messages.
    ///
    /// A zero grant is a keep-alive: accepted, but it neither refreshes the
    /// flow-idle clock nor releases anything.
    pub fn on_send_more(
        &mut self,
        message: &Message,
        now: Instant,
    ) -> Result<Vec<ReleasedMessage>, OverlayError> {
        self.validate_send_more(message)?;
        let granted = match message {
            Message::SendMore { num_messages } => {
                self.msg_axis.release_outbound(*num_messages)?;
                *num_messages > 0
            }
            Message::SendMoreExtended {
                num_messages,
                num_bytes,
            } => {
                self.msg_axis.release_outbound(*num_messages)?;
                if let Some(bytes) = self.byte_axis.as_mut() {
                    bytes.release_outbound(*num_bytes)?;
                }
                *num_messages > 0 || *num_bytes > 0
            }
            _ => unreachable!("validate_send_more filtered non-grants"),
        };
        if granted {
            self.last_outbound_grant = Some(now);
        }
        Ok(self.release_ready(now))
    }

    /// Account an inbound message entering processing.
    ///
    /// Fails when the peer overran its flood grant, which is
    /// connection-fatal.
    pub fn begin_message_processing(&mut self, message: &Message) -> Result<(), OverlayError> {
        let is_flood = message.is_flood();
        self.msg_axis.lock_local(1, is_flood)?;
        if let Some(bytes) = self.byte_axis.as_mut() {
            bytes.lock_local(encoded_body_size(message), is_flood)?;
        }
        Ok(())
    }

    /// Account an inbound message leaving processing; maybe emit a coalesced
    /// credit grant for the peer.
    pub fn end_message_processing(&mut self, message: &Message) -> Option<Message> {
        let is_flood = message.is_flood();
        let freed_msgs = self.msg_axis.release_local(1, is_flood);
        let mut freed_bytes = 0;
        if let Some(bytes) = self.byte_axis.as_mut() {
            freed_bytes = bytes.release_local(encoded_body_size(message), is_flood);
        }
        self.flood_msgs_processed += freed_msgs;
        self.flood_bytes_processed += freed_bytes;

        if !self.started {
            return None;
        }
        let msgs_due = self.flood_msgs_processed >= self.batch_size_messages;
        let bytes_due =
            self.byte_axis.is_some() && self.flood_bytes_processed >= self.batch_size_bytes;
        if !(msgs_due || bytes_due) {
            return None;
        }

        let num_messages = self.flood_msgs_processed;
        let num_bytes = self.flood_bytes_processed;
        self.flood_msgs_processed = 0;
        self.flood_bytes_processed = 0;
        Some(match &self.byte_axis {
            Some(_) => Message::SendMoreExtended {
                num_messages,
                num_bytes,
            },
            None => Message::SendMore { num_messages },
        })
    }

    /// Whether local capacity allows reading another message from the
    /// socket.
    pub fn can_read(&self) -> bool {
        if !self.msg_axis.can_read() {
            return false;
        }
        match &self.byte_axis {
            Some(bytes) => bytes.can_read(),
            None => true,
        }
    }

    /// Whether the peer has gone too long without granting outbound credit.
    pub fn is_flow_idle(&self, now: Instant, threshold: Duration) -> bool {
        match self.last_outbound_grant {
            Some(at) => now.saturating_duration_since(at) >= threshold,
            None => false,
        }
    }

    /// Grow the byte-axis flood allowance when the network raises the max
    /// transaction size. Returns the extra grant to send to the peer.
    pub fn handle_tx_size_increase(&mut self, increase: u32) -> Option<Message> {
        let bytes = self.byte_axis.as_mut()?;
        bytes.limit_flood += increase as u64;
        bytes.flood += increase as u64;
        Some(Message::SendMoreExtended {
            num_messages: 0,
            num_bytes: increase as u64,
        })
    }

    /// Total messages currently waiting for outbound credit.
    pub fn queued_len(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }
}
