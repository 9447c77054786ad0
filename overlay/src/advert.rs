//! Pull-based transaction flood: advert batching and peer memory.
//!
//! Once adverts are enabled the overlay never pushes transaction bodies
//! unsolicited. Outgoing hashes accumulate in a batch that is flushed by
//! size or timer as a FLOOD_ADVERT; received adverts are remembered and
//! queued for the external transaction fetcher, which later demands the
//! bodies it wants.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use keel_types::Hash;
use keel_wire::{FloodAdvert, Message, TX_ADVERT_VECTOR_MAX_SIZE};
use rand::Rng;

/// Bounded hash -> ledger-sequence map with random eviction.
///
/// Remembers which transaction hashes the peer already knows about (it
/// advertised them, or we advertised to it) and at which ledger sequence, so
/// redundant adverts are suppressed and entries can be pruned once a ledger
/// seals.
pub struct AdvertHistory {
    map: HashMap<Hash, u32>,
    keys: Vec<Hash>,
    capacity: usize,
}

impl AdvertHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::with_capacity(capacity),
            keys: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `hash` at `ledger_seq`, evicting a random entry when full.
    pub fn put(&mut self, hash: Hash, ledger_seq: u32) {
        if self.capacity == 0 {
            return;
        }
        if let Some(seq) = self.map.get_mut(&hash) {
            *seq = ledger_seq;
            return;
        }
        if self.keys.len() >= self.capacity {
            let victim = rand::thread_rng().gen_range(0..self.keys.len());
            let evicted = self.keys.swap_remove(victim);
            self.map.remove(&evicted);
        }
        self.map.insert(hash, ledger_seq);
        self.keys.push(hash);
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.map.contains_key(hash)
    }

    /// Prune every entry recorded below `ledger_seq`.
    pub fn clear_below(&mut self, ledger_seq: u32) {
        self.map.retain(|_, seq| *seq >= ledger_seq);
        self.keys.retain(|h| self.map.contains_key(h));
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Per-peer advert machinery: outgoing batch, peer memory, incoming queue.
pub struct AdvertEngine {
    history: AdvertHistory,
    pending: Vec<Hash>,
    flush_deadline: Option<Instant>,
    incoming: VecDeque<Hash>,
    incoming_limit: usize,
    incoming_trimmed: u64,
    max_advert_size: usize,
    flush_period: Duration,
}

impl AdvertEngine {
    pub fn new(
        history_capacity: usize,
        max_advert_size: usize,
        flush_period: Duration,
        incoming_limit: usize,
    ) -> Self {
        Self {
            history: AdvertHistory::new(history_capacity),
            pending: Vec::new(),
            flush_deadline: None,
            incoming: VecDeque::new(),
            incoming_limit,
            incoming_trimmed: 0,
            max_advert_size,
            flush_period,
        }
    }

    /// Whether the peer already knows about `hash`.
    pub fn peer_knows(&self, hash: &Hash) -> bool {
        self.history.contains(hash)
    }

    /// Record that the peer knows `hash` as of `ledger_seq`.
    pub fn remember(&mut self, hash: Hash, ledger_seq: u32) {
        self.history.put(hash, ledger_seq);
    }

    /// Prune peer memory below a sealed ledger.
    pub fn clear_below(&mut self, ledger_seq: u32) {
        self.history.clear_below(ledger_seq);
    }

    /// Enqueue a hash for the next outgoing advert.
    ///
    /// Returns a FLOOD_ADVERT to send when the batch reached its flush size.
    /// A hash past the hard vector bound is dropped silently.
    pub fn queue_outgoing(&mut self, hash: Hash, now: Instant) -> Option<Message> {
        if self.pending.is_empty() {
            self.flush_deadline = Some(now + self.flush_period);
        }
        if self.pending.len() >= TX_ADVERT_VECTOR_MAX_SIZE {
            tracing::trace!(hash = %hash.abbrev(), "advert batch full, dropping hash");
            return None;
        }
        self.pending.push(hash);
        if self.pending.len() >= self.max_advert_size {
            return self.flush();
        }
        None
    }

    /// Flush the pending batch, if any.
    pub fn flush(&mut self) -> Option<Message> {
        self.flush_deadline = None;
        if self.pending.is_empty() {
            return None;
        }
        let tx_hashes = std::mem::take(&mut self.pending);
        Some(Message::FloodAdvert(FloodAdvert { tx_hashes }))
    }

    /// When the flush timer should next fire.
    pub fn flush_deadline(&self) -> Option<Instant> {
        self.flush_deadline
    }

    /// Record an inbound advert: remember every hash and queue it for the
    /// transaction fetcher. Hashes beyond the buffer limit are trimmed.
    ///
    /// Returns how many hashes were queued.
    pub fn record_incoming(&mut self, hashes: &[Hash], ledger_seq: u32) -> usize {
        let mut queued = 0;
        for hash in hashes {
            self.history.put(*hash, ledger_seq);
            if self.incoming.len() < self.incoming_limit {
                self.incoming.push_back(*hash);
                queued += 1;
            } else {
                self.incoming_trimmed += 1;
            }
        }
        queued
    }

    /// Next advertised hash for the transaction fetcher.
    pub fn pop_incoming(&mut self) -> Option<Hash> {
        self.incoming.pop_front()
    }

    pub fn incoming_len(&self) -> usize {
        self.incoming.len()
    }

    /// Hashes dropped because the incoming buffer was full.
    pub fn incoming_trimmed(&self) -> u64 {
        self.incoming_trimmed
    }

    /// Outgoing hashes currently awaiting a flush.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
