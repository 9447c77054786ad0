//! Epoch-guarded session registry.
//!
//! Deferred tasks must neither keep a dead session alive nor act on a slot
//! that was reused for a new connection. Tasks carry a [`SessionToken`]
//! (slot index + generation); looking it up after the session was removed
//! fails because removal bumps the slot's generation.

use std::sync::{Arc, Mutex};

use crate::session::PeerSession;

/// A shared handle to one session, lockable from any task.
pub type SessionHandle = Arc<Mutex<PeerSession>>;

/// A stable reference to a registered session.
///
/// Cheap to copy into deferred tasks; resolves to the session only while the
/// same connection still occupies the slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionToken {
    slot: usize,
    generation: u64,
}

struct Slot {
    generation: u64,
    session: Option<SessionHandle>,
}

/// Arena of live sessions, indexed by token.
pub struct SessionRegistry {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Register a session, returning its token.
    pub fn insert(&mut self, session: SessionHandle) -> SessionToken {
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot];
            entry.session = Some(session);
            SessionToken {
                slot,
                generation: entry.generation,
            }
        } else {
            let slot = self.slots.len();
            self.slots.push(Slot {
                generation: 0,
                session: Some(session),
            });
            SessionToken {
                slot,
                generation: 0,
            }
        }
    }

    /// Resolve a token. Returns `None` once the session was removed, even if
    /// the slot has been reused.
    pub fn get(&self, token: SessionToken) -> Option<SessionHandle> {
        let entry = self.slots.get(token.slot)?;
        if entry.generation != token.generation {
            return None;
        }
        entry.session.clone()
    }

    /// Remove a session. Bumps the slot generation so stale tokens stop
    /// resolving.
    pub fn remove(&mut self, token: SessionToken) -> Option<SessionHandle> {
        let entry = self.slots.get_mut(token.slot)?;
        if entry.generation != token.generation {
            return None;
        }
        let session = entry.session.take();
        if session.is_some() {
            entry.generation += 1;
            self.free.push(token.slot);
        }
        session
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.session.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry shared across the accept loop, drivers, and deferred tasks.
pub type SharedRegistry = Arc<Mutex<SessionRegistry>>;
