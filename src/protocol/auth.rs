//! Identity service integration.
//!
//! The host asks an [`IdentityService`] to validate each joining peer's
//! ticket before the connection may become Active. A successful
//! `begin_session` opens a server-side session that must be ended exactly
//! once; [`AuthSession`] owns that obligation.

use bytes::Bytes;
use rand::RngCore;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::constants::{REASON_INVALID_TICKET, REASON_MISSING_TICKET};
use crate::protocol::message::PeerId;

/// Length of tickets issued by [`LocalIdentityService`]
pub const TICKET_SIZE: usize = 32;

/// Opaque proof of identity presented in `Hello`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthTicket(pub Bytes);

impl AuthTicket {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted,
    Rejected(String),
}

/// External identity/authentication service
pub trait IdentityService: Send + Sync {
    /// Validate `ticket` for `peer` and open a session for it
    fn begin_session(&self, peer: PeerId, ticket: &AuthTicket) -> AuthOutcome;

    /// Close the session opened by `begin_session`
    fn end_session(&self, peer: PeerId);

    /// Issue a ticket the local peer can present to a host
    fn issue_ticket(&self, peer: PeerId) -> AuthTicket;
}

#[derive(Debug, Default)]
struct IdentityState {
    tickets: HashMap<PeerId, Bytes>,
    active: HashSet<PeerId>,
}

/// In-process identity service: issues random tickets and accepts each one
/// back once. Clones share state, so host and clients in one process can
/// share it.
#[derive(Debug, Clone, Default)]
pub struct LocalIdentityService {
    state: Arc<Mutex<IdentityState>>,
}

impl LocalIdentityService {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, IdentityState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Peers with an open session
    pub fn active_sessions(&self) -> usize {
        self.state().active.len()
    }

    pub fn is_active(&self, peer: &PeerId) -> bool {
        self.state().active.contains(peer)
    }

    /// Invalidate a peer's ticket
    pub fn revoke(&self, peer: &PeerId) {
        self.state().tickets.remove(peer);
    }
}

impl IdentityService for LocalIdentityService {
    fn begin_session(&self, peer: PeerId, ticket: &AuthTicket) -> AuthOutcome {
        if ticket.is_empty() {
            return AuthOutcome::Rejected(REASON_MISSING_TICKET.to_string());
        }
        let mut state = self.state();
        let valid = state
            .tickets
            .get(&peer)
            .is_some_and(|issued| issued.as_ref() == ticket.as_bytes());
        if !valid {
            warn!(%peer, "Rejected identity ticket");
            return AuthOutcome::Rejected(REASON_INVALID_TICKET.to_string());
        }
        // Single use
        state.tickets.remove(&peer);
        state.active.insert(peer);
        debug!(%peer, "Identity session started");
        AuthOutcome::Accepted
    }

    fn end_session(&self, peer: PeerId) {
        if self.state().active.remove(&peer) {
            debug!(%peer, "Identity session ended");
        }
    }

    fn issue_ticket(&self, peer: PeerId) -> AuthTicket {
        let mut raw = vec![0u8; TICKET_SIZE];
        rand::rng().fill_bytes(&mut raw);
        let ticket = Bytes::from(raw);
        self.state().tickets.insert(peer, ticket.clone());
        AuthTicket(ticket)
    }
}

/// An open identity session, ended on [`end`](Self::end) or drop
pub struct AuthSession {
    peer: PeerId,
    service: Arc<dyn IdentityService>,
    ended: bool,
}

impl AuthSession {
    /// Validate the ticket and open a session
    pub fn begin(
        service: Arc<dyn IdentityService>,
        peer: PeerId,
        ticket: &AuthTicket,
    ) -> std::result::Result<Self, String> {
        match service.begin_session(peer, ticket) {
            AuthOutcome::Accepted => Ok(Self {
                peer,
                service,
                ended: false,
            }),
            AuthOutcome::Rejected(reason) => Err(reason),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// End the session; later calls do nothing
    pub fn end(&mut self) {
        if !self.ended {
            self.ended = true;
            self.service.end_session(self.peer);
        }
    }
}

impl std::fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSession")
            .field("peer", &self.peer)
            .field("ended", &self.ended)
            .finish()
    }
}

impl Drop for AuthSession {
    fn drop(&mut self) {
        self.end();
    }
}
