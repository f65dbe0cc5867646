//! Session join handshake.
//!
//! ```text
//! client                                  host
//!   | transport connected (both: Welcome)   |
//!   |--- Hello { peer_id, ticket } -------->| server_admit
//!   |                                       |   capacity, duplicates, identity
//!   |<-- Welcome { host_id, time, peers } --|   connection -> Active
//!   | client_on_welcome -> Active           |
//! ```
//!
//! Every refusal closes the host-side connection with a reason string from
//! [`constants`], which the client sees as its close reason. Authentication
//! refusals are prefixed with [`constants::REASON_AUTH_FAILED`].

use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::auth::{AuthTicket, IdentityService};
use crate::protocol::connection::{Connection, ConnectionId, ConnectionState};
use crate::protocol::message::{PeerId, SessionMessage};
use crate::protocol::socket::ListenSocket;
use crate::transport::Transport;

/// Result of a successful admission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub connection: ConnectionId,
    pub peer: PeerId,
    /// Older connection for the same peer that was force-closed
    pub replaced: Option<ConnectionId>,
}

/// Build the client's `Hello`, issuing a fresh ticket for `local_id`
pub fn client_hello(identity: &dyn IdentityService, local_id: PeerId) -> (AuthTicket, SessionMessage) {
    let ticket = identity.issue_ticket(local_id);
    let hello = SessionMessage::Hello {
        peer_id: local_id,
        ticket: ticket.0.clone(),
    };
    (ticket, hello)
}

/// Close reason sent to a peer whose identity was rejected
pub fn auth_failure_reason(detail: &str) -> String {
    format!("{}: {detail}", constants::REASON_AUTH_FAILED)
}

/// Whether a close reason reports an authentication refusal
pub fn is_auth_failure(reason: &str) -> bool {
    reason.starts_with(constants::REASON_AUTH_FAILED)
}

/// Host side: admit the peer behind `id` after its `Hello`.
///
/// Checks run in order: the connection must be in Welcome; the host must
/// have room (`max_players` Active connections, not counting one this peer
/// is replacing); an older connection for the same peer is closed; the
/// identity service must accept the ticket. On success the connection is
/// Active. On any failure it has already been closed.
#[instrument(skip(socket, transport, identity, ticket), fields(connection = %id))]
pub fn server_admit(
    socket: &mut ListenSocket,
    transport: &mut dyn Transport,
    identity: &Arc<dyn IdentityService>,
    id: ConnectionId,
    peer: PeerId,
    ticket: &AuthTicket,
    max_players: usize,
) -> Result<Admission> {
    let state = socket
        .connection(id)
        .map(Connection::state)
        .ok_or_else(|| ProtocolError::NoRoute(id.to_string()))?;
    if state != ConnectionState::Welcome {
        warn!(%peer, %state, "Hello outside of Welcome");
        socket.close_connection(transport, id, constants::REASON_PROTOCOL_VIOLATION);
        return Err(ProtocolError::UnexpectedMessage(format!(
            "hello in state {state}"
        )));
    }

    let previous = socket.find_peer(peer, Some(id));
    let replacing_active = previous
        .and_then(|old| socket.connection(old))
        .is_some_and(|old| old.state() == ConnectionState::Active);
    let active = socket.active_count() - usize::from(replacing_active);
    if active >= max_players {
        info!(%peer, active, max_players, "Refusing join: server full");
        socket.close_connection(transport, id, constants::REASON_SERVER_FULL);
        return Err(ProtocolError::ServerFull);
    }

    // The old session must end before the new one begins
    if let Some(old) = previous {
        warn!(%peer, old = %old, "Closing duplicate session");
        socket.close_connection(transport, old, constants::REASON_DUPLICATE_SESSION);
    }

    let Some(connection) = socket.connection_mut(id) else {
        return Err(ProtocolError::ConnectionClosed);
    };
    if let Err(e) = connection.begin_auth(Arc::clone(identity), peer, ticket) {
        let reason = match &e {
            ProtocolError::AuthenticationError(detail) => auth_failure_reason(detail),
            _ => constants::REASON_PROTOCOL_VIOLATION.to_string(),
        };
        socket.close_connection(transport, id, &reason);
        return Err(e);
    }
    if let Err(e) = connection.transition(ConnectionState::Active) {
        socket.close_connection(transport, id, constants::REASON_PROTOCOL_VIOLATION);
        return Err(e);
    }

    info!(%peer, "Peer admitted");
    Ok(Admission {
        connection: id,
        peer,
        replaced: previous,
    })
}

/// Client side: the host's `Welcome` arrived on `connection`
pub fn client_on_welcome(connection: &mut Connection, host_id: PeerId) -> Result<()> {
    if connection.state() != ConnectionState::Welcome {
        return Err(ProtocolError::UnexpectedMessage(format!(
            "welcome in state {}",
            connection.state()
        )));
    }
    connection.set_peer_id(host_id);
    connection.transition(ConnectionState::Active)?;
    debug!(connection = %connection.id(), %host_id, "Joined host");
    Ok(())
}
