//! # Connection
//!
//! A single logical channel to one remote peer.
//!
//! A connection owns its transport handle, its identity session and a pair
//! of unbounded queues. The simulation side enqueues encoded frames with
//! [`Connection::send`] and drains decoded payloads with
//! [`Connection::next_incoming`]; the pump moves frames between the queues
//! and the transport with [`Connection::flush`] and
//! [`Connection::receive_batch`]. Sends never block.
//!
//! ## States
//! ```text
//! Unconnected -> Connecting <-> FindingRoute -> Welcome -> Active
//!        any non-terminal -> ClosedByPeer | ProblemDetectedLocally | Dead
//!        ClosedByPeer | ProblemDetectedLocally -> Dead
//! ```
//! Active is reachable only from Welcome, and a host-side connection only
//! becomes Active while holding an identity session.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::core::byte_buffer::ByteBuffer;
use crate::core::frame::{FrameDecoder, FrameEncoder};
use crate::error::constants::{REASON_AUTH_FAILED, REASON_KICKED};
use crate::error::{ProtocolError, Result};
use crate::protocol::auth::{AuthSession, AuthTicket, IdentityService};
use crate::protocol::message::{PeerId, SessionMessage};
use crate::transport::{LinkStats, ReceivedMessage, SendFlags, Transport, TransportHandle, TransportState};
use crate::utils::metrics::global_metrics;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How the channel reaches the remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Client connected straight to an address
    Direct,
    /// Route found through the relay directory
    Relayed,
    /// Accepted by a listen socket
    ServerHosted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    FindingRoute,
    Welcome,
    Active,
    ClosedByPeer,
    ProblemDetectedLocally,
    Dead,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::ClosedByPeer | ConnectionState::ProblemDetectedLocally | ConnectionState::Dead
        )
    }

    fn rank(self) -> u8 {
        match self {
            ConnectionState::Unconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::FindingRoute => 2,
            ConnectionState::Welcome => 3,
            ConnectionState::Active => 4,
            ConnectionState::ClosedByPeer
            | ConnectionState::ProblemDetectedLocally
            | ConnectionState::Dead => 0,
        }
    }

    /// Open and at least as far along the handshake as `min`
    pub fn is_at_least(self, min: ConnectionState) -> bool {
        !self.is_terminal() && self.rank() >= min.rank()
    }

    pub fn can_transition(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, to) {
            (Unconnected, Connecting | FindingRoute) => true,
            (Connecting, FindingRoute) | (FindingRoute, Connecting) => true,
            (Connecting | FindingRoute, Welcome) => true,
            (Welcome, Active) => true,
            (from, ClosedByPeer | ProblemDetectedLocally) => !from.is_terminal(),
            (from, Dead) => from != Dead,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Cumulative per-connection counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_dropped: u64,
    pub decode_errors: u64,
}

/// What one pump pass moved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub messages_dropped: u64,
}

impl PumpStats {
    pub fn merge(&mut self, other: PumpStats) {
        self.messages_sent += other.messages_sent;
        self.bytes_sent += other.bytes_sent;
        self.messages_received += other.messages_received;
        self.bytes_received += other.bytes_received;
        self.messages_dropped += other.messages_dropped;
    }
}

/// An encoded frame waiting for the pump
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub data: Bytes,
    pub flags: SendFlags,
}

/// A decoded payload waiting for the simulation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub data: Bytes,
    pub source: ConnectionId,
}

pub struct Connection {
    id: ConnectionId,
    handle: Option<TransportHandle>,
    kind: ConnectionKind,
    state: ConnectionState,
    remote_is_host: bool,
    peer_id: Option<PeerId>,
    auth_ticket: Option<AuthTicket>,
    auth_session: Option<AuthSession>,
    stats: ConnectionStats,
    encoder: FrameEncoder,
    outgoing_tx: mpsc::UnboundedSender<OutgoingMessage>,
    outgoing_rx: mpsc::UnboundedReceiver<OutgoingMessage>,
    incoming_tx: mpsc::UnboundedSender<IncomingMessage>,
    incoming_rx: mpsc::UnboundedReceiver<IncomingMessage>,
    close_reason: Option<String>,
    created: Instant,
}

impl Connection {
    pub fn new(
        handle: TransportHandle,
        kind: ConnectionKind,
        state: ConnectionState,
        remote_is_host: bool,
        encoder: FrameEncoder,
    ) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let id = ConnectionId::next();
        global_metrics().connection_established();
        debug!(connection = %id, %handle, ?kind, %state, "Connection created");
        Self {
            id,
            handle: Some(handle),
            kind,
            state,
            remote_is_host,
            peer_id: None,
            auth_ticket: None,
            auth_session: None,
            stats: ConnectionStats::default(),
            encoder,
            outgoing_tx,
            outgoing_rx,
            incoming_tx,
            incoming_rx,
            close_reason: None,
            created: Instant::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// `None` once closed
    pub fn handle(&self) -> Option<TransportHandle> {
        self.handle
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn remote_is_host(&self) -> bool {
        self.remote_is_host
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_id
    }

    pub fn set_peer_id(&mut self, peer: PeerId) {
        self.peer_id = Some(peer);
    }

    pub fn auth_ticket(&self) -> Option<&AuthTicket> {
        self.auth_ticket.as_ref()
    }

    pub fn set_auth_ticket(&mut self, ticket: AuthTicket) {
        self.auth_ticket = Some(ticket);
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_session.is_some()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    pub fn age(&self) -> std::time::Duration {
        self.created.elapsed()
    }

    /// Has a handle and is not in a terminal state
    pub fn is_open(&self) -> bool {
        self.handle.is_some() && !self.state.is_terminal()
    }

    /// Live transport statistics
    pub fn link_stats(&self, transport: &dyn Transport) -> Option<LinkStats> {
        self.handle.and_then(|handle| transport.link_stats(handle))
    }

    /// Move to `to`, rejecting transitions the state machine forbids
    pub fn transition(&mut self, to: ConnectionState) -> Result<()> {
        let from = self.state;
        if from == to {
            return Ok(());
        }
        if !from.can_transition(to) {
            return Err(ProtocolError::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        if to == ConnectionState::Active && !self.remote_is_host && self.auth_session.is_none() {
            return Err(ProtocolError::AuthenticationError(
                REASON_AUTH_FAILED.to_string(),
            ));
        }
        self.state = to;
        debug!(connection = %self.id, %from, %to, "Connection state changed");
        Ok(())
    }

    /// Apply a transport-level state change
    pub fn on_transport_state(&mut self, state: TransportState, reason: Option<&str>) -> Result<()> {
        match state {
            TransportState::Connected => match self.state {
                ConnectionState::Connecting | ConnectionState::FindingRoute => {
                    self.transition(ConnectionState::Welcome)
                }
                _ => Ok(()),
            },
            TransportState::FindingRoute => self.transition(ConnectionState::FindingRoute),
            TransportState::Connecting => self.transition(ConnectionState::Connecting),
            TransportState::ClosedByPeer | TransportState::ProblemDetectedLocally | TransportState::None => {
                if self.close_reason.is_none() {
                    self.close_reason = reason.map(str::to_string);
                }
                let to = if state == TransportState::ClosedByPeer {
                    ConnectionState::ClosedByPeer
                } else {
                    ConnectionState::ProblemDetectedLocally
                };
                if self.state.is_terminal() {
                    Ok(())
                } else {
                    self.transition(to)
                }
            }
        }
    }

    /// Encode and enqueue a payload
    pub fn send(&mut self, payload: &[u8], flags: SendFlags) -> Result<()> {
        self.ensure_open()?;
        let frame = self.encoder.encode(payload)?;
        self.enqueue_frame(frame, flags)
    }

    pub fn send_buffer(&mut self, buffer: &ByteBuffer, flags: SendFlags) -> Result<()> {
        self.send(buffer.as_slice(), flags)
    }

    pub fn send_message(&mut self, message: &SessionMessage, flags: SendFlags) -> Result<()> {
        let buffer = message.to_buffer()?;
        self.send_buffer(&buffer, flags)
    }

    /// Enqueue an already-encoded frame
    pub fn enqueue_frame(&mut self, frame: Bytes, flags: SendFlags) -> Result<()> {
        self.ensure_open()?;
        self.outgoing_tx
            .send(OutgoingMessage { data: frame, flags })
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// A sender other threads can enqueue encoded frames with
    pub fn outgoing_sender(&self) -> mpsc::UnboundedSender<OutgoingMessage> {
        self.outgoing_tx.clone()
    }

    /// Hand every queued frame to the transport. Failed sends are logged and dropped.
    pub fn flush(&mut self, transport: &mut dyn Transport) -> PumpStats {
        let mut pumped = PumpStats::default();
        let Some(handle) = self.handle else {
            return pumped;
        };
        while let Ok(message) = self.outgoing_rx.try_recv() {
            let len = message.data.len() as u64;
            match transport.send(handle, &message.data, message.flags) {
                Ok(()) => {
                    self.record_sent(len);
                    pumped.messages_sent += 1;
                    pumped.bytes_sent += len;
                }
                Err(e) => {
                    warn!(connection = %self.id, error = %e, len, "Dropped outgoing message");
                    self.record_dropped();
                    pumped.messages_dropped += 1;
                }
            }
        }
        pumped
    }

    /// Pull up to `max` messages from the transport into the incoming queue
    pub fn receive_batch(
        &mut self,
        transport: &mut dyn Transport,
        decoder: &mut FrameDecoder,
        max: usize,
    ) -> Result<PumpStats> {
        let handle = self.handle.ok_or(ProtocolError::ConnectionClosed)?;
        let mut batch = Vec::with_capacity(max);
        transport.receive(handle, max, &mut batch)?;

        let mut pumped = PumpStats::default();
        for message in batch {
            pumped.messages_received += 1;
            pumped.bytes_received += message.data.len() as u64;
            self.ingest(decoder, message);
        }
        Ok(pumped)
    }

    /// Decode a received frame onto this connection's incoming queue.
    /// Malformed frames are counted and dropped.
    pub fn ingest(&mut self, decoder: &mut FrameDecoder, message: ReceivedMessage) -> bool {
        match self.decode_received(decoder, &message) {
            Some(incoming) => self.incoming_tx.send(incoming).is_ok(),
            None => false,
        }
    }

    /// Decode a received frame without queueing it
    pub fn decode_received(
        &mut self,
        decoder: &mut FrameDecoder,
        message: &ReceivedMessage,
    ) -> Option<IncomingMessage> {
        match decoder.decode_to_bytes(&message.data) {
            Ok(data) => {
                self.stats.messages_received += 1;
                self.stats.bytes_received += message.data.len() as u64;
                global_metrics().message_received(message.data.len() as u64);
                trace!(connection = %self.id, len = data.len(), "Frame decoded");
                Some(IncomingMessage {
                    data,
                    source: self.id,
                })
            }
            Err(e) => {
                self.stats.decode_errors += 1;
                global_metrics().decode_error();
                warn!(connection = %self.id, error = %e, "Dropped malformed frame");
                None
            }
        }
    }

    pub fn next_incoming(&mut self) -> Option<IncomingMessage> {
        self.incoming_rx.try_recv().ok()
    }

    pub(crate) fn record_sent(&mut self, len: u64) {
        self.stats.messages_sent += 1;
        self.stats.bytes_sent += len;
        global_metrics().message_sent(len);
    }

    pub(crate) fn record_dropped(&mut self) {
        self.stats.messages_dropped += 1;
        global_metrics().message_dropped();
    }

    /// Validate the peer's ticket. Only legal in Welcome.
    ///
    /// # Errors
    /// `AuthenticationError` carrying the service's reason when rejected
    pub fn begin_auth(
        &mut self,
        identity: Arc<dyn IdentityService>,
        peer: PeerId,
        ticket: &AuthTicket,
    ) -> Result<()> {
        if self.state != ConnectionState::Welcome {
            return Err(ProtocolError::UnexpectedMessage(format!(
                "hello in state {}",
                self.state
            )));
        }
        if self.auth_session.is_some() {
            return Err(ProtocolError::UnexpectedMessage(
                "repeated hello".to_string(),
            ));
        }
        global_metrics().handshake_attempt();
        match AuthSession::begin(identity, peer, ticket) {
            Ok(session) => {
                global_metrics().handshake_success();
                self.auth_session = Some(session);
                self.peer_id = Some(peer);
                Ok(())
            }
            Err(reason) => {
                global_metrics().handshake_failed();
                warn!(connection = %self.id, %peer, %reason, "Authentication rejected");
                Err(ProtocolError::AuthenticationError(reason))
            }
        }
    }

    /// Close the connection. Later calls have no further effect.
    pub fn close(&mut self, transport: &mut dyn Transport, reason: Option<&str>) {
        if let Some(handle) = self.handle.take() {
            transport.close(handle, reason);
        }
        if let Some(mut session) = self.auth_session.take() {
            session.end();
        }
        while self.outgoing_rx.try_recv().is_ok() {}
        while self.incoming_rx.try_recv().is_ok() {}

        if self.state != ConnectionState::Dead {
            if self.close_reason.is_none() {
                self.close_reason = reason.map(str::to_string);
            }
            debug!(
                connection = %self.id,
                from = %self.state,
                reason = reason.unwrap_or(""),
                "Connection closed"
            );
            self.state = ConnectionState::Dead;
            global_metrics().connection_closed();
        }
    }

    /// Remove the remote peer. Only the host may kick.
    pub fn kick(
        &mut self,
        transport: &mut dyn Transport,
        local_is_host: bool,
        reason: Option<&str>,
    ) -> Result<()> {
        if !local_is_host {
            return Err(ProtocolError::NotHost);
        }
        self.close(transport, Some(reason.unwrap_or(REASON_KICKED)));
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(ProtocolError::ConnectionClosed)
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("peer_id", &self.peer_id)
            .field("authenticated", &self.auth_session.is_some())
            .finish()
    }
}
