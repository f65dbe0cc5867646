//! # Network Session
//!
//! Host or client view of one multiplayer session.
//!
//! The host owns a [`ListenSocket`] holding every accepted client; a client
//! owns one outbound [`Connection`] to the host. Clients have no transport
//! connections to each other: a targeted send to another client is wrapped
//! as a relayed message and forwarded by the host.
//!
//! ## Frame Loop
//! Call [`NetworkSession::tick`] once per frame. A tick
//! 1. runs transport callbacks (connects, accepts, disconnects),
//! 2. pumps every queue to and from the transport,
//! 3. handles the session control messages that arrived,
//! 4. on the host, sends heartbeats and state deltas when due,
//! 5. refreshes aggregate statistics.
//!
//! Faults inside a tick are logged and swallowed; one bad message or
//! connection never stops the pump. Application-facing results come out of
//! [`NetworkSession::poll_event`].
//!
//! There is no host migration. When a client loses its host it reports
//! [`SessionEvent::HostLost`] and stays disconnected.

use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{NetworkConfig, PROTOCOL_VERSION};
use crate::core::frame::{FrameDecoder, FrameEncoder};
use crate::error::constants::{
    REASON_CONNECT_TIMEOUT, REASON_DISCONNECTED, REASON_HOST_SHUTDOWN, REASON_PROTOCOL_VIOLATION,
    REASON_SERVER_FULL,
};
use crate::error::{ProtocolError, Result};
use crate::protocol::auth::{AuthTicket, IdentityService};
use crate::protocol::connection::{
    Connection, ConnectionId, ConnectionKind, ConnectionState, IncomingMessage, PumpStats,
};
use crate::protocol::dispatcher::{Delivery, Dispatcher};
use crate::protocol::handshake::{self, Admission};
use crate::protocol::message::{PeerId, RelayedMessage, SessionMessage};
use crate::protocol::socket::{ListenSocket, SocketEvent};
use crate::transport::{
    PeerAddress, SendFlags, StatusChange, Transport, TransportHandle, TransportState,
};
use crate::utils::metrics::global_metrics;

/// Extra table slots beyond `max_players` for connections still handshaking
const PENDING_CONNECTION_HEADROOM: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Host,
    Client,
}

/// Something the application should react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Client: the host admitted us
    Joined { host_id: PeerId },
    PeerJoined { peer: PeerId },
    PeerLeft { peer: PeerId, reason: Option<String> },
    /// A user payload with no registered handler
    Message(Delivery),
    /// Client: a heartbeat updated the host clock offset
    HostTime { host_time_ms: u64, offset_ms: i64 },
    StateDelta {
        sequence: u32,
        payload: Bytes,
        sender: Option<PeerId>,
    },
    /// Client: the host connection is gone
    HostLost { reason: Option<String> },
}

/// Supplies the host's periodic state updates
pub trait StateProvider: Send {
    /// Next delta to broadcast, or `None` when nothing changed
    fn next_delta(&mut self) -> Option<Bytes>;
}

impl<F> StateProvider for F
where
    F: FnMut() -> Option<Bytes> + Send,
{
    fn next_delta(&mut self) -> Option<Bytes> {
        self()
    }
}

/// Aggregate session statistics, refreshed every `stats_interval`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionStats {
    pub frames: u64,
    pub frame_rate: f64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Bytes per second over the last interval
    pub send_bandwidth: f64,
    pub receive_bandwidth: f64,
    pub connections: usize,
    /// Highest ping among live connections
    pub max_ping_ms: u32,
}

pub struct NetworkSession {
    local_id: PeerId,
    role: Role,
    config: NetworkConfig,
    transport: Box<dyn Transport>,
    identity: Arc<dyn IdentityService>,
    socket: Option<ListenSocket>,
    outbound: HashMap<ConnectionId, Connection>,
    outbound_handles: HashMap<TransportHandle, ConnectionId>,
    routes: HashMap<PeerId, ConnectionId>,
    host_connection: Option<ConnectionId>,
    host_id: Option<PeerId>,
    peers: HashSet<PeerId>,
    encoder: FrameEncoder,
    decoder: FrameDecoder,
    dispatcher: Dispatcher,
    events: VecDeque<SessionEvent>,
    state_provider: Option<Box<dyn StateProvider>>,
    started: Instant,
    host_time_offset_ms: Option<i64>,
    frame: u64,
    state_sequence: u32,
    last_heartbeat: Instant,
    last_state_update: Instant,
    last_stats: Instant,
    frames_at_last_stats: u64,
    bytes_at_last_stats: (u64, u64),
    stats: SessionStats,
    status_changes: Vec<StatusChange>,
    last_close_reason: Option<String>,
    closed: bool,
}

impl NetworkSession {
    fn new(
        role: Role,
        transport: Box<dyn Transport>,
        identity: Arc<dyn IdentityService>,
        local_id: PeerId,
        config: NetworkConfig,
    ) -> Result<Self> {
        config.validate_strict()?;
        let now = Instant::now();
        Ok(Self {
            local_id,
            role,
            encoder: FrameEncoder::from_config(&config.transport),
            decoder: FrameDecoder::from_config(&config.transport),
            config,
            transport,
            identity,
            socket: None,
            outbound: HashMap::new(),
            outbound_handles: HashMap::new(),
            routes: HashMap::new(),
            host_connection: None,
            host_id: None,
            peers: HashSet::new(),
            dispatcher: Dispatcher::new(),
            events: VecDeque::new(),
            state_provider: None,
            started: now,
            host_time_offset_ms: None,
            frame: 0,
            state_sequence: 0,
            last_heartbeat: now,
            last_state_update: now,
            last_stats: now,
            frames_at_last_stats: 0,
            bytes_at_last_stats: (0, 0),
            stats: SessionStats::default(),
            status_changes: Vec::new(),
            last_close_reason: None,
            closed: false,
        })
    }

    /// Start hosting: listen on the configured port
    #[instrument(skip(transport, identity, config))]
    pub fn host(
        mut transport: Box<dyn Transport>,
        identity: Arc<dyn IdentityService>,
        local_id: PeerId,
        config: NetworkConfig,
    ) -> Result<Self> {
        let port = config.session.listen_port;
        let max_connections = config.session.max_players + PENDING_CONNECTION_HEADROOM;
        let encoder = FrameEncoder::from_config(&config.transport);
        let socket = ListenSocket::open(transport.as_mut(), port, max_connections, encoder)?;

        let mut session = Self::new(Role::Host, transport, identity, local_id, config)?;
        session.host_id = Some(local_id);
        session.socket = Some(socket);
        info!(%local_id, port, version = PROTOCOL_VERSION, "Hosting session");
        Ok(session)
    }

    /// Create a client with no connection yet; see [`begin_join`](Self::begin_join)
    pub fn client(
        transport: Box<dyn Transport>,
        identity: Arc<dyn IdentityService>,
        local_id: PeerId,
        config: NetworkConfig,
    ) -> Result<Self> {
        Self::new(Role::Client, transport, identity, local_id, config)
    }

    /// Join a host, retrying until the connection is Active.
    ///
    /// Each attempt waits up to `connect.active_timeout`; at most
    /// `connect.max_attempts` are made. The token is checked at every loop
    /// boundary and the partial session is torn down on any failure.
    ///
    /// # Errors
    /// - `ServerFull` or `AuthenticationError` as soon as the host refuses
    /// - `Cancelled` when the token fires
    /// - `Timeout` when every attempt expired
    #[instrument(skip(transport, identity, address, config, cancel), fields(%address))]
    pub async fn join(
        transport: Box<dyn Transport>,
        identity: Arc<dyn IdentityService>,
        local_id: PeerId,
        address: PeerAddress,
        config: NetworkConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let mut session = Self::client(transport, identity, local_id, config)?;
        let connect = session.config.connect.clone();

        for attempt in 1..=connect.max_attempts {
            if cancel.is_cancelled() {
                session.shutdown();
                return Err(ProtocolError::Cancelled);
            }
            match session.begin_join(&address) {
                Ok(_) => {
                    let deadline = Instant::now() + connect.active_timeout;
                    loop {
                        session.tick();
                        if session.is_joined() {
                            info!(attempt, "Joined session");
                            return Ok(session);
                        }
                        if let Some(refusal) = session.refusal() {
                            session.shutdown();
                            return Err(refusal);
                        }
                        if session.host_connection.is_none() || Instant::now() >= deadline {
                            break;
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                session.shutdown();
                                return Err(ProtocolError::Cancelled);
                            }
                            _ = tokio::time::sleep(connect.poll_interval) => {}
                        }
                    }
                    debug!(attempt, "Join attempt did not reach Active");
                    session.abandon_attempt(REASON_CONNECT_TIMEOUT);
                }
                Err(e) => debug!(attempt, error = %e, "Join attempt failed to start"),
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    session.shutdown();
                    return Err(ProtocolError::Cancelled);
                }
                _ = tokio::time::sleep(connect.retry_delay) => {}
            }
        }

        warn!(attempts = connect.max_attempts, "Giving up on join");
        session.shutdown();
        Err(ProtocolError::Timeout)
    }

    /// Client: start connecting to a host. Progress happens in `tick`.
    pub fn begin_join(&mut self, address: &PeerAddress) -> Result<ConnectionId> {
        if self.role != Role::Client {
            return Err(ProtocolError::Custom("Host sessions cannot join".to_string()));
        }
        if self.closed {
            return Err(ProtocolError::ConnectionClosed);
        }
        if let Some(existing) = self.host_connection {
            if self.outbound.get(&existing).is_some_and(Connection::is_open) {
                return Err(ProtocolError::Custom("Already joining a host".to_string()));
            }
            self.abandon_attempt(REASON_DISCONNECTED);
        }

        self.last_close_reason = None;
        let handle = self.transport.connect(address)?;
        let state = match self.transport.state(handle) {
            TransportState::FindingRoute => ConnectionState::FindingRoute,
            _ => ConnectionState::Connecting,
        };
        let kind = match address {
            PeerAddress::Relay(_) => ConnectionKind::Relayed,
            _ => ConnectionKind::Direct,
        };
        let mut connection = Connection::new(handle, kind, state, true, self.encoder);
        let id = connection.id();
        let (ticket, _) = handshake::client_hello(self.identity.as_ref(), self.local_id);
        connection.set_auth_ticket(ticket);

        self.outbound_handles.insert(handle, id);
        self.outbound.insert(id, connection);
        self.host_connection = Some(id);
        debug!(connection = %id, %address, "Join started");
        Ok(id)
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn host_id(&self) -> Option<PeerId> {
        self.host_id
    }

    /// Host: listening. Client: the host connection is Active.
    pub fn is_joined(&self) -> bool {
        if self.closed {
            return false;
        }
        match self.role {
            Role::Host => self.socket.as_ref().is_some_and(ListenSocket::is_open),
            Role::Client => self
                .host_connection
                .and_then(|id| self.outbound.get(&id))
                .is_some_and(|c| c.state() == ConnectionState::Active),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Other peers known to be in the session
    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.iter()
    }

    pub fn has_peer(&self, peer: &PeerId) -> bool {
        self.peers.contains(peer)
    }

    /// Live connections this session owns
    pub fn connection_count(&self) -> usize {
        self.socket.as_ref().map_or(0, ListenSocket::len) + self.outbound.len()
    }

    /// State of the direct connection to `peer`, if any
    pub fn connection_state(&self, peer: &PeerId) -> Option<ConnectionState> {
        let id = self.routes.get(peer)?;
        self.connection(*id).map(Connection::state)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.socket
            .as_ref()
            .and_then(|s| s.connection(id))
            .or_else(|| self.outbound.get(&id))
    }

    fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        if let Some(connection) = self.socket.as_mut().and_then(|s| s.connection_mut(id)) {
            return Some(connection);
        }
        self.outbound.get_mut(&id)
    }

    pub fn listen_socket(&self) -> Option<&ListenSocket> {
        self.socket.as_ref()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Reason the last host connection closed, if it did
    pub fn last_close_reason(&self) -> Option<&str> {
        self.last_close_reason.as_deref()
    }

    /// Host: provide the payloads for periodic state updates
    pub fn set_state_provider<P: StateProvider + 'static>(&mut self, provider: P) {
        self.state_provider = Some(Box::new(provider));
    }

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    fn local_time_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Authoritative session time. Clients apply the last heartbeat offset.
    pub fn host_time_ms(&self) -> u64 {
        let local = self.local_time_ms();
        match (self.role, self.host_time_offset_ms) {
            (Role::Client, Some(offset)) => local.saturating_add_signed(offset),
            _ => local,
        }
    }

    pub fn host_time_offset_ms(&self) -> Option<i64> {
        self.host_time_offset_ms
    }

    // ---------------------------------------------------------------------
    // Sending
    // ---------------------------------------------------------------------

    fn encode_message(&self, message: &SessionMessage) -> Result<Bytes> {
        let buffer = message.to_buffer()?;
        self.encoder.encode_buffer(&buffer)
    }

    /// Send a user payload to every Active connection
    pub fn broadcast(&mut self, tag: u16, payload: &[u8], flags: SendFlags) -> Result<usize> {
        self.broadcast_filtered(tag, payload, flags, ConnectionState::Active, |_| true)
    }

    /// Send a user payload to every connection at or above `min_state` that
    /// matches `filter`. The frame is encoded once. Returns the target count.
    pub fn broadcast_filtered<F>(
        &mut self,
        tag: u16,
        payload: &[u8],
        flags: SendFlags,
        min_state: ConnectionState,
        filter: F,
    ) -> Result<usize>
    where
        F: Fn(&Connection) -> bool,
    {
        let message = SessionMessage::User {
            tag,
            payload: Bytes::copy_from_slice(payload),
        };
        let frame = self.encode_message(&message)?;
        self.broadcast_frame(frame, flags, min_state, filter)
    }

    fn broadcast_message<F>(&mut self, message: &SessionMessage, flags: SendFlags, filter: F) -> Result<usize>
    where
        F: Fn(&Connection) -> bool,
    {
        let frame = self.encode_message(message)?;
        self.broadcast_frame(frame, flags, ConnectionState::Active, filter)
    }

    fn broadcast_frame<F>(
        &mut self,
        frame: Bytes,
        flags: SendFlags,
        min_state: ConnectionState,
        filter: F,
    ) -> Result<usize>
    where
        F: Fn(&Connection) -> bool,
    {
        let mut count = 0;
        if let Some(socket) = self.socket.as_ref() {
            let targets: Vec<ConnectionId> = socket
                .connections()
                .filter(|c| c.state().is_at_least(min_state) && filter(*c))
                .map(Connection::id)
                .collect();
            count += targets.len();
            socket.broadcast_frame(targets, frame.clone(), flags)?;
        }
        for connection in self.outbound.values_mut() {
            if connection.state().is_at_least(min_state) && filter(&*connection) {
                match connection.enqueue_frame(frame.clone(), flags) {
                    Ok(()) => count += 1,
                    Err(e) => debug!(connection = %connection.id(), error = %e, "Skipped broadcast target"),
                }
            }
        }
        trace!(targets = count, len = frame.len(), "Broadcast queued");
        Ok(count)
    }

    /// Send a user payload to one peer: directly when a connection exists,
    /// otherwise relayed through the host
    pub fn send_to(&mut self, target: PeerId, tag: u16, payload: &[u8], flags: SendFlags) -> Result<()> {
        if target == self.local_id {
            return Err(ProtocolError::NoRoute("cannot send to self".to_string()));
        }
        let message = SessionMessage::User {
            tag,
            payload: Bytes::copy_from_slice(payload),
        };

        if let Some(id) = self.routes.get(&target).copied() {
            let frame = self.encode_message(&message)?;
            let connection = self
                .connection_mut(id)
                .filter(|c| c.state() == ConnectionState::Active)
                .ok_or_else(|| ProtocolError::NoRoute(target.to_string()))?;
            return connection.enqueue_frame(frame, flags);
        }

        if self.role == Role::Client && self.is_joined() {
            let relayed = SessionMessage::Relayed(RelayedMessage {
                sender: self.local_id,
                target,
                inner_frame: self.encode_message(&message)?,
                flags,
            });
            let frame = self.encode_message(&relayed)?;
            let host = self
                .host_connection
                .and_then(|id| self.outbound.get_mut(&id))
                .ok_or_else(|| ProtocolError::NoRoute(target.to_string()))?;
            trace!(%target, "Relaying through host");
            return host.enqueue_frame(frame, flags);
        }

        Err(ProtocolError::NoRoute(target.to_string()))
    }

    /// Host: remove a peer
    pub fn kick(&mut self, peer: PeerId, reason: Option<&str>) -> Result<()> {
        let local_is_host = self.role == Role::Host;
        let id = self.routes.get(&peer).copied();
        match (self.socket.as_mut(), id) {
            (Some(socket), Some(id)) => socket.kick(self.transport.as_mut(), id, local_is_host, reason),
            _ if !local_is_host => Err(ProtocolError::NotHost),
            _ => Err(ProtocolError::NoRoute(peer.to_string())),
        }
    }

    // ---------------------------------------------------------------------
    // Frame loop
    // ---------------------------------------------------------------------

    /// Run one frame of networking
    pub fn tick(&mut self) {
        if self.closed {
            return;
        }
        self.frame += 1;
        self.run_callbacks();
        let pumped = self.pump();
        self.process_incoming();
        if self.role == Role::Host {
            self.send_periodic();
        }
        self.update_stats(pumped);
    }

    fn run_callbacks(&mut self) {
        let mut changes = std::mem::take(&mut self.status_changes);
        self.transport.run_callbacks(&mut changes);
        for change in changes.drain(..) {
            if change.listen.is_some() {
                self.on_socket_status(&change);
            } else if let Some(id) = self.outbound_handles.get(&change.handle).copied() {
                self.on_outbound_status(id, &change);
            } else if change.new.is_terminal() {
                self.transport.close(change.handle, None);
            }
        }
        self.status_changes = changes;

        let Some(socket) = self.socket.as_mut() else {
            return;
        };
        let mut departed = Vec::new();
        while let Some(event) = socket.next_event() {
            match event {
                SocketEvent::Connected(id) => debug!(connection = %id, "Awaiting hello"),
                SocketEvent::Disconnected { id, peer, reason } => {
                    if let Some(peer) = peer {
                        departed.push((id, peer, reason));
                    }
                }
            }
        }
        for (id, peer, reason) in departed {
            if self.routes.get(&peer) != Some(&id) {
                continue;
            }
            self.routes.remove(&peer);
            self.peers.remove(&peer);
            info!(%peer, reason = reason.as_deref().unwrap_or(""), "Peer left");
            if let Err(e) = self.broadcast_message(&SessionMessage::PeerLeft { peer }, SendFlags::RELIABLE, |_| true) {
                warn!(error = %e, "Failed to announce departure");
            }
            self.events.push_back(SessionEvent::PeerLeft { peer, reason });
        }
    }

    fn on_socket_status(&mut self, change: &StatusChange) {
        let Some(socket) = self.socket.as_mut() else {
            self.transport.close(change.handle, Some(REASON_HOST_SHUTDOWN));
            return;
        };
        let transport = self.transport.as_mut();
        let result = match change.new {
            TransportState::Connecting => socket.on_connecting(transport, change.handle).map(|_| ()),
            TransportState::Connected => socket.on_connected(change.handle).map(|_| ()),
            state if state.is_terminal() => {
                if socket
                    .on_disconnected(transport, change.handle, state, change.reason.as_deref())
                    .is_none()
                {
                    transport.close(change.handle, None);
                }
                Ok(())
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            debug!(handle = %change.handle, error = %e, "Incoming connection not tracked");
        }
    }

    fn on_outbound_status(&mut self, id: ConnectionId, change: &StatusChange) {
        let Some(connection) = self.outbound.get_mut(&id) else {
            return;
        };
        if let Err(e) = connection.on_transport_state(change.new, change.reason.as_deref()) {
            warn!(connection = %id, error = %e, "Rejected transport state");
            return;
        }

        match connection.state() {
            ConnectionState::Welcome => {
                let Some(ticket) = connection.auth_ticket().cloned() else {
                    return;
                };
                let hello = SessionMessage::Hello {
                    peer_id: self.local_id,
                    ticket: ticket.0,
                };
                if let Err(e) = connection.send_message(&hello, SendFlags::RELIABLE) {
                    warn!(connection = %id, error = %e, "Failed to send hello");
                }
            }
            state if state.is_terminal() => {
                let reason = connection.close_reason().map(str::to_string);
                let was_active = self.host_connection == Some(id)
                    && self.host_id.is_some()
                    && self.role == Role::Client;
                self.remove_outbound(id, None);
                if self.host_connection == Some(id) {
                    self.host_connection = None;
                    self.last_close_reason = reason.clone();
                    if was_active {
                        warn!(reason = reason.as_deref().unwrap_or(""), "Lost connection to host");
                        self.peers.clear();
                        self.routes.clear();
                        self.host_id = None;
                        self.events.push_back(SessionEvent::HostLost { reason });
                    } else {
                        info!(reason = reason.as_deref().unwrap_or(""), "Host refused connection");
                    }
                }
            }
            _ => {}
        }
    }

    fn remove_outbound(&mut self, id: ConnectionId, reason: Option<&str>) {
        if let Some(mut connection) = self.outbound.remove(&id) {
            connection.close(self.transport.as_mut(), reason);
        }
        self.outbound_handles.retain(|_, v| *v != id);
        self.routes.retain(|_, v| *v != id);
    }

    /// Drop the current join attempt
    fn abandon_attempt(&mut self, reason: &str) {
        if let Some(id) = self.host_connection.take() {
            self.remove_outbound(id, Some(reason));
        }
    }

    /// Refusal reported by the host during a join
    fn refusal(&self) -> Option<ProtocolError> {
        if self.host_connection.is_some() {
            return None;
        }
        let reason = self.last_close_reason.as_deref()?;
        if reason == REASON_SERVER_FULL {
            Some(ProtocolError::ServerFull)
        } else if handshake::is_auth_failure(reason) {
            Some(ProtocolError::AuthenticationError(reason.to_string()))
        } else {
            None
        }
    }

    fn pump(&mut self) -> PumpStats {
        let batch = self.config.session.receive_batch_size;
        let transport = self.transport.as_mut();
        let mut pumped = PumpStats::default();

        if let Some(socket) = self.socket.as_mut() {
            pumped.merge(socket.process_messages_in_thread(transport, &mut self.decoder, batch));
        }
        for connection in self.outbound.values_mut() {
            pumped.merge(connection.flush(transport));
            if !connection.is_open() {
                continue;
            }
            match connection.receive_batch(transport, &mut self.decoder, batch) {
                Ok(received) => pumped.merge(received),
                Err(e) => debug!(connection = %connection.id(), error = %e, "Receive failed"),
            }
        }
        pumped
    }

    fn process_incoming(&mut self) {
        let mut hosted = Vec::new();
        if let Some(socket) = self.socket.as_mut() {
            while let Some(message) = socket.next_incoming() {
                hosted.push(message);
            }
        }
        for message in hosted {
            if let Err(e) = self.handle_hosted(message) {
                debug!(error = %e, "Dropped message from client");
            }
        }

        let mut from_host = Vec::new();
        for connection in self.outbound.values_mut() {
            while let Some(message) = connection.next_incoming() {
                from_host.push(message);
            }
        }
        for message in from_host {
            if let Err(e) = self.handle_from_host(message) {
                debug!(error = %e, "Dropped message from host");
            }
        }
    }

    fn decode(&self, message: &IncomingMessage) -> Result<SessionMessage> {
        SessionMessage::decode(message.data.clone()).inspect_err(|e| {
            global_metrics().decode_error();
            warn!(connection = %message.source, error = %e, "Undecodable session message");
        })
    }

    /// Host: a message arrived on an accepted connection
    fn handle_hosted(&mut self, incoming: IncomingMessage) -> Result<()> {
        let id = incoming.source;
        let message = self.decode(&incoming)?;
        let (state, sender) = self
            .connection(id)
            .map(|c| (c.state(), c.peer_id()))
            .ok_or_else(|| ProtocolError::NoRoute(id.to_string()))?;

        if let SessionMessage::Hello { peer_id, ticket } = message {
            return self.admit(id, peer_id, AuthTicket(ticket));
        }
        if state != ConnectionState::Active {
            self.close_hosted(id, REASON_PROTOCOL_VIOLATION);
            return Err(ProtocolError::UnexpectedMessage(format!(
                "{} before hello",
                message.name()
            )));
        }

        match message {
            SessionMessage::User { tag, payload } => {
                self.deliver(Delivery {
                    sender,
                    source: Some(id),
                    tag,
                    payload,
                    relayed: false,
                });
                Ok(())
            }
            SessionMessage::Relayed(relayed) => self.route_relayed(id, sender, relayed),
            SessionMessage::StateDelta { sequence, payload } => {
                self.events.push_back(SessionEvent::StateDelta {
                    sequence,
                    payload,
                    sender,
                });
                Ok(())
            }
            other => Err(ProtocolError::UnexpectedMessage(format!(
                "{} from client",
                other.name()
            ))),
        }
    }

    fn close_hosted(&mut self, id: ConnectionId, reason: &str) {
        if let Some(socket) = self.socket.as_mut() {
            socket.close_connection(self.transport.as_mut(), id, reason);
        }
    }

    fn admit(&mut self, id: ConnectionId, peer: PeerId, ticket: AuthTicket) -> Result<()> {
        if peer == self.local_id {
            self.close_hosted(id, REASON_PROTOCOL_VIOLATION);
            return Err(ProtocolError::AuthenticationError("peer id collides with host".to_string()));
        }
        let Some(socket) = self.socket.as_mut() else {
            return Err(ProtocolError::NotHost);
        };
        let Admission { connection, peer, .. } = handshake::server_admit(
            socket,
            self.transport.as_mut(),
            &self.identity,
            id,
            peer,
            &ticket,
            self.config.session.max_players,
        )?;

        let others: Vec<PeerId> = self.peers.iter().copied().filter(|p| *p != peer).collect();
        let welcome = SessionMessage::Welcome {
            host_id: self.local_id,
            host_time_ms: self.host_time_ms(),
            peers: others,
        };
        if let Some(conn) = self.connection_mut(connection) {
            conn.send_message(&welcome, SendFlags::RELIABLE)?;
        }
        self.routes.insert(peer, connection);

        // A reconnect replacing its own stale session is not a new arrival
        if self.peers.insert(peer) {
            self.broadcast_message(&SessionMessage::PeerJoined { peer }, SendFlags::RELIABLE, |c| {
                c.id() != connection
            })?;
            self.events.push_back(SessionEvent::PeerJoined { peer });
        }
        Ok(())
    }

    /// Host: forward a relayed message, or deliver it when addressed to us
    fn route_relayed(&mut self, source: ConnectionId, sender: Option<PeerId>, relayed: RelayedMessage) -> Result<()> {
        if sender != Some(relayed.sender) {
            warn!(
                connection = %source,
                claimed = %relayed.sender,
                "Relayed message with spoofed sender"
            );
            return Err(ProtocolError::UnexpectedMessage("spoofed relay sender".to_string()));
        }

        if relayed.target == self.local_id {
            return self.deliver_relayed(Some(source), relayed);
        }

        let target = self
            .routes
            .get(&relayed.target)
            .copied()
            .ok_or_else(|| ProtocolError::NoRoute(relayed.target.to_string()))?;
        let flags = relayed.flags;
        let frame = self.encode_message(&SessionMessage::Relayed(relayed))?;
        let connection = self
            .connection_mut(target)
            .ok_or_else(|| ProtocolError::NoRoute(target.to_string()))?;
        connection.enqueue_frame(frame, flags)?;
        global_metrics().relayed_message();
        Ok(())
    }

    fn deliver_relayed(&mut self, source: Option<ConnectionId>, relayed: RelayedMessage) -> Result<()> {
        let inner = self.decoder.decode_to_bytes(&relayed.inner_frame)?;
        match SessionMessage::decode(inner)? {
            SessionMessage::User { tag, payload } => {
                self.deliver(Delivery {
                    sender: Some(relayed.sender),
                    source,
                    tag,
                    payload,
                    relayed: true,
                });
                Ok(())
            }
            other => Err(ProtocolError::UnexpectedMessage(format!(
                "relayed {}",
                other.name()
            ))),
        }
    }

    /// Client: a message arrived from the host
    fn handle_from_host(&mut self, incoming: IncomingMessage) -> Result<()> {
        let id = incoming.source;
        let message = self.decode(&incoming)?;
        let state = self
            .outbound
            .get(&id)
            .map(Connection::state)
            .ok_or_else(|| ProtocolError::NoRoute(id.to_string()))?;

        if let SessionMessage::Welcome {
            host_id,
            host_time_ms,
            peers,
        } = message
        {
            let connection = self
                .outbound
                .get_mut(&id)
                .ok_or_else(|| ProtocolError::NoRoute(id.to_string()))?;
            handshake::client_on_welcome(connection, host_id)?;
            self.host_id = Some(host_id);
            self.routes.insert(host_id, id);
            self.reconcile_clock(host_time_ms);
            self.events.push_back(SessionEvent::Joined { host_id });
            for peer in peers.into_iter().filter(|p| *p != self.local_id) {
                if self.peers.insert(peer) {
                    self.events.push_back(SessionEvent::PeerJoined { peer });
                }
            }
            return Ok(());
        }
        if state != ConnectionState::Active {
            return Err(ProtocolError::UnexpectedMessage(format!(
                "{} before welcome",
                message.name()
            )));
        }

        match message {
            SessionMessage::Heartbeat { host_time_ms, .. } => {
                let offset_ms = self.reconcile_clock(host_time_ms);
                self.events.push_back(SessionEvent::HostTime {
                    host_time_ms,
                    offset_ms,
                });
            }
            SessionMessage::StateDelta { sequence, payload } => {
                self.events.push_back(SessionEvent::StateDelta {
                    sequence,
                    payload,
                    sender: self.host_id,
                });
            }
            SessionMessage::User { tag, payload } => self.deliver(Delivery {
                sender: self.host_id,
                source: Some(id),
                tag,
                payload,
                relayed: false,
            }),
            SessionMessage::Relayed(relayed) => {
                if relayed.target != self.local_id {
                    return Err(ProtocolError::NoRoute(relayed.target.to_string()));
                }
                self.deliver_relayed(Some(id), relayed)?;
            }
            SessionMessage::PeerJoined { peer } => {
                if peer != self.local_id && self.peers.insert(peer) {
                    self.events.push_back(SessionEvent::PeerJoined { peer });
                }
            }
            SessionMessage::PeerLeft { peer } => {
                if self.peers.remove(&peer) {
                    self.events.push_back(SessionEvent::PeerLeft { peer, reason: None });
                }
            }
            other => {
                return Err(ProtocolError::UnexpectedMessage(format!(
                    "{} from host",
                    other.name()
                )))
            }
        }
        Ok(())
    }

    /// Record the offset between host time and local time
    fn reconcile_clock(&mut self, host_time_ms: u64) -> i64 {
        let local = i64::try_from(self.local_time_ms()).unwrap_or(i64::MAX);
        let host = i64::try_from(host_time_ms).unwrap_or(i64::MAX);
        let offset = host.saturating_sub(local);
        self.host_time_offset_ms = Some(offset);
        offset
    }

    /// Hand a user payload to its handler, or queue it as an event
    fn deliver(&mut self, delivery: Delivery) {
        match self.dispatcher.dispatch(&delivery) {
            Ok(()) => {}
            Err(ProtocolError::UnexpectedMessage(_)) => {
                self.events.push_back(SessionEvent::Message(delivery));
            }
            Err(e) => error!(tag = delivery.tag, error = %e, "Message handler failed"),
        }
    }

    fn send_periodic(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_heartbeat) >= self.config.session.heartbeat_interval {
            self.last_heartbeat = now;
            let heartbeat = SessionMessage::Heartbeat {
                host_time_ms: self.host_time_ms(),
                frame: self.frame,
            };
            if let Err(e) = self.broadcast_message(&heartbeat, SendFlags::UNRELIABLE_NO_DELAY, |_| true) {
                warn!(error = %e, "Heartbeat failed");
            }
        }

        if now.duration_since(self.last_state_update) >= self.config.session.state_update_interval {
            self.last_state_update = now;
            let Some(payload) = self.state_provider.as_mut().and_then(|p| p.next_delta()) else {
                return;
            };
            self.state_sequence = self.state_sequence.wrapping_add(1);
            let delta = SessionMessage::StateDelta {
                sequence: self.state_sequence,
                payload,
            };
            if let Err(e) = self.broadcast_message(&delta, SendFlags::RELIABLE, |_| true) {
                warn!(error = %e, "State update failed");
            }
        }
    }

    fn update_stats(&mut self, pumped: PumpStats) {
        self.stats.frames = self.frame;
        self.stats.messages_sent += pumped.messages_sent;
        self.stats.messages_received += pumped.messages_received;
        self.stats.messages_dropped += pumped.messages_dropped;
        self.stats.bytes_sent += pumped.bytes_sent;
        self.stats.bytes_received += pumped.bytes_received;

        let elapsed = self.last_stats.elapsed();
        if elapsed < self.config.session.stats_interval || elapsed.is_zero() {
            return;
        }
        let seconds = elapsed.as_secs_f64();
        let (sent_before, received_before) = self.bytes_at_last_stats;
        self.stats.frame_rate = (self.frame - self.frames_at_last_stats) as f64 / seconds;
        self.stats.send_bandwidth = (self.stats.bytes_sent - sent_before) as f64 / seconds;
        self.stats.receive_bandwidth = (self.stats.bytes_received - received_before) as f64 / seconds;
        self.stats.connections = self.connection_count();
        self.stats.max_ping_ms = self.max_ping_ms();

        self.last_stats = Instant::now();
        self.frames_at_last_stats = self.frame;
        self.bytes_at_last_stats = (self.stats.bytes_sent, self.stats.bytes_received);
        debug!(
            frame_rate = self.stats.frame_rate,
            send_bps = self.stats.send_bandwidth,
            recv_bps = self.stats.receive_bandwidth,
            connections = self.stats.connections,
            "Session stats"
        );
    }

    fn max_ping_ms(&self) -> u32 {
        let transport = self.transport.as_ref();
        let hosted = self.socket.iter().flat_map(|s| s.connections());
        hosted
            .chain(self.outbound.values())
            .filter_map(|c| c.link_stats(transport))
            .map(|s| s.ping_ms)
            .max()
            .unwrap_or(0)
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    /// Close every connection and the listen socket. Idempotent.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        let transport = self.transport.as_mut();
        if let Some(socket) = self.socket.as_mut() {
            socket.close(transport);
        }
        for (_, mut connection) in self.outbound.drain() {
            connection.close(transport, Some(REASON_DISCONNECTED));
        }
        self.outbound_handles.clear();
        self.routes.clear();
        self.peers.clear();
        self.host_connection = None;
        self.closed = true;
        info!(local_id = %self.local_id, role = ?self.role, "Session closed");
        global_metrics().log_metrics();
    }

    /// Client-facing alias for [`shutdown`](Self::shutdown)
    pub fn disconnect(&mut self) {
        self.shutdown();
    }

    /// Time since the session was created
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for NetworkSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for NetworkSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkSession")
            .field("local_id", &self.local_id)
            .field("role", &self.role)
            .field("host_id", &self.host_id)
            .field("peers", &self.peers.len())
            .field("connections", &self.connection_count())
            .field("closed", &self.closed)
            .finish()
    }
}
