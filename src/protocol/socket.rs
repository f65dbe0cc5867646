//! Listen socket: accepts and multiplexes many connections.
//!
//! The socket owns every connection it accepts. Connections share one
//! transport poll group, so a single receive call per pump pulls messages for
//! all of them into the socket's incoming queue. Broadcasts go through a
//! socket-level fan-out queue, so a frame is encoded once however many
//! targets it has.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::core::frame::{FrameDecoder, FrameEncoder};
use crate::error::constants::{REASON_HOST_SHUTDOWN, REASON_SERVER_FULL};
use crate::error::{ProtocolError, Result};
use crate::protocol::connection::{
    Connection, ConnectionId, ConnectionKind, ConnectionState, IncomingMessage, PumpStats,
};
use crate::protocol::message::PeerId;
use crate::transport::{
    ListenHandle, PollGroupHandle, ReceivedMessage, SendFlags, Transport, TransportHandle,
    TransportState,
};

/// Connection lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// Transport connected; the connection is in Welcome awaiting `Hello`
    Connected(ConnectionId),
    Disconnected {
        id: ConnectionId,
        peer: Option<PeerId>,
        reason: Option<String>,
    },
}

#[derive(Debug)]
struct FanOut {
    targets: Vec<ConnectionId>,
    frame: Bytes,
    flags: SendFlags,
}

#[derive(Debug)]
pub struct ListenSocket {
    listen: Option<ListenHandle>,
    poll_group: Option<PollGroupHandle>,
    port: u16,
    max_connections: usize,
    encoder: FrameEncoder,
    connections: HashMap<ConnectionId, Connection>,
    by_handle: HashMap<TransportHandle, ConnectionId>,
    fanout_tx: mpsc::UnboundedSender<FanOut>,
    fanout_rx: mpsc::UnboundedReceiver<FanOut>,
    incoming_tx: mpsc::UnboundedSender<IncomingMessage>,
    incoming_rx: mpsc::UnboundedReceiver<IncomingMessage>,
    events: VecDeque<SocketEvent>,
    batch: Vec<ReceivedMessage>,
}

impl ListenSocket {
    /// Open a listen endpoint and its poll group
    #[instrument(skip(transport, encoder))]
    pub fn open(
        transport: &mut dyn Transport,
        port: u16,
        max_connections: usize,
        encoder: FrameEncoder,
    ) -> Result<Self> {
        let listen = transport.listen(port)?;
        let poll_group = transport.create_poll_group();
        let (fanout_tx, fanout_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        info!(port, max_connections, "Listen socket opened");
        Ok(Self {
            listen: Some(listen),
            poll_group: Some(poll_group),
            port,
            max_connections,
            encoder,
            connections: HashMap::new(),
            by_handle: HashMap::new(),
            fanout_tx,
            fanout_rx,
            incoming_tx,
            incoming_rx,
            events: VecDeque::new(),
            batch: Vec::new(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn listen_handle(&self) -> Option<ListenHandle> {
        self.listen
    }

    pub fn is_open(&self) -> bool {
        self.listen.is_some()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connections that completed the handshake
    pub fn active_count(&self) -> usize {
        self.connections
            .values()
            .filter(|c| c.state() == ConnectionState::Active)
            .count()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn id_for_handle(&self, handle: TransportHandle) -> Option<ConnectionId> {
        self.by_handle.get(&handle).copied()
    }

    /// First open connection authenticated as `peer`, other than `except`
    pub fn find_peer(&self, peer: PeerId, except: Option<ConnectionId>) -> Option<ConnectionId> {
        self.connections
            .values()
            .find(|c| c.peer_id() == Some(peer) && Some(c.id()) != except && c.is_open())
            .map(Connection::id)
    }

    /// Accept an incoming connection and track it under the poll group
    pub fn on_connecting(
        &mut self,
        transport: &mut dyn Transport,
        handle: TransportHandle,
    ) -> Result<ConnectionId> {
        if let Some(id) = self.by_handle.get(&handle) {
            return Ok(*id);
        }
        if !self.is_open() {
            transport.close(handle, Some(REASON_HOST_SHUTDOWN));
            return Err(ProtocolError::ConnectionClosed);
        }
        if self.connections.len() >= self.max_connections {
            warn!(%handle, max = self.max_connections, "Connection table full");
            transport.close(handle, Some(REASON_SERVER_FULL));
            return Err(ProtocolError::ServerFull);
        }

        transport.accept(handle)?;
        let mut connection = Connection::new(
            handle,
            ConnectionKind::ServerHosted,
            ConnectionState::Connecting,
            false,
            self.encoder,
        );
        if let Err(e) = transport.set_poll_group(handle, self.poll_group) {
            connection.close(transport, None);
            return Err(e);
        }
        let id = connection.id();
        self.by_handle.insert(handle, id);
        self.connections.insert(id, connection);
        debug!(connection = %id, %handle, "Accepted incoming connection");
        Ok(id)
    }

    /// Transport connected: advance to Welcome
    pub fn on_connected(&mut self, handle: TransportHandle) -> Result<Option<ConnectionId>> {
        let Some(id) = self.by_handle.get(&handle).copied() else {
            return Ok(None);
        };
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.transition(ConnectionState::Welcome)?;
            self.events.push_back(SocketEvent::Connected(id));
        }
        Ok(Some(id))
    }

    /// Transport reported the connection gone: remove and close it
    pub fn on_disconnected(
        &mut self,
        transport: &mut dyn Transport,
        handle: TransportHandle,
        state: TransportState,
        reason: Option<&str>,
    ) -> Option<ConnectionId> {
        let id = self.by_handle.get(&handle).copied()?;
        if let Some(connection) = self.connections.get_mut(&id) {
            if let Err(e) = connection.on_transport_state(state, reason) {
                debug!(connection = %id, error = %e, "Ignoring transport state");
            }
        }
        self.remove(transport, id, None);
        Some(id)
    }

    /// Close one connection with a reason sent to the peer
    pub fn close_connection(
        &mut self,
        transport: &mut dyn Transport,
        id: ConnectionId,
        reason: &str,
    ) -> bool {
        self.remove(transport, id, Some(reason))
    }

    /// Kick a connection; fails with `NotHost` unless `local_is_host`
    pub fn kick(
        &mut self,
        transport: &mut dyn Transport,
        id: ConnectionId,
        local_is_host: bool,
        reason: Option<&str>,
    ) -> Result<()> {
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or_else(|| ProtocolError::NoRoute(id.to_string()))?;
        connection.kick(transport, local_is_host, reason)?;
        self.remove(transport, id, None);
        Ok(())
    }

    fn remove(&mut self, transport: &mut dyn Transport, id: ConnectionId, reason: Option<&str>) -> bool {
        let Some(mut connection) = self.connections.remove(&id) else {
            return false;
        };
        self.by_handle.retain(|_, v| *v != id);
        connection.close(transport, reason);
        self.events.push_back(SocketEvent::Disconnected {
            id,
            peer: connection.peer_id(),
            reason: connection.close_reason().map(str::to_string),
        });
        true
    }

    /// Queue one encoded frame for several connections
    pub fn broadcast_frame(&self, targets: Vec<ConnectionId>, frame: Bytes, flags: SendFlags) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        self.fanout_tx
            .send(FanOut {
                targets,
                frame,
                flags,
            })
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Pump: flush every connection's queue and the fan-out queue, then pull
    /// one batch for the whole poll group into the socket incoming queue
    pub fn process_messages_in_thread(
        &mut self,
        transport: &mut dyn Transport,
        decoder: &mut FrameDecoder,
        batch_size: usize,
    ) -> PumpStats {
        let mut pumped = PumpStats::default();

        for connection in self.connections.values_mut() {
            pumped.merge(connection.flush(transport));
        }

        while let Ok(fanout) = self.fanout_rx.try_recv() {
            for target in &fanout.targets {
                let Some(connection) = self.connections.get_mut(target) else {
                    continue;
                };
                let Some(handle) = connection.handle().filter(|_| connection.is_open()) else {
                    continue;
                };
                let len = fanout.frame.len() as u64;
                match transport.send(handle, &fanout.frame, fanout.flags) {
                    Ok(()) => {
                        connection.record_sent(len);
                        pumped.messages_sent += 1;
                        pumped.bytes_sent += len;
                    }
                    Err(e) => {
                        warn!(connection = %target, error = %e, "Dropped broadcast frame");
                        connection.record_dropped();
                        pumped.messages_dropped += 1;
                    }
                }
            }
        }

        let Some(group) = self.poll_group else {
            return pumped;
        };
        self.batch.clear();
        if let Err(e) = transport.receive_on_poll_group(group, batch_size, &mut self.batch) {
            warn!(error = %e, "Poll group receive failed");
            return pumped;
        }
        for message in self.batch.drain(..) {
            pumped.messages_received += 1;
            pumped.bytes_received += message.data.len() as u64;
            let Some(id) = self.by_handle.get(&message.handle).copied() else {
                continue;
            };
            let Some(connection) = self.connections.get_mut(&id) else {
                continue;
            };
            if let Some(incoming) = connection.decode_received(decoder, &message) {
                // Receiver lives in self; the send cannot fail
                let _ = self.incoming_tx.send(incoming);
            }
        }
        pumped
    }

    pub fn next_incoming(&mut self) -> Option<IncomingMessage> {
        self.incoming_rx.try_recv().ok()
    }

    pub fn next_event(&mut self) -> Option<SocketEvent> {
        self.events.pop_front()
    }

    /// Force-close every connection, the listen endpoint and the poll group
    pub fn close(&mut self, transport: &mut dyn Transport) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            self.remove(transport, id, Some(REASON_HOST_SHUTDOWN));
        }
        if let Some(listen) = self.listen.take() {
            if let Err(e) = transport.close_listen(listen) {
                debug!(error = %e, "Listen endpoint already gone");
            }
            info!(port = self.port, "Listen socket closed");
        }
        if let Some(group) = self.poll_group.take() {
            transport.destroy_poll_group(group);
        }
        while self.fanout_rx.try_recv().is_ok() {}
        while self.incoming_rx.try_recv().is_ok() {}
    }
}
