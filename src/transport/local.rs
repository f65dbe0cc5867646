//! In-process transport.
//!
//! A [`LocalNetwork`] is a hub shared by any number of [`LocalTransport`]
//! endpoints in the same process. Endpoints listen on ports, connect to each
//! other by port or through the relay directory, and exchange messages via
//! per-link inboxes. Each endpoint applies its own [`LinkConditioner`] to
//! what it sends.
//!
//! An endpoint counts as alive while it keeps calling `run_callbacks`. If
//! the far side of a connected link stops pumping for longer than the idle
//! timeout, the link fails with `ProblemDetectedLocally`.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::TransportConfig;
use crate::error::constants::{
    ERR_NOT_CONNECTED, ERR_UNKNOWN_HANDLE, ERR_UNKNOWN_POLL_GROUP, REASON_NO_LISTENER,
    REASON_ROUTE_NOT_FOUND, REASON_TIMED_OUT,
};
use crate::error::{ProtocolError, Result};
use crate::protocol::message::PeerId;
use crate::transport::{
    drain_poll_group, LinkStats, ListenHandle, PeerAddress, PollGroupHandle, ReceivedMessage, SendFlags,
    StatusChange, Transport, TransportHandle, TransportState,
};
use crate::utils::LinkConditioner;

type EndpointId = u32;

#[derive(Debug)]
struct Pending {
    data: Bytes,
    flags: SendFlags,
    deliver_at: Instant,
}

#[derive(Debug)]
struct Link {
    owner: EndpointId,
    peer: Option<TransportHandle>,
    listen: Option<ListenHandle>,
    state: TransportState,
    inbox: VecDeque<Pending>,
    inbox_bytes: usize,
    poll_group: Option<PollGroupHandle>,
    stats: LinkStats,
    created: Instant,
}

impl Link {
    fn new(owner: EndpointId, listen: Option<ListenHandle>, state: TransportState) -> Self {
        Self {
            owner,
            peer: None,
            listen,
            state,
            inbox: VecDeque::new(),
            inbox_bytes: 0,
            poll_group: None,
            stats: LinkStats::default(),
            created: Instant::now(),
        }
    }
}

#[derive(Debug, Default)]
struct Hub {
    next_id: u32,
    links: HashMap<TransportHandle, Link>,
    listeners: HashMap<u16, (EndpointId, ListenHandle)>,
    listen_ports: HashMap<ListenHandle, u16>,
    /// Owner and the member that led the last batch
    groups: HashMap<PollGroupHandle, (EndpointId, Option<TransportHandle>)>,
    directory: HashMap<PeerId, u16>,
    events: HashMap<EndpointId, Vec<StatusChange>>,
    last_pump: HashMap<EndpointId, Instant>,
}

impl Hub {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn push_event(
        &mut self,
        owner: EndpointId,
        handle: TransportHandle,
        listen: Option<ListenHandle>,
        old: TransportState,
        new: TransportState,
        reason: Option<String>,
    ) {
        self.events.entry(owner).or_default().push(StatusChange {
            handle,
            listen,
            old,
            new,
            reason,
        });
    }

    fn owns_group(&self, owner: EndpointId, group: PollGroupHandle) -> bool {
        self.groups.get(&group).is_some_and(|(id, _)| *id == owner)
    }

    fn owned_link(&mut self, owner: EndpointId, handle: TransportHandle) -> Result<&mut Link> {
        match self.links.get_mut(&handle) {
            Some(link) if link.owner == owner => Ok(link),
            _ => Err(ProtocolError::TransportError(format!(
                "{ERR_UNKNOWN_HANDLE}: {handle}"
            ))),
        }
    }

    /// Remove a link and tell the far side
    fn close_link(&mut self, handle: TransportHandle, reason: Option<&str>) -> bool {
        let Some(link) = self.links.remove(&handle) else {
            return false;
        };
        if let Some(peer_handle) = link.peer {
            if let Some(peer) = self.links.get_mut(&peer_handle) {
                peer.peer = None;
                if !peer.state.is_terminal() {
                    let old = peer.state;
                    peer.state = TransportState::ClosedByPeer;
                    let (owner, listen) = (peer.owner, peer.listen);
                    self.push_event(
                        owner,
                        peer_handle,
                        listen,
                        old,
                        TransportState::ClosedByPeer,
                        reason.map(str::to_string),
                    );
                }
            }
        }
        true
    }

    /// Pull ready messages off one link
    fn drain(&mut self, handle: TransportHandle, now: Instant, max: usize, out: &mut Vec<ReceivedMessage>) -> usize {
        let Some(link) = self.links.get_mut(&handle) else {
            return 0;
        };
        let mut count = 0;
        while count < max {
            match link.inbox.front() {
                Some(pending) if pending.deliver_at <= now => {}
                _ => break,
            }
            let Some(pending) = link.inbox.pop_front() else {
                break;
            };
            link.inbox_bytes -= pending.data.len();
            link.stats.messages_received += 1;
            link.stats.bytes_received += pending.data.len() as u64;
            out.push(ReceivedMessage {
                handle,
                data: pending.data,
                flags: pending.flags,
            });
            count += 1;
        }
        count
    }
}

fn lock(hub: &Mutex<Hub>) -> MutexGuard<'_, Hub> {
    hub.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared in-process network. Clones refer to the same hub.
#[derive(Debug, Clone, Default)]
pub struct LocalNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `peer` in the relay directory as reachable on `port`
    pub fn advertise(&self, peer: PeerId, port: u16) {
        lock(&self.hub).directory.insert(peer, port);
        debug!(%peer, port, "Advertised peer in relay directory");
    }

    pub fn withdraw(&self, peer: &PeerId) {
        lock(&self.hub).directory.remove(peer);
    }

    /// Look up a peer's port in the relay directory
    pub fn resolve(&self, peer: &PeerId) -> Option<u16> {
        lock(&self.hub).directory.get(peer).copied()
    }

    /// Number of open links across every endpoint
    pub fn open_links(&self) -> usize {
        lock(&self.hub).links.len()
    }

    /// Create an endpoint on this network
    pub fn endpoint(&self, config: &TransportConfig) -> LocalTransport {
        LocalTransport::new(self, config)
    }
}

/// One endpoint on a [`LocalNetwork`]
#[derive(Debug)]
pub struct LocalTransport {
    hub: Arc<Mutex<Hub>>,
    id: EndpointId,
    conditioner: LinkConditioner,
    idle_timeout: Duration,
    send_buffer_size: usize,
}

impl LocalTransport {
    pub fn new(network: &LocalNetwork, config: &TransportConfig) -> Self {
        Self::with_conditioner(network, config, LinkConditioner::from_config(config))
    }

    pub fn with_conditioner(
        network: &LocalNetwork,
        config: &TransportConfig,
        conditioner: LinkConditioner,
    ) -> Self {
        let id = {
            let mut hub = lock(&network.hub);
            let id = hub.next_id();
            hub.last_pump.insert(id, Instant::now());
            id
        };
        debug!(endpoint = id, conditioned = conditioner.is_active(), "Local endpoint created");
        Self {
            hub: Arc::clone(&network.hub),
            id,
            conditioner,
            idle_timeout: config.idle_timeout,
            send_buffer_size: config.send_buffer_size,
        }
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        lock(&self.hub)
    }

    fn timed_out(&self, since: Instant, now: Instant) -> bool {
        !self.idle_timeout.is_zero() && now.duration_since(since) > self.idle_timeout
    }
}

impl Transport for LocalTransport {
    fn listen(&mut self, port: u16) -> Result<ListenHandle> {
        let mut hub = self.hub();
        if hub.listeners.contains_key(&port) {
            return Err(ProtocolError::TransportError(format!(
                "Port {port} is already in use"
            )));
        }
        let listen = ListenHandle(hub.next_id());
        hub.listeners.insert(port, (self.id, listen));
        hub.listen_ports.insert(listen, port);
        info!(endpoint = self.id, port, %listen, "Listening on local port");
        Ok(listen)
    }

    fn close_listen(&mut self, listen: ListenHandle) -> Result<()> {
        let mut hub = self.hub();
        let port = hub
            .listen_ports
            .get(&listen)
            .copied()
            .ok_or_else(|| ProtocolError::TransportError(format!("Unknown listen handle {listen}")))?;
        match hub.listeners.get(&port) {
            Some((owner, _)) if *owner == self.id => {}
            _ => {
                return Err(ProtocolError::TransportError(format!(
                    "Unknown listen handle {listen}"
                )))
            }
        }
        hub.listeners.remove(&port);
        hub.listen_ports.remove(&listen);

        let accepted: Vec<TransportHandle> = hub
            .links
            .iter()
            .filter(|(_, link)| link.owner == self.id && link.listen == Some(listen))
            .map(|(handle, _)| *handle)
            .collect();
        for handle in accepted {
            hub.close_link(handle, None);
        }
        info!(endpoint = self.id, port, "Closed local listen port");
        Ok(())
    }

    fn connect(&mut self, address: &PeerAddress) -> Result<TransportHandle> {
        let mut hub = self.hub();
        let (port, client_state) = match address {
            PeerAddress::Local(port) => (*port, TransportState::Connecting),
            PeerAddress::Relay(peer) => {
                let port = hub.directory.get(peer).copied().ok_or_else(|| {
                    ProtocolError::NoRoute(format!("{peer}: {REASON_ROUTE_NOT_FOUND}"))
                })?;
                (port, TransportState::FindingRoute)
            }
            PeerAddress::Ip(addr) => {
                return Err(ProtocolError::TransportError(format!(
                    "Local transport cannot reach {addr}"
                )))
            }
        };
        let (server, listen) = hub.listeners.get(&port).copied().ok_or_else(|| {
            ProtocolError::TransportError(format!("{REASON_NO_LISTENER}: {address}"))
        })?;

        let client_handle = TransportHandle(hub.next_id());
        let server_handle = TransportHandle(hub.next_id());

        let mut client = Link::new(self.id, None, client_state);
        client.peer = Some(server_handle);
        let mut accepted = Link::new(server, Some(listen), TransportState::Connecting);
        accepted.peer = Some(client_handle);

        hub.links.insert(client_handle, client);
        hub.links.insert(server_handle, accepted);
        hub.push_event(
            server,
            server_handle,
            Some(listen),
            TransportState::None,
            TransportState::Connecting,
            None,
        );
        if client_state == TransportState::FindingRoute {
            hub.push_event(
                self.id,
                client_handle,
                None,
                TransportState::None,
                TransportState::FindingRoute,
                None,
            );
        }

        debug!(endpoint = self.id, %address, handle = %client_handle, "Connecting");
        Ok(client_handle)
    }

    fn accept(&mut self, handle: TransportHandle) -> Result<()> {
        let mut hub = self.hub();
        let link = hub.owned_link(self.id, handle)?;
        if link.state != TransportState::Connecting || link.listen.is_none() {
            return Err(ProtocolError::TransportError(format!(
                "{handle} is not an incoming connection awaiting accept"
            )));
        }
        link.state = TransportState::Connected;
        let listen = link.listen;
        let peer_handle = link.peer;
        hub.push_event(
            self.id,
            handle,
            listen,
            TransportState::Connecting,
            TransportState::Connected,
            None,
        );

        if let Some(peer_handle) = peer_handle {
            if let Some(peer) = hub.links.get_mut(&peer_handle) {
                let old = peer.state;
                peer.state = TransportState::Connected;
                let owner = peer.owner;
                hub.push_event(owner, peer_handle, None, old, TransportState::Connected, None);
            }
        }
        debug!(endpoint = self.id, %handle, "Accepted connection");
        Ok(())
    }

    fn send(&mut self, handle: TransportHandle, data: &[u8], flags: SendFlags) -> Result<()> {
        let now = Instant::now();
        let dropped = self.conditioner.should_drop(flags);
        let deliver_at = self.conditioner.delivery_time(now);
        let send_buffer_size = self.send_buffer_size;
        let mut hub = self.hub();

        let link = hub.owned_link(self.id, handle)?;
        if link.state != TransportState::Connected {
            return Err(ProtocolError::TransportError(format!(
                "{ERR_NOT_CONNECTED}: {handle}"
            )));
        }
        link.stats.messages_sent += 1;
        link.stats.bytes_sent += data.len() as u64;
        let Some(peer_handle) = link.peer else {
            return Err(ProtocolError::ConnectionClosed);
        };

        if dropped {
            trace!(%handle, len = data.len(), "Conditioner dropped message");
            return Ok(());
        }

        let peer = hub
            .links
            .get_mut(&peer_handle)
            .ok_or(ProtocolError::ConnectionClosed)?;
        if peer.inbox_bytes + data.len() > send_buffer_size {
            return Err(ProtocolError::TransportError(format!(
                "Send buffer full on {handle} ({} bytes queued)",
                peer.inbox_bytes
            )));
        }
        peer.inbox_bytes += data.len();
        peer.inbox.push_back(Pending {
            data: Bytes::copy_from_slice(data),
            flags,
            deliver_at,
        });
        Ok(())
    }

    fn receive(
        &mut self,
        handle: TransportHandle,
        max: usize,
        out: &mut Vec<ReceivedMessage>,
    ) -> Result<usize> {
        let mut hub = self.hub();
        hub.owned_link(self.id, handle)?;
        Ok(hub.drain(handle, Instant::now(), max, out))
    }

    fn create_poll_group(&mut self) -> PollGroupHandle {
        let mut hub = self.hub();
        let group = PollGroupHandle(hub.next_id());
        hub.groups.insert(group, (self.id, None));
        group
    }

    fn destroy_poll_group(&mut self, group: PollGroupHandle) -> bool {
        let mut hub = self.hub();
        if !hub.owns_group(self.id, group) {
            return false;
        }
        hub.groups.remove(&group);
        for link in hub.links.values_mut() {
            if link.poll_group == Some(group) {
                link.poll_group = None;
            }
        }
        true
    }

    fn set_poll_group(&mut self, handle: TransportHandle, group: Option<PollGroupHandle>) -> Result<()> {
        let mut hub = self.hub();
        if let Some(group) = group {
            if !hub.owns_group(self.id, group) {
                return Err(ProtocolError::TransportError(format!(
                    "{ERR_UNKNOWN_POLL_GROUP}: {group}"
                )));
            }
        }
        hub.owned_link(self.id, handle)?.poll_group = group;
        Ok(())
    }

    fn receive_on_poll_group(
        &mut self,
        group: PollGroupHandle,
        max: usize,
        out: &mut Vec<ReceivedMessage>,
    ) -> Result<usize> {
        let mut hub = self.hub();
        if !hub.owns_group(self.id, group) {
            return Err(ProtocolError::TransportError(format!(
                "{ERR_UNKNOWN_POLL_GROUP}: {group}"
            )));
        }
        let members: Vec<TransportHandle> = hub
            .links
            .iter()
            .filter(|(_, link)| link.poll_group == Some(group))
            .map(|(handle, _)| *handle)
            .collect();
        let last_lead = hub.groups.get(&group).and_then(|(_, lead)| *lead);

        let now = Instant::now();
        let (total, lead) = drain_poll_group(members, last_lead, max, |handle, limit| {
            hub.drain(handle, now, limit, out)
        });
        if let Some(entry) = hub.groups.get_mut(&group) {
            entry.1 = lead;
        }
        Ok(total)
    }

    fn close(&mut self, handle: TransportHandle, reason: Option<&str>) -> bool {
        let mut hub = self.hub();
        if hub.owned_link(self.id, handle).is_err() {
            return false;
        }
        debug!(endpoint = self.id, %handle, reason = reason.unwrap_or(""), "Closing connection");
        hub.close_link(handle, reason)
    }

    fn state(&self, handle: TransportHandle) -> TransportState {
        match self.hub().links.get(&handle) {
            Some(link) if link.owner == self.id => link.state,
            _ => TransportState::None,
        }
    }

    fn link_stats(&self, handle: TransportHandle) -> Option<LinkStats> {
        let ping_ms = u32::try_from(self.conditioner.latency().as_millis() * 2).unwrap_or(u32::MAX);
        let hub = self.hub();
        let link = hub.links.get(&handle).filter(|link| link.owner == self.id)?;
        Some(LinkStats {
            ping_ms,
            ..link.stats
        })
    }

    fn run_callbacks(&mut self, events: &mut Vec<StatusChange>) {
        let now = Instant::now();
        let mut hub = self.hub();
        hub.last_pump.insert(self.id, now);

        let mut expired = Vec::new();
        for (handle, link) in hub.links.iter().filter(|(_, link)| link.owner == self.id) {
            let since = match link.state {
                TransportState::Connecting | TransportState::FindingRoute => Some(link.created),
                TransportState::Connected => link
                    .peer
                    .and_then(|peer| hub.links.get(&peer))
                    .and_then(|peer| hub.last_pump.get(&peer.owner).copied()),
                _ => None,
            };
            if since.is_some_and(|since| self.timed_out(since, now)) {
                expired.push((*handle, link.listen, link.state));
            }
        }
        for (handle, listen, old) in expired {
            warn!(endpoint = self.id, %handle, "Connection timed out");
            if let Some(link) = hub.links.get_mut(&handle) {
                link.state = TransportState::ProblemDetectedLocally;
            }
            hub.push_event(
                self.id,
                handle,
                listen,
                old,
                TransportState::ProblemDetectedLocally,
                Some(REASON_TIMED_OUT.to_string()),
            );
        }

        if let Some(pending) = hub.events.get_mut(&self.id) {
            events.append(pending);
        }
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        let mut hub = lock(&self.hub);
        let owned: Vec<TransportHandle> = hub
            .links
            .iter()
            .filter(|(_, link)| link.owner == self.id)
            .map(|(handle, _)| *handle)
            .collect();
        for handle in owned {
            hub.close_link(handle, None);
        }
        let id = self.id;
        hub.listeners.retain(|_, (owner, _)| *owner != id);
        let ports: Vec<u16> = hub.listeners.keys().copied().collect();
        hub.listen_ports.retain(|_, port| ports.contains(port));
        hub.groups.retain(|_, (owner, _)| *owner != id);
        hub.events.remove(&id);
        hub.last_pump.remove(&id);
        debug!(endpoint = id, "Local endpoint dropped");
    }
}
