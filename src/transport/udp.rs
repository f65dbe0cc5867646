//! UDP transport over `tokio::net::UdpSocket`.
//!
//! Two background tasks own the socket: one reads datagrams into an inbound
//! channel, the other writes queued datagrams (honouring the conditioner's
//! delivery time). The transport itself is synchronous and only touches the
//! channels, so the session pump never awaits.
//!
//! ## Datagram Format
//! ```text
//! [Kind(1)] [Body(N)]
//! ```
//! | kind | body |
//! |------|------|
//! | CONNECT | - |
//! | ACCEPT | - |
//! | DATA | flags(1), payload |
//! | CLOSE | reason (UTF-8) |
//! | PING / PONG | sequence(4, LE) |
//!
//! One connection per remote address. No retransmission: every send is
//! best effort regardless of the reliable flag.
//!
//! `send_buffer_size` caps the bytes queued for the socket but not yet
//! written; sends past it fail. `receive_buffer_size` caps the bytes held per
//! connection until `receive` takes them; datagrams past it are dropped. A
//! single message larger than either cap still passes when its queue is empty.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::TransportConfig;
use crate::error::constants::{
    ERR_NOT_CONNECTED, ERR_UNKNOWN_HANDLE, ERR_UNKNOWN_POLL_GROUP, REASON_CONNECT_TIMEOUT,
    REASON_NO_LISTENER, REASON_TIMED_OUT,
};
use crate::error::{ProtocolError, Result};
use crate::transport::{
    drain_poll_group, LinkStats, ListenHandle, PeerAddress, PollGroupHandle, ReceivedMessage, SendFlags,
    StatusChange, Transport, TransportHandle, TransportState,
};
use crate::utils::metrics::global_metrics;
use crate::utils::LinkConditioner;

const KIND_CONNECT: u8 = 1;
const KIND_ACCEPT: u8 = 2;
const KIND_DATA: u8 = 3;
const KIND_CLOSE: u8 = 4;
const KIND_PING: u8 = 5;
const KIND_PONG: u8 = 6;

/// Largest UDP payload over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// DATA datagram overhead: kind + flags
const DATA_HEADER_SIZE: usize = 2;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(250);
const PING_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

struct Outbound {
    to: SocketAddr,
    datagram: Bytes,
    deliver_at: Instant,
}

#[derive(Debug)]
struct UdpLink {
    remote: SocketAddr,
    listen: Option<ListenHandle>,
    state: TransportState,
    inbox: VecDeque<ReceivedMessage>,
    inbox_bytes: usize,
    poll_group: Option<PollGroupHandle>,
    stats: LinkStats,
    created: Instant,
    last_received: Instant,
    last_connect_sent: Instant,
    last_ping_sent: Option<(u32, Instant)>,
    ping_sequence: u32,
}

impl UdpLink {
    fn new(remote: SocketAddr, listen: Option<ListenHandle>, state: TransportState) -> Self {
        let now = Instant::now();
        Self {
            remote,
            listen,
            state,
            inbox: VecDeque::new(),
            inbox_bytes: 0,
            poll_group: None,
            stats: LinkStats::default(),
            created: now,
            last_received: now,
            last_connect_sent: now,
            last_ping_sent: None,
            ping_sequence: 0,
        }
    }
}

/// UDP datagram transport
pub struct UdpTransport {
    local_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Outbound>,
    inbound: mpsc::UnboundedReceiver<(SocketAddr, Bytes)>,
    cancel: CancellationToken,
    conditioner: LinkConditioner,
    idle_timeout: Duration,
    /// Bytes handed to the send task and not yet written
    queued_bytes: Arc<AtomicUsize>,
    send_buffer_size: usize,
    receive_buffer_size: usize,
    next_id: u32,
    listen: Option<ListenHandle>,
    links: HashMap<TransportHandle, UdpLink>,
    by_addr: HashMap<SocketAddr, TransportHandle>,
    /// Poll groups and the member that led the last batch
    groups: HashMap<PollGroupHandle, Option<TransportHandle>>,
    events: Vec<StatusChange>,
}

impl UdpTransport {
    /// Bind a socket and start the I/O tasks. Must be called inside a tokio runtime.
    #[instrument(skip(config))]
    pub async fn bind(addr: SocketAddr, config: &TransportConfig) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        let cancel = CancellationToken::new();

        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let queued_bytes = Arc::new(AtomicUsize::new(0));

        tokio::spawn(recv_loop(Arc::clone(&socket), inbound_tx, cancel.clone()));
        tokio::spawn(send_loop(socket, outbound_rx, Arc::clone(&queued_bytes)));

        info!(%local_addr, "UDP transport bound");
        Ok(Self {
            local_addr,
            outbound,
            inbound,
            cancel,
            conditioner: LinkConditioner::from_config(config),
            idle_timeout: config.idle_timeout,
            queued_bytes,
            send_buffer_size: config.send_buffer_size,
            receive_buffer_size: config.receive_buffer_size,
            next_id: 0,
            listen: None,
            links: HashMap::new(),
            by_addr: HashMap::new(),
            groups: HashMap::new(),
            events: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn emit(&mut self, handle: TransportHandle, old: TransportState, reason: Option<String>) {
        let Some(link) = self.links.get(&handle) else {
            return;
        };
        self.events.push(StatusChange {
            handle,
            listen: link.listen,
            old,
            new: link.state,
            reason,
        });
    }

    fn set_state(&mut self, handle: TransportHandle, new: TransportState, reason: Option<String>) {
        let Some(link) = self.links.get_mut(&handle) else {
            return;
        };
        let old = link.state;
        if old == new {
            return;
        }
        link.state = new;
        self.emit(handle, old, reason);
    }

    fn queue(&mut self, to: SocketAddr, datagram: Bytes) {
        let deliver_at = self.conditioner.delivery_time(Instant::now());
        let len = datagram.len();
        self.queued_bytes.fetch_add(len, Ordering::Relaxed);
        if self
            .outbound
            .send(Outbound {
                to,
                datagram,
                deliver_at,
            })
            .is_err()
        {
            self.queued_bytes.fetch_sub(len, Ordering::Relaxed);
            warn!(%to, "UDP send task has stopped");
        }
    }

    fn queue_control(&mut self, to: SocketAddr, kind: u8, body: &[u8]) {
        let mut datagram = BytesMut::with_capacity(1 + body.len());
        datagram.put_u8(kind);
        datagram.put_slice(body);
        self.queue(to, datagram.freeze());
    }

    fn owned(&self, handle: TransportHandle) -> Result<&UdpLink> {
        self.links.get(&handle).ok_or_else(|| {
            ProtocolError::TransportError(format!("{ERR_UNKNOWN_HANDLE}: {handle}"))
        })
    }

    fn owned_mut(&mut self, handle: TransportHandle) -> Result<&mut UdpLink> {
        self.links.get_mut(&handle).ok_or_else(|| {
            ProtocolError::TransportError(format!("{ERR_UNKNOWN_HANDLE}: {handle}"))
        })
    }

    /// Drain the inbound channel and apply each datagram
    fn pump_socket(&mut self) {
        while let Ok((from, datagram)) = self.inbound.try_recv() {
            self.handle_datagram(from, datagram);
        }
    }

    fn handle_datagram(&mut self, from: SocketAddr, datagram: Bytes) {
        let Some(&kind) = datagram.first() else {
            return;
        };
        let existing = self.by_addr.get(&from).copied();
        if let Some(handle) = existing {
            if let Some(link) = self.links.get_mut(&handle) {
                link.last_received = Instant::now();
            }
        }

        match (kind, existing) {
            (KIND_CONNECT, None) => self.on_connect_request(from),
            (KIND_CONNECT, Some(handle)) => {
                let state = self.links.get(&handle).map(|link| link.state);
                match state {
                    // Our ACCEPT was lost
                    Some(TransportState::Connected) => self.queue_control(from, KIND_ACCEPT, &[]),
                    Some(state) if state.is_terminal() => {
                        self.forget(handle);
                        self.on_connect_request(from);
                    }
                    _ => {}
                }
            }
            (KIND_ACCEPT, Some(handle)) => {
                let connecting = self.links.get(&handle).is_some_and(|link| {
                    link.listen.is_none()
                        && matches!(link.state, TransportState::Connecting | TransportState::FindingRoute)
                });
                if connecting {
                    if let Some(link) = self.links.get_mut(&handle) {
                        link.stats.ping_ms = elapsed_ms(link.last_connect_sent);
                    }
                    self.set_state(handle, TransportState::Connected, None);
                    debug!(%handle, remote = %from, "UDP connection accepted by peer");
                }
            }
            (KIND_DATA, Some(handle)) => {
                let Some(link) = self.links.get_mut(&handle) else {
                    return;
                };
                if link.state != TransportState::Connected || datagram.len() < DATA_HEADER_SIZE {
                    return;
                }
                let flags = SendFlags(datagram[1]);
                let data = datagram.slice(DATA_HEADER_SIZE..);
                if !link.inbox.is_empty() && link.inbox_bytes + data.len() > self.receive_buffer_size {
                    trace!(%handle, len = data.len(), queued = link.inbox_bytes, "Receive buffer full, dropping datagram");
                    global_metrics().message_dropped();
                    return;
                }
                link.stats.messages_received += 1;
                link.stats.bytes_received += data.len() as u64;
                link.inbox_bytes += data.len();
                link.inbox.push_back(ReceivedMessage { handle, data, flags });
            }
            (KIND_CLOSE, Some(handle)) => {
                let reason = String::from_utf8_lossy(&datagram[1..]).into_owned();
                let live = self
                    .links
                    .get(&handle)
                    .is_some_and(|link| !link.state.is_terminal());
                if live {
                    debug!(%handle, remote = %from, %reason, "UDP connection closed by peer");
                    let reason = (!reason.is_empty()).then_some(reason);
                    self.set_state(handle, TransportState::ClosedByPeer, reason);
                }
            }
            (KIND_PING, Some(_)) => self.queue_control(from, KIND_PONG, &datagram[1..]),
            (KIND_PONG, Some(handle)) => {
                if datagram.len() < 5 {
                    return;
                }
                let sequence = u32::from_le_bytes([datagram[1], datagram[2], datagram[3], datagram[4]]);
                if let Some(link) = self.links.get_mut(&handle) {
                    if let Some((expected, sent)) = link.last_ping_sent {
                        if expected == sequence {
                            link.stats.ping_ms = elapsed_ms(sent);
                            link.last_ping_sent = None;
                        }
                    }
                }
            }
            (kind, None) if kind != KIND_CLOSE => {
                self.queue_control(from, KIND_CLOSE, ERR_NOT_CONNECTED.as_bytes());
            }
            _ => trace!(kind, remote = %from, "Ignored datagram"),
        }
    }

    fn on_connect_request(&mut self, from: SocketAddr) {
        let Some(listen) = self.listen else {
            self.queue_control(from, KIND_CLOSE, REASON_NO_LISTENER.as_bytes());
            return;
        };
        let handle = TransportHandle(self.next_id());
        self.links
            .insert(handle, UdpLink::new(from, Some(listen), TransportState::Connecting));
        self.by_addr.insert(from, handle);
        self.emit(handle, TransportState::None, None);
        debug!(%handle, remote = %from, "Incoming UDP connection");
    }

    fn forget(&mut self, handle: TransportHandle) {
        if let Some(link) = self.links.remove(&handle) {
            if self.by_addr.get(&link.remote) == Some(&handle) {
                self.by_addr.remove(&link.remote);
            }
        }
    }

    fn timed_out(&self, since: Instant, now: Instant, limit: Duration) -> bool {
        !limit.is_zero() && now.duration_since(since) > limit
    }
}

fn take_inbox(link: &mut UdpLink, max: usize, out: &mut Vec<ReceivedMessage>) -> usize {
    let count = max.min(link.inbox.len());
    for message in link.inbox.drain(..count) {
        link.inbox_bytes -= message.data.len();
        out.push(message);
    }
    count
}

fn elapsed_ms(since: Instant) -> u32 {
    u32::try_from(since.elapsed().as_millis()).unwrap_or(u32::MAX)
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    inbound: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
    cancel: CancellationToken,
) {
    // Room for the largest datagram so recv_from never truncates
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, from)) => {
                    if inbound.send((from, Bytes::copy_from_slice(&buf[..len]))).is_err() {
                        break;
                    }
                }
                // ICMP port unreachable surfaces here on some platforms
                Err(e) => debug!(error = %e, "UDP receive failed"),
            }
        }
    }
    trace!("UDP receive task stopped");
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    queued_bytes: Arc<AtomicUsize>,
) {
    while let Some(item) = outbound.recv().await {
        if item.deliver_at > Instant::now() {
            tokio::time::sleep_until(item.deliver_at.into()).await;
        }
        if let Err(e) = socket.send_to(&item.datagram, item.to).await {
            warn!(error = %e, to = %item.to, "UDP send failed");
        }
        queued_bytes.fetch_sub(item.datagram.len(), Ordering::Relaxed);
    }
    trace!("UDP send task stopped");
}

impl Transport for UdpTransport {
    fn listen(&mut self, port: u16) -> Result<ListenHandle> {
        if port != 0 && port != self.local_addr.port() {
            return Err(ProtocolError::TransportError(format!(
                "UDP transport is bound to {}, cannot listen on port {port}",
                self.local_addr
            )));
        }
        if self.listen.is_some() {
            return Err(ProtocolError::TransportError(
                "UDP transport is already listening".to_string(),
            ));
        }
        let listen = ListenHandle(self.next_id());
        self.listen = Some(listen);
        info!(addr = %self.local_addr, %listen, "Listening for UDP connections");
        Ok(listen)
    }

    fn close_listen(&mut self, listen: ListenHandle) -> Result<()> {
        if self.listen != Some(listen) {
            return Err(ProtocolError::TransportError(format!(
                "Unknown listen handle {listen}"
            )));
        }
        self.listen = None;
        let accepted: Vec<TransportHandle> = self
            .links
            .iter()
            .filter(|(_, link)| link.listen == Some(listen))
            .map(|(handle, _)| *handle)
            .collect();
        for handle in accepted {
            self.close(handle, None);
        }
        Ok(())
    }

    fn connect(&mut self, address: &PeerAddress) -> Result<TransportHandle> {
        let PeerAddress::Ip(remote) = *address else {
            return Err(ProtocolError::NoRoute(format!(
                "UDP transport cannot resolve {address}"
            )));
        };
        if let Some(existing) = self.by_addr.get(&remote).copied() {
            if self.links.get(&existing).is_some_and(|link| !link.state.is_terminal()) {
                return Err(ProtocolError::TransportError(format!(
                    "Already connected to {remote}"
                )));
            }
            self.forget(existing);
        }
        let handle = TransportHandle(self.next_id());
        self.links
            .insert(handle, UdpLink::new(remote, None, TransportState::Connecting));
        self.by_addr.insert(remote, handle);
        self.queue_control(remote, KIND_CONNECT, &[]);
        debug!(%handle, %remote, "Connecting over UDP");
        Ok(handle)
    }

    fn accept(&mut self, handle: TransportHandle) -> Result<()> {
        let link = self.owned(handle)?;
        if link.state != TransportState::Connecting || link.listen.is_none() {
            return Err(ProtocolError::TransportError(format!(
                "{handle} is not an incoming connection awaiting accept"
            )));
        }
        let remote = link.remote;
        self.queue_control(remote, KIND_ACCEPT, &[]);
        self.set_state(handle, TransportState::Connected, None);
        Ok(())
    }

    fn send(&mut self, handle: TransportHandle, data: &[u8], flags: SendFlags) -> Result<()> {
        if data.len() + DATA_HEADER_SIZE > MAX_DATAGRAM_SIZE {
            return Err(ProtocolError::TransportError(format!(
                "Message of {} bytes does not fit in a datagram",
                data.len()
            )));
        }
        let queued = self.queued_bytes.load(Ordering::Relaxed);
        let send_buffer_size = self.send_buffer_size;
        let dropped = self.conditioner.should_drop(flags);
        let link = self.owned_mut(handle)?;
        if link.state != TransportState::Connected {
            return Err(ProtocolError::TransportError(format!(
                "{ERR_NOT_CONNECTED}: {handle}"
            )));
        }
        if queued > 0 && queued + DATA_HEADER_SIZE + data.len() > send_buffer_size {
            return Err(ProtocolError::TransportError(format!(
                "Send buffer full on {handle} ({queued} bytes queued)"
            )));
        }
        link.stats.messages_sent += 1;
        link.stats.bytes_sent += data.len() as u64;
        let remote = link.remote;
        if dropped {
            trace!(%handle, len = data.len(), "Conditioner dropped datagram");
            return Ok(());
        }

        let mut datagram = BytesMut::with_capacity(DATA_HEADER_SIZE + data.len());
        datagram.put_u8(KIND_DATA);
        datagram.put_u8(flags.bits());
        datagram.put_slice(data);
        self.queue(remote, datagram.freeze());
        Ok(())
    }

    fn receive(
        &mut self,
        handle: TransportHandle,
        max: usize,
        out: &mut Vec<ReceivedMessage>,
    ) -> Result<usize> {
        self.pump_socket();
        Ok(take_inbox(self.owned_mut(handle)?, max, out))
    }

    fn create_poll_group(&mut self) -> PollGroupHandle {
        let group = PollGroupHandle(self.next_id());
        self.groups.insert(group, None);
        group
    }

    fn destroy_poll_group(&mut self, group: PollGroupHandle) -> bool {
        if self.groups.remove(&group).is_none() {
            return false;
        }
        for link in self.links.values_mut() {
            if link.poll_group == Some(group) {
                link.poll_group = None;
            }
        }
        true
    }

    fn set_poll_group(&mut self, handle: TransportHandle, group: Option<PollGroupHandle>) -> Result<()> {
        if let Some(group) = group {
            if !self.groups.contains_key(&group) {
                return Err(ProtocolError::TransportError(format!(
                    "{ERR_UNKNOWN_POLL_GROUP}: {group}"
                )));
            }
        }
        self.owned_mut(handle)?.poll_group = group;
        Ok(())
    }

    fn receive_on_poll_group(
        &mut self,
        group: PollGroupHandle,
        max: usize,
        out: &mut Vec<ReceivedMessage>,
    ) -> Result<usize> {
        let Some(&last_lead) = self.groups.get(&group) else {
            return Err(ProtocolError::TransportError(format!(
                "{ERR_UNKNOWN_POLL_GROUP}: {group}"
            )));
        };
        self.pump_socket();
        let members: Vec<TransportHandle> = self
            .links
            .iter()
            .filter(|(_, link)| link.poll_group == Some(group))
            .map(|(handle, _)| *handle)
            .collect();

        let links = &mut self.links;
        let (total, lead) = drain_poll_group(members, last_lead, max, |handle, limit| {
            links
                .get_mut(&handle)
                .map_or(0, |link| take_inbox(link, limit, out))
        });
        self.groups.insert(group, lead);
        Ok(total)
    }

    fn close(&mut self, handle: TransportHandle, reason: Option<&str>) -> bool {
        let Some(link) = self.links.get(&handle) else {
            return false;
        };
        if !link.state.is_terminal() {
            let remote = link.remote;
            self.queue_control(remote, KIND_CLOSE, reason.unwrap_or("").as_bytes());
        }
        self.forget(handle);
        debug!(%handle, reason = reason.unwrap_or(""), "Closed UDP connection");
        true
    }

    fn state(&self, handle: TransportHandle) -> TransportState {
        self.links
            .get(&handle)
            .map_or(TransportState::None, |link| link.state)
    }

    fn link_stats(&self, handle: TransportHandle) -> Option<LinkStats> {
        self.links.get(&handle).map(|link| link.stats)
    }

    fn run_callbacks(&mut self, events: &mut Vec<StatusChange>) {
        self.pump_socket();
        let now = Instant::now();
        let connect_timeout = if self.idle_timeout.is_zero() {
            DEFAULT_CONNECT_TIMEOUT
        } else {
            self.idle_timeout
        };

        let mut retry = Vec::new();
        let mut ping = Vec::new();
        let mut expired = Vec::new();
        for (handle, link) in &self.links {
            match link.state {
                TransportState::Connecting | TransportState::FindingRoute if link.listen.is_none() => {
                    if self.timed_out(link.created, now, connect_timeout) {
                        expired.push((*handle, REASON_CONNECT_TIMEOUT));
                    } else if now.duration_since(link.last_connect_sent) >= CONNECT_RETRY_INTERVAL {
                        retry.push(*handle);
                    }
                }
                TransportState::Connecting => {
                    if self.timed_out(link.created, now, connect_timeout) {
                        expired.push((*handle, REASON_TIMED_OUT));
                    }
                }
                TransportState::Connected => {
                    if self.timed_out(link.last_received, now, self.idle_timeout) {
                        expired.push((*handle, REASON_TIMED_OUT));
                    } else if link
                        .last_ping_sent
                        .map_or(now.duration_since(link.last_received) >= PING_INTERVAL, |(_, sent)| {
                            now.duration_since(sent) >= PING_INTERVAL
                        })
                    {
                        ping.push(*handle);
                    }
                }
                _ => {}
            }
        }

        for handle in retry {
            if let Some(link) = self.links.get_mut(&handle) {
                link.last_connect_sent = now;
                let remote = link.remote;
                self.queue_control(remote, KIND_CONNECT, &[]);
            }
        }
        for handle in ping {
            if let Some(link) = self.links.get_mut(&handle) {
                link.ping_sequence = link.ping_sequence.wrapping_add(1);
                let sequence = link.ping_sequence;
                link.last_ping_sent = Some((sequence, now));
                let remote = link.remote;
                self.queue_control(remote, KIND_PING, &sequence.to_le_bytes());
            }
        }
        for (handle, reason) in expired {
            warn!(%handle, reason, "UDP connection timed out");
            self.set_state(
                handle,
                TransportState::ProblemDetectedLocally,
                Some(reason.to_string()),
            );
        }

        events.append(&mut self.events);
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        let live: Vec<TransportHandle> = self.links.keys().copied().collect();
        for handle in live {
            self.close(handle, None);
        }
        self.cancel.cancel();
    }
}
