//! # Transport Layer
//!
//! Datagram transports that move frames between peers.
//!
//! The session layer never talks to sockets directly; it drives a
//! [`Transport`] from its per-frame pump. Every call is non-blocking:
//! sends are queued, receives return what has already arrived, and
//! connection state changes are collected with [`Transport::run_callbacks`].
//!
//! ## Backends
//! - **Local**: in-process hub for tests and single-machine play, with relay
//!   directory, fault injection and idle timeouts
//! - **UDP**: `tokio::net::UdpSocket` with a minimal connect/accept/close
//!   handshake and keepalive pings; unreliable, no retransmission
//!
//! ## Handles
//! Handles are opaque numbers chosen by the backend. A closed handle is
//! never reused by the same backend.

pub mod local;
pub mod udp;

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::ops::BitOr;

use crate::error::Result;
use crate::protocol::message::PeerId;

pub use local::{LocalNetwork, LocalTransport};
pub use udp::UdpTransport;

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

handle_type!(
    /// One end of a transport-level connection
    TransportHandle,
    "conn"
);
handle_type!(
    /// A listen endpoint
    ListenHandle,
    "listen"
);
handle_type!(
    /// A group of connections received from together
    PollGroupHandle,
    "group"
);

/// Where to connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerAddress {
    /// A socket address
    Ip(SocketAddr),
    /// A port on the in-process hub
    Local(u16),
    /// A peer resolved through the relay directory at connect time
    Relay(PeerId),
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddress::Ip(addr) => write!(f, "{addr}"),
            PeerAddress::Local(port) => write!(f, "local:{port}"),
            PeerAddress::Relay(peer) => write!(f, "relay:{peer}"),
        }
    }
}

/// Transport-level connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    None,
    Connecting,
    FindingRoute,
    Connected,
    ClosedByPeer,
    ProblemDetectedLocally,
}

impl TransportState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransportState::None | TransportState::ClosedByPeer | TransportState::ProblemDetectedLocally
        )
    }
}

/// A connection changed state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub handle: TransportHandle,
    /// Set when the connection arrived on one of our listen endpoints
    pub listen: Option<ListenHandle>,
    pub old: TransportState,
    pub new: TransportState,
    /// Close reason, when the change is a close
    pub reason: Option<String>,
}

/// Send behaviour bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SendFlags(pub u8);

impl SendFlags {
    pub const UNRELIABLE: SendFlags = SendFlags(0);
    pub const NO_NAGLE: SendFlags = SendFlags(1);
    pub const NO_DELAY: SendFlags = SendFlags(4);
    pub const RELIABLE: SendFlags = SendFlags(8);
    pub const UNRELIABLE_NO_DELAY: SendFlags = SendFlags(Self::NO_DELAY.0 | Self::NO_NAGLE.0);
    pub const RELIABLE_NO_NAGLE: SendFlags = SendFlags(Self::RELIABLE.0 | Self::NO_NAGLE.0);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: SendFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_reliable(self) -> bool {
        self.contains(Self::RELIABLE)
    }
}

impl BitOr for SendFlags {
    type Output = SendFlags;

    fn bitor(self, rhs: SendFlags) -> SendFlags {
        SendFlags(self.0 | rhs.0)
    }
}

/// A message pulled off a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub handle: TransportHandle,
    pub data: Bytes,
    pub flags: SendFlags,
}

/// Live per-connection statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub ping_ms: u32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// A datagram transport driven from the session pump.
///
/// Implementations must not block. Messages sent on one handle arrive in
/// send order; unreliable messages may be lost.
pub trait Transport: Send {
    /// Open a listen endpoint
    fn listen(&mut self, port: u16) -> Result<ListenHandle>;

    /// Close a listen endpoint and every connection accepted through it
    fn close_listen(&mut self, listen: ListenHandle) -> Result<()>;

    /// Start connecting. The handle is usable once its state reaches `Connected`.
    fn connect(&mut self, address: &PeerAddress) -> Result<TransportHandle>;

    /// Accept an incoming connection reported in `Connecting` state
    fn accept(&mut self, handle: TransportHandle) -> Result<()>;

    /// Queue a message
    fn send(&mut self, handle: TransportHandle, data: &[u8], flags: SendFlags) -> Result<()>;

    /// Append up to `max` messages from one connection to `out`, returning the count
    fn receive(
        &mut self,
        handle: TransportHandle,
        max: usize,
        out: &mut Vec<ReceivedMessage>,
    ) -> Result<usize>;

    fn create_poll_group(&mut self) -> PollGroupHandle;

    /// Returns false if the group did not exist
    fn destroy_poll_group(&mut self, group: PollGroupHandle) -> bool;

    /// Move a connection into a poll group, or out of any group with `None`
    fn set_poll_group(&mut self, handle: TransportHandle, group: Option<PollGroupHandle>) -> Result<()>;

    /// Append up to `max` messages from the connections in the group to `out`.
    ///
    /// Each member gets an even share of `max` before any member may take
    /// more, and successive calls start at the member after the one that
    /// led the previous batch.
    fn receive_on_poll_group(
        &mut self,
        group: PollGroupHandle,
        max: usize,
        out: &mut Vec<ReceivedMessage>,
    ) -> Result<usize>;

    /// Close a connection, telling the peer why when possible.
    /// Returns false if the handle was unknown.
    fn close(&mut self, handle: TransportHandle, reason: Option<&str>) -> bool;

    fn state(&self, handle: TransportHandle) -> TransportState;

    fn link_stats(&self, handle: TransportHandle) -> Option<LinkStats>;

    /// Run timers and append pending state changes to `events`
    fn run_callbacks(&mut self, events: &mut Vec<StatusChange>);
}

/// Drain up to `max` messages across a poll group's `members`.
///
/// Members are visited in handle order starting after `last_lead`. A first
/// pass caps every member at `max / members` (at least one), a second pass
/// hands whatever is left to members that still have messages. `drain` is
/// called with a handle and a limit and returns how many it took. Returns the
/// total and the member that led this batch.
pub(crate) fn drain_poll_group<F>(
    mut members: Vec<TransportHandle>,
    last_lead: Option<TransportHandle>,
    max: usize,
    mut drain: F,
) -> (usize, Option<TransportHandle>)
where
    F: FnMut(TransportHandle, usize) -> usize,
{
    members.sort_unstable();
    if let Some(last) = last_lead {
        let start = members.partition_point(|handle| *handle <= last);
        members.rotate_left(start);
    }
    let Some(&lead) = members.first() else {
        return (0, last_lead);
    };

    let share = (max / members.len()).max(1);
    let mut total = 0;
    for &handle in &members {
        if total >= max {
            break;
        }
        total += drain(handle, share.min(max - total));
    }
    for &handle in &members {
        if total >= max {
            break;
        }
        total += drain(handle, max - total);
    }
    (total, Some(lead))
}
