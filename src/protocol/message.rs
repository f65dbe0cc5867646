//! Session control messages.
//!
//! Every frame payload on a session connection is a [`SessionMessage`]: a
//! kind byte followed by a body written with [`ByteBuffer`]. User payloads
//! travel as [`SessionMessage::User`] and are routed by their `tag` through
//! the dispatcher; the session never looks inside them.

use bytes::Bytes;
use uuid::Uuid;

use crate::core::byte_buffer::ByteBuffer;
use crate::error::{ProtocolError, Result};
use crate::transport::SendFlags;

/// Stable identity of a peer for the lifetime of a session
pub type PeerId = Uuid;

/// Message kind bytes
pub mod kinds {
    pub const HELLO: u8 = 1;
    pub const WELCOME: u8 = 2;
    pub const HEARTBEAT: u8 = 3;
    pub const STATE_DELTA: u8 = 4;
    pub const RELAYED: u8 = 5;
    pub const USER: u8 = 6;
    pub const PEER_JOINED: u8 = 7;
    pub const PEER_LEFT: u8 = 8;
}

/// A targeted message forwarded through the host when sender and target
/// share no direct connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayedMessage {
    pub sender: PeerId,
    pub target: PeerId,
    /// A complete frame wrapping a `SessionMessage::User`
    pub inner_frame: Bytes,
    pub flags: SendFlags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMessage {
    /// Client introduces itself with an identity ticket
    Hello { peer_id: PeerId, ticket: Bytes },
    /// Host admits a client
    Welcome {
        host_id: PeerId,
        host_time_ms: u64,
        peers: Vec<PeerId>,
    },
    /// Authoritative clock from the host
    Heartbeat { host_time_ms: u64, frame: u64 },
    /// Periodic state update from the host
    StateDelta { sequence: u32, payload: Bytes },
    Relayed(RelayedMessage),
    User { tag: u16, payload: Bytes },
    PeerJoined { peer: PeerId },
    PeerLeft { peer: PeerId },
}

impl SessionMessage {
    pub fn kind(&self) -> u8 {
        match self {
            SessionMessage::Hello { .. } => kinds::HELLO,
            SessionMessage::Welcome { .. } => kinds::WELCOME,
            SessionMessage::Heartbeat { .. } => kinds::HEARTBEAT,
            SessionMessage::StateDelta { .. } => kinds::STATE_DELTA,
            SessionMessage::Relayed(_) => kinds::RELAYED,
            SessionMessage::User { .. } => kinds::USER,
            SessionMessage::PeerJoined { .. } => kinds::PEER_JOINED,
            SessionMessage::PeerLeft { .. } => kinds::PEER_LEFT,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionMessage::Hello { .. } => "hello",
            SessionMessage::Welcome { .. } => "welcome",
            SessionMessage::Heartbeat { .. } => "heartbeat",
            SessionMessage::StateDelta { .. } => "state_delta",
            SessionMessage::Relayed(_) => "relayed",
            SessionMessage::User { .. } => "user",
            SessionMessage::PeerJoined { .. } => "peer_joined",
            SessionMessage::PeerLeft { .. } => "peer_left",
        }
    }

    /// Write kind and body
    pub fn write_to(&self, buffer: &mut ByteBuffer) -> Result<()> {
        buffer.write(self.kind())?;
        match self {
            SessionMessage::Hello { peer_id, ticket } => {
                buffer.write(*peer_id)?;
                buffer.write_blob(ticket)?;
            }
            SessionMessage::Welcome {
                host_id,
                host_time_ms,
                peers,
            } => {
                buffer.write(*host_id)?;
                buffer.write(*host_time_ms)?;
                buffer.write_array(peers)?;
            }
            SessionMessage::Heartbeat { host_time_ms, frame } => {
                buffer.write(*host_time_ms)?;
                buffer.write(*frame)?;
            }
            SessionMessage::StateDelta { sequence, payload } => {
                buffer.write(*sequence)?;
                buffer.write_blob(payload)?;
            }
            SessionMessage::Relayed(relayed) => {
                buffer.write(relayed.sender)?;
                buffer.write(relayed.target)?;
                buffer.write_blob(&relayed.inner_frame)?;
                buffer.write(relayed.flags.bits())?;
            }
            SessionMessage::User { tag, payload } => {
                buffer.write(*tag)?;
                buffer.write_blob(payload)?;
            }
            SessionMessage::PeerJoined { peer } | SessionMessage::PeerLeft { peer } => {
                buffer.write(*peer)?;
            }
        }
        Ok(())
    }

    /// Serialize into a fresh buffer
    pub fn to_buffer(&self) -> Result<ByteBuffer> {
        let mut buffer = ByteBuffer::create(self.size_hint());
        self.write_to(&mut buffer)?;
        Ok(buffer)
    }

    /// Parse one message from the buffer's cursor
    pub fn read_from(buffer: &mut ByteBuffer) -> Result<Self> {
        let kind: u8 = buffer.read()?;
        let message = match kind {
            kinds::HELLO => SessionMessage::Hello {
                peer_id: buffer.read()?,
                ticket: buffer.read_blob_bytes()?,
            },
            kinds::WELCOME => SessionMessage::Welcome {
                host_id: buffer.read()?,
                host_time_ms: buffer.read()?,
                peers: buffer.read_array()?,
            },
            kinds::HEARTBEAT => SessionMessage::Heartbeat {
                host_time_ms: buffer.read()?,
                frame: buffer.read()?,
            },
            kinds::STATE_DELTA => SessionMessage::StateDelta {
                sequence: buffer.read()?,
                payload: buffer.read_blob_bytes()?,
            },
            kinds::RELAYED => SessionMessage::Relayed(RelayedMessage {
                sender: buffer.read()?,
                target: buffer.read()?,
                inner_frame: buffer.read_blob_bytes()?,
                flags: SendFlags(buffer.read()?),
            }),
            kinds::USER => SessionMessage::User {
                tag: buffer.read()?,
                payload: buffer.read_blob_bytes()?,
            },
            kinds::PEER_JOINED => SessionMessage::PeerJoined { peer: buffer.read()? },
            kinds::PEER_LEFT => SessionMessage::PeerLeft { peer: buffer.read()? },
            other => return Err(ProtocolError::UnknownMessageKind(other)),
        };
        Ok(message)
    }

    /// Parse a decoded frame payload
    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut buffer = ByteBuffer::reader(payload);
        Self::read_from(&mut buffer)
    }

    fn size_hint(&self) -> usize {
        const PREFIX: usize = 4;
        1 + match self {
            SessionMessage::Hello { ticket, .. } => 16 + PREFIX + ticket.len(),
            SessionMessage::Welcome { peers, .. } => 16 + 8 + PREFIX + peers.len() * 16,
            SessionMessage::Heartbeat { .. } => 16,
            SessionMessage::StateDelta { payload, .. } => 4 + PREFIX + payload.len(),
            SessionMessage::Relayed(relayed) => 32 + PREFIX + relayed.inner_frame.len() + 1,
            SessionMessage::User { payload, .. } => 2 + PREFIX + payload.len(),
            SessionMessage::PeerJoined { .. } | SessionMessage::PeerLeft { .. } => 16,
        }
    }
}
