//! # session-wire
//!
//! Binary wire protocol and connection layer for multiplayer sessions.
//!
//! ## Layers
//! - [`core`]: `ByteBuffer` serialization and the `[flag][length][payload]`
//!   frame codec with optional LZ4 block compression
//! - [`transport`]: pump-driven datagram transports (in-process and UDP)
//! - [`protocol`]: connections, listen sockets, the Hello/Welcome handshake
//!   and the host/client [`NetworkSession`]
//! - [`config`], [`error`], [`utils`]: configuration, the error taxonomy,
//!   logging, metrics and fault injection
//!
//! ## Quick Start
//! ```no_run
//! use std::sync::Arc;
//! use session_wire::{LocalIdentityService, LocalNetwork, NetworkConfig, NetworkSession};
//! use session_wire::transport::{PeerAddress, SendFlags};
//!
//! # fn main() -> session_wire::Result<()> {
//! let network = LocalNetwork::new();
//! let identity = Arc::new(LocalIdentityService::new());
//! let config = NetworkConfig::default();
//!
//! let host_transport = Box::new(network.endpoint(&config.transport));
//! let mut host = NetworkSession::host(host_transport, identity.clone(), uuid::Uuid::new_v4(), config.clone())?;
//!
//! let client_transport = Box::new(network.endpoint(&config.transport));
//! let mut client = NetworkSession::client(client_transport, identity, uuid::Uuid::new_v4(), config.clone())?;
//! client.begin_join(&PeerAddress::Local(config.session.listen_port))?;
//!
//! while !client.is_joined() {
//!     host.tick();
//!     client.tick();
//! }
//! client.broadcast(1, b"hello", SendFlags::RELIABLE)?;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use crate::config::NetworkConfig;
pub use crate::core::{ByteBuffer, FrameDecoder, FrameEncoder};
pub use crate::error::{ErrorKind, ProtocolError, Result};
pub use crate::protocol::{
    Delivery, Dispatcher, IdentityService, LocalIdentityService, NetworkContext, NetworkSession,
    PeerId, SessionEvent,
};
pub use crate::transport::{LocalNetwork, LocalTransport, Transport, UdpTransport};
