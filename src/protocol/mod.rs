//! # Session Protocol
//!
//! Connections, listen sockets and the session layer built on top of a
//! [`Transport`](crate::transport::Transport).
//!
//! ## Components
//! - **Message**: closed set of session control messages
//! - **Auth**: identity tickets and the guarded identity session
//! - **Connection**: one logical channel with its state machine and queues
//! - **Socket**: listen endpoint owning every accepted connection
//! - **Handshake**: Hello/Welcome admission checks
//! - **Dispatcher**: user payload routing by tag
//! - **Session**: host/client frame loop, broadcast, relay, heartbeats
//! - **Context**: holder for the single active session

pub mod auth;
pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod handshake;
pub mod message;
pub mod session;
pub mod socket;

pub use auth::{AuthTicket, IdentityService, LocalIdentityService};
pub use connection::{Connection, ConnectionId, ConnectionKind, ConnectionState};
pub use context::NetworkContext;
pub use dispatcher::{Delivery, Dispatcher};
pub use message::{PeerId, SessionMessage};
pub use session::{NetworkSession, Role, SessionEvent, SessionStats, StateProvider};
pub use socket::{ListenSocket, SocketEvent};

#[cfg(test)]
mod tests;
