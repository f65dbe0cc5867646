//! Shared fixtures for session-level integration tests
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use session_wire::config::NetworkConfig;
use session_wire::protocol::auth::{IdentityService, LocalIdentityService};
use session_wire::protocol::session::{NetworkSession, SessionEvent};
use session_wire::transport::{LocalNetwork, LocalTransport, PeerAddress};
use uuid::Uuid;

pub fn config(port: u16) -> NetworkConfig {
    NetworkConfig::default_with_overrides(|c| c.session.listen_port = port)
}

/// One in-process network with a shared identity service
#[derive(Default)]
pub struct Harness {
    pub network: LocalNetwork,
    pub identity: LocalIdentityService,
}

impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity(&self) -> Arc<dyn IdentityService> {
        Arc::new(self.identity.clone())
    }

    pub fn host(&self, config: NetworkConfig) -> (Uuid, NetworkSession) {
        let id = Uuid::new_v4();
        let transport = Box::new(self.network.endpoint(&config.transport));
        let session = NetworkSession::host(transport, self.identity(), id, config).expect("host");
        (id, session)
    }

    /// A client that has started joining `port`
    pub fn client(&self, port: u16) -> (Uuid, NetworkSession) {
        let config = config(port);
        let transport = self.network.endpoint(&config.transport);
        self.client_on(transport, config, &PeerAddress::Local(port))
    }

    pub fn client_on(
        &self,
        transport: LocalTransport,
        config: NetworkConfig,
        address: &PeerAddress,
    ) -> (Uuid, NetworkSession) {
        let id = Uuid::new_v4();
        let mut session =
            NetworkSession::client(Box::new(transport), self.identity(), id, config).expect("client");
        session.begin_join(address).expect("begin join");
        (id, session)
    }
}

/// Tick every session `rounds` times
pub fn pump(sessions: &mut [&mut NetworkSession], rounds: usize) {
    for _ in 0..rounds {
        for session in sessions.iter_mut() {
            session.tick();
        }
    }
}

/// Tick until `done` holds or `timeout` passes. Returns whether it held.
pub fn pump_until<F>(sessions: &mut [&mut NetworkSession], timeout: Duration, mut done: F) -> bool
where
    F: FnMut(&[&mut NetworkSession]) -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        for session in sessions.iter_mut() {
            session.tick();
        }
        if done(&*sessions) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

/// User payloads delivered as events, as `(tag, payload, sender)`
pub fn messages(session: &mut NetworkSession) -> Vec<(u16, Vec<u8>, Option<Uuid>)> {
    session
        .drain_events()
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::Message(d) => Some((d.tag, d.payload.to_vec(), d.sender)),
            _ => None,
        })
        .collect()
}
