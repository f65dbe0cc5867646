// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::NetworkConfig;
use crate::protocol::auth::{IdentityService, LocalIdentityService};
use crate::protocol::connection::ConnectionState;
use crate::protocol::handshake::is_auth_failure;
use crate::protocol::session::{NetworkSession, SessionEvent};
use crate::transport::{LocalNetwork, PeerAddress, SendFlags};

const PORT: u16 = 27015;

fn config() -> NetworkConfig {
    NetworkConfig::default_with_overrides(|c| {
        c.session.listen_port = PORT;
        c.session.heartbeat_interval = Duration::from_millis(10);
    })
}

fn host(network: &LocalNetwork, identity: &LocalIdentityService, id: Uuid) -> NetworkSession {
    let config = config();
    let transport = Box::new(network.endpoint(&config.transport));
    let identity: Arc<dyn IdentityService> = Arc::new(identity.clone());
    NetworkSession::host(transport, identity, id, config).expect("host should start")
}

fn client(network: &LocalNetwork, identity: &LocalIdentityService, id: Uuid) -> NetworkSession {
    let config = config();
    let transport = Box::new(network.endpoint(&config.transport));
    let identity: Arc<dyn IdentityService> = Arc::new(identity.clone());
    let mut session = NetworkSession::client(transport, identity, id, config).unwrap();
    session.begin_join(&PeerAddress::Local(PORT)).unwrap();
    session
}

fn settle(host: &mut NetworkSession, client: &mut NetworkSession) {
    for _ in 0..20 {
        host.tick();
        client.tick();
    }
}

#[test]
fn test_session_join_flow() {
    let network = LocalNetwork::new();
    let identity = LocalIdentityService::new();
    let (host_id, client_id) = (Uuid::new_v4(), Uuid::new_v4());

    // =================== Step 1: Hello / Welcome ===================
    let mut host = host(&network, &identity, host_id);
    let mut client = client(&network, &identity, client_id);
    assert!(!client.is_joined());
    settle(&mut host, &mut client);

    assert!(client.is_joined(), "client should reach Active");
    assert_eq!(client.host_id(), Some(host_id));
    assert_eq!(client.connection_state(&host_id), Some(ConnectionState::Active));
    assert_eq!(host.connection_state(&client_id), Some(ConnectionState::Active));
    assert!(host.has_peer(&client_id));
    assert!(identity.is_active(&client_id));

    let host_events = host.drain_events();
    assert!(host_events.contains(&SessionEvent::PeerJoined { peer: client_id }));
    let client_events = client.drain_events();
    assert!(client_events.contains(&SessionEvent::Joined { host_id }));

    // =================== Step 2: User payload to the host ===================
    client
        .send_to(host_id, 7, b"ping", SendFlags::RELIABLE)
        .expect("direct route to host");
    settle(&mut host, &mut client);

    let delivered = host.drain_events().into_iter().find_map(|event| match event {
        SessionEvent::Message(delivery) => Some(delivery),
        _ => None,
    });
    let delivery = delivered.expect("host should receive the payload");
    assert_eq!(delivery.sender, Some(client_id));
    assert_eq!(delivery.tag, 7);
    assert_eq!(&delivery.payload[..], b"ping");
    assert!(!delivery.relayed);

    // =================== Step 3: Client leaves ===================
    client.disconnect();
    settle(&mut host, &mut client);

    assert!(!host.has_peer(&client_id));
    assert!(!identity.is_active(&client_id), "identity session should end");
    assert!(host
        .drain_events()
        .iter()
        .any(|e| matches!(e, SessionEvent::PeerLeft { peer, .. } if *peer == client_id)));
}

#[test]
fn test_registered_handler_consumes_payload() {
    let network = LocalNetwork::new();
    let identity = LocalIdentityService::new();
    let (host_id, client_id) = (Uuid::new_v4(), Uuid::new_v4());
    let mut host = host(&network, &identity, host_id);
    let mut client = client(&network, &identity, client_id);
    settle(&mut host, &mut client);

    let (tx, rx) = std::sync::mpsc::channel();
    host.dispatcher()
        .register(42, move |delivery| {
            tx.send(delivery.payload.clone()).unwrap();
            Ok(())
        })
        .unwrap();
    host.drain_events();

    client.broadcast(42, b"hello handler", SendFlags::RELIABLE).unwrap();
    settle(&mut host, &mut client);

    assert_eq!(&rx.try_recv().unwrap()[..], b"hello handler");
    assert!(!host
        .drain_events()
        .iter()
        .any(|e| matches!(e, SessionEvent::Message(_))));
}

#[test]
fn test_heartbeat_sets_host_clock() {
    let network = LocalNetwork::new();
    let identity = LocalIdentityService::new();
    let mut host = host(&network, &identity, Uuid::new_v4());
    let mut client = client(&network, &identity, Uuid::new_v4());
    settle(&mut host, &mut client);
    assert!(client.host_time_offset_ms().is_some(), "welcome carries host time");

    std::thread::sleep(Duration::from_millis(20));
    settle(&mut host, &mut client);

    assert!(client
        .drain_events()
        .iter()
        .any(|e| matches!(e, SessionEvent::HostTime { .. })));
    // Host started first, so its clock is ahead of the client's
    assert!(client.host_time_ms() + 5 >= host.host_time_ms());
}

#[test]
fn test_state_delta_reaches_clients() {
    let network = LocalNetwork::new();
    let identity = LocalIdentityService::new();
    let host_id = Uuid::new_v4();
    let mut host = host(&network, &identity, host_id);
    let mut client = client(&network, &identity, Uuid::new_v4());
    settle(&mut host, &mut client);
    host.set_state_provider(|| Some(Bytes::from_static(b"delta")));

    std::thread::sleep(Duration::from_millis(60));
    settle(&mut host, &mut client);

    let delta = client.drain_events().into_iter().find_map(|event| match event {
        SessionEvent::StateDelta {
            sequence,
            payload,
            sender,
        } => Some((sequence, payload, sender)),
        _ => None,
    });
    let (sequence, payload, sender) = delta.expect("client should see a state delta");
    assert!(sequence >= 1);
    assert_eq!(&payload[..], b"delta");
    assert_eq!(sender, Some(host_id));
}

#[test]
fn test_unknown_ticket_is_refused() {
    let network = LocalNetwork::new();
    let host_identity = LocalIdentityService::new();
    let client_identity = LocalIdentityService::new();
    let client_id = Uuid::new_v4();

    let mut host = host(&network, &host_identity, Uuid::new_v4());
    let mut client = client(&network, &client_identity, client_id);
    settle(&mut host, &mut client);

    assert!(!client.is_joined());
    assert!(!host.has_peer(&client_id));
    assert_eq!(host.listen_socket().unwrap().active_count(), 0);
    let reason = client.last_close_reason().expect("host should give a reason");
    assert!(is_auth_failure(reason), "unexpected reason: {reason}");
}
