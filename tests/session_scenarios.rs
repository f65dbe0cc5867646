//! End-to-end session scenarios on the in-process network: capacity,
//! relaying, filtered fan-out, kicking and the async join loop.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{config, messages, pump, pump_until, Harness};
use session_wire::config::NetworkConfig;
use session_wire::error::constants::{REASON_KICKED, REASON_SERVER_FULL};
use session_wire::error::ProtocolError;
use session_wire::protocol::auth::{IdentityService, LocalIdentityService};
use session_wire::protocol::connection::{ConnectionKind, ConnectionState};
use session_wire::protocol::context::NetworkContext;
use session_wire::protocol::session::{NetworkSession, SessionEvent};
use session_wire::transport::{PeerAddress, SendFlags};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

fn small_host(port: u16, max_players: usize) -> NetworkConfig {
    NetworkConfig::default_with_overrides(|c| {
        c.session.listen_port = port;
        c.session.max_players = max_players;
    })
}

fn quick_join(port: u16) -> NetworkConfig {
    NetworkConfig::default_with_overrides(|c| {
        c.session.listen_port = port;
        c.connect.max_attempts = 2;
        c.connect.retry_delay = Duration::from_millis(5);
        c.connect.active_timeout = Duration::from_millis(150);
        c.connect.poll_interval = Duration::from_millis(2);
    })
}

// ============================================================================
// CAPACITY
// ============================================================================

#[test]
fn test_extra_client_refused_when_full() {
    let harness = Harness::new();
    let (_, mut host) = harness.host(small_host(4300, 2));
    let (_, mut first) = harness.client(4300);
    let (_, mut second) = harness.client(4300);
    assert!(pump_until(
        &mut [&mut host, &mut first, &mut second],
        JOIN_TIMEOUT,
        |s| s[1].is_joined() && s[2].is_joined()
    ));

    let (third_id, mut third) = harness.client(4300);
    pump(&mut [&mut host, &mut first, &mut second, &mut third], 20);

    assert!(!third.is_joined());
    assert_eq!(third.last_close_reason(), Some(REASON_SERVER_FULL));
    assert!(!host.has_peer(&third_id));
    assert_eq!(host.peers().count(), 2);

    // Existing clients keep working
    assert!(first.is_joined() && second.is_joined());
    host.drain_events();
    first.broadcast(5, b"still here", SendFlags::RELIABLE).unwrap();
    pump(&mut [&mut first, &mut host], 5);
    assert_eq!(messages(&mut host).len(), 1);
}

#[test]
fn test_single_slot_host() {
    let harness = Harness::new();
    let (_, mut host) = harness.host(small_host(4301, 1));
    let (_, mut first) = harness.client(4301);
    assert!(pump_until(&mut [&mut host, &mut first], JOIN_TIMEOUT, |s| s[1].is_joined()));

    let (_, mut second) = harness.client(4301);
    pump(&mut [&mut host, &mut first, &mut second], 20);
    assert_eq!(second.last_close_reason(), Some(REASON_SERVER_FULL));

    // A slot frees up once the first client leaves
    first.disconnect();
    pump(&mut [&mut host], 5);
    let (_, mut retry) = harness.client(4301);
    assert!(pump_until(&mut [&mut host, &mut retry], JOIN_TIMEOUT, |s| s[1].is_joined()));
}

// ============================================================================
// ROUTING
// ============================================================================

#[test]
fn test_relay_between_clients() {
    let harness = Harness::new();
    let (_, mut host) = harness.host(config(4302));
    let (a_id, mut a) = harness.client(4302);
    let (c_id, mut c) = harness.client(4302);
    assert!(pump_until(
        &mut [&mut host, &mut a, &mut c],
        JOIN_TIMEOUT,
        |s| s[1].has_peer(&c_id) && s[2].has_peer(&a_id)
    ));
    c.drain_events();
    host.drain_events();

    a.send_to(c_id, 12, b"psst", SendFlags::RELIABLE).unwrap();
    pump(&mut [&mut a, &mut host, &mut c], 5);

    let deliveries: Vec<_> = c
        .drain_events()
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::Message(d) => Some(d),
            _ => None,
        })
        .collect();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].sender, Some(a_id));
    assert_eq!(deliveries[0].tag, 12);
    assert_eq!(&deliveries[0].payload[..], b"psst");
    assert!(deliveries[0].relayed);

    // The host forwards without consuming
    assert!(messages(&mut host).is_empty());
}

#[test]
fn test_send_to_unknown_peer() {
    let harness = Harness::new();
    let (_, mut host) = harness.host(config(4303));
    assert!(matches!(
        host.send_to(Uuid::new_v4(), 1, b"x", SendFlags::RELIABLE),
        Err(ProtocolError::NoRoute(_))
    ));
    let local = host.local_id();
    assert!(host.send_to(local, 1, b"x", SendFlags::RELIABLE).is_err());
}

#[test]
fn test_filtered_broadcast_skips_excluded_peer() {
    let harness = Harness::new();
    let (_, mut host) = harness.host(config(4304));
    let (_, mut a) = harness.client(4304);
    let (x_id, mut x) = harness.client(4304);
    let (_, mut b) = harness.client(4304);
    assert!(pump_until(
        &mut [&mut host, &mut a, &mut x, &mut b],
        JOIN_TIMEOUT,
        |s| s[1].is_joined() && s[2].is_joined() && s[3].is_joined()
    ));
    pump(&mut [&mut host, &mut a, &mut x, &mut b], 5);
    for session in [&mut a, &mut x, &mut b] {
        session.drain_events();
    }

    let targets = host
        .broadcast_filtered(
            30,
            b"not for x",
            SendFlags::RELIABLE,
            ConnectionState::Active,
            |c| c.peer_id() != Some(x_id),
        )
        .unwrap();
    assert_eq!(targets, 2);
    pump(&mut [&mut host, &mut a, &mut x, &mut b], 5);

    assert_eq!(messages(&mut a).len(), 1);
    assert_eq!(messages(&mut b).len(), 1);
    assert!(messages(&mut x).is_empty());
}

#[test]
fn test_join_through_relay_directory() {
    let harness = Harness::new();
    let (host_id, mut host) = harness.host(config(4305));
    harness.network.advertise(host_id, 4305);

    let client_config = config(4305);
    let transport = Box::new(harness.network.endpoint(&client_config.transport));
    let mut client =
        NetworkSession::client(transport, harness.identity(), Uuid::new_v4(), client_config).unwrap();
    let connection = client.begin_join(&PeerAddress::Relay(host_id)).unwrap();
    assert_eq!(
        client.connection(connection).map(|c| c.kind()),
        Some(ConnectionKind::Relayed)
    );

    assert!(pump_until(&mut [&mut host, &mut client], JOIN_TIMEOUT, |s| s[1].is_joined()));
    assert_eq!(client.host_id(), Some(host_id));

    // Unknown peers have no route
    let mut stray = harness.network.endpoint(&config(4305).transport);
    assert!(matches!(
        session_wire::transport::Transport::connect(&mut stray, &PeerAddress::Relay(Uuid::new_v4())),
        Err(ProtocolError::NoRoute(_))
    ));
}

// ============================================================================
// KICK AND CLOSE
// ============================================================================

#[test]
fn test_only_host_can_kick() {
    let harness = Harness::new();
    let (host_id, mut host) = harness.host(config(4306));
    let (client_id, mut client) = harness.client(4306);
    assert!(pump_until(&mut [&mut host, &mut client], JOIN_TIMEOUT, |s| s[1].is_joined()));

    assert!(matches!(
        client.kick(host_id, None),
        Err(ProtocolError::NotHost)
    ));
    assert!(matches!(
        host.kick(Uuid::new_v4(), None),
        Err(ProtocolError::NoRoute(_))
    ));

    host.drain_events();
    client.drain_events();
    host.kick(client_id, None).unwrap();
    pump(&mut [&mut host, &mut client], 3);

    assert!(!host.has_peer(&client_id));
    assert!(host.drain_events().contains(&SessionEvent::PeerLeft {
        peer: client_id,
        reason: Some(REASON_KICKED.to_string()),
    }));
    assert!(client.drain_events().contains(&SessionEvent::HostLost {
        reason: Some(REASON_KICKED.to_string()),
    }));
    assert!(!harness.identity.is_active(&client_id));
}

#[test]
fn test_close_is_idempotent() {
    let harness = Harness::new();
    let (_, mut host) = harness.host(config(4307));
    let (_, mut client) = harness.client(4307);
    assert!(pump_until(&mut [&mut host, &mut client], JOIN_TIMEOUT, |s| s[1].is_joined()));

    client.disconnect();
    client.disconnect();
    client.shutdown();
    assert!(client.is_closed());
    assert!(!client.is_joined());
    client.tick();
    assert!(matches!(
        client.begin_join(&PeerAddress::Local(4307)),
        Err(ProtocolError::ConnectionClosed)
    ));

    host.shutdown();
    host.shutdown();
    assert!(host.is_closed());
    assert_eq!(harness.network.open_links(), 0);
}

#[test]
fn test_failed_auth_never_activates() {
    let harness = Harness::new();
    let (_, mut host) = harness.host(config(4308));

    // Tickets minted by a different identity service are unknown to the host
    let foreign: Arc<dyn IdentityService> = Arc::new(LocalIdentityService::new());
    let client_config = config(4308);
    let transport = Box::new(harness.network.endpoint(&client_config.transport));
    let client_id = Uuid::new_v4();
    let mut client = NetworkSession::client(transport, foreign, client_id, client_config).unwrap();
    client.begin_join(&PeerAddress::Local(4308)).unwrap();

    for _ in 0..20 {
        host.tick();
        client.tick();
        assert_ne!(host.connection_state(&client_id), Some(ConnectionState::Active));
        assert!(!client.is_joined());
    }
    assert!(!host.has_peer(&client_id));
    assert!(client
        .last_close_reason()
        .is_some_and(session_wire::protocol::handshake::is_auth_failure));
}

// ============================================================================
// ASYNC JOIN
// ============================================================================

#[tokio::test]
async fn test_join_times_out_without_listener() {
    let harness = Harness::new();
    let config = quick_join(4309);
    let result = NetworkSession::join(
        Box::new(harness.network.endpoint(&config.transport)),
        harness.identity(),
        Uuid::new_v4(),
        PeerAddress::Local(4309),
        config,
        CancellationToken::new(),
    )
    .await;
    assert!(matches!(result, Err(ProtocolError::Timeout)));
}

#[tokio::test]
async fn test_join_cancelled_mid_attempt() {
    let harness = Harness::new();
    // Listening but never ticking, so the join cannot complete
    let (_, _silent_host) = harness.host(config(4310));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let config = config(4310);
    let result = NetworkSession::join(
        Box::new(harness.network.endpoint(&config.transport)),
        harness.identity(),
        Uuid::new_v4(),
        PeerAddress::Local(4310),
        config,
        cancel,
    )
    .await;
    assert!(matches!(result, Err(ProtocolError::Cancelled)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_join_refused_when_full() {
    let harness = Harness::new();
    let host = NetworkContext::new();
    let host_config = small_host(4311, 1);
    host.start_host(
        Box::new(harness.network.endpoint(&host_config.transport)),
        harness.identity(),
        Uuid::new_v4(),
        host_config,
    )
    .await
    .unwrap();

    let stop = CancellationToken::new();
    let ticker = {
        let host = host.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            while !stop.is_cancelled() {
                host.tick().await.unwrap();
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    let first_config = quick_join(4311);
    let first = NetworkSession::join(
        Box::new(harness.network.endpoint(&first_config.transport)),
        harness.identity(),
        Uuid::new_v4(),
        PeerAddress::Local(4311),
        first_config,
        CancellationToken::new(),
    )
    .await
    .expect("first join");
    assert!(first.is_joined());

    let second_config = quick_join(4311);
    let second = NetworkSession::join(
        Box::new(harness.network.endpoint(&second_config.transport)),
        harness.identity(),
        Uuid::new_v4(),
        PeerAddress::Local(4311),
        second_config,
        CancellationToken::new(),
    )
    .await;
    assert!(matches!(second, Err(ProtocolError::ServerFull)));

    stop.cancel();
    ticker.await.unwrap();
    drop(first);
}
