#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::config;
use session_wire::error::ProtocolError;
use session_wire::protocol::auth::{IdentityService, LocalIdentityService};
use session_wire::protocol::context::NetworkContext;
use session_wire::transport::{LocalNetwork, PeerAddress};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_joins_against_ticking_host() {
    let network = LocalNetwork::new();
    let identity: Arc<dyn IdentityService> = Arc::new(LocalIdentityService::new());
    let host = NetworkContext::new();
    let host_config = config(4200);
    host.start_host(
        Box::new(network.endpoint(&host_config.transport)),
        Arc::clone(&identity),
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

    let mut tasks = JoinSet::new();
    for _ in 0..6 {
        let network = network.clone();
        let identity = Arc::clone(&identity);
        tasks.spawn(async move {
            let config = config(4200);
            let context = NetworkContext::new();
            let id = Uuid::new_v4();
            context
                .join(
                    Box::new(network.endpoint(&config.transport)),
                    identity,
                    id,
                    PeerAddress::Local(4200),
                    config,
                    CancellationToken::new(),
                )
                .await
                .map(|()| (context, id))
        });
    }

    let mut clients = Vec::new();
    while let Some(res) = tasks.join_next().await {
        clients.push(res.unwrap().expect("join should succeed"));
    }
    assert_eq!(clients.len(), 6);

    let mut admitted = 0;
    for _ in 0..500 {
        admitted = host.with_session(|s| s.peers().count()).await.unwrap();
        if admitted == 6 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(admitted, 6);
    for (context, id) in &clients {
        assert!(context.is_active().await);
        assert!(host.with_session(|s| s.has_peer(id)).await.unwrap());
    }

    stop.cancel();
    ticker.await.unwrap();
    assert!(host.disconnect().await);
}

#[tokio::test]
async fn context_replaces_and_disconnects() {
    let network = LocalNetwork::new();
    let identity: Arc<dyn IdentityService> = Arc::new(LocalIdentityService::new());
    let context = NetworkContext::new();
    assert!(!context.is_active().await);
    assert!(matches!(
        context.tick().await,
        Err(ProtocolError::ConnectionClosed)
    ));

    let first = config(4201);
    context
        .start_host(
            Box::new(network.endpoint(&first.transport)),
            Arc::clone(&identity),
            Uuid::new_v4(),
            first,
        )
        .await
        .unwrap();

    let second = config(4202);
    context
        .start_host(
            Box::new(network.endpoint(&second.transport)),
            Arc::clone(&identity),
            Uuid::new_v4(),
            second,
        )
        .await
        .unwrap();

    let port = context
        .with_session(|s| s.listen_socket().map(|l| l.port()))
        .await
        .unwrap();
    assert_eq!(port, Some(4202));

    // The replaced host released its port
    let again = config(4201);
    let mut probe = network.endpoint(&again.transport);
    assert!(session_wire::transport::Transport::listen(&mut probe, 4201).is_ok());

    assert!(context.disconnect().await);
    assert!(!context.disconnect().await);
    assert!(!context.is_active().await);
}

#[tokio::test]
async fn cancelled_join_leaves_context_empty() {
    let network = LocalNetwork::new();
    let identity: Arc<dyn IdentityService> = Arc::new(LocalIdentityService::new());
    let context = NetworkContext::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let config = config(4203);
    let result = context
        .join(
            Box::new(network.endpoint(&config.transport)),
            identity,
            Uuid::new_v4(),
            PeerAddress::Local(4203),
            config,
            cancel,
        )
        .await;

    assert!(matches!(result, Err(ProtocolError::Cancelled)));
    assert!(!context.is_active().await);
}
