//! Example: a host and two clients on the in-process network
//!
//! Shows joining, broadcasting, relaying a message between clients through
//! the host and a registered message handler.
//!
//! Run with: `cargo run --example local_session`

#![allow(clippy::uninlined_format_args)]

use std::sync::Arc;
use std::time::Duration;

use session_wire::config::NetworkConfig;
use session_wire::protocol::auth::{IdentityService, LocalIdentityService};
use session_wire::protocol::session::{NetworkSession, SessionEvent};
use session_wire::transport::{LocalNetwork, PeerAddress, SendFlags};
use session_wire::utils::logging::init_logging;
use uuid::Uuid;

const CHAT: u16 = 1;
const WHISPER: u16 = 2;

fn pump(sessions: &mut [&mut NetworkSession], rounds: usize) {
    for _ in 0..rounds {
        for session in sessions.iter_mut() {
            session.tick();
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn report(name: &str, session: &mut NetworkSession) {
    for event in session.drain_events() {
        match event {
            SessionEvent::Message(delivery) => println!(
                "[{name}] tag {} from {:?}{}: {}",
                delivery.tag,
                delivery.sender,
                if delivery.relayed { " (relayed)" } else { "" },
                String::from_utf8_lossy(&delivery.payload)
            ),
            SessionEvent::HostTime { .. } => {}
            other => println!("[{name}] {:?}", other),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.session.listen_port = 27015;
        c.logging.app_name = "local-session".to_string();
    });
    init_logging(&config.logging)?;

    let network = LocalNetwork::new();
    let identity: Arc<dyn IdentityService> = Arc::new(LocalIdentityService::new());

    let host_id = Uuid::new_v4();
    let mut host = NetworkSession::host(
        Box::new(network.endpoint(&config.transport)),
        Arc::clone(&identity),
        host_id,
        config.clone(),
    )?;
    host.dispatcher().register(CHAT, |delivery| {
        println!(
            "[host handler] chat from {:?}: {}",
            delivery.sender,
            String::from_utf8_lossy(&delivery.payload)
        );
        Ok(())
    })?;

    let mut alice = NetworkSession::client(
        Box::new(network.endpoint(&config.transport)),
        Arc::clone(&identity),
        Uuid::new_v4(),
        config.clone(),
    )?;
    let mut bob = NetworkSession::client(
        Box::new(network.endpoint(&config.transport)),
        Arc::clone(&identity),
        Uuid::new_v4(),
        config.clone(),
    )?;
    alice.begin_join(&PeerAddress::Local(27015))?;
    bob.begin_join(&PeerAddress::Local(27015))?;

    pump(&mut [&mut host, &mut alice, &mut bob], 30);
    println!(
        "alice joined: {}, bob joined: {}, host sees {} peers",
        alice.is_joined(),
        bob.is_joined(),
        host.peers().count()
    );
    report("alice", &mut alice);
    report("bob", &mut bob);
    report("host", &mut host);

    alice.broadcast(CHAT, b"hello everyone", SendFlags::RELIABLE)?;
    host.broadcast(CHAT, b"welcome to the match", SendFlags::RELIABLE)?;
    alice.send_to(bob.local_id(), WHISPER, b"meet at the bridge", SendFlags::RELIABLE)?;
    pump(&mut [&mut alice, &mut host, &mut bob], 10);

    report("alice", &mut alice);
    report("bob", &mut bob);
    report("host", &mut host);

    let stats = host.stats();
    println!(
        "host: {} frames, {} messages sent, {} received",
        stats.frames, stats.messages_sent, stats.messages_received
    );

    bob.disconnect();
    pump(&mut [&mut host, &mut alice], 5);
    report("alice", &mut alice);
    report("host", &mut host);

    host.shutdown();
    Ok(())
}
