//! Holder for the one active session of a process.
//!
//! Only [`NetworkContext::start_host`], [`NetworkContext::join`] and
//! [`NetworkContext::disconnect`] replace the session. Everything else
//! borrows it under the lock.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::NetworkConfig;
use crate::error::{ProtocolError, Result};
use crate::protocol::auth::IdentityService;
use crate::protocol::message::PeerId;
use crate::protocol::session::NetworkSession;
use crate::transport::{PeerAddress, Transport};

/// Clones share the same slot
#[derive(Clone, Default)]
pub struct NetworkContext {
    session: Arc<Mutex<Option<NetworkSession>>>,
}

impl NetworkContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host a new session, closing any previous one
    pub async fn start_host(
        &self,
        transport: Box<dyn Transport>,
        identity: Arc<dyn IdentityService>,
        local_id: PeerId,
        config: NetworkConfig,
    ) -> Result<()> {
        let session = NetworkSession::host(transport, identity, local_id, config)?;
        self.replace(session).await;
        Ok(())
    }

    /// Join a host, closing any previous session once the join succeeds.
    /// The lock is not held while connecting.
    pub async fn join(
        &self,
        transport: Box<dyn Transport>,
        identity: Arc<dyn IdentityService>,
        local_id: PeerId,
        address: PeerAddress,
        config: NetworkConfig,
        cancel: CancellationToken,
    ) -> Result<()> {
        let session =
            NetworkSession::join(transport, identity, local_id, address, config, cancel).await?;
        self.replace(session).await;
        Ok(())
    }

    async fn replace(&self, session: NetworkSession) {
        let mut slot = self.session.lock().await;
        if let Some(mut previous) = slot.replace(session) {
            info!(local_id = %previous.local_id(), "Replacing active session");
            previous.shutdown();
        }
    }

    /// Close the active session. Returns false when there was none.
    pub async fn disconnect(&self) -> bool {
        match self.session.lock().await.take() {
            Some(mut session) => {
                session.disconnect();
                true
            }
            None => false,
        }
    }

    /// Run one frame on the active session
    pub async fn tick(&self) -> Result<()> {
        self.with_session(NetworkSession::tick).await
    }

    /// Borrow the active session
    ///
    /// # Errors
    /// `ConnectionClosed` when no session is active
    pub async fn with_session<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut NetworkSession) -> R,
    {
        let mut slot = self.session.lock().await;
        let session = slot.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
        Ok(f(session))
    }

    pub async fn is_active(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| !s.is_closed())
    }
}

impl std::fmt::Debug for NetworkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkContext").finish_non_exhaustive()
    }
}
