use crate::error::constants::{ERR_DISPATCHER_READ_LOCK, ERR_DISPATCHER_WRITE_LOCK};
use crate::error::{ProtocolError, Result};
use crate::protocol::connection::ConnectionId;
use crate::protocol::message::PeerId;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A user payload handed to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Originating peer, when known
    pub sender: Option<PeerId>,
    /// Connection the message arrived on
    pub source: Option<ConnectionId>,
    pub tag: u16,
    pub payload: Bytes,
    /// Forwarded by the host on the sender's behalf
    pub relayed: bool,
}

type HandlerFn = dyn Fn(&Delivery) -> Result<()> + Send + Sync + 'static;

/// Routes user payloads to handlers by tag.
/// Clones share the same handler table.
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Arc<RwLock<HashMap<u16, Box<HandlerFn>>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tags = self.handlers.read().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("Dispatcher").field("handlers", &tags).finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a handler, replacing any previous one for `tag`
    pub fn register<F>(&self, tag: u16, handler: F) -> Result<()>
    where
        F: Fn(&Delivery) -> Result<()> + Send + Sync + 'static,
    {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(ERR_DISPATCHER_WRITE_LOCK.to_string()))?;

        handlers.insert(tag, Box::new(handler));
        Ok(())
    }

    /// Returns whether a handler was removed
    pub fn unregister(&self, tag: u16) -> Result<bool> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(ERR_DISPATCHER_WRITE_LOCK.to_string()))?;

        Ok(handlers.remove(&tag).is_some())
    }

    pub fn is_registered(&self, tag: u16) -> bool {
        self.handlers
            .read()
            .map(|handlers| handlers.contains_key(&tag))
            .unwrap_or(false)
    }

    /// Run the handler for the delivery's tag.
    ///
    /// # Errors
    /// `UnexpectedMessage` when no handler is registered, otherwise whatever
    /// the handler returns
    pub fn dispatch(&self, delivery: &Delivery) -> Result<()> {
        let handlers = self
            .handlers
            .read()
            .map_err(|_| ProtocolError::Custom(ERR_DISPATCHER_READ_LOCK.to_string()))?;

        handlers
            .get(&delivery.tag)
            .ok_or_else(|| ProtocolError::UnexpectedMessage(format!("no handler for tag {}", delivery.tag)))
            .and_then(|handler| handler(delivery))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn delivery(tag: u16) -> Delivery {
        Delivery {
            sender: None,
            source: None,
            tag,
            payload: Bytes::from_static(b"x"),
            relayed: false,
        }
    }

    #[test]
    fn test_routes_by_tag() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        dispatcher
            .register(7, move |d| {
                assert_eq!(d.tag, 7);
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        dispatcher.dispatch(&delivery(7)).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(matches!(
            dispatcher.dispatch(&delivery(8)),
            Err(ProtocolError::UnexpectedMessage(_))
        ));
    }

    #[test]
    fn test_unregister() {
        let dispatcher = Dispatcher::new();
        dispatcher.register(1, |_| Ok(())).unwrap();
        assert!(dispatcher.is_registered(1));
        assert!(dispatcher.unregister(1).unwrap());
        assert!(!dispatcher.unregister(1).unwrap());
        assert!(!dispatcher.is_registered(1));
    }

    #[test]
    fn test_handler_error_propagates() {
        let dispatcher = Dispatcher::new();
        dispatcher
            .register(2, |_| Err(ProtocolError::Custom("bad payload".into())))
            .unwrap();
        assert!(matches!(
            dispatcher.dispatch(&delivery(2)),
            Err(ProtocolError::Custom(_))
        ));
    }
}
