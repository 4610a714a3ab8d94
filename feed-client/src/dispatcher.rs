//! Event fan-out to listeners.
//!
//! Listeners register for one event type (the wire `type`, or a local type
//! such as `connection.changed`) or for [`ALL_EVENTS`]. Dispatch calls the
//! type's listeners first, then wildcard listeners, each in registration
//! order. Handlers run outside the registry lock, so they may subscribe or
//! unsubscribe while being called.

use feed_types::{ClientEvent, ALL_EVENTS};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Handler = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

#[derive(Default)]
struct DispatcherInner {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<String, Vec<(u64, Handler)>>>,
}

/// Typed pub/sub with wildcard listeners.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    inner: Arc<DispatcherInner>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.inner.handlers.read();
        f.debug_struct("EventDispatcher")
            .field("event_types", &handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Handle returned by [`EventDispatcher::on`].
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    event_type: String,
    dispatcher: Weak<DispatcherInner>,
}

impl Subscription {
    /// Stop receiving events. Idempotent.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.dispatcher.upgrade() {
            let mut handlers = inner.handlers.write();
            if let Some(list) = handlers.get_mut(&self.event_type) {
                list.retain(|(id, _)| *id != self.id);
                if list.is_empty() {
                    handlers.remove(&self.event_type);
                }
            }
        }
    }
}

impl EventDispatcher {
    /// Create a dispatcher with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen for one event type, or [`ALL_EVENTS`].
    pub fn on<F>(&self, event_type: &str, handler: F) -> Subscription
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .write()
            .entry(event_type.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            id,
            event_type: event_type.to_string(),
            dispatcher: Arc::downgrade(&self.inner),
        }
    }

    /// Listen for every event.
    pub fn on_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.on(ALL_EVENTS, handler)
    }

    /// Remove every listener for one event type.
    pub fn off(&self, event_type: &str) {
        self.inner.handlers.write().remove(event_type);
    }

    /// Call every listener registered for this event.
    pub fn dispatch(&self, event: &ClientEvent) {
        let event_type = event.event_type();
        let targets: Vec<Handler> = {
            let handlers = self.inner.handlers.read();
            [event_type, ALL_EVENTS]
                .iter()
                .filter_map(|key| handlers.get(*key))
                .flat_map(|list| list.iter().map(|(_, h)| Arc::clone(h)))
                .collect()
        };
        tracing::trace!("dispatching {} to {} listeners", event_type, targets.len());
        for handler in targets {
            handler(event);
        }
    }

    /// Number of listeners for one event type.
    pub fn listener_count(&self, event_type: &str) -> usize {
        self.inner
            .handlers
            .read()
            .get(event_type)
            .map_or(0, Vec::len)
    }
}
