//! Typed event bus with unsubscribe handles.
//!
//! Emitters call [`EventBus::emit`]; observers hold a [`Subscription`] and
//! pull events from it. Dropping a subscription detaches it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

struct Registry<E> {
    next_id: u64,
    subscribers: HashMap<u64, mpsc::UnboundedSender<E>>,
}

/// Multi-subscriber event fan-out.
pub struct EventBus<E> {
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                subscribers: HashMap::new(),
            })),
        }
    }

    /// Register a new observer.
    pub fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.insert(id, tx);
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
            rx,
        }
    }

    /// Deliver an event to every live subscriber. Returns the delivery count.
    pub fn emit(&self, event: E) -> usize {
        let mut registry = self.registry.lock();
        registry.subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
        registry.subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().subscribers.len()
    }
}

/// Handle for one observer of an [`EventBus`].
pub struct Subscription<E> {
    id: u64,
    registry: Weak<Mutex<Registry<E>>>,
    rx: mpsc::UnboundedReceiver<E>,
}

impl<E> Subscription<E> {
    /// Wait for the next event. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Take an already-delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }

    /// Explicitly detach from the bus.
    pub fn unsubscribe(self) {}
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().subscribers.remove(&self.id);
        }
    }
}
