//! In-process fan-out of encoded frames.
//!
//! Two users:
//! - [`BroadcastGroup`]: one per open document on the relay server. Every
//!   connection of the room holds a receiver; frames reach all of them.
//! - [`SideChannelHub`]: the same-origin fallback link between clients of one
//!   process. Channels are addressed by `server_url/doc_name` and every frame
//!   carries the sender's origin id so it can skip its own traffic.
//!
//! Both are built on tokio broadcast channels: one send, N independent
//! receivers, and lagging receivers lose the oldest frames.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_connections: usize,
}

/// Fan-out group for the connections of one document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    connections: RwLock<HashMap<Uuid, SocketAddr>>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per receiver before it starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            connections: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Register a connection and hand back its receiver.
    pub fn join(&self, id: Uuid, addr: SocketAddr) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.connections.write().insert(id, addr);
        self.sender.subscribe()
    }

    /// Unregister a connection. Returns how many remain.
    pub fn leave(&self, id: &Uuid) -> usize {
        let mut connections = self.connections.write();
        connections.remove(id);
        connections.len()
    }

    /// Send one encoded frame to every receiver. Lock-free on the hot path.
    pub fn broadcast(&self, frame: Arc<Vec<u8>>) -> usize {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.sender.send(frame).unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn has_connection(&self, id: &Uuid) -> bool {
        self.connections.read().contains_key(id)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_connections: self.connection_count(),
        }
    }
}

/// A frame on the side channel.
#[derive(Debug, Clone)]
pub struct SideFrame {
    /// Id of the client that published the frame
    pub origin: Uuid,
    pub data: Arc<Vec<u8>>,
}

/// Same-origin broadcast fallback shared by the clients of one process.
pub struct SideChannelHub {
    channels: RwLock<HashMap<String, broadcast::Sender<SideFrame>>>,
    capacity: usize,
}

impl Default for SideChannelHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl SideChannelHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Subscribe to `address`, creating the channel on first use.
    pub fn subscribe(&self, address: &str) -> broadcast::Receiver<SideFrame> {
        // Fast path: read lock
        if let Some(sender) = self.channels.read().get(address) {
            return sender.subscribe();
        }
        let mut channels = self.channels.write();
        channels
            .entry(address.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish to everyone listening on `address`, the sender included.
    pub fn publish(&self, address: &str, origin: Uuid, data: Vec<u8>) -> usize {
        let channels = self.channels.read();
        let Some(sender) = channels.get(address) else {
            return 0;
        };
        sender
            .send(SideFrame {
                origin,
                data: Arc::new(data),
            })
            .unwrap_or(0)
    }

    /// Drop channels nobody listens to anymore.
    pub fn prune(&self) -> usize {
        let mut channels = self.channels.write();
        let before = channels.len();
        channels.retain(|_, sender| sender.receiver_count() > 0);
        before - channels.len()
    }

    pub fn listener_count(&self, address: &str) -> usize {
        self.channels
            .read()
            .get(address)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 4000))
    }

    #[tokio::test]
    async fn test_group_join_leave() {
        let group = BroadcastGroup::new(16);
        let id = Uuid::new_v4();
        let _rx = group.join(id, addr());
        assert!(group.has_connection(&id));
        assert_eq!(group.leave(&id), 0);
        assert!(!group.has_connection(&id));
    }

    #[tokio::test]
    async fn test_group_fan_out_includes_sender() {
        let group = BroadcastGroup::new(16);
        let mut a = group.join(Uuid::new_v4(), addr());
        let mut b = group.join(Uuid::new_v4(), addr());

        assert_eq!(group.broadcast(Arc::new(vec![1, 2, 3])), 2);
        assert_eq!(*a.recv().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(*b.recv().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(group.stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_side_channel_tags_origin() {
        let hub = SideChannelHub::default();
        let mut rx = hub.subscribe("ws://relay/doc");
        let origin = Uuid::new_v4();

        assert_eq!(hub.publish("ws://relay/doc", origin, vec![9]), 1);
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.origin, origin);
        assert_eq!(*frame.data, vec![9]);
    }

    #[test]
    fn test_side_channel_addresses_isolated() {
        let hub = SideChannelHub::default();
        let _a = hub.subscribe("ws://relay/a");
        assert_eq!(hub.publish("ws://relay/b", Uuid::new_v4(), vec![1]), 0);
        assert_eq!(hub.listener_count("ws://relay/a"), 1);
    }

    #[test]
    fn test_prune_removes_abandoned_channels() {
        let hub = SideChannelHub::default();
        let rx = hub.subscribe("ws://relay/a");
        drop(rx);
        assert_eq!(hub.prune(), 1);
        assert_eq!(hub.listener_count("ws://relay/a"), 0);
    }
}
