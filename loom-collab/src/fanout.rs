//! Publish/subscribe notification bus between relay processes.
//!
//! The bus never carries update bytes. A message on channel `doc` only says
//! "the log of `doc` now holds N entries", encoded as a decimal string.
//! Subscribers that cannot parse the count treat it as infinity and run a
//! full catch-up.
//!
//! A relay talks to the bus through two logical connections: a [`Publisher`]
//! and a dedicated [`Subscriber`]. Delivered messages arrive on the
//! subscriber's message stream.
//!
//! ```text
//!  Relay A ── Publisher ──┐                 ┌──► Subscriber ── Relay A
//!                         ├──► LocalFanOut ─┤
//!  Relay B ── Publisher ──┘   (channels)    └──► Subscriber ── Relay B
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

/// Payload published when the count is unknown.
pub const UNKNOWN_CLOCK: &str = "null";

/// Encode a log length for publication.
pub fn encode_clock(clock: u64) -> String {
    clock.to_string()
}

/// Decode a published log length. Anything unparseable means "infinity".
pub fn parse_clock(payload: &str) -> u64 {
    payload.trim().parse::<u64>().unwrap_or(u64::MAX)
}

/// One delivered notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: String,
}

/// Fan-out errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanOutError {
    /// The underlying bus connection is gone
    Disconnected,
    /// Transport-specific failure
    Transport(String),
}

impl std::fmt::Display for FanOutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FanOutError::Disconnected => write!(f, "Fan-out connection closed"),
            FanOutError::Transport(e) => write!(f, "Fan-out transport error: {e}"),
        }
    }
}

impl std::error::Error for FanOutError {}

/// Publishing side of a bus connection.
pub trait Publisher: Send + Sync {
    /// Publish `payload` on `channel`. Returns the number of receivers.
    fn publish(&self, channel: &str, payload: &str) -> Result<usize, FanOutError>;
}

/// Subscription side of a bus connection.
pub trait Subscriber: Send + Sync {
    /// Returns `false` if already subscribed.
    fn subscribe(&self, channel: &str) -> Result<bool, FanOutError>;
    /// Returns `false` if not subscribed.
    fn unsubscribe(&self, channel: &str) -> Result<bool, FanOutError>;
    fn subscriptions(&self) -> Vec<String>;
}

/// Both halves of a bus connection plus the delivered-message stream.
pub struct FanOutLink {
    pub publisher: Arc<dyn Publisher>,
    pub subscriber: Arc<dyn Subscriber>,
    pub messages: mpsc::UnboundedReceiver<ChannelMessage>,
}

/// In-process bus shared by every relay that holds a link to it.
#[derive(Default)]
pub struct LocalFanOut {
    /// channel → subscriber id → delivery sender
    channels: RwLock<HashMap<String, HashMap<u64, mpsc::UnboundedSender<ChannelMessage>>>>,
    next_id: AtomicU64,
    published: AtomicU64,
}

impl LocalFanOut {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a publisher/subscriber pair on this bus.
    pub fn connect(self: &Arc<Self>) -> FanOutLink {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        FanOutLink {
            publisher: Arc::new(LocalPublisher { hub: self.clone() }),
            subscriber: Arc::new(LocalSubscriber {
                hub: self.clone(),
                id,
                sender: tx,
                channels: Mutex::new(HashSet::new()),
            }),
            messages: rx,
        }
    }

    /// Number of connections subscribed to `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.read().get(channel).map_or(0, HashMap::len)
    }

    /// Total messages published since creation.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    fn deliver(&self, channel: &str, payload: &str) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let channels = self.channels.read();
        let Some(subscribers) = channels.get(channel) else {
            return 0;
        };
        let message = ChannelMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        subscribers
            .values()
            .filter(|tx| tx.send(message.clone()).is_ok())
            .count()
    }

    fn add(&self, channel: &str, id: u64, sender: mpsc::UnboundedSender<ChannelMessage>) {
        self.channels
            .write()
            .entry(channel.to_string())
            .or_default()
            .insert(id, sender);
    }

    fn remove(&self, channel: &str, id: u64) {
        let mut channels = self.channels.write();
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                channels.remove(channel);
            }
        }
    }
}

struct LocalPublisher {
    hub: Arc<LocalFanOut>,
}

impl Publisher for LocalPublisher {
    fn publish(&self, channel: &str, payload: &str) -> Result<usize, FanOutError> {
        Ok(self.hub.deliver(channel, payload))
    }
}

struct LocalSubscriber {
    hub: Arc<LocalFanOut>,
    id: u64,
    sender: mpsc::UnboundedSender<ChannelMessage>,
    channels: Mutex<HashSet<String>>,
}

impl Subscriber for LocalSubscriber {
    fn subscribe(&self, channel: &str) -> Result<bool, FanOutError> {
        if self.sender.is_closed() {
            return Err(FanOutError::Disconnected);
        }
        if !self.channels.lock().insert(channel.to_string()) {
            return Ok(false);
        }
        self.hub.add(channel, self.id, self.sender.clone());
        Ok(true)
    }

    fn unsubscribe(&self, channel: &str) -> Result<bool, FanOutError> {
        if !self.channels.lock().remove(channel) {
            return Ok(false);
        }
        self.hub.remove(channel, self.id);
        Ok(true)
    }

    fn subscriptions(&self) -> Vec<String> {
        self.channels.lock().iter().cloned().collect()
    }
}

impl Drop for LocalSubscriber {
    fn drop(&mut self) {
        for channel in self.channels.get_mut().drain() {
            self.hub.remove(&channel, self.id);
        }
    }
}
