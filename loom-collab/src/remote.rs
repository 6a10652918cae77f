//! Redis-backed update log and fan-out bus, shared by relays in different
//! processes or on different hosts.
//!
//! ```text
//!  Relay A ─┬─ command connection ── RPUSH/LRANGE/LLEN/DEL, PUBLISH ─┐
//!           └─ pub/sub connection ◄── SUBSCRIBE doc ──────────────────┤
//!                                                                     ├── Redis
//!  Relay B ─┬─ command connection ────────────────────────────────────┤
//!           └─ pub/sub connection ◄───────────────────────────────────┘
//! ```
//!
//! Each document's log is a Redis list under its bucket name, so the list
//! length is the clock and `RPUSH` hands out lengths atomically. A Redis
//! connection in subscriber mode cannot issue other commands, hence the two
//! connections per relay.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use redis::{Client, Commands, Connection, RedisError};
use tokio::sync::mpsc;

use crate::fanout::{ChannelMessage, FanOutError, FanOutLink, Publisher, Subscriber};
use crate::storage::{StoreError, UpdateLog};

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<RedisError> for FanOutError {
    fn from(e: RedisError) -> Self {
        if e.is_connection_dropped() || e.is_connection_refusal() {
            FanOutError::Disconnected
        } else {
            FanOutError::Transport(e.to_string())
        }
    }
}

/// Blocking command connection, reopened on demand after it drops.
struct CommandConnection {
    client: Client,
    connection: Mutex<Option<Connection>>,
}

impl CommandConnection {
    fn run<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T, RedisError>) -> Result<T, RedisError> {
        let mut slot = self.connection.lock();
        let mut connection = match slot.take() {
            Some(connection) => connection,
            None => {
                log::debug!("Opening Redis command connection");
                self.client.get_connection()?
            }
        };
        let result = f(&mut connection);
        match &result {
            Err(e) if e.is_io_error() || e.is_connection_dropped() => {
                log::warn!("Redis command connection lost: {e}");
            }
            _ => *slot = Some(connection),
        }
        result
    }
}

/// [`UpdateLog`] over Redis lists.
pub struct RedisLog {
    commands: Arc<CommandConnection>,
}

impl UpdateLog for RedisLog {
    fn append(&self, bucket: &str, update: &[u8]) -> Result<u64, StoreError> {
        Ok(self.commands.run(|c| c.rpush(bucket, update))?)
    }

    fn read_from(&self, bucket: &str, from: u64) -> Result<Vec<Vec<u8>>, StoreError> {
        let start = isize::try_from(from).unwrap_or(isize::MAX);
        Ok(self.commands.run(|c| c.lrange(bucket, start, -1))?)
    }

    fn len(&self, bucket: &str) -> Result<u64, StoreError> {
        Ok(self.commands.run(|c| c.llen(bucket))?)
    }

    fn clear(&self, bucket: &str) -> Result<u64, StoreError> {
        let (removed, _): (u64, u64) = self
            .commands
            .run(|c| redis::pipe().atomic().llen(bucket).del(bucket).query(c))?;
        Ok(removed)
    }
}

struct RedisPublisher {
    commands: Arc<CommandConnection>,
}

impl Publisher for RedisPublisher {
    fn publish(&self, channel: &str, payload: &str) -> Result<usize, FanOutError> {
        Ok(self.commands.run(|c| c.publish(channel, payload))?)
    }
}

enum SubscriptionChange {
    Subscribe(String),
    Unsubscribe(String),
}

struct RedisSubscriber {
    changes: mpsc::UnboundedSender<SubscriptionChange>,
    channels: Mutex<HashSet<String>>,
}

impl Subscriber for RedisSubscriber {
    fn subscribe(&self, channel: &str) -> Result<bool, FanOutError> {
        let mut channels = self.channels.lock();
        if channels.contains(channel) {
            return Ok(false);
        }
        self.changes
            .send(SubscriptionChange::Subscribe(channel.to_string()))
            .map_err(|_| FanOutError::Disconnected)?;
        channels.insert(channel.to_string());
        Ok(true)
    }

    fn unsubscribe(&self, channel: &str) -> Result<bool, FanOutError> {
        let mut channels = self.channels.lock();
        if !channels.remove(channel) {
            return Ok(false);
        }
        self.changes
            .send(SubscriptionChange::Unsubscribe(channel.to_string()))
            .map_err(|_| FanOutError::Disconnected)?;
        Ok(true)
    }

    fn subscriptions(&self) -> Vec<String> {
        self.channels.lock().iter().cloned().collect()
    }
}

enum PubSubEvent {
    Change(Option<SubscriptionChange>),
    Message(Option<redis::Msg>),
}

/// Own the subscriber-mode connection: apply subscription changes and
/// forward every delivered message.
async fn pump_subscriptions(
    mut pubsub: redis::aio::PubSub,
    mut changes: mpsc::UnboundedReceiver<SubscriptionChange>,
    deliver: mpsc::UnboundedSender<ChannelMessage>,
) {
    loop {
        let event = {
            let messages = pubsub.on_message();
            futures_util::pin_mut!(messages);
            tokio::select! {
                change = changes.recv() => PubSubEvent::Change(change),
                message = messages.next() => PubSubEvent::Message(message),
            }
        };

        match event {
            PubSubEvent::Change(Some(SubscriptionChange::Subscribe(channel))) => {
                if let Err(e) = pubsub.subscribe(&channel).await {
                    log::warn!("Redis SUBSCRIBE {channel} failed: {e}");
                }
            }
            PubSubEvent::Change(Some(SubscriptionChange::Unsubscribe(channel))) => {
                if let Err(e) = pubsub.unsubscribe(&channel).await {
                    log::warn!("Redis UNSUBSCRIBE {channel} failed: {e}");
                }
            }
            PubSubEvent::Change(None) => break,
            PubSubEvent::Message(Some(message)) => {
                let payload = match message.get_payload::<String>() {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::warn!("Unreadable payload on {}: {e}", message.get_channel_name());
                        continue;
                    }
                };
                let delivered = ChannelMessage {
                    channel: message.get_channel_name().to_string(),
                    payload,
                };
                if deliver.send(delivered).is_err() {
                    break;
                }
            }
            PubSubEvent::Message(None) => {
                log::error!("Redis subscription connection closed");
                break;
            }
        }
    }
    log::debug!("Redis subscription pump stopped");
}

/// A relay's connections to one Redis server.
pub struct RedisBus {
    pub log: Arc<RedisLog>,
    pub link: FanOutLink,
}

impl RedisBus {
    /// Open both connections to `url` (e.g. `redis://127.0.0.1:6379`).
    /// Must run inside a tokio runtime.
    pub async fn connect(url: &str) -> Result<Self, RedisError> {
        let client = Client::open(url)?;

        let opener = client.clone();
        let connection = tokio::task::spawn_blocking(move || opener.get_connection())
            .await
            .map_err(|e| RedisError::from(std::io::Error::other(e.to_string())))??;
        let commands = Arc::new(CommandConnection {
            client: client.clone(),
            connection: Mutex::new(Some(connection)),
        });

        let pubsub = client.get_async_pubsub().await?;
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_subscriptions(pubsub, change_rx, message_tx));
        log::info!("Connected to Redis at {url}");

        Ok(Self {
            log: Arc::new(RedisLog {
                commands: commands.clone(),
            }),
            link: FanOutLink {
                publisher: Arc::new(RedisPublisher { commands }),
                subscriber: Arc::new(RedisSubscriber {
                    changes: change_tx,
                    channels: Mutex::new(HashSet::new()),
                }),
                messages: message_rx,
            },
        })
    }
}
