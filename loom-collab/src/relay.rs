//! Persistence relay: the registry of bound documents in one process.
//!
//! ```text
//!                    bind / unbind / shutdown
//!  server rooms ──────────────────────────────► Relay ── bindings: name → (Binding, refs)
//!                                                 │
//!           fan-out messages (channel, count)     │ pump task
//!  Subscriber ──────────────────────────────────► handle_notification ──► Binding::on_notification
//! ```
//!
//! Several local consumers may share one binding; it is torn down when the
//! last of them unbinds. The channel subscription for a document lives
//! exactly as long as its binding.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use yrs::Doc;

use crate::binding::Binding;
use crate::document::{self, DocumentError};
use crate::fanout::{encode_clock, parse_clock, ChannelMessage, FanOutError, FanOutLink, Publisher, Subscriber};
use crate::storage::{bucket_name, StoreError, UpdateLog};

/// Relay errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Durable log failure
    Store(StoreError),
    /// Fan-out bus failure
    FanOut(FanOutError),
    /// Document engine failure
    Document(DocumentError),
    /// The binding was destroyed
    Closed(String),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::Store(e) => write!(f, "Store error: {e}"),
            RelayError::FanOut(e) => write!(f, "Fan-out error: {e}"),
            RelayError::Document(e) => write!(f, "Document error: {e}"),
            RelayError::Closed(name) => write!(f, "Binding for {name} is closed"),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<StoreError> for RelayError {
    fn from(e: StoreError) -> Self {
        RelayError::Store(e)
    }
}

impl From<FanOutError> for RelayError {
    fn from(e: FanOutError) -> Self {
        RelayError::FanOut(e)
    }
}

impl From<DocumentError> for RelayError {
    fn from(e: DocumentError) -> Self {
        RelayError::Document(e)
    }
}

struct Entry {
    binding: Arc<Binding>,
    refs: usize,
}

/// Registry of document bindings for one process.
pub struct Relay {
    log: Arc<dyn UpdateLog>,
    publisher: Arc<dyn Publisher>,
    subscriber: Arc<dyn Subscriber>,
    bindings: Mutex<HashMap<String, Entry>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Relay {
    /// Create a relay over `log`, listening on `link`. Must run inside a tokio runtime.
    pub fn new(log: Arc<dyn UpdateLog>, link: FanOutLink) -> Arc<Self> {
        let FanOutLink {
            publisher,
            subscriber,
            messages,
        } = link;
        let relay = Arc::new(Self {
            log,
            publisher,
            subscriber,
            bindings: Mutex::new(HashMap::new()),
            pump: Mutex::new(None),
        });
        let pump = tokio::spawn(Self::pump(Arc::downgrade(&relay), messages));
        *relay.pump.lock() = Some(pump);
        relay
    }

    async fn pump(relay: Weak<Relay>, mut messages: mpsc::UnboundedReceiver<ChannelMessage>) {
        while let Some(message) = messages.recv().await {
            let Some(relay) = relay.upgrade() else {
                break;
            };
            relay.handle_notification(&message.channel, &message.payload);
        }
    }

    /// Bind `name`, or take another reference on an existing binding.
    ///
    /// When the binding already exists, `doc` is discarded and the caller
    /// must use [`Binding::doc`].
    pub fn bind(&self, name: &str, doc: Doc) -> Result<Arc<Binding>, RelayError> {
        let mut bindings = self.bindings.lock();
        if let Some(entry) = bindings.get_mut(name) {
            entry.refs += 1;
            log::debug!("Bound {name} again ({} refs)", entry.refs);
            return Ok(entry.binding.clone());
        }

        let binding = Binding::spawn(name, doc, self.log.clone(), self.publisher.clone())?;
        if let Err(e) = self.subscriber.subscribe(name) {
            let _ = binding.close();
            return Err(e.into());
        }
        binding.start_catch_up();
        bindings.insert(
            name.to_string(),
            Entry {
                binding: binding.clone(),
                refs: 1,
            },
        );
        log::info!("Bound document {name}");
        Ok(binding)
    }

    /// Drop one reference. Returns `true` if the binding was destroyed.
    pub async fn unbind(&self, name: &str) -> Result<bool, RelayError> {
        let (worker, unsubscribed) = {
            let mut bindings = self.bindings.lock();
            let Some(entry) = bindings.get_mut(name) else {
                return Ok(false);
            };
            entry.refs -= 1;
            if entry.refs > 0 {
                log::debug!("Unbound {name} ({} refs left)", entry.refs);
                return Ok(false);
            }
            let Some(entry) = bindings.remove(name) else {
                return Ok(false);
            };
            // Detach under the lock so a concurrent bind cannot lose its subscription
            let worker = entry.binding.close();
            (worker, self.subscriber.unsubscribe(name))
        };

        if let Some(worker) = worker {
            let _ = worker.await;
        }
        log::info!("Destroyed binding for {name}");
        unsubscribed.map(|_| true).map_err(RelayError::from)
    }

    /// Destroy every binding regardless of reference counts.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, Entry)> = self.bindings.lock().drain().collect();
        let mut workers = Vec::with_capacity(drained.len());
        for (name, entry) in drained {
            workers.extend(entry.binding.close());
            if let Err(e) = self.subscriber.unsubscribe(&name) {
                log::warn!("Unsubscribe from {name} failed: {e}");
            }
        }
        for worker in workers {
            let _ = worker.await;
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        log::info!("Relay shut down");
    }

    /// Route a fan-out message to its binding.
    pub fn handle_notification(&self, channel: &str, payload: &str) {
        let clock = parse_clock(payload);
        let binding = self.bindings.lock().get(channel).map(|e| e.binding.clone());
        match binding {
            Some(binding) => {
                if binding.on_notification(clock) {
                    log::debug!("Fetching {channel} up to {payload}");
                }
            }
            None => {
                log::debug!("Notification for unbound {channel}, unsubscribing");
                if let Err(e) = self.subscriber.unsubscribe(channel) {
                    log::warn!("Unsubscribe from {channel} failed: {e}");
                }
            }
        }
    }

    /// Persist the full state of `doc` as a new entry of `name`'s log.
    pub async fn write_state(&self, name: &str, doc: &Doc) -> Result<u64, RelayError> {
        let update = document::encode_state_as_update(doc);
        if let Some(binding) = self.binding(name) {
            return binding.persist(update).await;
        }

        let log = self.log.clone();
        let bucket = bucket_name(name);
        let len = tokio::task::spawn_blocking(move || log.append(&bucket, &update))
            .await
            .map_err(|e| StoreError::TaskFailed(e.to_string()))??;
        let publisher = self.publisher.clone();
        let channel = name.to_string();
        tokio::task::spawn_blocking(move || publisher.publish(&channel, &encode_clock(len)))
            .await
            .map_err(|e| FanOutError::Transport(e.to_string()))??;
        Ok(len)
    }

    /// Delete `name`'s log, destroying any binding first.
    pub async fn clear_document(&self, name: &str) -> Result<u64, RelayError> {
        let worker = {
            let mut bindings = self.bindings.lock();
            match bindings.remove(name) {
                Some(entry) => {
                    let worker = entry.binding.close();
                    self.subscriber.unsubscribe(name)?;
                    worker
                }
                None => None,
            }
        };
        if let Some(worker) = worker {
            let _ = worker.await;
        }

        let log = self.log.clone();
        let bucket = bucket_name(name);
        let removed = tokio::task::spawn_blocking(move || log.clear(&bucket))
            .await
            .map_err(|e| StoreError::TaskFailed(e.to_string()))??;
        log::info!("Cleared {removed} updates of {name}");
        Ok(removed)
    }

    pub fn binding(&self, name: &str) -> Option<Arc<Binding>> {
        self.bindings.lock().get(name).map(|e| e.binding.clone())
    }

    /// Current reference count of `name` (0 if unbound).
    pub fn ref_count(&self, name: &str) -> usize {
        self.bindings.lock().get(name).map_or(0, |e| e.refs)
    }

    pub fn bound_documents(&self) -> Vec<String> {
        self.bindings.lock().keys().cloned().collect()
    }
}
