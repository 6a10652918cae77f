//! Live binding between one document and its durable update log.
//!
//! Each binding owns a worker task that serializes everything touching the
//! log for that document:
//!
//! ```text
//!  yrs observer ── Capture(update) ──┐
//!  Binding::persist ── Persist ──────┼──► worker ──► UpdateLog::append ──► publish(len)
//!  Relay notification ── fetch ──────┘        └────► UpdateLog::read_from ──► merge
//! ```
//!
//! Clocks: `applied` counts log entries merged into the document and
//! `fetching` is the highest length announced on the fan-out bus. A fetch
//! runs while `fetching > applied`; a notification that arrives while a
//! fetch is in flight only raises the target.
//!
//! Log failures never lose data: captured updates the log refused stay
//! queued in the worker and are appended again, merged with later captures,
//! and a failed catch-up read is retried. Both retries back off.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;
use yrs::{Doc, Origin};

use crate::backoff::Backoff;
use crate::document;
use crate::events::{EventBus, Subscription};
use crate::fanout::{encode_clock, FanOutError, Publisher};
use crate::relay::RelayError;
use crate::storage::{bucket_name, StoreError, UpdateLog};

/// Snapshot of a binding's clocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Clocks {
    /// Log entries merged into the live document
    pub applied: u64,
    /// Log length known to exist upstream
    pub fetching: u64,
}

impl Clocks {
    pub fn is_converged(&self) -> bool {
        self.applied == self.fetching
    }
}

/// Events emitted by a binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingEvent {
    /// Catch-up finished with `applied == fetching`
    Synced { clock: u64 },
    /// A captured update was appended; `clock` is the new log length
    Persisted { clock: u64 },
    /// Captured updates could not be made durable yet. The worker holds
    /// `pending` of them, `update` being the oldest, and appends them again
    PersistFailed {
        error: String,
        update: Vec<u8>,
        pending: usize,
    },
    /// Reading the log during catch-up failed; the read is retried
    FetchFailed { error: String },
}

const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_MAX: Duration = Duration::from_secs(5);

enum Command {
    Capture(Vec<u8>),
    Persist(Vec<u8>, oneshot::Sender<Result<u64, RelayError>>),
    Close,
}

/// A document bound to the relay.
pub struct Binding {
    name: String,
    bucket: String,
    doc: Doc,
    /// Transaction origin of merges from the log
    origin: Origin,
    clocks: Mutex<Clocks>,
    synced: watch::Sender<bool>,
    fetch: Notify,
    commands: mpsc::UnboundedSender<Command>,
    events: EventBus<BindingEvent>,
    observer: Mutex<Option<yrs::Subscription>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Binding {
    /// Create the binding and start its worker. Must run inside a tokio runtime.
    ///
    /// A non-empty `doc` has its full state queued as the first captured update.
    pub(crate) fn spawn(
        name: &str,
        doc: Doc,
        log: Arc<dyn UpdateLog>,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Arc<Self>, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (synced, _) = watch::channel(false);
        let binding = Arc::new(Self {
            name: name.to_string(),
            bucket: bucket_name(name),
            doc,
            origin: document::origin(&format!("loom-relay/{name}/{}", Uuid::new_v4())),
            clocks: Mutex::new(Clocks::default()),
            synced,
            fetch: Notify::new(),
            commands: tx.clone(),
            events: EventBus::new(),
            observer: Mutex::new(None),
            worker: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let capture = tx.clone();
        let observer = document::observe_local_updates(&binding.doc, binding.origin.clone(), move |update| {
            let _ = capture.send(Command::Capture(update));
        })?;
        *binding.observer.lock() = Some(observer);

        if !document::is_empty(&binding.doc) {
            let _ = tx.send(Command::Capture(document::encode_state_as_update(&binding.doc)));
        }

        let worker = Worker {
            binding: binding.clone(),
            log,
            publisher,
            commands: rx,
            pending: Vec::new(),
            persist_retry: None,
            persist_backoff: Backoff::new(RETRY_BASE, RETRY_MAX),
            fetch_retry: None,
            fetch_backoff: Backoff::new(RETRY_BASE, RETRY_MAX),
        };
        *binding.worker.lock() = Some(tokio::spawn(worker.run()));
        Ok(binding)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The live document. Edits made on it are persisted automatically.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn clocks(&self) -> Clocks {
        *self.clocks.lock()
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Resolve once the binding has caught up with every known update.
    pub async fn wait_synced(&self) -> Result<(), RelayError> {
        let mut rx = self.synced.subscribe();
        rx.wait_for(|synced| *synced)
            .await
            .map(|_| ())
            .map_err(|_| RelayError::Closed(self.name.clone()))
    }

    pub fn subscribe(&self) -> Subscription<BindingEvent> {
        self.events.subscribe()
    }

    /// Append an update and wait until it is durable.
    ///
    /// Unlike captured edits, failures are returned so the caller can retry.
    pub async fn persist(&self, update: Vec<u8>) -> Result<u64, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Persist(update, tx))
            .map_err(|_| RelayError::Closed(self.name.clone()))?;
        rx.await.map_err(|_| RelayError::Closed(self.name.clone()))?
    }

    /// React to a fan-out notification announcing `clock` log entries.
    ///
    /// Returns `true` if this started a new fetch.
    pub fn on_notification(&self, clock: u64) -> bool {
        let mut clocks = self.clocks.lock();
        if clock <= clocks.fetching {
            return false;
        }
        let in_flight = clocks.fetching != clocks.applied;
        clocks.fetching = clock;
        drop(clocks);

        if in_flight {
            return false;
        }
        self.synced.send_replace(false);
        self.fetch.notify_one();
        true
    }

    /// Kick off the initial catch-up.
    pub(crate) fn start_catch_up(&self) {
        self.synced.send_replace(false);
        self.fetch.notify_one();
    }

    /// Detach the document observer and stop the worker after it drains.
    ///
    /// Returns the worker handle the first time it is called.
    pub(crate) fn close(&self) -> Option<JoinHandle<()>> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.observer.lock().take();
        let _ = self.commands.send(Command::Close);
        self.worker.lock().take()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn finish_catch_up(&self, clock: u64) {
        self.synced.send_replace(true);
        self.events.emit(BindingEvent::Synced { clock });
    }
}

struct Worker {
    binding: Arc<Binding>,
    log: Arc<dyn UpdateLog>,
    publisher: Arc<dyn Publisher>,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Captured updates the log has not accepted yet, oldest first
    pending: Vec<Vec<u8>>,
    persist_retry: Option<Instant>,
    persist_backoff: Backoff,
    fetch_retry: Option<Instant>,
    fetch_backoff: Backoff,
}

impl Worker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Capture(update)) => {
                        self.pending.push(update);
                        self.flush().await;
                    }
                    Some(Command::Persist(update, reply)) => {
                        let _ = reply.send(self.persist(update).await);
                    }
                    Some(Command::Close) | None => break,
                },
                _ = sleep_until(self.persist_retry) => {
                    self.persist_retry = None;
                    self.flush().await;
                }
                _ = self.binding.fetch.notified() => self.catch_up().await,
                _ = sleep_until(self.fetch_retry) => {
                    self.fetch_retry = None;
                    self.catch_up().await;
                }
            }
        }

        if !self.pending.is_empty() {
            self.flush().await;
            if !self.pending.is_empty() {
                log::error!(
                    "Binding for {} stopped with {} updates not persisted",
                    self.binding.name,
                    self.pending.len()
                );
            }
        }
        log::debug!("Binding worker for {} stopped", self.binding.name);
    }

    /// Append every pending captured update, oldest first.
    async fn flush(&mut self) {
        if self.pending.len() > 1 {
            match document::merge_updates(&self.pending) {
                Ok(merged) => self.pending = vec![merged],
                Err(e) => log::warn!("Merging pending updates of {} failed: {e}", self.binding.name),
            }
        }

        while let Some(update) = self.pending.first().cloned() {
            match self.append(update.clone()).await {
                Ok(len) => {
                    self.pending.remove(0);
                    if let Err(e) = self.announce(len).await {
                        log::warn!("Update #{len} for {} persisted but not announced: {e}", self.binding.name);
                    }
                }
                Err(e) => {
                    let delay = self.persist_backoff.delay();
                    self.persist_backoff.record_failure();
                    self.persist_retry = Some(Instant::now() + delay);
                    log::warn!(
                        "Update for {} not persisted, retrying in {delay:?}: {e}",
                        self.binding.name
                    );
                    self.binding.events.emit(BindingEvent::PersistFailed {
                        error: e.to_string(),
                        update,
                        pending: self.pending.len(),
                    });
                    return;
                }
            }
        }
        self.persist_backoff.reset();
        self.persist_retry = None;
    }

    async fn persist(&self, update: Vec<u8>) -> Result<u64, RelayError> {
        let len = self.append(update).await?;
        self.announce(len).await?;
        Ok(len)
    }

    async fn append(&self, update: Vec<u8>) -> Result<u64, StoreError> {
        let bucket = self.binding.bucket.clone();
        let len = self
            .blocking(move |log| log.append(&bucket, &update))
            .await?;

        {
            let mut clocks = self.binding.clocks.lock();
            if len == clocks.applied + 1 {
                clocks.applied = len;
                clocks.fetching = clocks.fetching.max(len);
            }
        }
        log::debug!("Persisted update #{len} for {}", self.binding.name);
        self.binding.events.emit(BindingEvent::Persisted { clock: len });
        Ok(len)
    }

    /// Tell sibling relays the log now holds `len` entries.
    async fn announce(&self, len: u64) -> Result<(), FanOutError> {
        let publisher = self.publisher.clone();
        let channel = self.binding.name.clone();
        tokio::task::spawn_blocking(move || publisher.publish(&channel, &encode_clock(len)))
            .await
            .map_err(|e| FanOutError::Transport(e.to_string()))??;
        Ok(())
    }

    /// Merge log entries until `applied` reaches `fetching`.
    async fn catch_up(&mut self) {
        let binding = self.binding.clone();
        self.fetch_retry = None;
        loop {
            let start = binding.clocks.lock().applied;
            let bucket = binding.bucket.clone();
            let entries = match self.blocking(move |log| log.read_from(&bucket, start)).await {
                Ok(entries) => entries,
                Err(e) => {
                    // Keep the target; the binding stays unsynced until a read succeeds
                    let delay = self.fetch_backoff.delay();
                    self.fetch_backoff.record_failure();
                    self.fetch_retry = Some(Instant::now() + delay);
                    log::warn!("Catch-up read for {} failed, retrying in {delay:?}: {e}", binding.name);
                    binding.events.emit(BindingEvent::FetchFailed { error: e.to_string() });
                    return;
                }
            };
            self.fetch_backoff.reset();

            let count = entries.len() as u64;
            if count > 0 {
                match document::apply_updates(&binding.doc, &entries, &binding.origin) {
                    Ok(0) => {}
                    Ok(skipped) => log::warn!("Skipped {skipped} undecodable entries in {}", binding.bucket),
                    Err(e) => log::warn!("Merging entries of {} failed: {e}", binding.bucket),
                }
            }

            let mut clocks = binding.clocks.lock();
            clocks.applied = clocks.applied.max(start + count);
            clocks.fetching = clocks.fetching.max(clocks.applied);
            if clocks.fetching > clocks.applied && count == 0 {
                log::warn!(
                    "Stale notification for {}: expected {} entries, log holds {}",
                    binding.name,
                    clocks.fetching,
                    clocks.applied
                );
                clocks.fetching = clocks.applied;
            }
            if clocks.is_converged() {
                let clock = clocks.applied;
                drop(clocks);
                log::debug!("{} caught up at clock {clock}", binding.name);
                binding.finish_catch_up(clock);
                return;
            }
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&dyn UpdateLog) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let log = self.log.clone();
        tokio::task::spawn_blocking(move || f(log.as_ref()))
            .await
            .map_err(|e| StoreError::TaskFailed(e.to_string()))?
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::LocalFanOut;
    use crate::storage::MemoryLog;
    use std::time::Duration;
    use yrs::{GetString, Text, Transact};

    fn spawn_binding(name: &str, doc: Doc) -> (Arc<Binding>, Arc<MemoryLog>) {
        let log = Arc::new(MemoryLog::new());
        let hub = LocalFanOut::new();
        let link = hub.connect();
        let binding = Binding::spawn(name, doc, log.clone(), link.publisher).unwrap();
        (binding, log)
    }

    fn text_in(entries: &[Vec<u8>]) -> String {
        let replica = Doc::new();
        for entry in entries {
            document::apply_update(&replica, entry, None).unwrap();
        }
        let text = replica.get_or_insert_text("content");
        let txn = replica.transact();
        text.get_string(&txn)
    }

    #[tokio::test]
    async fn test_non_empty_doc_persisted_first() {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("content");
        text.insert(&mut doc.transact_mut(), 0, "seed");

        let (binding, log) = spawn_binding("seeded", doc);
        binding.start_catch_up();
        tokio::time::timeout(Duration::from_secs(2), binding.wait_synced()).await.unwrap().unwrap();

        assert_eq!(log.len("seeded:updates").unwrap(), 1);
        assert_eq!(binding.clocks(), Clocks { applied: 1, fetching: 1 });
    }

    #[tokio::test]
    async fn test_local_edit_advances_applied_clock() {
        let (binding, log) = spawn_binding("edits", Doc::new());
        binding.start_catch_up();
        binding.wait_synced().await.unwrap();

        let mut events = binding.subscribe();
        let text = binding.doc().get_or_insert_text("content");
        text.insert(&mut binding.doc().transact_mut(), 0, "a");
        text.insert(&mut binding.doc().transact_mut(), 1, "b");

        for expected in 1..=2 {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap();
            assert_eq!(event, Some(BindingEvent::Persisted { clock: expected }));
        }
        assert_eq!(log.len("edits:updates").unwrap(), 2);
        assert_eq!(binding.clocks().applied, 2);
    }

    #[tokio::test]
    async fn test_notification_ignored_when_not_ahead() {
        let (binding, _log) = spawn_binding("quiet", Doc::new());
        assert!(binding.on_notification(3));
        assert!(!binding.on_notification(3));
        assert!(!binding.on_notification(2));
        // Raised target while in flight does not start another fetch
        assert!(!binding.on_notification(5));
        assert_eq!(binding.clocks().fetching, 5);
    }

    #[tokio::test]
    async fn test_persist_error_is_returned() {
        let (binding, log) = spawn_binding("failing", Doc::new());
        log.set_fail_writes(true);
        let result = binding.persist(vec![0, 0]).await;
        assert!(matches!(result, Err(RelayError::Store(_))));
        assert_eq!(binding.clocks().applied, 0);
    }

    #[tokio::test]
    async fn test_refused_capture_is_retried() {
        let (binding, log) = spawn_binding("flaky", Doc::new());
        binding.start_catch_up();
        binding.wait_synced().await.unwrap();

        let mut events = binding.subscribe();
        log.set_fail_writes(true);
        let text = binding.doc().get_or_insert_text("content");
        text.insert(&mut binding.doc().transact_mut(), 0, "x");
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap();
        let Some(BindingEvent::PersistFailed { update, pending, .. }) = event else {
            panic!("expected PersistFailed");
        };
        assert_eq!(pending, 1);
        assert_eq!(text_in(&[update]), "x");
        assert_eq!(log.len("flaky:updates").unwrap(), 0);

        log.set_fail_writes(false);
        text.insert(&mut binding.doc().transact_mut(), 1, "y");
        let mut durable = String::new();
        for _ in 0..100 {
            durable = text_in(&log.read_from("flaky:updates", 0).unwrap());
            if durable == "xy" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(durable, "xy");
    }

    #[tokio::test]
    async fn test_failed_read_keeps_target_and_retries() {
        let (binding, log) = spawn_binding("unreadable", Doc::new());
        let source = Doc::new();
        let text = source.get_or_insert_text("content");
        text.insert(&mut source.transact_mut(), 0, "kept");
        log.append("unreadable:updates", &document::encode_state_as_update(&source))
            .unwrap();
        log.set_fail_reads(true);

        let mut events = binding.subscribe();
        assert!(binding.on_notification(1));
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap();
        assert!(matches!(event, Some(BindingEvent::FetchFailed { .. })));
        assert!(!binding.is_synced());
        assert_eq!(binding.clocks(), Clocks { applied: 0, fetching: 1 });

        log.set_fail_reads(false);
        tokio::time::timeout(Duration::from_secs(5), binding.wait_synced()).await.unwrap().unwrap();
        assert_eq!(binding.clocks(), Clocks { applied: 1, fetching: 1 });
        let live = binding.doc().get_or_insert_text("content");
        assert_eq!(live.get_string(&binding.doc().transact()), "kept");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (binding, _log) = spawn_binding("closing", Doc::new());
        let handle = binding.close().unwrap();
        handle.await.unwrap();
        assert!(binding.close().is_none());
        assert!(binding.is_closed());
        assert!(matches!(binding.persist(vec![]).await, Err(RelayError::Closed(_))));
    }
}
