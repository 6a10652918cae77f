//! WebSocket sync client: keeps one local document and its awareness in
//! step with a relay server.
//!
//! ```text
//!   SyncClient (handle)            ClientTask (one tokio task)
//!   connect / disconnect  ──cmd──►  ┌──────────────────────────────┐
//!   set_local_state                 │ link: Down | Connecting | Open│◄──► relay server
//!   subscribe ◄── ClientEvent ───── │ side channel                 │◄──► sibling clients
//!                                   │ backoff, idle + resync ticks │
//!   doc edits ──observer──────────► └──────────────────────────────┘
//! ```
//!
//! Provides:
//! - Connection lifecycle with exponential reconnect backoff
//! - Idle detection: a link that stays silent for `idle_multiple` heartbeat
//!   periods is closed and re-dialed
//! - Awareness heartbeats and expiry
//! - A same-process side channel so clients of one document converge
//!   without the server
//!
//! Inbound frames are dispatched by tag through a table of handlers built
//! once per client. Remote merges carry the client's own origin so they are
//! never sent back out.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;
use yrs::encoding::read::{Cursor, Read};
use yrs::{Doc, Origin, Subscription as DocSubscription};

use crate::awareness::{Awareness, AwarenessChange};
use crate::backoff::Backoff;
use crate::broadcast::{SideChannelHub, SideFrame};
use crate::document::{self, DocumentError};
use crate::events::{EventBus, Subscription};
use crate::protocol::{AuthMessage, Message, MessageType, ProtocolError, SyncMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base server URL, e.g. `ws://127.0.0.1:4455`
    pub server_url: String,
    pub doc_name: String,
    /// Extra query parameters sent with every connection attempt
    pub params: BTreeMap<String, String>,
    /// Start connecting immediately
    pub connect: bool,
    /// Join the same-process side channel
    pub side_channel: bool,
    /// First reconnect delay; doubles after every failed attempt
    pub reconnect_base: Duration,
    pub max_backoff: Duration,
    /// Awareness renewal period
    pub heartbeat_interval: Duration,
    /// Heartbeat periods without any inbound frame before the link is dropped
    pub idle_multiple: u32,
    /// Periodically re-send sync step 1 while connected
    pub resync_interval: Option<Duration>,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, doc_name: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            doc_name: doc_name.into(),
            params: BTreeMap::new(),
            connect: true,
            side_channel: true,
            reconnect_base: Duration::from_millis(100),
            max_backoff: Duration::from_millis(2500),
            heartbeat_interval: Duration::from_secs(15),
            idle_multiple: 2,
            resync_interval: None,
        }
    }

    /// Add a query parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        self.heartbeat_interval.saturating_mul(self.idle_multiple.max(1))
    }

    /// Remote awareness states expire after two silent heartbeat periods.
    pub fn awareness_timeout(&self) -> Duration {
        self.heartbeat_interval.saturating_mul(2)
    }

    /// Side channel address: the server URL without trailing slashes, then the name.
    pub fn side_channel_address(&self) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), self.doc_name)
    }

    /// Full connection URL including the encoded query.
    pub fn url(&self) -> String {
        let mut url = self.side_channel_address();
        if !self.params.is_empty() {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(self.params.iter())
                .finish();
            url.push('?');
            url.push_str(&query);
        }
        url
    }

    fn check_interval(&self) -> Duration {
        let period = self.idle_timeout().min(self.awareness_timeout()) / 10;
        period.max(Duration::from_millis(1))
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Connected and the server's sync step 2 has been applied
    Synced,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Status(ConnectionState),
    Synced(bool),
    /// A connection attempt or open link failed
    ConnectionError(String),
    /// The link closed, cleanly or not
    ConnectionClosed,
    PermissionDenied { reason: String },
    Awareness(AwarenessChange),
}

/// Client errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    InvalidUrl(String),
    /// The background task has already stopped
    Closed,
    Document(DocumentError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::InvalidUrl(e) => write!(f, "Invalid server URL: {e}"),
            ClientError::Closed => write!(f, "Client is closed"),
            ClientError::Document(e) => write!(f, "Document error: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<DocumentError> for ClientError {
    fn from(e: DocumentError) -> Self {
        ClientError::Document(e)
    }
}

enum Command {
    Connect,
    Disconnect,
    SetLocalState(Option<Value>),
    Destroy,
}

/// The sync client.
///
/// Owns nothing but handles: the document, the shared awareness registry
/// and the command queue of the background task. Dropping it aborts the
/// task; [`SyncClient::destroy`] shuts down gracefully.
pub struct SyncClient {
    id: Uuid,
    doc: Doc,
    url: String,
    state: Arc<RwLock<ConnectionState>>,
    awareness: Arc<parking_lot::RwLock<Awareness>>,
    events: EventBus<ClientEvent>,
    commands: mpsc::UnboundedSender<Command>,
    task: Option<JoinHandle<()>>,
}

impl SyncClient {
    /// Create a client for `doc`. Must run inside a tokio runtime.
    pub fn new(
        doc: Doc,
        config: ClientConfig,
        hub: Option<Arc<SideChannelHub>>,
    ) -> Result<Self, ClientError> {
        let url = config.url();
        let parsed = url::Url::parse(&url).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(ClientError::InvalidUrl(format!(
                "unsupported scheme {}",
                parsed.scheme()
            )));
        }

        let id = Uuid::new_v4();
        let origin = document::origin(&format!("loom-client/{id}"));
        let (update_tx, doc_updates) = mpsc::unbounded_channel();
        let doc_subscription = document::observe_local_updates(&doc, origin.clone(), move |update| {
            let _ = update_tx.send(update);
        })?;

        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));
        let awareness = Arc::new(parking_lot::RwLock::new(Awareness::new(doc.client_id())));
        let events = EventBus::new();
        let (commands, command_rx) = mpsc::unbounded_channel();

        let task = ClientTask {
            id,
            doc: doc.clone(),
            origin,
            url: url.clone(),
            side_address: config.side_channel_address(),
            backoff: Backoff::new(config.reconnect_base, config.max_backoff),
            config,
            hub,
            state: state.clone(),
            awareness: awareness.clone(),
            events: events.clone(),
            commands: command_rx,
            doc_updates,
            _doc_subscription: doc_subscription,
            dispatch: Dispatch::new(),
            link: Link::Down,
            side: None,
            should_connect: false,
            connected: false,
            synced: false,
            reported_synced: false,
            reconnect_at: None,
            last_message: Instant::now(),
        };
        let task = tokio::spawn(task.run());

        Ok(Self {
            id,
            doc,
            url,
            state,
            awareness,
            events,
            commands,
            task: Some(task),
        })
    }

    /// Start (or resume) connecting. No-op while already linked.
    pub fn connect(&self) -> Result<(), ClientError> {
        self.send(Command::Connect)
    }

    /// Close both links and stop reconnecting. Peers see our awareness removed.
    pub fn disconnect(&self) -> Result<(), ClientError> {
        self.send(Command::Disconnect)
    }

    /// Replace the local awareness state; `None` announces departure.
    pub fn set_local_state(&self, state: Option<Value>) -> Result<(), ClientError> {
        self.send(Command::SetLocalState(state))
    }

    /// Disconnect, release every observer and wait for the task to finish.
    pub async fn destroy(mut self) {
        let _ = self.commands.send(Command::Destroy);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn send(&self, command: Command) -> Result<(), ClientError> {
        self.commands.send(command).map_err(|_| ClientError::Closed)
    }

    pub fn subscribe(&self) -> Subscription<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_synced(&self) -> bool {
        self.connection_state().await == ConnectionState::Synced
    }

    /// Snapshot of every known awareness state, keyed by client id.
    pub fn awareness_states(&self) -> HashMap<u64, Value> {
        self.awareness.read().states().clone()
    }

    pub fn local_state(&self) -> Option<Value> {
        self.awareness.read().local_state().cloned()
    }

    /// Id of this client on the side channel.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Document client id, also used as the awareness id.
    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

enum Link {
    Down,
    Connecting(BoxFuture<'static, Result<WsStream, tungstenite::Error>>),
    Open(WsStream),
    /// Writing failed or the peer sent Close: read what is still buffered
    /// until the stream ends
    Closing(WsStream),
}

enum LinkEvent {
    Opened(Result<WsStream, tungstenite::Error>),
    Frame(Option<Result<WsMessage, tungstenite::Error>>),
}

enum Event {
    Command(Command),
    Link(LinkEvent),
    LocalUpdate(Vec<u8>),
    Side(Result<SideFrame, RecvError>),
    Reconnect,
    Tick,
    Resync,
}

/// Where a frame came from, and where its reply goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Network,
    SideChannel,
}

impl Route {
    fn other(self) -> Route {
        match self {
            Route::Network => Route::SideChannel,
            Route::SideChannel => Route::Network,
        }
    }
}

/// What a handler wants sent after processing a frame.
#[derive(Default)]
struct Outcome {
    /// Back to the link the frame arrived on
    reply: Option<Vec<u8>>,
    /// To the other link only
    forward: Option<Vec<u8>>,
    /// To both links
    announce: Option<Vec<u8>>,
}

type Handler = fn(&mut ClientTask, &mut Cursor<'_>, Route) -> Result<Outcome, ProtocolError>;

struct Dispatch {
    handlers: HashMap<u64, Handler>,
}

impl Dispatch {
    fn new() -> Self {
        let mut handlers: HashMap<u64, Handler> = HashMap::new();
        handlers.insert(MessageType::Sync.tag(), handle_sync);
        handlers.insert(MessageType::Awareness.tag(), handle_awareness);
        handlers.insert(MessageType::Auth.tag(), handle_auth);
        handlers.insert(MessageType::QueryAwareness.tag(), handle_query_awareness);
        Self { handlers }
    }

    fn get(&self, tag: u64) -> Option<Handler> {
        self.handlers.get(&tag).copied()
    }
}

fn handle_sync(
    task: &mut ClientTask,
    cursor: &mut Cursor<'_>,
    route: Route,
) -> Result<Outcome, ProtocolError> {
    let message = SyncMessage::decode_from(cursor)?;
    let is_step2 = matches!(message, SyncMessage::Step2(_));
    let reply = document::read_sync_message(&task.doc, message, Some(&task.origin))?;
    if is_step2 && route == Route::Network {
        task.synced = true;
    }
    Ok(Outcome {
        reply: reply.map(|m| Message::Sync(m).encode()),
        ..Outcome::default()
    })
}

fn handle_awareness(
    task: &mut ClientTask,
    cursor: &mut Cursor<'_>,
    _route: Route,
) -> Result<Outcome, ProtocolError> {
    let update = cursor.read_buf()?;
    let mut awareness = task.awareness.write();
    let change = awareness.apply_update(update, Instant::now())?;
    if change.is_noop() {
        return Ok(Outcome::default());
    }

    let me = awareness.client_id();
    let others: Vec<u64> = change.touched().into_iter().filter(|&c| c != me).collect();
    let reasserted = change.refreshed.contains(&me);
    let outcome = Outcome {
        reply: None,
        forward: (!others.is_empty())
            .then(|| Message::Awareness(awareness.encode_update(&others)).encode()),
        announce: reasserted.then(|| Message::Awareness(awareness.encode_update(&[me])).encode()),
    };
    drop(awareness);

    if !change.is_empty() {
        task.events.emit(ClientEvent::Awareness(change));
    }
    Ok(outcome)
}

fn handle_auth(
    task: &mut ClientTask,
    cursor: &mut Cursor<'_>,
    _route: Route,
) -> Result<Outcome, ProtocolError> {
    match AuthMessage::decode_from(cursor)? {
        AuthMessage::PermissionDenied { reason } => {
            log::warn!("Permission denied for {}: {reason}", task.url);
            task.events.emit(ClientEvent::PermissionDenied { reason });
        }
    }
    Ok(Outcome::default())
}

fn handle_query_awareness(
    task: &mut ClientTask,
    _cursor: &mut Cursor<'_>,
    _route: Route,
) -> Result<Outcome, ProtocolError> {
    let full = task.awareness.read().encode_full();
    Ok(Outcome {
        reply: Some(Message::Awareness(full).encode()),
        ..Outcome::default()
    })
}

struct ClientTask {
    id: Uuid,
    doc: Doc,
    origin: Origin,
    url: String,
    side_address: String,
    config: ClientConfig,
    backoff: Backoff,
    hub: Option<Arc<SideChannelHub>>,
    state: Arc<RwLock<ConnectionState>>,
    awareness: Arc<parking_lot::RwLock<Awareness>>,
    events: EventBus<ClientEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    doc_updates: mpsc::UnboundedReceiver<Vec<u8>>,
    _doc_subscription: DocSubscription,
    dispatch: Dispatch,
    link: Link,
    side: Option<broadcast::Receiver<SideFrame>>,
    should_connect: bool,
    connected: bool,
    synced: bool,
    reported_synced: bool,
    reconnect_at: Option<tokio::time::Instant>,
    last_message: Instant,
}

impl ClientTask {
    async fn run(mut self) {
        let mut check = tokio::time::interval(self.config.check_interval());
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut resync = self.config.resync_interval.map(|period| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        if self.config.connect {
            self.connect().await;
        }

        loop {
            let event = tokio::select! {
                command = self.commands.recv() => Event::Command(command.unwrap_or(Command::Destroy)),
                link = poll_link(&mut self.link) => Event::Link(link),
                Some(update) = self.doc_updates.recv() => Event::LocalUpdate(update),
                frame = recv_side(&mut self.side) => Event::Side(frame),
                _ = sleep_until(self.reconnect_at) => Event::Reconnect,
                _ = check.tick() => Event::Tick,
                _ = tick(&mut resync) => Event::Resync,
            };
            if !self.handle(event).await {
                break;
            }
        }

        self.disconnect().await;
        log::debug!("Client {} for {} stopped", self.id, self.url);
    }

    /// Returns `false` once the task should stop.
    async fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::Command(Command::Connect) => self.connect().await,
            Event::Command(Command::Disconnect) => self.disconnect().await,
            Event::Command(Command::SetLocalState(state)) => {
                let change = self.awareness.write().set_local_state(state, Instant::now());
                self.on_local_awareness(change).await;
            }
            Event::Command(Command::Destroy) => return false,
            Event::Link(LinkEvent::Opened(Ok(ws))) => self.on_open(ws).await,
            Event::Link(LinkEvent::Opened(Err(e))) => {
                log::debug!("Connecting to {} failed: {e}", self.url);
                self.events.emit(ClientEvent::ConnectionError(e.to_string()));
                self.on_close().await;
            }
            Event::Link(LinkEvent::Frame(Some(Ok(message)))) => self.on_frame(message).await,
            Event::Link(LinkEvent::Frame(Some(Err(e)))) => {
                log::warn!("Link to {} failed: {e}", self.url);
                self.events.emit(ClientEvent::ConnectionError(e.to_string()));
                self.on_close().await;
            }
            Event::Link(LinkEvent::Frame(None)) => self.on_close().await,
            Event::LocalUpdate(update) => {
                let frame = Message::Sync(SyncMessage::Update(update)).encode();
                self.broadcast(frame).await;
            }
            Event::Side(Ok(frame)) => {
                if frame.origin != self.id {
                    let outcome = self.read_frame(&frame.data, Route::SideChannel);
                    self.deliver(outcome, Route::SideChannel).await;
                }
            }
            Event::Side(Err(RecvError::Lagged(skipped))) => {
                log::warn!("Side channel {} lagged, {skipped} frames lost", self.side_address);
            }
            Event::Side(Err(RecvError::Closed)) => self.side = None,
            Event::Reconnect => {
                self.reconnect_at = None;
                self.start_connect().await;
            }
            Event::Tick => self.on_tick().await,
            Event::Resync => {
                if self.connected {
                    let step1 = SyncMessage::Step1(document::encode_state_vector(&self.doc));
                    self.send_ws(Message::Sync(step1).encode()).await;
                }
            }
        }
        true
    }

    async fn connect(&mut self) {
        self.should_connect = true;
        self.start_connect().await;
        self.connect_side_channel();
    }

    async fn start_connect(&mut self) {
        if !self.should_connect || !matches!(self.link, Link::Down) {
            return;
        }
        let url = self.url.clone();
        self.link = Link::Connecting(
            async move { tokio_tungstenite::connect_async(url).await.map(|(ws, _)| ws) }.boxed(),
        );
        self.synced = false;
        self.set_state(ConnectionState::Connecting).await;
    }

    async fn on_open(&mut self, ws: WsStream) {
        log::info!("Connected to {}", self.url);
        self.link = Link::Open(ws);
        self.connected = true;
        self.last_message = Instant::now();
        self.backoff.reset();
        self.set_state(ConnectionState::Connected).await;

        let step1 = SyncMessage::Step1(document::encode_state_vector(&self.doc));
        self.send_ws(Message::Sync(step1).encode()).await;
        let own = {
            let awareness = self.awareness.read();
            awareness
                .local_state()
                .is_some()
                .then(|| Message::Awareness(awareness.encode_update(&[awareness.client_id()])).encode())
        };
        if let Some(frame) = own {
            self.send_ws(frame).await;
        }
    }

    async fn on_close(&mut self) {
        self.link = Link::Down;
        self.events.emit(ClientEvent::ConnectionClosed);

        if self.connected {
            self.connected = false;
            self.synced = false;
            let change = self.awareness.write().remove_remote_states(Instant::now());
            if !change.is_empty() {
                self.events.emit(ClientEvent::Awareness(change));
            }
            self.refresh_synced();
            self.set_state(ConnectionState::Disconnected).await;
        } else {
            self.backoff.record_failure();
        }

        if self.should_connect {
            let delay = self.backoff.delay();
            log::debug!("Reconnecting to {} in {delay:?}", self.url);
            self.reconnect_at = Some(tokio::time::Instant::now() + delay);
        } else {
            self.set_state(ConnectionState::Disconnected).await;
        }
    }

    async fn on_frame(&mut self, message: WsMessage) {
        self.last_message = Instant::now();
        match message {
            WsMessage::Binary(data) => {
                let outcome = self.read_frame(&data, Route::Network);
                self.deliver(outcome, Route::Network).await;
            }
            WsMessage::Close(_) => self.begin_closing(),
            _ => {}
        }
    }

    /// Decode and dispatch one frame. Malformed frames are logged and dropped.
    fn read_frame(&mut self, data: &[u8], route: Route) -> Outcome {
        let mut cursor = Cursor::new(data);
        let tag: u64 = match cursor.read_var() {
            Ok(tag) => tag,
            Err(e) => {
                log::warn!("Discarding malformed frame from {route:?}: {e}");
                return Outcome::default();
            }
        };
        let Some(handler) = self.dispatch.get(tag) else {
            log::warn!("Discarding frame with unknown type {tag} from {route:?}");
            return Outcome::default();
        };
        match handler(self, &mut cursor, route) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("Discarding malformed frame from {route:?}: {e}");
                Outcome::default()
            }
        }
    }

    async fn deliver(&mut self, outcome: Outcome, route: Route) {
        if let Some(reply) = outcome.reply {
            self.send_on(route, reply).await;
        }
        if let Some(forward) = outcome.forward {
            self.send_on(route.other(), forward).await;
        }
        if let Some(announce) = outcome.announce {
            self.broadcast(announce).await;
        }
        self.refresh_synced();
        if self.connected && self.synced {
            self.set_state(ConnectionState::Synced).await;
        }
    }

    async fn on_local_awareness(&mut self, change: AwarenessChange) {
        if !change.is_empty() {
            self.events.emit(ClientEvent::Awareness(change));
        }
        let frame = {
            let awareness = self.awareness.read();
            Message::Awareness(awareness.encode_update(&[awareness.client_id()])).encode()
        };
        self.broadcast(frame).await;
    }

    async fn on_tick(&mut self) {
        let timeout = self.config.awareness_timeout();
        let (change, frame) = {
            let mut awareness = self.awareness.write();
            let change = awareness.check_outdated(Instant::now(), timeout);
            let frame = (!change.is_noop())
                .then(|| Message::Awareness(awareness.encode_update(&change.touched())).encode());
            (change, frame)
        };
        if !change.is_empty() {
            self.events.emit(ClientEvent::Awareness(change));
        }
        if let Some(frame) = frame {
            self.broadcast(frame).await;
        }

        let idle_timeout = self.config.idle_timeout();
        if self.connected && self.last_message.elapsed() > idle_timeout {
            log::warn!("No frame from {} for {idle_timeout:?}, closing link", self.url);
            self.close_ws().await;
            self.on_close().await;
        }
    }

    async fn disconnect(&mut self) {
        self.should_connect = false;
        self.reconnect_at = None;

        let tombstone = {
            let awareness = self.awareness.read();
            Message::Awareness(awareness.encode_removal(&[awareness.client_id()])).encode()
        };
        self.broadcast(tombstone).await;
        self.side = None;

        match self.link {
            Link::Down => self.set_state(ConnectionState::Disconnected).await,
            Link::Connecting(_) => {
                self.link = Link::Down;
                self.set_state(ConnectionState::Disconnected).await;
            }
            Link::Open(_) | Link::Closing(_) => {
                self.close_ws().await;
                self.on_close().await;
            }
        }
    }

    fn connect_side_channel(&mut self) {
        if !self.config.side_channel || self.side.is_some() {
            return;
        }
        let Some(hub) = self.hub.clone() else {
            return;
        };
        self.side = Some(hub.subscribe(&self.side_address));

        let step1 = SyncMessage::Step1(document::encode_state_vector(&self.doc));
        let step2 = SyncMessage::Step2(document::encode_state_as_update(&self.doc));
        let (query, own) = {
            let awareness = self.awareness.read();
            (
                Message::QueryAwareness.encode(),
                Message::Awareness(awareness.encode_update(&[awareness.client_id()])).encode(),
            )
        };
        for frame in [
            Message::Sync(step1).encode(),
            Message::Sync(step2).encode(),
            query,
            own,
        ] {
            hub.publish(&self.side_address, self.id, frame);
        }
        log::debug!("Joined side channel {}", self.side_address);
    }

    async fn send_on(&mut self, route: Route, frame: Vec<u8>) {
        match route {
            Route::Network => self.send_ws(frame).await,
            Route::SideChannel => self.send_side(frame),
        }
    }

    async fn broadcast(&mut self, frame: Vec<u8>) {
        self.send_side(frame.clone());
        self.send_ws(frame).await;
    }

    fn send_side(&self, frame: Vec<u8>) {
        if self.side.is_none() {
            return;
        }
        if let Some(hub) = &self.hub {
            hub.publish(&self.side_address, self.id, frame);
        }
    }

    async fn send_ws(&mut self, frame: Vec<u8>) {
        let Link::Open(ws) = &mut self.link else {
            return;
        };
        if let Err(e) = ws.send(WsMessage::Binary(frame.into())).await {
            log::warn!("Send to {} failed: {e}", self.url);
            self.events.emit(ClientEvent::ConnectionError(e.to_string()));
            self.begin_closing();
        }
    }

    /// Stop writing but keep reading; `on_close` runs once the stream ends.
    fn begin_closing(&mut self) {
        if let Link::Open(ws) = std::mem::replace(&mut self.link, Link::Down) {
            self.link = Link::Closing(ws);
        }
    }

    async fn close_ws(&mut self) {
        if let Link::Open(ws) = &mut self.link {
            let _ = tokio::time::timeout(Duration::from_millis(250), ws.close(None)).await;
        }
    }

    fn refresh_synced(&mut self) {
        let synced = self.connected && self.synced;
        if synced != self.reported_synced {
            self.reported_synced = synced;
            self.events.emit(ClientEvent::Synced(synced));
        }
    }

    async fn set_state(&mut self, state: ConnectionState) {
        let mut current = self.state.write().await;
        if *current == state {
            return;
        }
        *current = state;
        drop(current);
        self.events.emit(ClientEvent::Status(state));
    }
}

async fn poll_link(link: &mut Link) -> LinkEvent {
    match link {
        Link::Down => std::future::pending().await,
        Link::Connecting(attempt) => LinkEvent::Opened(attempt.await),
        Link::Open(ws) | Link::Closing(ws) => LinkEvent::Frame(ws.next().await),
    }
}

async fn recv_side(side: &mut Option<broadcast::Receiver<SideFrame>>) -> Result<SideFrame, RecvError> {
    match side {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
