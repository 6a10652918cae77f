//! WebSocket relay server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── DocumentRoom (name) ── Binding ── UpdateLog + fan-out bus
//! Client B ──┘        │      │
//!                     │      └── Awareness (observer) ── expiry sweeper
//!                     ▼
//!               BroadcastGroup
//!                ┌────┼────┐
//!                ▼    ▼    ▼
//!             Client A  B  C
//! ```
//!
//! The document name is the request path; the query string is handed to the
//! [`Authorizer`]. A room is opened on the first connection: the document is
//! bound through the [`Relay`] and the handshake waits until the binding has
//! caught up with the durable log. The room closes and the document is
//! unbound when its last connection leaves.
//!
//! Every document update, whether it came from a client here or from a
//! sibling relay, is broadcast to every connection of the room.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;
use yrs::encoding::read::Cursor;
use yrs::Doc;

use crate::awareness::{Awareness, OUTDATED_TIMEOUT};
use crate::binding::Binding;
use crate::broadcast::BroadcastGroup;
use crate::document;
use crate::protocol::{AuthMessage, Message, MessageType, ProtocolError, SyncMessage};
use crate::relay::{Relay, RelayError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How long a denied connection is kept open for the peer to read the verdict.
const DENIAL_LINGER: Duration = Duration::from_secs(1);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Silence after which a remote awareness state is dropped
    pub awareness_timeout: Duration,
    /// Longest a handshake waits for the binding to catch up
    pub sync_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            broadcast_capacity: 256,
            awareness_timeout: OUTDATED_TIMEOUT,
            sync_timeout: Duration::from_secs(10),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub denied_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub open_documents: usize,
}

/// Connection admission.
pub trait Authorizer: Send + Sync {
    /// `Err(reason)` refuses the connection; the reason is sent to the client.
    fn authorize(&self, doc_name: &str, params: &BTreeMap<String, String>) -> Result<(), String>;
}

/// Admits every connection.
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _doc_name: &str, _params: &BTreeMap<String, String>) -> Result<(), String> {
        Ok(())
    }
}

impl<F> Authorizer for F
where
    F: Fn(&str, &BTreeMap<String, String>) -> Result<(), String> + Send + Sync,
{
    fn authorize(&self, doc_name: &str, params: &BTreeMap<String, String>) -> Result<(), String> {
        self(doc_name, params)
    }
}

/// One open document: binding, awareness and fan-out.
struct DocumentRoom {
    name: String,
    binding: Arc<Binding>,
    awareness: Arc<parking_lot::Mutex<Awareness>>,
    broadcast: Arc<BroadcastGroup>,
    /// Awareness client ids announced over each connection
    controlled: parking_lot::Mutex<HashMap<Uuid, HashSet<u64>>>,
    _updates: yrs::Subscription,
    sweeper: JoinHandle<()>,
}

impl DocumentRoom {
    fn open(name: &str, binding: Arc<Binding>, config: &ServerConfig) -> Result<Self, RelayError> {
        let broadcast = Arc::new(BroadcastGroup::new(config.broadcast_capacity));
        let sink = broadcast.clone();
        let updates = document::observe_all_updates(binding.doc(), move |update| {
            let frame = Message::Sync(SyncMessage::Update(update)).encode();
            sink.broadcast(Arc::new(frame));
        })?;

        let awareness = Arc::new(parking_lot::Mutex::new(Awareness::observer(
            binding.doc().client_id(),
        )));
        let sweeper = tokio::spawn(sweep_awareness(
            awareness.clone(),
            broadcast.clone(),
            config.awareness_timeout,
        ));

        Ok(Self {
            name: name.to_string(),
            binding,
            awareness,
            broadcast,
            controlled: parking_lot::Mutex::new(HashMap::new()),
            _updates: updates,
            sweeper,
        })
    }

    fn doc(&self) -> &Doc {
        self.binding.doc()
    }

    /// Process one inbound frame. Returns the reply for the sender, if any.
    fn handle_frame(&self, conn_id: Uuid, data: &[u8]) -> Result<Option<Vec<u8>>, ProtocolError> {
        let mut cursor = Cursor::new(data);
        let message_type = MessageType::read(&mut cursor)?;
        match Message::decode_body(message_type, &mut cursor)? {
            Message::Sync(sync) => {
                let reply = document::read_sync_message(self.doc(), sync, None)?;
                Ok(reply.map(|m| Message::Sync(m).encode()))
            }
            Message::Awareness(update) => {
                let frame = {
                    let mut awareness = self.awareness.lock();
                    let change = awareness.apply_update(&update, Instant::now())?;
                    if change.is_noop() {
                        return Ok(None);
                    }
                    let mut controlled = self.controlled.lock();
                    let owned = controlled.entry(conn_id).or_default();
                    owned.extend(change.added.iter().chain(&change.updated).chain(&change.refreshed));
                    for id in &change.removed {
                        owned.remove(id);
                    }
                    Message::Awareness(awareness.encode_update(&change.touched())).encode()
                };
                self.broadcast.broadcast(Arc::new(frame));
                Ok(None)
            }
            Message::QueryAwareness => {
                let full = self.awareness.lock().encode_full();
                Ok(Some(Message::Awareness(full).encode()))
            }
            Message::Auth(_) => Ok(None),
        }
    }

    /// Frames that open the handshake with a new connection.
    fn greeting(&self) -> Vec<Vec<u8>> {
        let step1 = SyncMessage::Step1(document::encode_state_vector(self.doc()));
        let mut frames = vec![Message::Sync(step1).encode()];
        let awareness = self.awareness.lock();
        if !awareness.states().is_empty() {
            frames.push(Message::Awareness(awareness.encode_full()).encode());
        }
        frames
    }

    /// Frames that bring a connection that missed broadcasts back up to date.
    fn resync(&self) -> Vec<Vec<u8>> {
        let state = SyncMessage::Update(document::encode_state_as_update(self.doc()));
        let mut frames = vec![Message::Sync(state).encode()];
        let awareness = self.awareness.lock();
        if !awareness.states().is_empty() {
            frames.push(Message::Awareness(awareness.encode_full()).encode());
        }
        frames
    }

    /// Forget the awareness states a departed connection controlled.
    fn release(&self, conn_id: &Uuid) {
        let Some(owned) = self.controlled.lock().remove(conn_id) else {
            return;
        };
        if owned.is_empty() {
            return;
        }
        let ids: Vec<u64> = owned.into_iter().collect();
        let frame = {
            let mut awareness = self.awareness.lock();
            let change = awareness.remove_states(&ids, Instant::now());
            if change.is_noop() {
                return;
            }
            Message::Awareness(awareness.encode_update(&change.removed)).encode()
        };
        self.broadcast.broadcast(Arc::new(frame));
    }
}

impl Drop for DocumentRoom {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

async fn sweep_awareness(
    awareness: Arc<parking_lot::Mutex<Awareness>>,
    broadcast: Arc<BroadcastGroup>,
    timeout: Duration,
) {
    let mut interval = tokio::time::interval((timeout / 10).max(Duration::from_millis(1)));
    loop {
        interval.tick().await;
        let frame = {
            let mut awareness = awareness.lock();
            let change = awareness.check_outdated(Instant::now(), timeout);
            if change.removed.is_empty() {
                continue;
            }
            Message::Awareness(awareness.encode_update(&change.removed)).encode()
        };
        broadcast.broadcast(Arc::new(frame));
    }
}

/// The relay server.
#[derive(Clone)]
pub struct RelayServer {
    config: ServerConfig,
    relay: Arc<Relay>,
    authorizer: Arc<dyn Authorizer>,
    /// Open rooms: name → room
    rooms: Arc<RwLock<HashMap<String, Arc<DocumentRoom>>>>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig, relay: Arc<Relay>) -> Self {
        Self {
            config,
            relay,
            authorizer: Arc::new(AllowAll),
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_authorizer(mut self, authorizer: impl Authorizer + 'static) -> Self {
        self.authorizer = Arc::new(authorizer);
        self
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(self, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
        let mut path = String::new();
        let mut query = String::new();
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                path = request.uri().path().to_string();
                query = request.uri().query().unwrap_or_default().to_string();
                Ok(response)
            },
        )
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let name = path.trim_start_matches('/').to_string();
        let params: BTreeMap<String, String> =
            url::form_urlencoded::parse(query.as_bytes()).into_owned().collect();
        let verdict = if name.is_empty() {
            Err("missing document name".to_string())
        } else {
            self.authorizer.authorize(&name, &params)
        };
        if let Err(reason) = verdict {
            log::info!("Denied {addr} access to '{name}': {reason}");
            let frame = Message::Auth(AuthMessage::PermissionDenied { reason }).encode();
            let _ = ws_sender.send(WsMessage::Binary(frame.into())).await;
            let _ = ws_sender.close().await;
            // Dropping now could reset the socket before the peer reads the verdict
            let _ = tokio::time::timeout(DENIAL_LINGER, async {
                while let Some(Ok(_)) = ws_receiver.next().await {}
            })
            .await;
            let mut s = self.stats.write().await;
            s.denied_connections += 1;
            s.active_connections -= 1;
            return Ok(());
        }

        let conn_id = Uuid::new_v4();
        let (room, mut broadcast_rx) = match self.join_room(&name, conn_id, addr).await {
            Ok(joined) => joined,
            Err(e) => {
                self.stats.write().await.active_connections -= 1;
                return Err(e.into());
            }
        };
        log::info!("Connection {conn_id} from {addr} joined {name}");

        let result = self
            .pump_connection(&room, conn_id, &mut ws_sender, &mut ws_receiver, &mut broadcast_rx)
            .await;

        drop(broadcast_rx);
        self.leave_room(room, conn_id).await;
        self.stats.write().await.active_connections -= 1;
        log::info!("Connection {conn_id} from {addr} left {name}");
        result
    }

    async fn pump_connection<S, R>(
        &self,
        room: &DocumentRoom,
        conn_id: Uuid,
        ws_sender: &mut S,
        ws_receiver: &mut R,
        broadcast_rx: &mut tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>,
    ) -> Result<(), BoxError>
    where
        S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
        R: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        match tokio::time::timeout(self.config.sync_timeout, room.binding.wait_synced()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => log::warn!(
                "{} not caught up after {:?}, greeting anyway",
                room.name,
                self.config.sync_timeout
            ),
        }
        for frame in room.greeting() {
            ws_sender.send(WsMessage::Binary(frame.into())).await?;
        }

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(WsMessage::Binary(data))) => {
                            {
                                let mut s = self.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            match room.handle_frame(conn_id, &data) {
                                Ok(Some(reply)) => ws_sender.send(WsMessage::Binary(reply.into())).await?,
                                Ok(None) => {}
                                Err(e) => log::warn!("Discarding malformed frame on {}: {e}", room.name),
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(WsMessage::Ping(data))) => {
                            ws_sender.send(WsMessage::Pong(data)).await?;
                        }
                        Some(Err(e)) => {
                            log::debug!("WebSocket error on {}: {e}", room.name);
                            break;
                        }
                        _ => {}
                    }
                }
                // Outgoing broadcast frame
                frame = broadcast_rx.recv() => {
                    match frame {
                        Ok(data) => ws_sender.send(WsMessage::Binary(data.to_vec().into())).await?,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Connection {conn_id} lagged by {n} frames, sending full state");
                            for frame in room.resync() {
                                ws_sender.send(WsMessage::Binary(frame.into())).await?;
                            }
                        }
                        Err(_) => break,
                    }
                }
            }
        }
        Ok(())
    }

    /// Open (or reuse) the room for `name` and register the connection in it.
    async fn join_room(
        &self,
        name: &str,
        conn_id: Uuid,
        addr: SocketAddr,
    ) -> Result<(Arc<DocumentRoom>, tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>), RelayError> {
        let mut rooms = self.rooms.write().await;
        let room = match rooms.get(name) {
            Some(room) => room.clone(),
            None => {
                let binding = self.relay.bind(name, Doc::new())?;
                let room = match DocumentRoom::open(name, binding, &self.config) {
                    Ok(room) => Arc::new(room),
                    Err(e) => {
                        drop(rooms);
                        let _ = self.relay.unbind(name).await;
                        return Err(e);
                    }
                };
                rooms.insert(name.to_string(), room.clone());
                self.stats.write().await.open_documents = rooms.len();
                log::info!("Opened document {name}");
                room
            }
        };
        // Joined under the rooms lock so a closing room is never handed out
        let rx = room.broadcast.join(conn_id, addr);
        Ok((room, rx))
    }

    async fn leave_room(&self, room: Arc<DocumentRoom>, conn_id: Uuid) {
        let remaining = room.broadcast.leave(&conn_id);
        room.release(&conn_id);
        if remaining > 0 {
            return;
        }

        {
            let mut rooms = self.rooms.write().await;
            let current = rooms.get(&room.name).is_some_and(|r| Arc::ptr_eq(r, &room));
            if !current || room.broadcast.connection_count() > 0 {
                return;
            }
            rooms.remove(&room.name);
            self.stats.write().await.open_documents = rooms.len();
        }

        let name = room.name.clone();
        drop(room);
        match self.relay.unbind(&name).await {
            Ok(_) => log::info!("Closed document {name}"),
            Err(e) => log::error!("Unbinding {name} failed: {e}"),
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub async fn open_documents(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::LocalFanOut;
    use crate::storage::MemoryLog;

    fn room_for(name: &str) -> (Arc<Relay>, DocumentRoom) {
        room_with(name, &ServerConfig::default())
    }

    fn room_with(name: &str, config: &ServerConfig) -> (Arc<Relay>, DocumentRoom) {
        let relay = Relay::new(Arc::new(MemoryLog::new()), LocalFanOut::new().connect());
        let binding = relay.bind(name, Doc::new()).unwrap();
        let room = DocumentRoom::open(name, binding, config).unwrap();
        (relay, room)
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:1234");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.awareness_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_closure_authorizer() {
        let only_token = |_: &str, params: &BTreeMap<String, String>| {
            params.get("token").map(|_| ()).ok_or_else(|| "token required".to_string())
        };
        let mut params = BTreeMap::new();
        assert_eq!(only_token.authorize("doc", &params), Err("token required".to_string()));
        params.insert("token".to_string(), "t".to_string());
        assert!(only_token.authorize("doc", &params).is_ok());
        assert!(AllowAll.authorize("doc", &BTreeMap::new()).is_ok());
    }

    #[tokio::test]
    async fn test_greeting_starts_with_step1() {
        let (_relay, room) = room_for("greet");
        let frames = room.greeting();
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            Message::decode(&frames[0]).unwrap(),
            Message::Sync(SyncMessage::Step1(_))
        ));
    }

    #[tokio::test]
    async fn test_step1_gets_step2_reply() {
        let (_relay, room) = room_for("reply");
        let step1 = Message::Sync(SyncMessage::Step1(document::encode_state_vector(&Doc::new()))).encode();
        let reply = room.handle_frame(Uuid::new_v4(), &step1).unwrap().unwrap();
        assert!(matches!(
            Message::decode(&reply).unwrap(),
            Message::Sync(SyncMessage::Step2(_))
        ));
    }

    #[tokio::test]
    async fn test_awareness_is_broadcast_and_released() {
        let (_relay, room) = room_for("presence");
        let conn = Uuid::new_v4();
        let mut rx = room.broadcast.join(conn, SocketAddr::from(([127, 0, 0, 1], 1)));

        let peer = Awareness::new(77);
        let frame = Message::Awareness(peer.encode_update(&[77])).encode();
        assert!(room.handle_frame(conn, &frame).unwrap().is_none());
        assert!(rx.recv().await.is_ok());
        assert!(room.awareness.lock().state(77).is_some());

        room.release(&conn);
        assert!(room.awareness.lock().state(77).is_none());
        let removal = rx.recv().await.unwrap();
        assert!(matches!(Message::decode(&removal).unwrap(), Message::Awareness(_)));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_rejected() {
        let (_relay, room) = room_for("junk");
        assert!(room.handle_frame(Uuid::new_v4(), &[0xff]).is_err());
        assert!(room.handle_frame(Uuid::new_v4(), &[9, 0]).is_err());
    }

    #[tokio::test]
    async fn test_lagged_connection_gets_full_state() {
        use tokio::sync::broadcast::error::RecvError;
        use yrs::{GetString, Text, Transact};

        let config = ServerConfig {
            broadcast_capacity: 1,
            ..ServerConfig::default()
        };
        let (_relay, room) = room_with("burst", &config);
        let mut rx = room.broadcast.join(Uuid::new_v4(), SocketAddr::from(([127, 0, 0, 1], 1)));

        let text = room.doc().get_or_insert_text("content");
        for chunk in ["a", "b", "c", "d"] {
            let mut txn = room.doc().transact_mut();
            let len = text.len(&txn);
            text.insert(&mut txn, len, chunk);
        }
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(_))));

        let replica = Doc::new();
        for frame in room.resync() {
            if let Message::Sync(sync) = Message::decode(&frame).unwrap() {
                document::read_sync_message(&replica, sync, None).unwrap();
            }
        }
        let replica_text = replica.get_or_insert_text("content");
        assert_eq!(replica_text.get_string(&replica.transact()), "abcd");
    }
}
