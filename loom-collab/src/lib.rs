//! # loom-collab — CRDT document sync over WebSocket relays
//!
//! Keeps replicas of collaborative documents convergent: clients edit a
//! local yrs document, relays fan their updates out and persist every
//! update to an append-only log so sibling relays and later joiners can
//! catch up.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐   append / read   ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ RelayServer │ ◄───────────────► │ UpdateLog   │
//! │ (per user)  │   lib0 sync proto   │ (per node)  │                   │ (durable)   │
//! └──────┬──────┘                     └──────┬──────┘                   └─────────────┘
//!        │ side channel                      │ Relay / Binding
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐   "clock" notes   ┌─────────────┐
//! │ sibling     │                     │ Yrs Doc     │ ◄───────────────► │ fan-out bus │
//! │ clients     │                     │ (authority) │                   │ (channels)  │
//! └─────────────┘                     └─────────────┘                   └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — lib0 varint framing and the sync/awareness/auth messages
//! - [`awareness`] — presence registry with clocks and expiry
//! - [`document`] — yrs helpers: state vectors, diffs, origin-tagged merges
//! - [`storage`] — append-only update logs (RocksDB and in-memory)
//! - [`fanout`] — publish/subscribe seam between relays
//! - [`remote`] — Redis log and bus for relays in separate processes
//! - [`binding`] — one document bound to its log, with catch-up
//! - [`relay`] — reference-counted registry of bindings
//! - [`broadcast`] — room fan-out and the client side channel
//! - [`server`] — WebSocket relay server
//! - [`client`] — WebSocket sync client with reconnect backoff
//! - [`events`] — typed event bus shared by client and binding

pub mod awareness;
pub mod backoff;
pub mod binding;
pub mod broadcast;
pub mod client;
pub mod document;
pub mod events;
pub mod fanout;
pub mod protocol;
pub mod relay;
pub mod remote;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use awareness::{Awareness, AwarenessChange, OUTDATED_TIMEOUT};
pub use backoff::Backoff;
pub use binding::{Binding, BindingEvent, Clocks};
pub use broadcast::{BroadcastGroup, BroadcastStats, SideChannelHub, SideFrame};
pub use client::{ClientConfig, ClientError, ClientEvent, ConnectionState, SyncClient};
pub use document::DocumentError;
pub use events::{EventBus, Subscription};
pub use fanout::{ChannelMessage, FanOutError, FanOutLink, LocalFanOut, Publisher, Subscriber};
pub use protocol::{AuthMessage, Message, MessageType, ProtocolError, SyncMessage};
pub use relay::{Relay, RelayError};
pub use remote::{RedisBus, RedisLog};
pub use server::{AllowAll, Authorizer, RelayServer, ServerConfig, ServerStats};
pub use storage::{LogHead, MemoryLog, RocksLog, StoreConfig, StoreError, UpdateLog};
