//! # presence-sync: real-time presence fan-out server
//!
//! Clients connect over WebSocket, stream pointer and interaction events,
//! and receive every other client's state with low latency. Stale pointer
//! motion is dropped instead of queued.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  JSON events   ┌──────────────────┐
//! │  Client    │ ─────────────► │ connection task  │
//! │ (browser)  │ ◄───────────── │ (server)         │
//! └────────────┘  batches       └────────┬─────────┘
//!                                        │ record_event
//!                                        ▼
//!                               ┌──────────────────┐
//!                               │ PresenceStore    │  id → ClientState
//!                               │  └ EventBuffer   │  windowed, monotonic
//!                               └────────┬─────────┘
//!                                        │ drain_updates (every tick)
//!                                        ▼
//!                              ┌────────────────────┐
//!                              │ BroadcastScheduler │ ─► ConnectionRegistry
//!                              │ (fan-out N-1)      │    (id → PeerHandle)
//!                              └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages
//! - [`buffer`]: per-client time-windowed event buffer
//! - [`store`]: shared `ConnectionId → ClientState` map
//! - [`registry`]: live connections and their outbound queues
//! - [`scheduler`]: tick / event-driven fan-out excluding the sender
//! - [`server`]: WebSocket transport
//! - [`config`]: defaults and `PRESENCE_*` overrides

pub mod buffer;
pub mod config;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod store;

// Re-exports for convenience
pub use buffer::{BufferedEvent, EventBuffer, EventId, PushOutcome};
pub use config::{ConfigError, PresenceConfig};
pub use protocol::{
    ConnectionId, EntityUpdate, EventMessage, InboundMessage, Position, ProtocolError,
    ServerMessage, ServerMessageType,
};
pub use registry::{ConnectionRegistry, Frame, PeerHandle, SendError};
pub use scheduler::{BroadcastMode, BroadcastScheduler, BroadcastSet, BroadcastStats, FanOutReport};
pub use server::{PresenceServer, ServerError, ServerStats};
pub use store::{ClientState, ClientUpdate, PresenceStore, RecordOutcome, StoreError};
