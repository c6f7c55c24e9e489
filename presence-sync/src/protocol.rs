//! JSON wire protocol between presence clients and the server.
//!
//! Inbound (client → server), one text frame per event:
//! ```text
//! { "name": "POINTER_POSITION", "message": { "timestamp": 1712, "data": { "x": 1.0, "y": 2.0 } } }
//! ```
//!
//! Outbound (server → client):
//! ```text
//! { "type": "POINTER_POSITIONS", "message": { "entities": [ … ] } }
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::buffer::BufferedEvent;
use crate::store::ClientUpdate;

/// Continuous pointer motion. Transient by default.
pub const POINTER_POSITION: &str = "POINTER_POSITION";
/// Pointer left the shared surface.
pub const POINTER_OUT: &str = "POINTER_OUT";
/// Liveness probe, answered with `PONG` and never buffered.
pub const PING: &str = "PING";

/// Server-assigned identifier of a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// 2D pointer position in shared-surface coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Read `{ "x": …, "y": … }` out of an event payload.
    pub fn from_data(data: &Value) -> Option<Self> {
        let x = data.get("x")?.as_f64()?;
        let y = data.get("y")?.as_f64()?;
        Some(Self { x, y })
    }
}

/// Body of an inbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    /// Client clock in milliseconds.
    pub timestamp: i64,
    /// Opaque key-value payload; `null` when the client sent none.
    #[serde(default)]
    pub data: Value,
}

impl EventMessage {
    pub fn new(timestamp: i64, data: Value) -> Self {
        Self { timestamp, data }
    }
}

/// A single client → server event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub name: String,
    pub message: EventMessage,
}

impl InboundMessage {
    /// Parse and validate a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let msg: InboundMessage = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        if msg.name.trim().is_empty() {
            return Err(ProtocolError::MissingField("name"));
        }
        if !(msg.message.data.is_object() || msg.message.data.is_null()) {
            return Err(ProtocolError::InvalidField {
                field: "message.data",
                reason: "expected an object".into(),
            });
        }
        Ok(msg)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Outbound message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessageType {
    /// A connection was accepted (`isLocal` tells the recipient whether it is them)
    Connect,
    /// A connection went away
    Disconnect,
    /// Periodic batch of other clients' updates
    PointerPositions,
    /// Event-driven update of a single client
    State,
    /// Full roster, sent once on connect
    Users,
    /// Reply to `PING`
    Pong,
}

/// A server → client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub msg_type: ServerMessageType,
    pub message: Value,
}

/// One event as relayed to other clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub name: String,
    pub timestamp: i64,
    pub data: Value,
}

impl From<&BufferedEvent> for EventRecord {
    fn from(event: &BufferedEvent) -> Self {
        Self {
            name: event.name.clone(),
            timestamp: event.timestamp,
            data: event.data.clone(),
        }
    }
}

/// Per-client entry of a `POINTER_POSITIONS` / `STATE` batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityUpdate {
    pub id: ConnectionId,
    pub is_local: bool,
    pub position: Option<Position>,
    pub events: Vec<EventRecord>,
}

impl From<&ClientUpdate> for EntityUpdate {
    fn from(update: &ClientUpdate) -> Self {
        Self {
            id: update.id,
            is_local: false,
            position: update.position,
            events: update.events.iter().map(EventRecord::from).collect(),
        }
    }
}

/// Roster entry of a `USERS` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub id: ConnectionId,
    pub is_local: bool,
    pub position: Option<Position>,
}

impl ServerMessage {
    pub fn connect(id: ConnectionId, is_local: bool) -> Self {
        Self {
            msg_type: ServerMessageType::Connect,
            message: json!({ "id": id, "isLocal": is_local }),
        }
    }

    pub fn disconnect(id: ConnectionId) -> Self {
        Self {
            msg_type: ServerMessageType::Disconnect,
            message: json!({ "id": id }),
        }
    }

    /// Batched updates for one recipient. The caller has already removed the
    /// recipient's own update.
    pub fn pointer_positions(updates: &[&ClientUpdate]) -> Self {
        Self::batch(ServerMessageType::PointerPositions, updates)
    }

    pub fn state(updates: &[&ClientUpdate]) -> Self {
        Self::batch(ServerMessageType::State, updates)
    }

    fn batch(msg_type: ServerMessageType, updates: &[&ClientUpdate]) -> Self {
        let entities: Vec<EntityUpdate> = updates.iter().map(|u| EntityUpdate::from(*u)).collect();
        Self {
            msg_type,
            message: json!({ "entities": entities }),
        }
    }

    /// Roster as seen by `local`.
    pub fn users(roster: &[(ConnectionId, Option<Position>)], local: ConnectionId) -> Self {
        let users: Vec<RosterEntry> = roster
            .iter()
            .map(|(id, position)| RosterEntry {
                id: *id,
                is_local: *id == local,
                position: *position,
            })
            .collect();
        Self {
            msg_type: ServerMessageType::Users,
            message: json!({ "users": users }),
        }
    }

    pub fn pong(timestamp: i64) -> Self {
        Self {
            msg_type: ServerMessageType::Pong,
            message: json!({ "timestamp": timestamp }),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Entities of a `POINTER_POSITIONS` / `STATE` message.
    pub fn entities(&self) -> Result<Vec<EntityUpdate>, ProtocolError> {
        match self.msg_type {
            ServerMessageType::PointerPositions | ServerMessageType::State => {}
            _ => return Err(ProtocolError::InvalidMessageType),
        }
        let entities = self
            .message
            .get("entities")
            .cloned()
            .ok_or(ProtocolError::MissingField("entities"))?;
        serde_json::from_value(entities).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("binary frames are not supported")]
    UnsupportedFrame,
    #[error("invalid message type")]
    InvalidMessageType,
    #[error("serialization error: {0}")]
    Serialization(String),
}
