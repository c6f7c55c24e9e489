//! Shared presence state: `ConnectionId → ClientState`.
//!
//! One mutex guards the whole map. It is held only for map access and
//! bounded buffer work, never across a network send.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::Mutex;

use crate::buffer::{BufferedEvent, EventBuffer, PushOutcome};
use crate::protocol::{ConnectionId, EventMessage, Position, POINTER_OUT, POINTER_POSITION};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("client {0} is already present")]
    DuplicateClient(ConnectionId),
}

/// Presence state of one connected client.
#[derive(Debug, Clone)]
pub struct ClientState {
    pub id: ConnectionId,
    /// Last resolved pointer position; `None` until the first position event.
    pub current_position: Option<Position>,
    pub buffer: EventBuffer,
}

impl ClientState {
    pub fn new(id: ConnectionId, window_size_ms: u64) -> Self {
        Self {
            id,
            current_position: None,
            buffer: EventBuffer::new(window_size_ms),
        }
    }

    /// Drain the buffer and fold the events into the current position.
    ///
    /// Returns `None` when nothing was pending.
    pub fn take_update(&mut self) -> Option<ClientUpdate> {
        let events = self.buffer.drain();
        if events.is_empty() {
            return None;
        }

        for event in &events {
            match event.name.as_str() {
                POINTER_POSITION => match Position::from_data(&event.data) {
                    Some(position) => self.current_position = Some(position),
                    None => log::debug!("Client {}: {} without x/y", self.id, event.event_id),
                },
                POINTER_OUT => self.current_position = None,
                _ => {}
            }
        }

        Some(ClientUpdate {
            id: self.id,
            position: self.current_position,
            events,
        })
    }
}

/// What one client reported since the last drain.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientUpdate {
    pub id: ConnectionId,
    pub position: Option<Position>,
    pub events: Vec<BufferedEvent>,
}

/// Result of [`PresenceStore::record_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Accepted,
    Replaced,
    /// Older than the client's watermark; dropped.
    Rejected { lag_ms: i64 },
    /// The client is gone (disconnect race); nothing recorded.
    UnknownClient,
}

impl RecordOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, RecordOutcome::Accepted | RecordOutcome::Replaced)
    }
}

#[derive(Debug)]
pub struct PresenceStore {
    clients: Mutex<HashMap<ConnectionId, ClientState>>,
    window_size_ms: u64,
}

impl PresenceStore {
    pub fn new(window_size_ms: u64) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            window_size_ms,
        }
    }

    /// Empty state for `id`, using this store's window.
    pub fn fresh_state(&self, id: ConnectionId) -> ClientState {
        ClientState::new(id, self.window_size_ms)
    }

    pub async fn add_client(&self, id: ConnectionId, state: ClientState) -> Result<(), StoreError> {
        let mut clients = self.clients.lock().await;
        if clients.contains_key(&id) {
            return Err(StoreError::DuplicateClient(id));
        }
        clients.insert(id, state);
        Ok(())
    }

    pub async fn get_client(&self, id: &ConnectionId) -> Option<ClientState> {
        self.clients.lock().await.get(id).cloned()
    }

    /// Buffer an event for `id`. A vanished client is a no-op.
    pub async fn record_event(
        &self,
        id: &ConnectionId,
        name: &str,
        message: EventMessage,
        transient: bool,
    ) -> RecordOutcome {
        let mut clients = self.clients.lock().await;
        let Some(client) = clients.get_mut(id) else {
            log::debug!("Dropping {name} for unknown client {id}");
            return RecordOutcome::UnknownClient;
        };

        let event = BufferedEvent::new(name, message.timestamp, transient, message.data);
        match client.buffer.push(event) {
            PushOutcome::Inserted { evicted } => {
                if evicted > 0 {
                    log::trace!("Client {id}: evicted {evicted} stale events");
                }
                RecordOutcome::Accepted
            }
            PushOutcome::Replaced { .. } => RecordOutcome::Replaced,
            PushOutcome::Rejected { lag_ms } => {
                if !transient {
                    log::warn!("Client {id}: out-of-order {name} dropped ({lag_ms} ms behind)");
                }
                RecordOutcome::Rejected { lag_ms }
            }
        }
    }

    pub async fn remove_client(&self, id: &ConnectionId) -> Option<ClientState> {
        self.clients.lock().await.remove(id)
    }

    /// Consistent copy of every client's state.
    pub async fn snapshot(&self) -> HashMap<ConnectionId, ClientState> {
        self.clients.lock().await.clone()
    }

    /// Drain every buffer; idle clients produce nothing.
    pub async fn drain_updates(&self) -> Vec<ClientUpdate> {
        let mut clients = self.clients.lock().await;
        clients
            .values_mut()
            .filter_map(ClientState::take_update)
            .collect()
    }

    /// Drain a single client's buffer.
    pub async fn drain_client(&self, id: &ConnectionId) -> Option<ClientUpdate> {
        self.clients.lock().await.get_mut(id)?.take_update()
    }

    /// `(id, position)` for every client.
    pub async fn roster(&self) -> Vec<(ConnectionId, Option<Position>)> {
        self.clients
            .lock()
            .await
            .values()
            .map(|c| (c.id, c.current_position))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }

    pub fn window_size_ms(&self) -> u64 {
        self.window_size_ms
    }
}
