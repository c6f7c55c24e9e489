//! Registry of live connections.
//!
//! Each accepted socket gets a [`PeerHandle`]: the sending half of a bounded
//! outbound queue. The connection task owns the receiving half and writes to
//! the socket, so anything holding a handle can send without touching I/O.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;

use crate::protocol::ConnectionId;

/// One encoded outbound message.
pub type Frame = Arc<str>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,
    #[error("outbound queue full")]
    Full,
}

/// Sending side of a connection.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    addr: SocketAddr,
    tx: mpsc::Sender<Frame>,
}

impl PeerHandle {
    /// Create a handle and the receiver the connection task drains.
    pub fn channel(addr: SocketAddr, capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { addr, tx }, rx)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queue a frame without waiting.
    pub fn send(&self, frame: Frame) -> Result<(), SendError> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether both handles feed the same connection.
    pub fn same_connection(&self, other: &PeerHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, PeerHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a connection under a freshly generated id.
    pub async fn register(&self, handle: PeerHandle) -> ConnectionId {
        let mut connections = self.connections.write().await;
        let mut id = ConnectionId::generate();
        while connections.contains_key(&id) {
            id = ConnectionId::generate();
        }
        connections.insert(id, handle);
        id
    }

    /// Remove a connection. Unknown ids are ignored.
    pub async fn unregister(&self, id: &ConnectionId) -> Option<PeerHandle> {
        let removed = self.connections.write().await.remove(id);
        if removed.is_none() {
            log::debug!("Unregister of unknown connection {id}");
        }
        removed
    }

    /// Snapshot of live connections, optionally leaving one out.
    pub async fn list_connections(
        &self,
        excluding: Option<ConnectionId>,
    ) -> Vec<(ConnectionId, PeerHandle)> {
        self.connections
            .read()
            .await
            .iter()
            .filter(|(id, _)| Some(**id) != excluding)
            .map(|(id, handle)| (*id, handle.clone()))
            .collect()
    }

    /// Id of the connection behind `handle`; `None` once it is gone.
    pub async fn resolve_id(&self, handle: &PeerHandle) -> Option<ConnectionId> {
        self.connections
            .read()
            .await
            .iter()
            .find(|(_, h)| h.same_connection(handle))
            .map(|(id, _)| *id)
    }

    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}
