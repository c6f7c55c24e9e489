//! WebSocket presence server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── ConnectionRegistry (id → PeerHandle)
//!            ├── connection task ────┤
//! Client B ──┘   (one per socket)    └── PresenceStore (id → ClientState)
//!                                               │
//!                                     BroadcastScheduler (tick)
//!                                               │
//!                          ┌────────────────────┼────────────────────┐
//!                          ▼                    ▼                    ▼
//!                       Client A             Client B             Client C
//! ```
//!
//! Each connection task selects over the socket and its outbound queue.
//! Tasks never talk to each other directly; they share the store and the
//! registry.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::config::PresenceConfig;
use crate::protocol::{ConnectionId, InboundMessage, ProtocolError, ServerMessage, PING};
use crate::registry::{ConnectionRegistry, Frame, PeerHandle};
use crate::scheduler::{BroadcastMode, BroadcastScheduler, BroadcastStats};
use crate::store::{PresenceStore, RecordOutcome};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub rejected_events: u64,
    pub protocol_errors: u64,
}

/// State shared by every connection task.
#[derive(Clone)]
struct Shared {
    config: Arc<PresenceConfig>,
    store: Arc<PresenceStore>,
    registry: Arc<ConnectionRegistry>,
    scheduler: Arc<BroadcastScheduler>,
    stats: Arc<RwLock<ServerStats>>,
}

/// The presence server. Owns the single store and registry of the process.
pub struct PresenceServer {
    shared: Shared,
}

impl PresenceServer {
    pub fn new(config: PresenceConfig) -> Self {
        let store = Arc::new(PresenceStore::new(config.window_size_ms));
        let registry = Arc::new(ConnectionRegistry::new());
        let scheduler = Arc::new(BroadcastScheduler::new(
            store.clone(),
            registry.clone(),
            config.tick_interval(),
        ));

        Self {
            shared: Shared {
                config: Arc::new(config),
                store,
                registry,
                scheduler,
                stats: Arc::new(RwLock::new(ServerStats::default())),
            },
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(PresenceConfig::default())
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = &self.shared.config.bind_addr;
        TcpListener::bind(addr).await.map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })
    }

    /// Bind and serve until the process exits.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener, std::future::pending()).await
    }

    /// Accept connections on `listener` until `shutdown` resolves.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let config = &self.shared.config;
        match listener.local_addr() {
            Ok(addr) => log::info!("Presence server listening on {addr}"),
            Err(_) => log::info!("Presence server listening on {}", config.bind_addr),
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let ticker = match config.broadcast_mode {
            BroadcastMode::Tick => Some(self.shared.scheduler.clone().spawn(stop_rx)),
            BroadcastMode::Immediate => None,
        };

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            log::warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = &mut shutdown => {
                    log::info!("Presence server shutting down");
                    break;
                }
            }
        }

        let _ = stop_tx.send(true);
        if let Some(ticker) = ticker {
            ticker.await?;
        }
        Ok(())
    }

    /// Handle a single WebSocket connection from handshake to cleanup.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Shared,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;

        let (handle, outbound_rx) = PeerHandle::channel(addr, shared.config.outbound_capacity);
        let id = shared.registry.register(handle.clone()).await;
        if let Err(e) = shared.store.add_client(id, shared.store.fresh_state(id)).await {
            log::warn!("{e}; keeping existing state");
        }
        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        log::info!("Client {id} connected from {addr}");

        // The session runs in its own task so a panic in it still reaches the
        // cleanup below.
        let session = tokio::spawn(Self::session(
            ws_stream,
            id,
            handle,
            outbound_rx,
            shared.clone(),
        ));
        let result = match session.await {
            Ok(result) => result,
            Err(e) => {
                log::error!("Session task for {id} aborted: {e}");
                Err(ServerError::Task(e))
            }
        };

        // Cleanup runs however the session ended.
        shared.registry.unregister(&id).await;
        shared.store.remove_client(&id).await;
        shared
            .scheduler
            .notify(&ServerMessage::disconnect(id), None)
            .await;
        {
            let mut s = shared.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Client {id} disconnected");

        result
    }

    async fn session(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        id: ConnectionId,
        handle: PeerHandle,
        mut outbound_rx: tokio::sync::mpsc::Receiver<Frame>,
        shared: Shared,
    ) -> Result<(), ServerError> {
        let shared = &shared;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // Greeting goes straight to the socket, ahead of anything queued.
        let connect = ServerMessage::connect(id, true).encode()?;
        ws_sender.send(Message::text(connect)).await?;
        let roster = shared.store.roster().await;
        let users = ServerMessage::users(&roster, id).encode()?;
        ws_sender.send(Message::text(users)).await?;

        shared
            .scheduler
            .notify(&ServerMessage::connect(id, false), Some(id))
            .await;

        let mut violations: u32 = 0;
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            shared.stats.write().await.total_messages += 1;
                            let handled =
                                Self::handle_text(id, text.as_str(), &handle, shared).await;
                            if let Err(e) = handled {
                                if Self::note_violation(id, e, &mut violations, shared).await {
                                    let _ = ws_sender.send(Message::Close(None)).await;
                                    break;
                                }
                            }
                        }

                        Some(Ok(Message::Binary(_))) => {
                            let e = ProtocolError::UnsupportedFrame;
                            if Self::note_violation(id, e, &mut violations, shared).await {
                                let _ = ws_sender.send(Message::Close(None)).await;
                                break;
                            }
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Connection closed by {id}");
                            break;
                        }

                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {id}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                frame = outbound_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            ws_sender.send(Message::text(frame.to_string())).await?;
                        }
                        None => break,
                    }
                }
            }
        }

        Ok(())
    }

    /// Count a protocol error. Returns true once the connection should be closed.
    async fn note_violation(
        id: ConnectionId,
        error: ProtocolError,
        violations: &mut u32,
        shared: &Shared,
    ) -> bool {
        *violations += 1;
        shared.stats.write().await.protocol_errors += 1;
        log::warn!("Protocol error from {id} ({violations}): {error}");

        let limit = shared.config.max_protocol_violations;
        if limit > 0 && *violations >= limit {
            log::warn!("Closing {id}: too many protocol errors");
            return true;
        }
        false
    }

    /// Decode one text frame and record it.
    async fn handle_text(
        id: ConnectionId,
        text: &str,
        handle: &PeerHandle,
        shared: &Shared,
    ) -> Result<(), ProtocolError> {
        let inbound = InboundMessage::decode(text)?;

        if inbound.name == PING {
            let pong = ServerMessage::pong(inbound.message.timestamp).encode()?;
            if let Err(e) = handle.send(Frame::from(pong)) {
                log::warn!("PONG to {id} failed: {e}");
            }
            return Ok(());
        }

        let transient = shared.config.is_transient(&inbound.name);
        let outcome = shared
            .store
            .record_event(&id, &inbound.name, inbound.message, transient)
            .await;

        match outcome {
            RecordOutcome::Accepted | RecordOutcome::Replaced => {
                if shared.config.broadcast_mode == BroadcastMode::Immediate {
                    shared.scheduler.publish_client(&id).await;
                }
            }
            RecordOutcome::Rejected { .. } => {
                shared.stats.write().await.rejected_events += 1;
            }
            RecordOutcome::UnknownClient => {}
        }
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.shared.scheduler.stats()
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &Arc<PresenceStore> {
        &self.shared.store
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.shared.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_server_creation() {
        let server = PresenceServer::with_defaults();
        assert_eq!(server.config().bind_addr, "127.0.0.1:9090");
        assert_eq!(server.store().window_size_ms(), 500);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = PresenceServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.rejected_events, 0);
        assert_eq!(stats.protocol_errors, 0);
        assert_eq!(server.broadcast_stats().ticks, 0);
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = PresenceServer::new(PresenceConfig {
            bind_addr: taken.local_addr().unwrap().to_string(),
            ..PresenceConfig::default()
        });
        assert!(matches!(server.bind().await, Err(ServerError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let server = PresenceServer::new(PresenceConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..PresenceConfig::default()
        });
        let listener = server.bind().await.unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            server.serve(listener, tokio::time::sleep(Duration::from_millis(120))),
        )
        .await
        .unwrap();

        assert!(result.is_ok());
        assert!(server.broadcast_stats().ticks >= 1);
    }
}
