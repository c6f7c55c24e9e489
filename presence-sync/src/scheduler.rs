//! Fan-out of client updates to N-1 connections.
//!
//! ```text
//!            tick (every tick_interval)
//!                    │
//!     PresenceStore::drain_updates()        ── idle clients yield nothing
//!                    │
//!      ConnectionRegistry::list_connections()
//!                    │
//!           BroadcastSet::compute()         ── drop each recipient's own update
//!                    │
//!     ┌──────────────┼──────────────┐
//!     ▼              ▼              ▼
//!  PeerHandle     PeerHandle     PeerHandle  ── failures counted, never fatal
//! ```
//!
//! Sends are non-blocking queue pushes and happen after every lock has
//! been released.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::ConfigError;
use crate::protocol::{ConnectionId, ServerMessage, ServerMessageType};
use crate::registry::{ConnectionRegistry, Frame, PeerHandle};
use crate::store::{ClientUpdate, PresenceStore};

/// When client updates are pushed to other connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BroadcastMode {
    /// Periodic sweep batching everything received since the last tick.
    #[default]
    Tick,
    /// Publish each accepted event right away.
    Immediate,
}

impl FromStr for BroadcastMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tick" | "periodic" => Ok(Self::Tick),
            "immediate" | "event" => Ok(Self::Immediate),
            other => Err(ConfigError::UnknownVariant {
                key: "broadcast_mode",
                value: other.to_owned(),
            }),
        }
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub ticks: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
}

/// Lock-free counters behind [`BroadcastStats`].
#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    ticks: AtomicU64,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn record(&self, report: FanOutReport) {
        self.messages_sent
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.messages_dropped
            .fetch_add(report.failed as u64, Ordering::Relaxed);
    }
}

/// One recipient and the updates it should see.
#[derive(Debug)]
pub struct Delivery<'a> {
    pub recipient: ConnectionId,
    pub handle: PeerHandle,
    pub updates: Vec<&'a ClientUpdate>,
}

/// Per-cycle recipient list. Never contains a recipient's own update and
/// never contains an empty batch.
#[derive(Debug)]
pub struct BroadcastSet<'a> {
    deliveries: Vec<Delivery<'a>>,
}

impl<'a> BroadcastSet<'a> {
    pub fn compute(
        updates: &'a [ClientUpdate],
        recipients: Vec<(ConnectionId, PeerHandle)>,
    ) -> Self {
        let deliveries = recipients
            .into_iter()
            .filter_map(|(recipient, handle)| {
                let relevant: Vec<&ClientUpdate> =
                    updates.iter().filter(|u| u.id != recipient).collect();
                if relevant.is_empty() {
                    return None;
                }
                Some(Delivery {
                    recipient,
                    handle,
                    updates: relevant,
                })
            })
            .collect();
        Self { deliveries }
    }

    pub fn deliveries(&self) -> &[Delivery<'a>] {
        &self.deliveries
    }

    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    /// Send one batch per recipient. A failing recipient does not stop the rest.
    pub fn deliver(self, msg_type: ServerMessageType) -> FanOutReport {
        let mut report = FanOutReport::default();
        for delivery in self.deliveries {
            let message = match msg_type {
                ServerMessageType::State => ServerMessage::state(&delivery.updates),
                _ => ServerMessage::pointer_positions(&delivery.updates),
            };
            let frame = match message.encode() {
                Ok(text) => Frame::from(text),
                Err(e) => {
                    log::error!("Failed to encode batch for {}: {e}", delivery.recipient);
                    report.failed += 1;
                    continue;
                }
            };
            match delivery.handle.send(frame) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    log::warn!(
                        "Send to {} ({}) failed: {e}",
                        delivery.recipient,
                        delivery.handle.addr()
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }
}

/// Drains the presence store and redistributes updates.
pub struct BroadcastScheduler {
    store: Arc<PresenceStore>,
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    stats: AtomicBroadcastStats,
}

impl BroadcastScheduler {
    pub fn new(
        store: Arc<PresenceStore>,
        registry: Arc<ConnectionRegistry>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            interval,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// One sweep: drain every buffer and send each connection the others' updates.
    pub async fn tick(&self) -> FanOutReport {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        let updates = self.store.drain_updates().await;
        if updates.is_empty() {
            return FanOutReport::default();
        }

        let recipients = self.registry.list_connections(None).await;
        let set = BroadcastSet::compute(&updates, recipients);
        let report = set.deliver(ServerMessageType::PointerPositions);
        self.stats.record(report);

        log::trace!(
            "Tick: {} updates, {} delivered, {} failed",
            updates.len(),
            report.delivered,
            report.failed
        );
        report
    }

    /// Event-driven path: push one client's pending events to everyone else.
    pub async fn publish_client(&self, id: &ConnectionId) -> FanOutReport {
        let Some(update) = self.store.drain_client(id).await else {
            return FanOutReport::default();
        };

        let updates = [update];
        let recipients = self.registry.list_connections(Some(*id)).await;
        let report = BroadcastSet::compute(&updates, recipients).deliver(ServerMessageType::State);
        self.stats.record(report);
        report
    }

    /// Best-effort notice to every connection except `excluding`.
    pub async fn notify(
        &self,
        message: &ServerMessage,
        excluding: Option<ConnectionId>,
    ) -> FanOutReport {
        let frame = match message.encode() {
            Ok(text) => Frame::from(text),
            Err(e) => {
                log::error!("Failed to encode {:?} notice: {e}", message.msg_type);
                return FanOutReport::default();
            }
        };

        let mut report = FanOutReport::default();
        for (id, handle) in self.registry.list_connections(excluding).await {
            match handle.send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    log::warn!("{:?} notice to {id} failed: {e}", message.msg_type);
                    report.failed += 1;
                }
            }
        }
        self.stats.record(report);
        report
    }

    /// Run [`tick`](Self::tick) every interval until `shutdown` turns true
    /// or its sender is dropped.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            log::info!("Broadcast scheduler started ({:?} interval)", self.interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            log::info!("Broadcast scheduler stopped");
        })
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            ticks: self.stats.ticks.load(Ordering::Relaxed),
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EntityUpdate, EventMessage, Position, POINTER_POSITION};
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Harness {
        store: Arc<PresenceStore>,
        registry: Arc<ConnectionRegistry>,
        scheduler: Arc<BroadcastScheduler>,
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(PresenceStore::new(1_000));
            let registry = Arc::new(ConnectionRegistry::new());
            let scheduler = Arc::new(BroadcastScheduler::new(
                store.clone(),
                registry.clone(),
                Duration::from_millis(10),
            ));
            Self { store, registry, scheduler }
        }

        async fn connect(&self) -> (ConnectionId, mpsc::Receiver<Frame>) {
            let (handle, rx) = PeerHandle::channel("127.0.0.1:5000".parse().unwrap(), 8);
            let id = self.registry.register(handle).await;
            self.store.add_client(id, self.store.fresh_state(id)).await.unwrap();
            (id, rx)
        }

        async fn move_pointer(&self, id: &ConnectionId, ts: i64, x: f64) {
            let msg = EventMessage::new(ts, json!({ "x": x, "y": 0.0 }));
            self.store.record_event(id, POINTER_POSITION, msg, true).await;
        }
    }

    fn entities(rx: &mut mpsc::Receiver<Frame>) -> Vec<EntityUpdate> {
        let frame = rx.try_recv().expect("expected a frame");
        ServerMessage::decode(&frame).unwrap().entities().unwrap()
    }

    #[tokio::test]
    async fn test_self_exclusion() {
        let h = Harness::new();
        let mut clients = Vec::new();
        for i in 0..3 {
            let (id, rx) = h.connect().await;
            h.move_pointer(&id, 10, i as f64).await;
            clients.push((id, rx));
        }

        let report = h.scheduler.tick().await;
        assert_eq!(report, FanOutReport { delivered: 3, failed: 0 });

        for (id, rx) in clients.iter_mut() {
            let batch = entities(rx);
            assert_eq!(batch.len(), 2);
            assert!(batch.iter().all(|e| e.id != *id));
            assert!(rx.try_recv().is_err(), "one batch per tick");
        }
    }

    #[tokio::test]
    async fn test_isolation_under_failure() {
        let h = Harness::new();
        let (a, mut rx_a) = h.connect().await;
        let (b, rx_b) = h.connect().await;
        let (c, mut rx_c) = h.connect().await;
        for id in [a, b, c] {
            h.move_pointer(&id, 5, 1.0).await;
        }

        // b's socket task is gone but it has not been unregistered yet.
        drop(rx_b);

        let report = h.scheduler.tick().await;
        assert_eq!(report, FanOutReport { delivered: 2, failed: 1 });

        assert_eq!(entities(&mut rx_a).len(), 2);
        assert_eq!(entities(&mut rx_c).len(), 2);

        let stats = h.scheduler.stats();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_dropped, 1);
    }

    #[tokio::test]
    async fn test_idle_tick_sends_nothing() {
        let h = Harness::new();
        let (_a, mut rx_a) = h.connect().await;
        let (_b, mut rx_b) = h.connect().await;

        assert_eq!(h.scheduler.tick().await, FanOutReport::default());
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
        assert_eq!(h.scheduler.stats().ticks, 1);
    }

    #[tokio::test]
    async fn test_sole_reporter_gets_nothing() {
        let h = Harness::new();
        let (a, mut rx_a) = h.connect().await;
        let (_b, mut rx_b) = h.connect().await;
        h.move_pointer(&a, 1, 7.0).await;

        let report = h.scheduler.tick().await;
        assert_eq!(report.delivered, 1);
        assert!(rx_a.try_recv().is_err());

        let batch = entities(&mut rx_b);
        assert_eq!(batch[0].id, a);
        assert_eq!(batch[0].position, Some(Position::new(7.0, 0.0)));
    }

    #[tokio::test]
    async fn test_drained_events_not_resent() {
        let h = Harness::new();
        let (a, _rx_a) = h.connect().await;
        let (_b, mut rx_b) = h.connect().await;
        h.move_pointer(&a, 1, 1.0).await;

        h.scheduler.tick().await;
        h.scheduler.tick().await;

        assert_eq!(entities(&mut rx_b).len(), 1);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_client_sends_state() {
        let h = Harness::new();
        let (a, mut rx_a) = h.connect().await;
        let (_b, mut rx_b) = h.connect().await;
        h.move_pointer(&a, 1, 2.0).await;

        let report = h.scheduler.publish_client(&a).await;
        assert_eq!(report.delivered, 1);
        assert!(rx_a.try_recv().is_err());

        let frame = rx_b.try_recv().unwrap();
        let msg = ServerMessage::decode(&frame).unwrap();
        assert_eq!(msg.msg_type, ServerMessageType::State);
        assert_eq!(msg.entities().unwrap()[0].id, a);

        assert_eq!(h.scheduler.publish_client(&a).await, FanOutReport::default());
    }

    #[tokio::test]
    async fn test_notify_excluding() {
        let h = Harness::new();
        let (a, mut rx_a) = h.connect().await;
        let (_b, mut rx_b) = h.connect().await;

        let report = h.scheduler.notify(&ServerMessage::connect(a, false), Some(a)).await;
        assert_eq!(report.delivered, 1);
        assert!(rx_a.try_recv().is_err());

        let msg = ServerMessage::decode(&rx_b.try_recv().unwrap()).unwrap();
        assert_eq!(msg.msg_type, ServerMessageType::Connect);
    }

    #[tokio::test]
    async fn test_disconnect_cleanup() {
        let h = Harness::new();
        let (x, _rx_x) = h.connect().await;
        let (_y, mut rx_y) = h.connect().await;

        h.registry.unregister(&x).await;
        h.store.remove_client(&x).await;

        let outcome = h
            .store
            .record_event(&x, POINTER_POSITION, EventMessage::new(1, json!({})), true)
            .await;
        assert!(!outcome.is_accepted());
        assert!(h.registry.list_connections(None).await.iter().all(|(id, _)| *id != x));

        h.scheduler.tick().await;
        assert!(rx_y.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_set_skips_empty_batches() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        let (ha, _ra) = PeerHandle::channel("127.0.0.1:1".parse().unwrap(), 1);
        let (hb, _rb) = PeerHandle::channel("127.0.0.1:2".parse().unwrap(), 1);
        let updates = vec![ClientUpdate {
            id: a,
            position: None,
            events: Vec::new(),
        }];

        let set = BroadcastSet::compute(&updates, vec![(a, ha), (b, hb)]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.deliveries()[0].recipient, b);
    }

    #[tokio::test]
    async fn test_spawn_ticks_until_shutdown() {
        let h = Harness::new();
        let (a, _rx_a) = h.connect().await;
        let (_b, mut rx_b) = h.connect().await;
        h.move_pointer(&a, 1, 1.0).await;

        let (tx, rx) = watch::channel(false);
        let task = h.scheduler.clone().spawn(rx);

        let frame = tokio::time::timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            ServerMessage::decode(&frame).unwrap().msg_type,
            ServerMessageType::PointerPositions
        );

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(h.scheduler.stats().ticks >= 1);
    }

    #[test]
    fn test_broadcast_mode_from_str() {
        assert_eq!("tick".parse::<BroadcastMode>().unwrap(), BroadcastMode::Tick);
        assert_eq!("Immediate".parse::<BroadcastMode>().unwrap(), BroadcastMode::Immediate);
        assert!("later".parse::<BroadcastMode>().is_err());
    }
}
