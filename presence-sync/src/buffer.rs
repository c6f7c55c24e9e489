//! Per-client, time-windowed event buffer.
//!
//! Events are kept in arrival order. A monotonic watermark (highest accepted
//! timestamp) rejects anything older, so the buffer never reorders. Transient
//! events (pointer motion) expire once they fall more than `window_size_ms`
//! behind the watermark; non-transient events stay until drained or popped.
//!
//! ```text
//! watermark = 400, window = 250  →  threshold = 150
//!
//!  [t=0 T] [t=100 T] [t=120 N] [t=200 T] [t=300 T] [t=400 T]
//!   evict    evict     keep      stop ─────────────────────▶ kept
//! ```
//!
//! Because older timestamps are rejected and an [`EventId`] can only repeat
//! at the watermark, entries are always in non-decreasing timestamp order.
//! The eviction pass therefore stops at the first transient entry that is
//! still inside the window. It runs lazily on every push; there is no timer.

use std::fmt;

use indexmap::IndexMap;
use serde_json::Value;

/// Identity of a buffered event: `(name, timestamp)`.
///
/// A second event with the same name and timestamp replaces the first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventId {
    name: String,
    timestamp: i64,
}

impl EventId {
    pub fn new(name: impl Into<String>, timestamp: i64) -> Self {
        Self {
            name: name.into(),
            timestamp,
        }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.timestamp)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferedEvent {
    pub name: String,
    pub event_id: EventId,
    /// Client clock in milliseconds.
    pub timestamp: i64,
    /// Subject to window expiry.
    pub transient: bool,
    pub data: Value,
}

impl BufferedEvent {
    pub fn new(name: impl Into<String>, timestamp: i64, transient: bool, data: Value) -> Self {
        let name = name.into();
        Self {
            event_id: EventId::new(name.clone(), timestamp),
            name,
            timestamp,
            transient,
            data,
        }
    }
}

/// Result of [`EventBuffer::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Appended at the end.
    Inserted { evicted: usize },
    /// Overwrote an entry with the same [`EventId`] in its original slot.
    Replaced { evicted: usize },
    /// Older than the watermark; the buffer is unchanged.
    Rejected { lag_ms: i64 },
}

impl PushOutcome {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, PushOutcome::Rejected { .. })
    }
}

#[derive(Debug, Clone)]
pub struct EventBuffer {
    window_size_ms: i64,
    events: IndexMap<EventId, BufferedEvent>,
    /// Highest timestamp ever accepted. Survives `drain`.
    max_timestamp: Option<i64>,
}

impl EventBuffer {
    pub fn new(window_size_ms: u64) -> Self {
        Self {
            window_size_ms: i64::try_from(window_size_ms).unwrap_or(i64::MAX),
            events: IndexMap::new(),
            max_timestamp: None,
        }
    }

    /// Buffer an event, then evict expired transient entries.
    pub fn push(&mut self, event: BufferedEvent) -> PushOutcome {
        if let Some(max) = self.max_timestamp {
            if event.timestamp < max {
                let lag_ms = max.saturating_sub(event.timestamp);
                log::debug!("Event {} rejected: lags behind by {lag_ms} ms", event.event_id);
                return PushOutcome::Rejected { lag_ms };
            }
        }

        let timestamp = event.timestamp;
        let replaced = self.events.insert(event.event_id.clone(), event).is_some();
        self.max_timestamp = Some(self.max_timestamp.map_or(timestamp, |max| max.max(timestamp)));

        let evicted = self.evict_expired();
        if replaced {
            PushOutcome::Replaced { evicted }
        } else {
            PushOutcome::Inserted { evicted }
        }
    }

    /// Remove and return a specific entry.
    pub fn pop(&mut self, event_id: &EventId) -> Option<BufferedEvent> {
        self.events.shift_remove(event_id)
    }

    /// Remove and return every entry in arrival order.
    pub fn drain(&mut self) -> Vec<BufferedEvent> {
        self.events.drain(..).map(|(_, event)| event).collect()
    }

    /// Entries with the given name, oldest first. Non-destructive.
    pub fn query_by_name(&self, name: &str) -> Vec<BufferedEvent> {
        self.events
            .values()
            .filter(|event| event.name == name)
            .cloned()
            .collect()
    }

    pub fn latest_by_name(&self, name: &str) -> Option<&BufferedEvent> {
        self.events.values().rev().find(|event| event.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferedEvent> {
        self.events.values()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn max_timestamp(&self) -> Option<i64> {
        self.max_timestamp
    }

    pub fn window_size_ms(&self) -> i64 {
        self.window_size_ms
    }

    fn evict_expired(&mut self) -> usize {
        let Some(max) = self.max_timestamp else {
            return 0;
        };
        let threshold = max.saturating_sub(self.window_size_ms);
        let before = self.events.len();

        let mut stopped = false;
        self.events.retain(|_, event| {
            if stopped || !event.transient {
                return true;
            }
            if event.timestamp >= threshold {
                stopped = true;
                return true;
            }
            false
        });

        before - self.events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transient(name: &str, ts: i64) -> BufferedEvent {
        BufferedEvent::new(name, ts, true, json!({ "ts": ts }))
    }

    fn durable(name: &str, ts: i64) -> BufferedEvent {
        BufferedEvent::new(name, ts, false, Value::Null)
    }

    fn timestamps(buffer: &EventBuffer) -> Vec<i64> {
        buffer.iter().map(|e| e.timestamp).collect()
    }

    #[test]
    fn test_monotonic_rejection() {
        let mut buffer = EventBuffer::new(1_000);

        assert!(buffer.push(transient("MOVE", 100)).is_accepted());
        assert_eq!(
            buffer.push(transient("MOVE", 90)),
            PushOutcome::Rejected { lag_ms: 10 }
        );

        assert_eq!(timestamps(&buffer), vec![100]);
        assert_eq!(buffer.max_timestamp(), Some(100));
    }

    #[test]
    fn test_rejection_applies_to_non_transient() {
        let mut buffer = EventBuffer::new(1_000);
        buffer.push(transient("MOVE", 500));
        assert!(!buffer.push(durable("CLICK", 499)).is_accepted());
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_extreme_timestamps() {
        let mut buffer = EventBuffer::new(500);
        assert!(buffer.push(transient("MOVE", i64::MAX)).is_accepted());
        assert_eq!(
            buffer.push(transient("MOVE", i64::MIN)),
            PushOutcome::Rejected { lag_ms: i64::MAX }
        );
        assert_eq!(
            buffer.push(durable("CLICK", -1)),
            PushOutcome::Rejected { lag_ms: i64::MAX }
        );
        assert_eq!(timestamps(&buffer), vec![i64::MAX]);

        let mut buffer = EventBuffer::new(u64::MAX);
        buffer.push(transient("MOVE", i64::MIN));
        assert_eq!(
            buffer.push(transient("MOVE", i64::MAX)),
            PushOutcome::Inserted { evicted: 1 }
        );
        assert_eq!(timestamps(&buffer), vec![i64::MAX]);
    }

    #[test]
    fn test_equal_timestamp_accepted() {
        let mut buffer = EventBuffer::new(1_000);
        buffer.push(transient("MOVE", 100));
        assert_eq!(
            buffer.push(durable("CLICK", 100)),
            PushOutcome::Inserted { evicted: 0 }
        );
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_window_eviction() {
        let mut buffer = EventBuffer::new(250);
        for ts in [0, 100, 200, 300, 400] {
            buffer.push(transient("MOVE", ts));
        }

        // threshold = 400 - 250 = 150
        assert_eq!(timestamps(&buffer), vec![200, 300, 400]);
        assert!(buffer.iter().all(|e| e.timestamp >= 150));
    }

    #[test]
    fn test_eviction_reports_count() {
        let mut buffer = EventBuffer::new(50);
        buffer.push(transient("MOVE", 0));
        buffer.push(transient("MOVE", 10));
        assert_eq!(
            buffer.push(transient("MOVE", 100)),
            PushOutcome::Inserted { evicted: 2 }
        );
    }

    #[test]
    fn test_non_transient_never_evicted() {
        let mut buffer = EventBuffer::new(250);
        buffer.push(durable("CLICK", 0));
        buffer.push(transient("MOVE", 50));
        buffer.push(durable("POINTER_OUT", 60));
        buffer.push(transient("MOVE", 10_000));

        assert_eq!(timestamps(&buffer), vec![0, 60, 10_000]);
        assert!(buffer.iter().filter(|e| !e.transient).count() == 2);
    }

    #[test]
    fn test_eviction_skips_non_transient_entries() {
        let mut buffer = EventBuffer::new(100);
        buffer.push(transient("HOVER", 0));
        buffer.push(durable("CLICK", 10));
        buffer.push(transient("MOVE", 20));
        buffer.push(transient("MOVE", 60));
        buffer.push(transient("MOVE", 150));

        // threshold = 50: 0 and 20 go, CLICK is stepped over, scan stops at 60.
        assert_eq!(timestamps(&buffer), vec![10, 60, 150]);
    }

    #[test]
    fn test_entries_stay_timestamp_ordered() {
        let mut buffer = EventBuffer::new(10_000);
        for (name, ts) in [("A", 5), ("B", 5), ("A", 3), ("C", 9), ("A", 5), ("B", 9), ("C", 8)] {
            buffer.push(transient(name, ts));
        }

        let ts = timestamps(&buffer);
        assert_eq!(ts, vec![5, 5, 9, 9]);
        assert!(ts.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_duplicate_event_replaced_in_place() {
        let mut buffer = EventBuffer::new(1_000);
        buffer.push(BufferedEvent::new("MOVE", 10, true, json!({ "x": 1 })));
        buffer.push(durable("CLICK", 20));
        // Same (name, timestamp) as the watermark: accepted and replaces.
        buffer.push(BufferedEvent::new("CLICK", 20, false, json!({ "button": 2 })));

        assert_eq!(buffer.len(), 2);
        let names: Vec<&str> = buffer.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["MOVE", "CLICK"]);
        assert_eq!(buffer.iter().last().unwrap().data, json!({ "button": 2 }));
    }

    #[test]
    fn test_replace_keeps_original_slot() {
        let mut buffer = EventBuffer::new(1_000);
        buffer.push(transient("A", 10));
        buffer.push(transient("B", 10));
        let outcome = buffer.push(BufferedEvent::new("A", 10, true, json!({ "v": 2 })));

        assert_eq!(outcome, PushOutcome::Replaced { evicted: 0 });
        let first = buffer.iter().next().unwrap();
        assert_eq!(first.name, "A");
        assert_eq!(first.data, json!({ "v": 2 }));
    }

    #[test]
    fn test_pop() {
        let mut buffer = EventBuffer::new(1_000);
        buffer.push(transient("MOVE", 1));
        buffer.push(durable("CLICK", 2));

        let popped = buffer.pop(&EventId::new("CLICK", 2)).unwrap();
        assert_eq!(popped.name, "CLICK");
        assert!(buffer.pop(&EventId::new("CLICK", 2)).is_none());
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_drain_idempotent() {
        let mut buffer = EventBuffer::new(1_000);
        buffer.push(transient("MOVE", 1));
        buffer.push(durable("CLICK", 2));
        buffer.push(transient("MOVE", 3));

        let first = buffer.drain();
        let second = buffer.drain();

        assert_eq!(first.iter().map(|e| e.timestamp).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(second.is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_watermark_survives_drain() {
        let mut buffer = EventBuffer::new(1_000);
        buffer.push(transient("MOVE", 100));
        buffer.drain();

        assert!(!buffer.push(transient("MOVE", 50)).is_accepted());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_query_by_name() {
        let mut buffer = EventBuffer::new(1_000);
        buffer.push(transient("MOVE", 1));
        buffer.push(durable("CLICK", 2));
        buffer.push(transient("MOVE", 3));

        let moves = buffer.query_by_name("MOVE");
        assert_eq!(moves.len(), 2);
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.latest_by_name("MOVE").unwrap().timestamp, 3);
        assert!(buffer.query_by_name("SCROLL").is_empty());
    }
}
