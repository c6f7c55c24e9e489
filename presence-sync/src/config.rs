//! Server configuration: defaults, environment overrides, validation.
//!
//! | Variable | Field |
//! |----------|-------|
//! | `PRESENCE_BIND_ADDR` | `bind_addr` |
//! | `PRESENCE_WINDOW_MS` | `window_size_ms` |
//! | `PRESENCE_TICK_MS` | `tick_interval_ms` |
//! | `PRESENCE_BROADCAST_MODE` | `broadcast_mode` (`tick` / `immediate`) |
//! | `PRESENCE_OUTBOUND_CAPACITY` | `outbound_capacity` |
//! | `PRESENCE_MAX_PROTOCOL_VIOLATIONS` | `max_protocol_violations` |
//! | `PRESENCE_TRANSIENT_EVENTS` | `transient_events` (comma separated) |
//!
//! Unparseable values are logged and ignored.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::POINTER_POSITION;
use crate::scheduler::BroadcastMode;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),
    #[error("unknown value `{value}` for `{key}`")]
    UnknownVariant { key: &'static str, value: String },
    #[error("`bind_addr` is empty")]
    EmptyBindAddr,
}

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Retention window for transient events, relative to the newest timestamp
    pub window_size_ms: u64,
    /// Broadcast sweep interval (tick mode)
    pub tick_interval_ms: u64,
    pub broadcast_mode: BroadcastMode,
    /// Frames queued per connection before sends to it start failing
    pub outbound_capacity: usize,
    /// Malformed messages tolerated before the connection is closed (0 = never close)
    pub max_protocol_violations: u32,
    /// Event names subject to window eviction
    pub transient_events: Vec<String>,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            window_size_ms: 500,
            tick_interval_ms: 50,
            broadcast_mode: BroadcastMode::Tick,
            outbound_capacity: 256,
            max_protocol_violations: 3,
            transient_events: vec![POINTER_POSITION.to_string()],
        }
    }
}

impl PresenceConfig {
    /// Defaults overridden by `PRESENCE_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };

        if let Some(addr) = get("PRESENCE_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(value) = parse_override(get("PRESENCE_WINDOW_MS"), "PRESENCE_WINDOW_MS") {
            self.window_size_ms = value;
        }
        if let Some(value) = parse_override(get("PRESENCE_TICK_MS"), "PRESENCE_TICK_MS") {
            self.tick_interval_ms = value;
        }
        if let Some(value) =
            parse_override(get("PRESENCE_BROADCAST_MODE"), "PRESENCE_BROADCAST_MODE")
        {
            self.broadcast_mode = value;
        }
        if let Some(value) =
            parse_override(get("PRESENCE_OUTBOUND_CAPACITY"), "PRESENCE_OUTBOUND_CAPACITY")
        {
            self.outbound_capacity = value;
        }
        if let Some(value) = parse_override(
            get("PRESENCE_MAX_PROTOCOL_VIOLATIONS"),
            "PRESENCE_MAX_PROTOCOL_VIOLATIONS",
        ) {
            self.max_protocol_violations = value;
        }
        if let Some(raw) = get("PRESENCE_TRANSIENT_EVENTS") {
            self.transient_events = raw
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_addr.trim().is_empty() {
            return Err(ConfigError::EmptyBindAddr);
        }
        if self.window_size_ms == 0 {
            return Err(ConfigError::Zero("window_size_ms"));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Zero("tick_interval_ms"));
        }
        if self.outbound_capacity == 0 {
            return Err(ConfigError::Zero("outbound_capacity"));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Whether events with this name may be dropped once stale.
    pub fn is_transient(&self, name: &str) -> bool {
        self.transient_events.iter().any(|n| n == name)
    }
}

fn parse_override<T>(raw: Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = raw?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(err) => {
            log::warn!("invalid {key}={raw:?}, ignoring: {err}");
            None
        }
    }
}
