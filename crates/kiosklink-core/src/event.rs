//! Bridge events.
//!
//! Everything that happens on either transport is normalized into a
//! [`BridgeEvent`] before the orchestrator sees it. Consumers never learn
//! whether a value arrived over the push channel or the poll channel.

use serde::{Deserialize, Serialize};

/// A normalized event flowing through the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BridgeEvent {
    /// A device published (or a poll returned) a full telemetry snapshot.
    Telemetry {
        device_key: String,
        values: serde_json::Map<String, serde_json::Value>,
        timestamp: i64,
    },
    /// A discrete event from a device, e.g. `screenOn`.
    DeviceEvent {
        device_key: String,
        event: String,
        timestamp: i64,
    },
    /// The liveness verdict for one device changed.
    AliveChanged {
        device_key: String,
        alive: bool,
        timestamp: i64,
    },
    /// The fleet-wide "all enabled devices alive" signal changed.
    FleetHealthChanged { all_alive: bool, timestamp: i64 },
}

impl BridgeEvent {
    pub fn telemetry(
        device_key: impl Into<String>,
        values: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self::Telemetry {
            device_key: device_key.into(),
            values,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn device_event(device_key: impl Into<String>, event: impl Into<String>) -> Self {
        Self::DeviceEvent {
            device_key: device_key.into(),
            event: event.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn alive_changed(device_key: impl Into<String>, alive: bool) -> Self {
        Self::AliveChanged {
            device_key: device_key.into(),
            alive,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn fleet_health_changed(all_alive: bool) -> Self {
        Self::FleetHealthChanged {
            all_alive,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// The device this event concerns, if it concerns a single device.
    pub fn device_key(&self) -> Option<&str> {
        match self {
            Self::Telemetry { device_key, .. }
            | Self::DeviceEvent { device_key, .. }
            | Self::AliveChanged { device_key, .. } => Some(device_key),
            Self::FleetHealthChanged { .. } => None,
        }
    }
}

/// Metadata attached to every published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event id.
    pub id: uuid::Uuid,
    /// Component that published the event ("gateway", "poll", "liveness", ...).
    pub source: String,
    /// Publication timestamp (unix millis).
    pub timestamp: i64,
}

impl EventMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            source: source.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}
