//! Push-channel message classification.
//!
//! The devices publish telemetry and events on topics we do not control, so
//! classification goes by content shape plus the retained flag, never by
//! topic. Anything that fits neither shape is `Unclassified` and dropped by
//! the gateway.

use serde_json::{Map, Value};

/// What a push-channel publish turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageClass {
    /// Retained device-info snapshot.
    Telemetry(Map<String, Value>),
    /// Discrete device event.
    Event(String),
    Unclassified,
}

/// Classify a decoded publish.
///
/// Telemetry is retained and carries the device-info shape (an `ip4` or
/// `startUrl` field); an event is non-retained and carries an `event`
/// field.
pub fn classify(retained: bool, payload: &[u8]) -> MessageClass {
    let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(payload) else {
        return MessageClass::Unclassified;
    };

    if retained && (map.contains_key("ip4") || map.contains_key("startUrl")) {
        return MessageClass::Telemetry(map);
    }

    if !retained {
        if let Some(Value::String(event)) = map.get("event") {
            return MessageClass::Event(event.clone());
        }
    }

    MessageClass::Unclassified
}

/// Normalize a telemetry map for the store: strings, booleans and numbers
/// pass through, objects and arrays become JSON text, nulls are skipped.
pub fn normalize_telemetry(map: Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in map {
        match value {
            Value::String(_) | Value::Bool(_) | Value::Number(_) => {
                out.insert(key, value);
            }
            Value::Object(_) | Value::Array(_) => {
                match serde_json::to_string(&value) {
                    Ok(text) => {
                        out.insert(key, Value::String(text));
                    }
                    Err(err) => {
                        tracing::warn!(field = %key, %err, "could not stringify telemetry value");
                    }
                }
            }
            Value::Null => {
                tracing::debug!(field = %key, "null telemetry value skipped");
            }
        }
    }
    out
}
