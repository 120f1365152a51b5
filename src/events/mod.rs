//! Usage events and the batches the engine hands back for publishing.
use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

mod client;
mod pipeline;

pub use client::{EventApiClient, EventsApi};
pub use pipeline::EventQueueManager;

/// Wire names of the engine-generated aggregate event kinds. Caller-tracked
/// events use free-form type names instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    VariableEvaluated,
    AggVariableEvaluated,
    VariableDefaulted,
    AggVariableDefaulted,
    CustomEvent,
}

impl EventType {
    /// The name this kind travels under.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::VariableEvaluated => "variableEvaluated",
            EventType::AggVariableEvaluated => "aggVariableEvaluated",
            EventType::VariableDefaulted => "variableDefaulted",
            EventType::AggVariableDefaulted => "aggVariableDefaulted",
            EventType::CustomEvent => "customEvent",
        }
    }
}

/// A usage event.
///
/// Explicit events carry a caller-chosen `event_type`; aggregate events use
/// the [`EventType`] names and are generated and coalesced inside the
/// engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    /// What the event is about, e.g. the variable key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Seconds since the Unix epoch.
    pub date: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub meta_data: HashMap<String, serde_json::Value>,
}

impl Event {
    /// An event of the given type, stamped with the current time.
    pub fn new(event_type: impl Into<String>) -> Event {
        Event {
            event_type: event_type.into(),
            target: None,
            date: Utc::now().timestamp(),
            value: None,
            meta_data: HashMap::new(),
        }
    }

    /// Set the event target.
    pub fn with_target(mut self, target: impl Into<String>) -> Event {
        self.target = Some(target.into());
        self
    }

    /// Set the numeric value.
    pub fn with_value(mut self, value: f64) -> Event {
        self.value = Some(value);
        self
    }

    /// Attach a metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Event {
        self.meta_data.insert(key.into(), value);
        self
    }

    pub(crate) fn aggregate(event_type: EventType, target: &str) -> Event {
        Event::new(event_type.as_str())
            .with_target(target)
            .with_value(1.0)
    }
}

/// One user's batch of events inside a flush payload. The contents are
/// produced (and fully populated) by the engine; the host publishes them
/// verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEventsBatchRecord {
    pub user: serde_json::Value,
    pub events: Vec<serde_json::Value>,
}

/// A batch of buffered events handed from the engine to the host for
/// publishing.
///
/// Minted by the engine when the queue is flushed, identified by an opaque
/// id, and consumed exactly once: published, then acknowledged by id as a
/// success or failure. Never mutated by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushPayload {
    pub payload_id: String,
    #[serde(default)]
    pub event_count: u64,
    #[serde(default)]
    pub records: Vec<UserEventsBatchRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_event_serializes_with_wire_names() {
        let event = Event::new("add-to-cart")
            .with_target("sku-123")
            .with_value(2.0)
            .with_meta("cart", serde_json::json!({"size": 3}));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "add-to-cart");
        assert_eq!(json["target"], "sku-123");
        assert_eq!(json["value"], 2.0);
        assert_eq!(json["metaData"]["cart"]["size"], 3);
        assert!(json["date"].as_i64().unwrap() > 0);
    }

    #[test]
    fn aggregate_event_omits_empty_metadata() {
        let event = Event::aggregate(EventType::AggVariableDefaulted, "show-banner");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "aggVariableDefaulted");
        assert_eq!(json["target"], "show-banner");
        assert_eq!(json["value"], 1.0);
        assert!(json.get("metaData").is_none());
    }

    #[test]
    fn flush_payloads_decode_from_engine_json() {
        let payloads: Vec<FlushPayload> = serde_json::from_str(
            r#"[{
                "payloadId": "payload-1",
                "eventCount": 2,
                "records": [{
                    "user": {"user_id": "u-1", "platform": "Rust"},
                    "events": [
                        {"type": "aggVariableEvaluated", "target": "show-banner"},
                        {"type": "customEvent", "target": "sku-123"}
                    ]
                }]
            }]"#,
        )
        .unwrap();

        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].payload_id, "payload-1");
        assert_eq!(payloads[0].event_count, 2);
        assert_eq!(payloads[0].records[0].events.len(), 2);
    }
}
