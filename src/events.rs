//! Observability event stream
//!
//! Rooms and forwarders emit append-only JSON records describing state
//! transitions and periodic stream statistics. The sink is a capability
//! injected at construction; nothing in the media plane depends on what the
//! sink does with the records.

use serde_json::Value;

/// Sink for append-only JSON observability records
pub trait EventSink: Send + Sync {
    /// Record one event. `data` is the event payload; implementations own
    /// delivery (file, collector, ...) and must not block the caller.
    fn log(&self, event: &str, data: Value);
}

/// Default sink that drops every record
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn log(&self, _event: &str, _data: Value) {}
}

/// Wrap an event payload with its name and a wall-clock stamp
pub(crate) fn stamped(event: &str, mut data: Value) -> Value {
    if let Value::Object(map) = &mut data {
        map.insert("event".to_string(), Value::from(event));
        map.insert(
            "ts_ms".to_string(),
            Value::from(chrono::Utc::now().timestamp_millis()),
        );
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stamped_adds_event_and_timestamp() {
        let v = stamped("join", json!({"room_id": "r1"}));
        assert_eq!(v["event"], "join");
        assert_eq!(v["room_id"], "r1");
        assert!(v["ts_ms"].as_i64().unwrap() > 0);
    }
}
