use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event_catalog::EventKind;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One event as handed to a channel transport.
pub struct EventEnvelope {
    pub event: EventKind,
    pub instance_name: String,
    pub instance_id: String,
    pub date_time_ms: u64,
    #[serde(default)]
    pub data: Value,
}

impl EventEnvelope {
    pub fn new(
        event: EventKind,
        instance_name: impl Into<String>,
        instance_id: impl Into<String>,
        date_time_ms: u64,
        data: Value,
    ) -> Self {
        Self {
            event,
            instance_name: instance_name.into(),
            instance_id: instance_id.into(),
            date_time_ms,
            data,
        }
    }

    /// Wire body posted to HTTP sinks: the event under its delivery name.
    pub fn to_delivery_body(&self, destination: Option<&str>) -> Value {
        let mut body = serde_json::json!({
            "event": self.event.delivery_name(),
            "instance": self.instance_name,
            "instance_id": self.instance_id,
            "date_time_ms": self.date_time_ms,
            "data": self.data,
        });
        if let (Some(destination), Value::Object(map)) = (destination, &mut body) {
            map.insert(
                "destination".to_string(),
                Value::String(destination.to_string()),
            );
        }
        body
    }
}
