use std::sync::atomic::{AtomicU64, Ordering};

use relay_channels::{ChannelFanout, FanoutReport};
use relay_core::current_unix_timestamp_ms;
use relay_events::{EventEnvelope, EventKind};
use serde_json::Value;

/// Single emission path for one instance: stamps envelopes, fans them out and
/// refreshes the idle clock.
pub struct InstanceEvents {
    instance_name: String,
    instance_id: String,
    fanout: ChannelFanout,
    last_touched_ms: AtomicU64,
}

impl InstanceEvents {
    pub fn new(instance_name: &str, instance_id: &str, fanout: ChannelFanout) -> Self {
        Self {
            instance_name: instance_name.to_string(),
            instance_id: instance_id.to_string(),
            fanout,
            last_touched_ms: AtomicU64::new(current_unix_timestamp_ms()),
        }
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn fanout(&self) -> &ChannelFanout {
        &self.fanout
    }

    pub fn emit(&self, event: EventKind, data: Value) -> FanoutReport {
        let now_ms = current_unix_timestamp_ms();
        self.touch_at(now_ms);
        let envelope = EventEnvelope::new(
            event,
            self.instance_name.as_str(),
            self.instance_id.as_str(),
            now_ms,
            data,
        );
        self.fanout.emit(&envelope)
    }

    fn touch_at(&self, now_ms: u64) {
        self.last_touched_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    pub fn last_touched_ms(&self) -> u64 {
        self.last_touched_ms.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for InstanceEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceEvents")
            .field("instance_name", &self.instance_name)
            .field("instance_id", &self.instance_id)
            .field("last_touched_ms", &self.last_touched_ms())
            .finish()
    }
}
