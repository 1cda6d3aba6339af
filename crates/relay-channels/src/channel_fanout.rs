use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use anyhow::bail;
use async_trait::async_trait;
use relay_events::EventEnvelope;
use serde::Serialize;
use tracing::{debug, warn};

use crate::channel_adapter::{
    ChannelAdapter, ChannelDelivery, ChannelTransport, DispatchOutcome,
    DEFAULT_CHANNEL_QUEUE_CAPACITY,
};
use crate::channel_config::{ChannelConfig, ChannelConfigError, ChannelKind};

#[derive(Clone, Default)]
/// Injected sink clients, one per channel kind.
pub struct ChannelTransports {
    transports: BTreeMap<ChannelKind, Arc<dyn ChannelTransport>>,
}

impl ChannelTransports {
    /// Routes every channel kind to the same transport.
    pub fn uniform(transport: Arc<dyn ChannelTransport>) -> Self {
        Self {
            transports: ChannelKind::ALL
                .iter()
                .map(|kind| (*kind, Arc::clone(&transport)))
                .collect(),
        }
    }

    pub fn with_transport(mut self, kind: ChannelKind, transport: Arc<dyn ChannelTransport>) -> Self {
        self.transports.insert(kind, transport);
        self
    }

    pub fn for_kind(&self, kind: ChannelKind) -> Option<Arc<dyn ChannelTransport>> {
        self.transports.get(&kind).cloned()
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
/// Which channels accepted, ignored or dropped one emitted event.
pub struct FanoutReport {
    pub enqueued: Vec<ChannelKind>,
    pub skipped: Vec<ChannelKind>,
    pub dropped: Vec<ChannelKind>,
}

fn read_or_recover<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_or_recover<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The configured adapters of one instance.
pub struct ChannelFanout {
    instance_name: String,
    transports: ChannelTransports,
    queue_capacity: usize,
    adapters: RwLock<BTreeMap<ChannelKind, Arc<ChannelAdapter>>>,
}

impl ChannelFanout {
    pub fn new(instance_name: &str, transports: ChannelTransports, queue_capacity: usize) -> Self {
        Self {
            instance_name: instance_name.to_string(),
            transports,
            queue_capacity: if queue_capacity == 0 {
                DEFAULT_CHANNEL_QUEUE_CAPACITY
            } else {
                queue_capacity
            },
            adapters: RwLock::new(BTreeMap::new()),
        }
    }

    /// Applies `config` to the adapter of its kind, starting one if needed.
    pub fn configure(&self, config: ChannelConfig) -> Result<ChannelConfig, ChannelConfigError> {
        let kind = config.kind();
        let existing = read_or_recover(&self.adapters).get(&kind).cloned();
        if let Some(adapter) = existing {
            adapter.configure(config.clone())?;
            return Ok(config);
        }
        let transport = self.transports.for_kind(kind).unwrap_or_else(|| {
            warn!(
                instance = %self.instance_name,
                channel = kind.as_str(),
                "no transport registered for channel"
            );
            Arc::new(UnroutedTransport) as Arc<dyn ChannelTransport>
        });
        let adapter =
            ChannelAdapter::spawn(&self.instance_name, config.clone(), transport, self.queue_capacity)?;
        let mut adapters = write_or_recover(&self.adapters);
        match adapters.get(&kind) {
            // A concurrent configure won the insert; apply on top of it.
            Some(winner) => winner.configure(config.clone())?,
            None => {
                adapters.insert(kind, Arc::new(adapter));
            }
        }
        Ok(config)
    }

    pub fn config(&self, kind: ChannelKind) -> Option<ChannelConfig> {
        read_or_recover(&self.adapters)
            .get(&kind)
            .map(|adapter| adapter.config())
    }

    pub fn configs(&self) -> BTreeMap<ChannelKind, ChannelConfig> {
        read_or_recover(&self.adapters)
            .iter()
            .map(|(kind, adapter)| (*kind, adapter.config()))
            .collect()
    }

    fn snapshot(&self) -> Vec<Arc<ChannelAdapter>> {
        read_or_recover(&self.adapters).values().cloned().collect()
    }

    /// Offers `envelope` to every adapter. Returns once each subscribed adapter has enqueued.
    pub fn emit(&self, envelope: &EventEnvelope) -> FanoutReport {
        let mut report = FanoutReport::default();
        for adapter in self.snapshot() {
            match adapter.dispatch(envelope) {
                DispatchOutcome::Enqueued => report.enqueued.push(adapter.kind()),
                DispatchOutcome::Skipped => report.skipped.push(adapter.kind()),
                DispatchOutcome::Dropped => report.dropped.push(adapter.kind()),
            }
        }
        debug!(
            instance = %self.instance_name,
            event = envelope.event.as_str(),
            enqueued = report.enqueued.len(),
            skipped = report.skipped.len(),
            dropped = report.dropped.len(),
            "event fan-out issued"
        );
        report
    }

    /// Releases sink resources of the matching adapters; each release is isolated.
    pub async fn release_where<F>(&self, predicate: F) -> Vec<(ChannelKind, anyhow::Error)>
    where
        F: Fn(ChannelKind) -> bool,
    {
        let mut failures = Vec::new();
        for adapter in self.snapshot() {
            if !predicate(adapter.kind()) {
                continue;
            }
            if let Err(error) = adapter.release().await {
                warn!(
                    instance = %self.instance_name,
                    channel = adapter.kind().as_str(),
                    error = %format!("{error:#}"),
                    "channel resource release failed"
                );
                failures.push((adapter.kind(), error));
            }
        }
        failures
    }

    /// Detaches every adapter and waits for their queues to drain.
    pub async fn close(&self) {
        let adapters: Vec<Arc<ChannelAdapter>> = {
            let mut guard = write_or_recover(&self.adapters);
            std::mem::take(&mut *guard).into_values().collect()
        };
        for adapter in adapters {
            adapter.close().await;
        }
    }
}

struct UnroutedTransport;

#[async_trait]
impl ChannelTransport for UnroutedTransport {
    async fn send(&self, delivery: &ChannelDelivery) -> anyhow::Result<()> {
        bail!("no transport registered for channel {}", delivery.kind)
    }
}
