use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use relay_events::{EventEnvelope, EventKind};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel_config::{ChannelConfig, ChannelConfigError, ChannelDestination, ChannelKind};

pub const DEFAULT_CHANNEL_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
/// One event bound to the destination it was enqueued for.
pub struct ChannelDelivery {
    pub kind: ChannelKind,
    pub destination: ChannelDestination,
    pub envelope: EventEnvelope,
}

/// Delivery seam implemented by the concrete sink clients (HTTP, socket, broker, CRM, bot).
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn send(&self, delivery: &ChannelDelivery) -> Result<()>;

    /// Releases per-instance resources held by the sink (queues, caches).
    async fn release(&self, instance_name: &str) -> Result<()> {
        let _ = instance_name;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Result of handing one event to one adapter.
pub enum DispatchOutcome {
    Enqueued,
    Skipped,
    Dropped,
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

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One configured channel of one instance: cached config, bounded queue and delivery worker.
pub struct ChannelAdapter {
    kind: ChannelKind,
    instance_name: String,
    config: RwLock<ChannelConfig>,
    transport: Arc<dyn ChannelTransport>,
    queue: Mutex<Option<mpsc::Sender<ChannelDelivery>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ChannelAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelAdapter")
            .field("kind", &self.kind)
            .field("instance_name", &self.instance_name)
            .field("config", &*read_or_recover(&self.config))
            .finish_non_exhaustive()
    }
}

impl ChannelAdapter {
    /// Validates `config` and starts the delivery worker. Must run inside a Tokio runtime.
    pub fn spawn(
        instance_name: &str,
        config: ChannelConfig,
        transport: Arc<dyn ChannelTransport>,
        queue_capacity: usize,
    ) -> Result<Self, ChannelConfigError> {
        config.validate()?;
        let kind = config.kind();
        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity.max(1));
        let worker = tokio::spawn(run_channel_worker(
            kind,
            instance_name.to_string(),
            Arc::clone(&transport),
            queue_rx,
        ));
        Ok(Self {
            kind,
            instance_name: instance_name.to_string(),
            config: RwLock::new(config),
            transport,
            queue: Mutex::new(Some(queue_tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn config(&self) -> ChannelConfig {
        read_or_recover(&self.config).clone()
    }

    /// Replaces the cached config after validation; a rejected config leaves the old one in place.
    pub fn configure(&self, config: ChannelConfig) -> Result<(), ChannelConfigError> {
        if config.kind() != self.kind {
            return Err(ChannelConfigError::KindMismatch {
                expected: self.kind,
                actual: config.kind(),
            });
        }
        config.validate()?;
        *write_or_recover(&self.config) = config;
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        read_or_recover(&self.config).enabled
    }

    pub fn subscribes(&self, event: EventKind) -> bool {
        read_or_recover(&self.config).subscribes(event)
    }

    /// Enqueues `envelope` when enabled and subscribed. Never waits on the sink.
    pub fn dispatch(&self, envelope: &EventEnvelope) -> DispatchOutcome {
        let destination = {
            let config = read_or_recover(&self.config);
            if !config.subscribes(envelope.event) {
                return DispatchOutcome::Skipped;
            }
            config.destination.clone()
        };
        let delivery = ChannelDelivery {
            kind: self.kind,
            destination,
            envelope: envelope.clone(),
        };
        let queue = lock_or_recover(&self.queue);
        let Some(queue_tx) = queue.as_ref() else {
            return DispatchOutcome::Dropped;
        };
        match queue_tx.try_send(delivery) {
            Ok(()) => DispatchOutcome::Enqueued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    instance = %self.instance_name,
                    channel = self.kind.as_str(),
                    event = envelope.event.as_str(),
                    reason_code = "channel_queue_full",
                    "dropping event for saturated channel"
                );
                DispatchOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => DispatchOutcome::Dropped,
        }
    }

    pub async fn release(&self) -> Result<()> {
        self.transport.release(&self.instance_name).await
    }

    /// Stops accepting events and waits for the worker to drain what was already queued.
    pub async fn close(&self) {
        drop(lock_or_recover(&self.queue).take());
        let worker = lock_or_recover(&self.worker).take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

async fn run_channel_worker(
    kind: ChannelKind,
    instance_name: String,
    transport: Arc<dyn ChannelTransport>,
    mut queue_rx: mpsc::Receiver<ChannelDelivery>,
) {
    while let Some(delivery) = queue_rx.recv().await {
        match transport.send(&delivery).await {
            Ok(()) => debug!(
                instance = %instance_name,
                channel = kind.as_str(),
                event = delivery.envelope.event.as_str(),
                "channel delivery sent"
            ),
            Err(error) => warn!(
                instance = %instance_name,
                channel = kind.as_str(),
                event = delivery.envelope.event.as_str(),
                error = %format!("{error:#}"),
                "channel delivery failed"
            ),
        }
    }
    debug!(instance = %instance_name, channel = kind.as_str(), "channel worker stopped");
}
