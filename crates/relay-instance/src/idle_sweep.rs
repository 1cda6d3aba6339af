use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use relay_core::{current_unix_timestamp_ms, idle_for_ms, is_idle_beyond};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::connection_state::ConnectionState;
use crate::relay_service::RelayService;

/// Handle to the background idle sweep. Dropping it leaves the task running;
/// call [`IdleSweepHandle::shutdown`] to stop it.
#[derive(Debug)]
pub struct IdleSweepHandle {
    enabled: bool,
    interval: Duration,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl IdleSweepHandle {
    fn disabled(interval: Duration) -> Self {
        Self {
            enabled: false,
            interval,
            shutdown_tx: None,
            task: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl RelayService {
    /// Tears down every instance idle past the configured timeout.
    ///
    /// Open sessions and instances still being provisioned are never evicted.
    /// Returns the names removed in this pass.
    pub async fn evict_idle(&self, now_ms: u64) -> Vec<String> {
        let Some(timeout) = self.config.idle_timeout else {
            return Vec::new();
        };
        let threshold_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let mut evicted = Vec::new();
        for record in self.registry.list_all() {
            if record.is_provisioning()
                || record.connection().current_state() == ConnectionState::Open
                || !is_idle_beyond(record.last_touched_ms(), now_ms, threshold_ms)
            {
                continue;
            }
            info!(
                instance = record.name(),
                idle_ms = idle_for_ms(record.last_touched_ms(), now_ms),
                threshold_ms,
                "evicting idle instance"
            );
            match self.teardown(&record, "idle_timeout").await {
                Ok(report) => evicted.push(report.instance_name),
                Err(error) => debug!(
                    instance = record.name(),
                    reason_code = error.reason_code(),
                    "idle instance kept; session opened before eviction"
                ),
            }
        }
        evicted
    }

    /// Starts the periodic idle sweep. Without an idle timeout the handle is inert.
    pub fn start_idle_sweep(self: &Arc<Self>) -> Result<IdleSweepHandle> {
        let interval = self.config.idle_sweep_interval;
        if interval.is_zero() {
            anyhow::bail!("idle sweep interval must be greater than zero");
        }
        if self.config.idle_timeout.is_none() {
            debug!("idle sweep disabled; no idle timeout configured");
            return Ok(IdleSweepHandle::disabled(interval));
        }
        let handle = tokio::runtime::Handle::try_current()
            .context("idle sweep requires an active Tokio runtime")?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let service = Arc::clone(self);
        let task = handle.spawn(async move {
            run_idle_sweep_loop(service, interval, shutdown_rx).await;
        });
        Ok(IdleSweepHandle {
            enabled: true,
            interval,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

async fn run_idle_sweep_loop(
    service: Arc<RelayService>,
    interval: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so a fresh service is not swept.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = service.evict_idle(current_unix_timestamp_ms()).await;
                if !evicted.is_empty() {
                    info!(evicted = evicted.len(), "idle sweep removed instances");
                }
            }
            _ = &mut shutdown_rx => {
                debug!("idle sweep stopped");
                break;
            }
        }
    }
}
