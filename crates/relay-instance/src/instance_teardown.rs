use std::sync::Arc;

use relay_channels::ChannelKind;
use relay_events::EventKind;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::connection_state::ConnectionSnapshot;
use crate::error::InstanceResult;
use crate::instance_record::InstanceRecord;
use crate::relay_service::RelayService;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ReleaseFailure {
    pub channel: ChannelKind,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
/// Outcome of removing one instance. Cleanup failures are listed, never raised.
pub struct TeardownReport {
    pub instance_name: String,
    pub instance_id: String,
    pub reason: String,
    pub release_failures: Vec<ReleaseFailure>,
}

impl RelayService {
    /// Ends the session of a connecting or open instance; the instance stays registered.
    pub async fn logout(&self, instance_name: &str) -> InstanceResult<ConnectionSnapshot> {
        let record = self.require(instance_name)?;
        let snapshot = record.connection().logout().await?;
        info!(instance = %instance_name, "instance logged out");
        Ok(snapshot)
    }

    /// Removes an instance that is not connected.
    pub async fn delete_instance(&self, instance_name: &str) -> InstanceResult<TeardownReport> {
        let record = self.require(instance_name)?;
        self.teardown(&record, "delete_requested").await
    }

    /// Best-effort removal: releases sink resources, announces `INSTANCE_DELETE`,
    /// unregisters, and drains the channel queues.
    ///
    /// Fails with `StateError`, changing nothing, when the session is open.
    pub(crate) async fn teardown(
        &self,
        record: &Arc<InstanceRecord>,
        reason: &str,
    ) -> InstanceResult<TeardownReport> {
        record.connection().retire().await?;

        let mut release_failures = Vec::new();
        let queue_failures = record.fanout().release_where(ChannelKind::is_queue).await;
        let crm_failures = record
            .fanout()
            .release_where(|kind| kind == ChannelKind::Chatwoot)
            .await;
        for (channel, error) in queue_failures.into_iter().chain(crm_failures) {
            release_failures.push(ReleaseFailure {
                channel,
                detail: format!("{error:#}"),
            });
        }

        record.emit(
            EventKind::InstanceDelete,
            json!({
                "instance_name": record.name(),
                "instance_id": record.id(),
                "reason": reason,
            }),
        );
        {
            // The name stays claimed until the stored config is gone.
            let _persist = record.lock_persist().await;
            if let Err(error) = self.repository.delete(record.name()).await {
                warn!(
                    instance = record.name(),
                    error = %format!("{error:#}"),
                    "failed to delete persisted instance config"
                );
            }
            self.registry.unregister_record(record);
        }
        record.fanout().close().await;

        info!(
            instance = record.name(),
            reason,
            release_failures = release_failures.len(),
            "instance removed"
        );
        Ok(TeardownReport {
            instance_name: record.name().to_string(),
            instance_id: record.id().to_string(),
            reason: reason.to_string(),
            release_failures,
        })
    }

    /// Drains every instance's channel queues. Registrations are dropped.
    pub async fn shutdown(&self) {
        for record in self.registry.list_all() {
            self.registry.unregister_record(&record);
            record.fanout().close().await;
        }
        info!("relay service stopped");
    }
}
