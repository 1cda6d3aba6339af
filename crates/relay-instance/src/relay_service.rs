use std::sync::{Arc, Mutex};

use relay_channels::{ChannelConfig, ChannelKind, ChannelRequest, ChannelTransports, FanoutReport};
use relay_events::EventKind;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use crate::connection_state::ConnectionSnapshot;
use crate::credentials::{credential_hash, generate_token, normalize_token, token_fingerprint};
use crate::error::{InstanceError, InstanceResult};
use crate::instance_record::{InstanceCredential, InstanceRecord, InstanceSummary};
use crate::instance_registry::InstanceRegistry;
use crate::instance_repository::{InstanceRepository, InstanceSettings};
use crate::runtime_config::RelayRuntimeConfig;
use crate::session_engine::{QrArtifact, SessionEngineFactory};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CredentialRefresh {
    pub instance_name: String,
    pub token: String,
    pub hash: String,
}

/// Owns the registry and the injected collaborators, and exposes every
/// instance operation the request layer calls.
pub struct RelayService {
    pub(crate) config: RelayRuntimeConfig,
    pub(crate) registry: InstanceRegistry,
    pub(crate) repository: Arc<dyn InstanceRepository>,
    pub(crate) engines: Arc<dyn SessionEngineFactory>,
    pub(crate) transports: ChannelTransports,
    credential_lock: Mutex<()>,
}

impl RelayService {
    pub fn new(
        config: RelayRuntimeConfig,
        repository: Arc<dyn InstanceRepository>,
        engines: Arc<dyn SessionEngineFactory>,
        transports: ChannelTransports,
    ) -> Self {
        Self {
            config,
            registry: InstanceRegistry::new(),
            repository,
            engines,
            transports,
            credential_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &RelayRuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    /// Serializes token uniqueness checks with the writes that claim a token.
    pub(crate) fn lock_credentials(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.credential_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn require(&self, instance_name: &str) -> InstanceResult<Arc<InstanceRecord>> {
        self.registry
            .get(instance_name)
            .ok_or_else(|| InstanceError::NotFound(instance_name.to_string()))
    }

    /// Writes the record's full config blob in one repository call.
    ///
    /// A record that has left the registry is never written back.
    pub(crate) async fn persist(&self, record: &InstanceRecord) -> InstanceResult<()> {
        let _guard = record.lock_persist().await;
        if !self.registry.is_current(record) {
            return Err(InstanceError::NotFound(record.name().to_string()));
        }
        let blob = record.to_config_blob();
        self.repository
            .put(record.name(), &blob)
            .await
            .map_err(InstanceError::Repository)
    }

    pub async fn connect(
        &self,
        instance_name: &str,
        number: Option<&str>,
    ) -> InstanceResult<ConnectionSnapshot> {
        let record = self.require(instance_name)?;
        let number = number.or(record.identity().number.as_deref());
        record.connection().connect(number).await
    }

    /// Releases the live session and reconnects it.
    pub async fn restart(&self, instance_name: &str) -> InstanceResult<ConnectionSnapshot> {
        let record = self.require(instance_name)?;
        record
            .connection()
            .reload(record.identity().number.as_deref())
            .await
    }

    pub fn fetch_state(&self, instance_name: &str) -> InstanceResult<ConnectionSnapshot> {
        Ok(self.require(instance_name)?.connection().snapshot())
    }

    /// Lists registered instances, optionally narrowed to one name.
    pub fn fetch_all(&self, name_filter: Option<&str>) -> Vec<InstanceSummary> {
        self.registry
            .list_all()
            .iter()
            .filter(|record| name_filter.map_or(true, |name| record.name() == name))
            .map(|record| record.summary())
            .collect()
    }

    pub async fn request_qr(&self, instance_name: &str) -> InstanceResult<QrArtifact> {
        self.require(instance_name)?.connection().request_qr().await
    }

    /// Applies one channel configuration to a live instance. Failures surface to the caller.
    pub async fn configure_channel(
        &self,
        instance_name: &str,
        request: &ChannelRequest,
    ) -> InstanceResult<ChannelConfig> {
        let record = self.require(instance_name)?;
        let config = request.resolve()?;
        let applied = record.configure_channel(config)?;
        self.persist(&record).await?;
        info!(
            instance = %instance_name,
            channel = applied.kind().as_str(),
            enabled = applied.enabled,
            events = applied.events.len(),
            "channel configured"
        );
        Ok(applied)
    }

    pub fn find_channel(
        &self,
        instance_name: &str,
        kind: ChannelKind,
    ) -> InstanceResult<Option<ChannelConfig>> {
        Ok(self.require(instance_name)?.fanout().config(kind))
    }

    pub async fn update_settings(
        &self,
        instance_name: &str,
        settings: InstanceSettings,
    ) -> InstanceResult<InstanceSettings> {
        let record = self.require(instance_name)?;
        record.replace_settings(settings);
        self.persist(&record).await?;
        Ok(record.settings())
    }

    /// Entry point for session-engine events; refreshes the instance's idle clock.
    pub fn emit_event(
        &self,
        instance_name: &str,
        event: EventKind,
        data: Value,
    ) -> InstanceResult<FanoutReport> {
        Ok(self.require(instance_name)?.emit(event, data))
    }

    /// Issues a new token for an instance and announces it with `NEW_JWT_TOKEN`.
    pub async fn refresh_credential(
        &self,
        instance_name: &str,
        new_token: Option<&str>,
    ) -> InstanceResult<CredentialRefresh> {
        let record = self.require(instance_name)?;
        let token = normalize_token(new_token).unwrap_or_else(generate_token);
        let credential = InstanceCredential {
            hash: credential_hash(record.id(), &token),
            token_fingerprint: token_fingerprint(&token),
        };
        let previous = {
            let _credentials = self.lock_credentials();
            if self
                .registry
                .token_in_use(&credential.token_fingerprint, Some(record.name()))
            {
                return Err(InstanceError::DuplicateToken);
            }
            record.replace_credential(credential.clone())
        };
        if let Err(error) = self.persist(&record).await {
            record.replace_credential(previous);
            return Err(error);
        }
        record.emit(
            EventKind::NewJwtToken,
            json!({
                "instance": record.name(),
                "hash": credential.hash,
            }),
        );
        info!(instance = %instance_name, "instance credential refreshed");
        Ok(CredentialRefresh {
            instance_name: record.name().to_string(),
            token,
            hash: credential.hash,
        })
    }
}

impl std::fmt::Debug for RelayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayService")
            .field("config", &self.config)
            .field("instances", &self.registry.len())
            .finish()
    }
}
