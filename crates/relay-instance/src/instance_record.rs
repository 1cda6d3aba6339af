use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use relay_channels::{ChannelConfig, ChannelConfigError, ChannelFanout, ChannelKind, FanoutReport};
use relay_events::EventKind;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::connection_state::{ConnectionState, ConnectionStateMachine};
use crate::instance_events::InstanceEvents;
use crate::instance_repository::{
    InstanceConfigBlob, InstanceIdentity, InstanceSettings, INSTANCE_CONFIG_SCHEMA_VERSION,
};
use crate::session_engine::{SessionEngine, SessionIntegration};

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

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InstanceCredential {
    pub hash: String,
    pub token_fingerprint: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
/// Listing view of one registered instance.
pub struct InstanceSummary {
    pub instance_name: String,
    pub instance_id: String,
    pub integration: SessionIntegration,
    pub connection_state: ConnectionState,
    pub enabled_channels: Vec<ChannelKind>,
    pub last_touched_ms: u64,
    pub provisioning: bool,
}

/// Live state of one instance: identity, session, channels and settings.
pub struct InstanceRecord {
    identity: InstanceIdentity,
    events: Arc<InstanceEvents>,
    connection: ConnectionStateMachine,
    settings: RwLock<InstanceSettings>,
    credential: RwLock<InstanceCredential>,
    provisioning: AtomicBool,
    persist_lock: Mutex<()>,
}

impl InstanceRecord {
    pub(crate) fn new(
        identity: InstanceIdentity,
        credential: InstanceCredential,
        fanout: ChannelFanout,
        engine: Arc<dyn SessionEngine>,
    ) -> Self {
        let events = Arc::new(InstanceEvents::new(
            &identity.instance_name,
            &identity.instance_id,
            fanout,
        ));
        let connection = ConnectionStateMachine::new(engine, Arc::clone(&events));
        Self {
            identity,
            events,
            connection,
            settings: RwLock::new(InstanceSettings::default()),
            credential: RwLock::new(credential),
            provisioning: AtomicBool::new(false),
            persist_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.identity.instance_name
    }

    pub fn id(&self) -> &str {
        &self.identity.instance_id
    }

    pub fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    pub fn connection(&self) -> &ConnectionStateMachine {
        &self.connection
    }

    pub fn fanout(&self) -> &ChannelFanout {
        self.events.fanout()
    }

    pub fn emit(&self, event: EventKind, data: Value) -> FanoutReport {
        self.events.emit(event, data)
    }

    pub fn configure_channel(&self, config: ChannelConfig) -> Result<ChannelConfig, ChannelConfigError> {
        self.events.fanout().configure(config)
    }

    pub fn channel_configs(&self) -> BTreeMap<ChannelKind, ChannelConfig> {
        self.events.fanout().configs()
    }

    pub fn settings(&self) -> InstanceSettings {
        read_or_recover(&self.settings).clone()
    }

    /// Replaces all settings in one write.
    pub fn replace_settings(&self, settings: InstanceSettings) {
        *write_or_recover(&self.settings) = settings;
    }

    pub fn credential_hash(&self) -> String {
        read_or_recover(&self.credential).hash.clone()
    }

    pub(crate) fn token_fingerprint(&self) -> String {
        read_or_recover(&self.credential).token_fingerprint.clone()
    }

    pub(crate) fn replace_credential(&self, credential: InstanceCredential) -> InstanceCredential {
        std::mem::replace(&mut *write_or_recover(&self.credential), credential)
    }

    pub fn last_touched_ms(&self) -> u64 {
        self.events.last_touched_ms()
    }

    pub fn is_provisioning(&self) -> bool {
        self.provisioning.load(Ordering::Acquire)
    }

    /// Marks the record as mid-provisioning until the guard drops.
    pub(crate) fn begin_provisioning(self: &Arc<Self>) -> ProvisioningGuard {
        self.provisioning.store(true, Ordering::Release);
        ProvisioningGuard {
            record: Arc::clone(self),
        }
    }

    /// Serializes read-modify-persist sequences on this record.
    pub(crate) async fn lock_persist(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.persist_lock.lock().await
    }

    pub fn to_config_blob(&self) -> InstanceConfigBlob {
        let credential = read_or_recover(&self.credential).clone();
        InstanceConfigBlob {
            schema_version: INSTANCE_CONFIG_SCHEMA_VERSION,
            identity: self.identity.clone(),
            channels: self.channel_configs(),
            settings: self.settings(),
            credential_hash: credential.hash,
            token_fingerprint: credential.token_fingerprint,
        }
    }

    pub fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            instance_name: self.identity.instance_name.clone(),
            instance_id: self.identity.instance_id.clone(),
            integration: self.identity.integration,
            connection_state: self.connection.current_state(),
            enabled_channels: self
                .channel_configs()
                .into_iter()
                .filter(|(_, config)| config.enabled)
                .map(|(kind, _)| kind)
                .collect(),
            last_touched_ms: self.last_touched_ms(),
            provisioning: self.is_provisioning(),
        }
    }
}

impl std::fmt::Debug for InstanceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRecord")
            .field("identity", &self.identity)
            .field("connection", &self.connection)
            .field("provisioning", &self.is_provisioning())
            .finish()
    }
}

pub(crate) struct ProvisioningGuard {
    record: Arc<InstanceRecord>,
}

impl Drop for ProvisioningGuard {
    fn drop(&mut self) {
        self.record.provisioning.store(false, Ordering::Release);
    }
}
