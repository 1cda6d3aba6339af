//! Ordered creation of a new instance.
//!
//! Everything that can be rejected from the request alone (name, integration
//! requirements, CRM-sync strictness, token reuse) is checked before the
//! instance becomes visible. After registration, optional channels are
//! configured independently and the CRM channel is applied last.

use std::collections::BTreeMap;
use std::sync::Arc;

use relay_channels::{
    ChannelConfig, ChannelFanout, ChannelKind, ChannelRequest,
    ChatwootRequest, ToggleRequest, TypebotRequest, WebhookRequest,
};
use relay_core::current_unix_timestamp_ms;
use relay_events::EventKind;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::connection_state::ConnectionState;
use crate::credentials::{credential_hash, generate_token, normalize_token, token_fingerprint};
use crate::error::{InstanceError, InstanceResult};
use crate::instance_record::{InstanceCredential, InstanceRecord};
use crate::instance_repository::{InstanceIdentity, InstanceSettings};
use crate::relay_service::RelayService;
use crate::session_engine::{QrArtifact, SessionIntegration};

const MAX_INSTANCE_NAME_CHARS: usize = 64;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateInstanceRequest {
    pub instance_name: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub integration: SessionIntegration,
    #[serde(default)]
    pub qrcode: bool,
    #[serde(default)]
    pub webhook: Option<WebhookRequest>,
    #[serde(default)]
    pub websocket: Option<ToggleRequest>,
    #[serde(default)]
    pub rabbitmq: Option<ToggleRequest>,
    #[serde(default)]
    pub sqs: Option<ToggleRequest>,
    #[serde(default)]
    pub chatwoot: Option<ChatwootRequest>,
    #[serde(default)]
    pub typebot: Option<TypebotRequest>,
    #[serde(default)]
    pub settings: InstanceSettings,
}

impl CreateInstanceRequest {
    pub fn named(instance_name: &str) -> Self {
        Self {
            instance_name: instance_name.to_string(),
            ..Self::default()
        }
    }

    /// Channels that are configured independently of each other.
    fn optional_channel_requests(&self) -> Vec<ChannelRequest> {
        let mut requests = Vec::new();
        if let Some(webhook) = &self.webhook {
            requests.push(ChannelRequest::Webhook(webhook.clone()));
        }
        if let Some(websocket) = &self.websocket {
            requests.push(ChannelRequest::Websocket(websocket.clone()));
        }
        if let Some(rabbitmq) = &self.rabbitmq {
            requests.push(ChannelRequest::Rabbitmq(rabbitmq.clone()));
        }
        if let Some(sqs) = &self.sqs {
            requests.push(ChannelRequest::Sqs(sqs.clone()));
        }
        if let Some(typebot) = &self.typebot {
            requests.push(ChannelRequest::Typebot(typebot.clone()));
        }
        // A CRM block without account, token or url stays disabled and is not strict.
        if let Some(chatwoot) = self.chatwoot.as_ref().filter(|chatwoot| !chatwoot.is_requested()) {
            requests.push(ChannelRequest::Chatwoot(chatwoot.clone()));
        }
        requests
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelOutcome {
    Configured,
    Failed,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
/// What provisioning actually applied for one requested channel.
pub struct ResolvedChannel {
    pub outcome: ChannelOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<ChannelConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ResolvedChannel {
    fn configured(config: ChannelConfig) -> Self {
        Self {
            outcome: ChannelOutcome::Configured,
            config: Some(config),
            reason_code: None,
            detail: None,
        }
    }

    fn failed(error: &InstanceError) -> Self {
        Self {
            outcome: ChannelOutcome::Failed,
            config: None,
            reason_code: Some(error.reason_code().to_string()),
            detail: Some(error.to_string()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.outcome == ChannelOutcome::Configured
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProvisionedInstance {
    pub instance_name: String,
    pub instance_id: String,
    pub integration: SessionIntegration,
    pub status: String,
    pub connection_state: ConnectionState,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProvisionResult {
    pub instance: ProvisionedInstance,
    pub hash: String,
    pub token: String,
    pub channels: BTreeMap<ChannelKind, ResolvedChannel>,
    pub settings: InstanceSettings,
    pub qrcode: Option<QrArtifact>,
}

/// Accepts names usable as registry keys and file names.
pub fn validate_instance_name(raw: &str) -> InstanceResult<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(InstanceError::Validation(
            "instance name cannot be empty".to_string(),
        ));
    }
    if name.chars().count() > MAX_INSTANCE_NAME_CHARS {
        return Err(InstanceError::Validation(format!(
            "instance name cannot exceed {MAX_INSTANCE_NAME_CHARS} characters"
        )));
    }
    if name.starts_with('.')
        || !name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
    {
        return Err(InstanceError::Validation(format!(
            "instance name '{name}' may only contain letters, digits, '-', '_' and '.'"
        )));
    }
    Ok(name.to_string())
}

fn validate_integration(request: &CreateInstanceRequest) -> InstanceResult<()> {
    if request.integration != SessionIntegration::BusinessApi {
        return Ok(());
    }
    if normalize_token(request.number.as_deref()).is_none() {
        return Err(InstanceError::Validation(
            "business_api integration requires a number".to_string(),
        ));
    }
    if normalize_token(request.token.as_deref()).is_none() {
        return Err(InstanceError::Validation(
            "business_api integration requires a token".to_string(),
        ));
    }
    Ok(())
}

fn resolve_crm_sync(request: &CreateInstanceRequest) -> InstanceResult<Option<ChannelConfig>> {
    match request.chatwoot.as_ref().filter(|chatwoot| chatwoot.is_requested()) {
        Some(chatwoot) => Ok(Some(ChannelRequest::Chatwoot(chatwoot.clone()).resolve()?)),
        None => Ok(None),
    }
}

impl RelayService {
    /// Creates, registers and configures a new instance.
    ///
    /// Pre-registration failures leave no trace. Optional channel failures are
    /// reported per channel in the result; a session connect failure leaves the
    /// instance created without a QR artifact.
    pub async fn create_instance(
        &self,
        request: CreateInstanceRequest,
    ) -> InstanceResult<ProvisionResult> {
        let instance_name = validate_instance_name(&request.instance_name)?;
        validate_integration(&request)?;
        let crm_sync = resolve_crm_sync(&request)?;

        let token = normalize_token(request.token.as_deref()).unwrap_or_else(generate_token);
        let instance_id = Uuid::new_v4().to_string();
        let credential = InstanceCredential {
            hash: credential_hash(&instance_id, &token),
            token_fingerprint: token_fingerprint(&token),
        };
        let (record, _provisioning) = {
            let _credentials = self.lock_credentials();
            if self.registry.token_in_use(&credential.token_fingerprint, None) {
                return Err(InstanceError::DuplicateToken);
            }
            if self.registry.contains(&instance_name) {
                return Err(InstanceError::Conflict(instance_name));
            }
            let engine = self
                .engines
                .build(request.integration, &instance_name)
                .map_err(InstanceError::engine)?;
            let identity = InstanceIdentity {
                instance_name: instance_name.clone(),
                instance_id: instance_id.clone(),
                integration: request.integration,
                number: normalize_token(request.number.as_deref()),
                created_unix_ms: current_unix_timestamp_ms(),
            };
            let fanout = ChannelFanout::new(
                &instance_name,
                self.transports.clone(),
                self.config.channel_queue_capacity,
            );
            let record = Arc::new(InstanceRecord::new(identity, credential, fanout, engine));
            let provisioning = record.begin_provisioning();
            self.registry.register(Arc::clone(&record))?;
            (record, provisioning)
        };

        if let Err(error) = self.persist(&record).await {
            self.discard(&record).await;
            return Err(error);
        }
        record.emit(
            EventKind::InstanceCreate,
            json!({
                "instance_name": record.name(),
                "instance_id": record.id(),
                "integration": request.integration.as_str(),
            }),
        );
        info!(
            instance = %instance_name,
            instance_id = %instance_id,
            integration = request.integration.as_str(),
            "instance registered"
        );

        let mut channels = BTreeMap::new();
        for channel_request in request.optional_channel_requests() {
            let kind = channel_request.kind();
            let resolved = match channel_request
                .resolve()
                .and_then(|config| record.configure_channel(config))
            {
                Ok(config) => ResolvedChannel::configured(config),
                Err(error) => {
                    let error = InstanceError::adapter(&error);
                    warn!(
                        instance = %instance_name,
                        channel = kind.as_str(),
                        reason_code = error.reason_code(),
                        error = %error,
                        "optional channel configuration failed"
                    );
                    ResolvedChannel::failed(&error)
                }
            };
            channels.insert(kind, resolved);
        }

        record.replace_settings(request.settings.clone());

        if let Some(config) = crm_sync {
            match record.configure_channel(config) {
                Ok(config) => {
                    channels.insert(ChannelKind::Chatwoot, ResolvedChannel::configured(config));
                }
                Err(error) => {
                    self.discard(&record).await;
                    return Err(InstanceError::adapter(&error));
                }
            }
        }

        if let Err(error) = self.persist(&record).await {
            self.discard(&record).await;
            return Err(error);
        }

        let qrcode = if request.qrcode && request.integration == SessionIntegration::Baileys {
            self.capture_qr(&record).await
        } else {
            None
        };

        Ok(ProvisionResult {
            instance: ProvisionedInstance {
                instance_name: record.name().to_string(),
                instance_id: record.id().to_string(),
                integration: request.integration,
                status: "created".to_string(),
                connection_state: record.connection().current_state(),
            },
            hash: record.credential_hash(),
            token,
            channels,
            settings: record.settings(),
            qrcode,
        })
    }

    async fn capture_qr(&self, record: &InstanceRecord) -> Option<QrArtifact> {
        let number = record.identity().number.as_deref();
        if let Err(error) = record.connection().connect(number).await {
            warn!(
                instance = record.name(),
                reason_code = error.reason_code(),
                error = %error,
                "session connect failed during provisioning"
            );
            return None;
        }
        let snapshot = record
            .connection()
            .wait_for_settle(self.config.qr_capture_mode, self.config.qr_settle_interval)
            .await;
        if snapshot.state != ConnectionState::Connecting {
            return None;
        }
        match snapshot.qr {
            Some(qr) => Some(qr),
            None => record.connection().request_qr().await.ok(),
        }
    }

    /// Drops a partially provisioned record without emitting teardown events.
    async fn discard(&self, record: &Arc<InstanceRecord>) {
        {
            // The name stays claimed until the stored config is gone.
            let _persist = record.lock_persist().await;
            if let Err(error) = self.repository.delete(record.name()).await {
                warn!(
                    instance = record.name(),
                    error = %format!("{error:#}"),
                    "failed to remove config of discarded instance"
                );
            }
            self.registry.unregister_record(record);
        }
        record.fanout().close().await;
    }
}
