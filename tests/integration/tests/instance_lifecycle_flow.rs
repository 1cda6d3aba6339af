use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use relay_channels::{
    ChannelDelivery, ChannelKind, ChannelTransport, ChannelTransports, ChatwootRequest,
    ToggleRequest, TypebotRequest, WebhookRequest,
};
use relay_events::{default_events, EventKind};
use relay_instance::{
    ConnectionState, CreateInstanceRequest, EngineUpdate, FileInstanceRepository,
    InstanceRepository, QrArtifact, QrCaptureMode, RelayRuntimeConfig, RelayService,
    SessionEngine, SessionEngineFactory, SessionIntegration,
};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

struct PairingEngine {
    qr: QrArtifact,
    connect_calls: AtomicUsize,
    updates: AsyncMutex<Option<mpsc::UnboundedSender<EngineUpdate>>>,
}

impl PairingEngine {
    fn new(instance_name: &str) -> Self {
        Self {
            qr: QrArtifact {
                code: format!("pair-{instance_name}"),
                base64: format!("data:image/png;base64,{instance_name}"),
                pairing_code: None,
            },
            connect_calls: AtomicUsize::new(0),
            updates: AsyncMutex::new(None),
        }
    }

    async fn open(&self) {
        let sender = self.updates.lock().await.clone();
        if let Some(sender) = sender {
            sender
                .send(EngineUpdate::Opened)
                .expect("listener should accept engine updates");
        }
    }
}

#[async_trait]
impl SessionEngine for PairingEngine {
    async fn connect(
        &self,
        _number: Option<&str>,
        updates: mpsc::UnboundedSender<EngineUpdate>,
    ) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        // Simulate the handshake latency of a real session.
        tokio::time::sleep(Duration::from_millis(20)).await;
        updates.send(EngineUpdate::Qr(self.qr.clone()))?;
        *self.updates.lock().await = Some(updates);
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        Ok(())
    }

    fn current_qr(&self) -> Option<QrArtifact> {
        None
    }
}

#[derive(Default)]
struct PairingEngineFactory {
    engines: std::sync::Mutex<BTreeMap<String, Arc<PairingEngine>>>,
}

impl PairingEngineFactory {
    fn engine(&self, instance_name: &str) -> Arc<PairingEngine> {
        self.engines
            .lock()
            .expect("engine map lock")
            .get(instance_name)
            .cloned()
            .expect("engine should be built for instance")
    }
}

impl SessionEngineFactory for PairingEngineFactory {
    fn build(
        &self,
        _integration: SessionIntegration,
        instance_name: &str,
    ) -> Result<Arc<dyn SessionEngine>> {
        let engine = Arc::new(PairingEngine::new(instance_name));
        self.engines
            .lock()
            .expect("engine map lock")
            .insert(instance_name.to_string(), Arc::clone(&engine));
        Ok(engine)
    }
}

#[derive(Default)]
struct CountingTransport {
    deliveries: AsyncMutex<Vec<(ChannelKind, EventKind)>>,
}

impl CountingTransport {
    async fn kinds_for(&self, event: EventKind) -> BTreeSet<ChannelKind> {
        self.deliveries
            .lock()
            .await
            .iter()
            .filter(|(_, delivered)| *delivered == event)
            .map(|(kind, _)| *kind)
            .collect()
    }
}

#[async_trait]
impl ChannelTransport for CountingTransport {
    async fn send(&self, delivery: &ChannelDelivery) -> Result<()> {
        self.deliveries
            .lock()
            .await
            .push((delivery.kind, delivery.envelope.event));
        Ok(())
    }
}

struct Harness {
    _workspace: TempDir,
    repository: Arc<FileInstanceRepository>,
    engines: Arc<PairingEngineFactory>,
    transport: Arc<CountingTransport>,
    service: Arc<RelayService>,
}

impl Harness {
    fn new() -> Self {
        let workspace = tempfile::tempdir().expect("tempdir");
        let repository = Arc::new(FileInstanceRepository::new(workspace.path().join("instances")));
        let engines = Arc::new(PairingEngineFactory::default());
        let transport = Arc::new(CountingTransport::default());
        let config = RelayRuntimeConfig {
            qr_settle_interval: Duration::from_millis(500),
            qr_capture_mode: QrCaptureMode::EventDriven,
            ..RelayRuntimeConfig::default()
        };
        let service = Arc::new(RelayService::new(
            config,
            repository.clone(),
            engines.clone(),
            ChannelTransports::uniform(transport.clone()),
        ));
        Self {
            _workspace: workspace,
            repository,
            engines,
            transport,
            service,
        }
    }
}

fn enabled(events: &[&str]) -> ToggleRequest {
    ToggleRequest {
        enabled: true,
        events: events.iter().map(|event| event.to_string()).collect(),
    }
}

#[tokio::test]
async fn integration_alice_is_created_closed_without_qr() {
    let harness = Harness::new();
    let result = harness
        .service
        .create_instance(CreateInstanceRequest::named("alice"))
        .await
        .expect("alice should be created");

    assert_eq!(result.instance.status, "created");
    assert_eq!(result.instance.integration, SessionIntegration::Baileys);
    assert_eq!(result.instance.connection_state, ConnectionState::Closed);
    assert!(result.qrcode.is_none());
    assert!(result.channels.is_empty());

    let stored = harness
        .repository
        .get("alice")
        .await
        .expect("repository read")
        .expect("alice should be persisted");
    assert_eq!(stored.identity.instance_id, result.instance.instance_id);
}

#[tokio::test]
async fn integration_bob_websocket_without_events_gets_full_catalog() {
    let harness = Harness::new();
    let mut request = CreateInstanceRequest::named("bob");
    request.websocket = Some(enabled(&[]));
    let result = harness
        .service
        .create_instance(request)
        .await
        .expect("bob should be created");

    let websocket = result.channels[&ChannelKind::Websocket]
        .config
        .clone()
        .expect("websocket should be configured");
    let resolved: BTreeSet<EventKind> = websocket.events.into_iter().collect();
    let catalog: BTreeSet<EventKind> = default_events().into_iter().collect();
    assert_eq!(resolved, catalog);
}

#[tokio::test]
async fn integration_carol_with_partial_crm_sync_is_rejected() {
    let harness = Harness::new();
    let mut request = CreateInstanceRequest::named("carol");
    request.chatwoot = Some(ChatwootRequest {
        account_id: Some("7".to_string()),
        ..ChatwootRequest::default()
    });
    let error = harness
        .service
        .create_instance(request)
        .await
        .expect_err("partial crm sync should fail");

    assert_eq!(error.reason_code(), "instance_validation_failed");
    assert!(harness.service.registry().get("carol").is_none());
    assert!(harness
        .repository
        .get("carol")
        .await
        .expect("repository read")
        .is_none());
}

#[tokio::test]
async fn integration_duplicate_name_leaves_registry_unchanged() {
    let harness = Harness::new();
    let first = harness
        .service
        .create_instance(CreateInstanceRequest::named("dora"))
        .await
        .expect("first create");
    let error = harness
        .service
        .create_instance(CreateInstanceRequest::named("dora"))
        .await
        .expect_err("second create should conflict");

    assert_eq!(error.reason_code(), "instance_name_conflict");
    let listed = harness.service.fetch_all(None);
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].instance_id, first.instance.instance_id);
}

#[tokio::test]
async fn integration_concurrent_connects_share_one_session_and_qr() {
    let harness = Harness::new();
    harness
        .service
        .create_instance(CreateInstanceRequest::named("eve"))
        .await
        .expect("eve should be created");

    let (first, second) = tokio::join!(
        harness.service.connect("eve", None),
        harness.service.connect("eve", None)
    );
    let first = first.expect("first connect");
    let second = second.expect("second connect");
    assert_eq!(first.state, ConnectionState::Connecting);
    assert_eq!(second.state, ConnectionState::Connecting);

    let engine = harness.engines.engine("eve");
    assert_eq!(engine.connect_calls.load(Ordering::SeqCst), 1);
    let record = harness.service.registry().get("eve").expect("eve");
    let mut updates = record.connection().subscribe();
    tokio::time::timeout(
        Duration::from_secs(2),
        updates.wait_for(|snapshot| snapshot.qr.is_some()),
    )
    .await
    .expect("qr within deadline")
    .expect("snapshot channel alive");
    let qr_first = harness.service.request_qr("eve").await.expect("qr");
    let qr_second = harness.service.request_qr("eve").await.expect("qr again");
    assert_eq!(qr_first, qr_second);
    assert_eq!(qr_first.code, "pair-eve");
}

#[tokio::test]
async fn integration_provisioning_captures_qr_and_delete_respects_state() {
    let harness = Harness::new();
    let mut open_request = CreateInstanceRequest::named("fred");
    open_request.qrcode = true;
    let created = harness
        .service
        .create_instance(open_request)
        .await
        .expect("fred should be created");
    assert_eq!(created.qrcode.expect("qr captured").code, "pair-fred");

    harness.engines.engine("fred").open().await;
    let record = harness.service.registry().get("fred").expect("fred");
    let mut updates = record.connection().subscribe();
    tokio::time::timeout(
        Duration::from_secs(2),
        updates.wait_for(|snapshot| snapshot.state == ConnectionState::Open),
    )
    .await
    .expect("open within deadline")
    .expect("snapshot channel alive");

    let error = harness
        .service
        .delete_instance("fred")
        .await
        .expect_err("open instance cannot be deleted");
    assert_eq!(error.reason_code(), "instance_invalid_state");
    assert!(harness.service.registry().contains("fred"));

    let mut connecting_request = CreateInstanceRequest::named("gail");
    connecting_request.qrcode = true;
    harness
        .service
        .create_instance(connecting_request)
        .await
        .expect("gail should be created");
    harness
        .service
        .delete_instance("gail")
        .await
        .expect("connecting instance can be deleted");
    assert!(!harness.service.registry().contains("gail"));

    harness.service.logout("fred").await.expect("logout fred");
    harness
        .service
        .delete_instance("fred")
        .await
        .expect("closed instance can be deleted");
    assert!(harness.service.registry().is_empty());
    assert!(harness
        .repository
        .get("fred")
        .await
        .expect("repository read")
        .is_none());
}

#[tokio::test]
async fn integration_event_reaches_exactly_the_three_subscribed_adapters() {
    let harness = Harness::new();
    let mut request = CreateInstanceRequest::named("hana");
    request.webhook = Some(WebhookRequest {
        enabled: true,
        url: Some("https://hooks.example.com/hana".to_string()),
        events: vec!["SEND_MESSAGE".to_string()],
        ..WebhookRequest::default()
    });
    request.websocket = Some(enabled(&["send.message"]));
    request.rabbitmq = Some(enabled(&["CALL"]));
    request.sqs = Some(enabled(&["send-message"]));
    request.chatwoot = Some(ChatwootRequest {
        account_id: Some("7".to_string()),
        token: Some("crm".to_string()),
        url: Some("https://crm.example.com".to_string()),
        sign_msg: Some(false),
        reopen_conversation: Some(true),
        conversation_pending: Some(false),
        events: vec!["CONTACTS_UPSERT".to_string()],
        ..ChatwootRequest::default()
    });
    request.typebot = Some(TypebotRequest {
        enabled: true,
        url: Some("https://bot.example.com".to_string()),
        typebot: Some("welcome-flow".to_string()),
        events: vec!["MESSAGES_UPSERT".to_string()],
        ..TypebotRequest::default()
    });
    let result = harness
        .service
        .create_instance(request)
        .await
        .expect("hana should be created");
    assert_eq!(result.channels.len(), 6);
    assert!(result.channels.values().all(|channel| channel.is_configured()));

    let report = harness
        .service
        .emit_event("hana", EventKind::SendMessage, json!({"key": {"id": "m-1"}}))
        .expect("emit");
    let expected = BTreeSet::from([ChannelKind::Webhook, ChannelKind::Websocket, ChannelKind::Sqs]);
    let enqueued: BTreeSet<ChannelKind> = report.enqueued.iter().copied().collect();
    let skipped: BTreeSet<ChannelKind> = report.skipped.iter().copied().collect();
    assert_eq!(enqueued, expected);
    assert_eq!(
        skipped,
        BTreeSet::from([ChannelKind::Rabbitmq, ChannelKind::Chatwoot, ChannelKind::Typebot])
    );

    harness.service.shutdown().await;
    assert_eq!(harness.transport.kinds_for(EventKind::SendMessage).await, expected);
}
