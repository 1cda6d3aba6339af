use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use relay_channels::{
    ChannelConfig, ChannelDelivery, ChannelDestination, ChannelKind, ChannelTransport,
    ChannelTransports, ChatwootRequest, ToggleRequest,
};
use relay_events::{default_events, EventKind};
use tokio::sync::{mpsc, oneshot};

use crate::instance_repository::{
    InMemoryInstanceRepository, InstanceConfigBlob, InstanceRepository,
};
use crate::relay_service::RelayService;
use crate::runtime_config::{QrCaptureMode, RelayRuntimeConfig};
use crate::session_engine::{
    EngineUpdate, QrArtifact, SessionEngine, SessionEngineFactory, SessionIntegration,
};

pub(crate) fn sample_qr(code: &str) -> QrArtifact {
    QrArtifact {
        code: code.to_string(),
        base64: format!("data:image/png;base64,{code}"),
        pairing_code: None,
    }
}

pub(crate) fn enabled_toggle(kind: ChannelKind) -> ChannelConfig {
    ChannelConfig {
        enabled: true,
        events: default_events(),
        destination: ChannelDestination::empty(kind),
    }
}

pub(crate) async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met before deadline"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Default)]
pub(crate) struct ScriptedEngine {
    qr: Option<QrArtifact>,
    fail_connect: AtomicBool,
    fail_logout: AtomicBool,
    connect_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    reload_calls: AtomicUsize,
    open_on_connect: AtomicBool,
    burst_on_connect: AtomicUsize,
    connect_gate: Mutex<Option<oneshot::Receiver<()>>>,
    updates: Mutex<Option<mpsc::UnboundedSender<EngineUpdate>>>,
}

impl ScriptedEngine {
    pub(crate) fn with_qr(qr: QrArtifact) -> Self {
        Self {
            qr: Some(qr),
            ..Self::default()
        }
    }

    pub(crate) fn silent() -> Self {
        Self::default()
    }

    pub(crate) fn failing_connect() -> Self {
        let engine = Self::default();
        engine.fail_connect.store(true, Ordering::SeqCst);
        engine
    }

    pub(crate) fn fail_logout(&self, fail: bool) {
        self.fail_logout.store(fail, Ordering::SeqCst);
    }

    /// Queues `Opened` from inside `connect`, before it returns.
    pub(crate) fn open_on_connect(&self) {
        self.open_on_connect.store(true, Ordering::SeqCst);
    }

    /// Reports `count` distinct QR updates from inside `connect`.
    pub(crate) fn burst_on_connect(&self, count: usize) {
        self.burst_on_connect.store(count, Ordering::SeqCst);
    }

    /// Holds the next `connect` call open until the returned sender fires.
    pub(crate) fn gate_connect(&self) -> oneshot::Sender<()> {
        let (release_tx, release_rx) = oneshot::channel();
        *self.connect_gate.lock().expect("gate lock") = Some(release_rx);
        release_tx
    }

    pub(crate) fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn reload_calls(&self) -> usize {
        self.reload_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn take_updates(&self) -> Option<mpsc::UnboundedSender<EngineUpdate>> {
        self.updates.lock().expect("updates lock").take()
    }

    pub(crate) async fn push(&self, update: EngineUpdate) {
        let sender = self.updates.lock().expect("updates lock").clone();
        if let Some(sender) = sender {
            sender.send(update).expect("listener alive");
        }
    }
}

#[async_trait]
impl SessionEngine for ScriptedEngine {
    async fn connect(
        &self,
        _number: Option<&str>,
        updates: mpsc::UnboundedSender<EngineUpdate>,
    ) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            bail!("scripted connect failure");
        }
        if let Some(qr) = self.qr.clone() {
            updates.send(EngineUpdate::Qr(qr))?;
        }
        for index in 0..self.burst_on_connect.load(Ordering::SeqCst) {
            updates.send(EngineUpdate::Qr(sample_qr(&format!("burst-{index}"))))?;
        }
        if self.open_on_connect.load(Ordering::SeqCst) {
            updates.send(EngineUpdate::Opened)?;
        }
        *self.updates.lock().expect("updates lock") = Some(updates);
        let gate = self.connect_gate.lock().expect("gate lock").take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_logout.load(Ordering::SeqCst) {
            bail!("scripted logout failure");
        }
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        self.reload_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn current_qr(&self) -> Option<QrArtifact> {
        self.qr.clone()
    }
}

#[derive(Default)]
pub(crate) struct ScriptedEngineFactory {
    fail_connect: bool,
    silent: bool,
    built: Mutex<Vec<(String, Arc<ScriptedEngine>)>>,
}

impl ScriptedEngineFactory {
    pub(crate) fn failing_connect() -> Self {
        Self {
            fail_connect: true,
            ..Self::default()
        }
    }

    /// Engines that never issue a QR on their own.
    pub(crate) fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }

    pub(crate) fn engine_for(&self, instance_name: &str) -> Arc<ScriptedEngine> {
        self.built
            .lock()
            .expect("built lock")
            .iter()
            .rev()
            .find(|(name, _)| name == instance_name)
            .map(|(_, engine)| Arc::clone(engine))
            .expect("engine built for instance")
    }
}

impl SessionEngineFactory for ScriptedEngineFactory {
    fn build(
        &self,
        _integration: SessionIntegration,
        instance_name: &str,
    ) -> Result<Arc<dyn SessionEngine>> {
        let engine = if self.fail_connect {
            ScriptedEngine::failing_connect()
        } else if self.silent {
            ScriptedEngine::silent()
        } else {
            ScriptedEngine::with_qr(sample_qr(&format!("qr-{instance_name}")))
        };
        let engine = Arc::new(engine);
        self.built
            .lock()
            .expect("built lock")
            .push((instance_name.to_string(), Arc::clone(&engine)));
        Ok(engine)
    }
}

#[derive(Default)]
pub(crate) struct RecordingTransport {
    deliveries: Mutex<Vec<(ChannelKind, EventKind, String)>>,
    releases: Mutex<Vec<String>>,
    fail_release: AtomicBool,
}

impl RecordingTransport {
    pub(crate) fn count_of(&self, event: EventKind) -> usize {
        self.deliveries
            .lock()
            .expect("deliveries lock")
            .iter()
            .filter(|(_, delivered, _)| *delivered == event)
            .count()
    }

    pub(crate) fn kinds_for(&self, event: EventKind) -> BTreeSet<ChannelKind> {
        self.deliveries
            .lock()
            .expect("deliveries lock")
            .iter()
            .filter(|(_, delivered, _)| *delivered == event)
            .map(|(kind, _, _)| *kind)
            .collect()
    }

    pub(crate) fn released(&self) -> Vec<String> {
        self.releases.lock().expect("releases lock").clone()
    }

    pub(crate) fn fail_releases(&self) {
        self.fail_release.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChannelTransport for RecordingTransport {
    async fn send(&self, delivery: &ChannelDelivery) -> Result<()> {
        self.deliveries.lock().expect("deliveries lock").push((
            delivery.kind,
            delivery.envelope.event,
            delivery.envelope.instance_name.clone(),
        ));
        Ok(())
    }

    async fn release(&self, instance_name: &str) -> Result<()> {
        self.releases
            .lock()
            .expect("releases lock")
            .push(instance_name.to_string());
        if self.fail_release.load(Ordering::SeqCst) {
            bail!("scripted release failure");
        }
        Ok(())
    }
}

/// One recording transport per channel kind, so release calls can be told apart.
pub(crate) fn per_kind_transports() -> (ChannelTransports, BTreeMap<ChannelKind, Arc<RecordingTransport>>) {
    let mut transports = ChannelTransports::default();
    let mut recorders = BTreeMap::new();
    for kind in ChannelKind::ALL {
        let recorder = Arc::new(RecordingTransport::default());
        transports = transports.with_transport(kind, recorder.clone());
        recorders.insert(kind, recorder);
    }
    (transports, recorders)
}

pub(crate) fn fast_config() -> RelayRuntimeConfig {
    RelayRuntimeConfig {
        qr_settle_interval: Duration::from_millis(10),
        qr_capture_mode: QrCaptureMode::EventDriven,
        ..RelayRuntimeConfig::default()
    }
}

/// Repository whose writes can be switched to fail and whose deletes can be held.
#[derive(Default)]
pub(crate) struct FlakyRepository {
    inner: InMemoryInstanceRepository,
    fail_puts: AtomicBool,
    deletes_started: AtomicUsize,
    delete_gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl FlakyRepository {
    /// Holds the next `delete` until the returned sender fires.
    pub(crate) fn gate_deletes(&self) -> oneshot::Sender<()> {
        let (release_tx, release_rx) = oneshot::channel();
        *self.delete_gate.lock().expect("gate lock") = Some(release_rx);
        release_tx
    }

    pub(crate) fn deletes_started(&self) -> usize {
        self.deletes_started.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub(crate) async fn stored(&self, instance_name: &str) -> Option<InstanceConfigBlob> {
        self.inner.get(instance_name).await.expect("in-memory get")
    }
}

#[async_trait]
impl InstanceRepository for FlakyRepository {
    async fn get(&self, instance_name: &str) -> Result<Option<InstanceConfigBlob>> {
        self.inner.get(instance_name).await
    }

    async fn put(&self, instance_name: &str, blob: &InstanceConfigBlob) -> Result<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            bail!("scripted repository write failure");
        }
        self.inner.put(instance_name, blob).await
    }

    async fn delete(&self, instance_name: &str) -> Result<()> {
        self.deletes_started.fetch_add(1, Ordering::SeqCst);
        let gate = self.delete_gate.lock().expect("gate lock").take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.inner.delete(instance_name).await
    }
}

pub(crate) struct ServiceHarness {
    pub(crate) service: Arc<RelayService>,
    pub(crate) engines: Arc<ScriptedEngineFactory>,
    pub(crate) repository: Arc<FlakyRepository>,
    pub(crate) recorders: BTreeMap<ChannelKind, Arc<RecordingTransport>>,
}

impl ServiceHarness {
    pub(crate) fn new(config: RelayRuntimeConfig) -> Self {
        Self::with_engines(config, ScriptedEngineFactory::default())
    }

    pub(crate) fn with_engines(config: RelayRuntimeConfig, engines: ScriptedEngineFactory) -> Self {
        let engines = Arc::new(engines);
        let repository = Arc::new(FlakyRepository::default());
        let (transports, recorders) = per_kind_transports();
        let service = Arc::new(RelayService::new(
            config,
            repository.clone(),
            engines.clone(),
            transports,
        ));
        Self {
            service,
            engines,
            repository,
            recorders,
        }
    }

    pub(crate) fn recorder(&self, kind: ChannelKind) -> Arc<RecordingTransport> {
        Arc::clone(&self.recorders[&kind])
    }

    /// Channel kinds that have delivered `event` so far.
    pub(crate) fn delivered_to(&self, event: EventKind) -> BTreeSet<ChannelKind> {
        self.recorders
            .iter()
            .filter(|(_, recorder)| recorder.count_of(event) > 0)
            .map(|(kind, _)| *kind)
            .collect()
    }
}

pub(crate) fn toggle(enabled: bool, events: &[&str]) -> ToggleRequest {
    ToggleRequest {
        enabled,
        events: events.iter().map(|event| event.to_string()).collect(),
    }
}

pub(crate) fn complete_chatwoot(url: &str) -> ChatwootRequest {
    ChatwootRequest {
        account_id: Some("1".to_string()),
        token: Some("crm-token".to_string()),
        url: Some(url.to_string()),
        sign_msg: Some(true),
        reopen_conversation: Some(false),
        conversation_pending: Some(false),
        ..ChatwootRequest::default()
    }
}
