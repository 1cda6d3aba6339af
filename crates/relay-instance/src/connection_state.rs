//! Per-instance connection state machine.
//!
//! ```text
//! closed ──connect──▶ connecting ──opened──▶ open
//!    ▲                    │                   │
//!    └──closed/logout─────┴───────────────────┘
//! ```
//!
//! Transitions are serialized by one async mutex per instance. Every connect
//! cycle carries a generation number so updates from an abandoned cycle are
//! dropped instead of moving the current one.
//!
//! The engine update channel is unbounded: the listener needs the instance
//! mutex that `connect` holds, so engine sends must never wait on it.

use std::sync::Arc;
use std::time::Duration;

use relay_events::EventKind;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::{InstanceError, InstanceResult};
use crate::instance_events::InstanceEvents;
use crate::runtime_config::QrCaptureMode;
use crate::session_engine::{EngineUpdate, QrArtifact, SessionEngine};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Closed,
    Connecting,
    Open,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Open => "open",
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Closed, Self::Connecting)
                | (Self::Connecting, Self::Open)
                | (Self::Connecting, Self::Closed)
                | (Self::Open, Self::Closed)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
/// Point-in-time view of a connection, as published to subscribers.
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    #[serde(default)]
    pub qr: Option<QrArtifact>,
    pub generation: u64,
    #[serde(default)]
    pub last_reason: Option<String>,
}

#[derive(Debug, Default)]
struct ConnectionInner {
    state: ConnectionState,
    qr: Option<QrArtifact>,
    generation: u64,
    last_reason: Option<String>,
    retired: bool,
}

impl ConnectionInner {
    fn ensure_active(&self) -> InstanceResult<()> {
        if self.retired {
            return Err(InstanceError::State(
                "instance is being removed".to_string(),
            ));
        }
        Ok(())
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            state: self.state,
            qr: self.qr.clone(),
            generation: self.generation,
            last_reason: self.last_reason.clone(),
        }
    }
}

struct ConnectionShared {
    events: Arc<InstanceEvents>,
    inner: Mutex<ConnectionInner>,
    snapshot_tx: watch::Sender<ConnectionSnapshot>,
}

impl ConnectionShared {
    fn publish(&self, inner: &ConnectionInner) {
        self.snapshot_tx.send_replace(inner.snapshot());
    }

    /// Applies one transition and emits `CONNECTION_UPDATE`. Illegal moves are ignored.
    fn transition(&self, inner: &mut ConnectionInner, next: ConnectionState, reason: &str) -> bool {
        let previous = inner.state;
        if !previous.can_transition_to(next) {
            warn!(
                instance = self.events.instance_name(),
                from = previous.as_str(),
                to = next.as_str(),
                reason,
                "ignoring illegal connection transition"
            );
            return false;
        }
        inner.state = next;
        inner.last_reason = Some(reason.to_string());
        if next != ConnectionState::Connecting {
            inner.qr = None;
        }
        self.publish(inner);
        info!(
            instance = self.events.instance_name(),
            from = previous.as_str(),
            to = next.as_str(),
            generation = inner.generation,
            reason,
            "connection state changed"
        );
        self.events.emit(
            EventKind::ConnectionUpdate,
            json!({
                "instance": self.events.instance_name(),
                "state": next.as_str(),
                "previous_state": previous.as_str(),
                "reason": reason,
            }),
        );
        true
    }

    fn record_qr(&self, inner: &mut ConnectionInner, qr: QrArtifact) {
        if inner.qr.as_ref() == Some(&qr) {
            return;
        }
        inner.qr = Some(qr.clone());
        self.publish(inner);
        self.events.emit(
            EventKind::QrcodeUpdated,
            json!({
                "instance": self.events.instance_name(),
                "qrcode": qr,
            }),
        );
    }
}

/// Closes the session when dropped, even if the awaiting caller is cancelled.
struct SessionRelease<'a> {
    shared: &'a ConnectionShared,
    inner: &'a mut ConnectionInner,
    reason: &'static str,
}

impl Drop for SessionRelease<'_> {
    fn drop(&mut self) {
        self.inner.generation = self.inner.generation.saturating_add(1);
        if self.inner.state != ConnectionState::Closed {
            self.shared
                .transition(&mut *self.inner, ConnectionState::Closed, self.reason);
        } else {
            self.shared.publish(&*self.inner);
        }
    }
}

pub struct ConnectionStateMachine {
    engine: Arc<dyn SessionEngine>,
    shared: Arc<ConnectionShared>,
}

impl ConnectionStateMachine {
    pub fn new(engine: Arc<dyn SessionEngine>, events: Arc<InstanceEvents>) -> Self {
        let (snapshot_tx, _) = watch::channel(ConnectionSnapshot::default());
        Self {
            engine,
            shared: Arc::new(ConnectionShared {
                events,
                inner: Mutex::new(ConnectionInner::default()),
                snapshot_tx,
            }),
        }
    }

    /// Non-blocking read of the latest published state.
    pub fn current_state(&self) -> ConnectionState {
        self.shared.snapshot_tx.borrow().state
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.shared.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    /// Starts a connect cycle from `closed`. A call while connecting or open
    /// returns the current snapshot without opening a second session.
    pub async fn connect(&self, number: Option<&str>) -> InstanceResult<ConnectionSnapshot> {
        let mut inner = self.shared.inner.lock().await;
        inner.ensure_active()?;
        if inner.state != ConnectionState::Closed {
            debug!(
                instance = self.shared.events.instance_name(),
                state = inner.state.as_str(),
                "connect ignored; session already active"
            );
            return Ok(inner.snapshot());
        }
        self.start_cycle(&mut *inner, number, "connect_requested").await
    }

    async fn start_cycle(
        &self,
        inner: &mut ConnectionInner,
        number: Option<&str>,
        reason: &str,
    ) -> InstanceResult<ConnectionSnapshot> {
        inner.generation = inner.generation.saturating_add(1);
        let generation = inner.generation;
        self.shared
            .transition(inner, ConnectionState::Connecting, reason);

        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_engine_listener(
            Arc::clone(&self.shared),
            generation,
            updates_rx,
        ));

        match self.engine.connect(number, updates_tx).await {
            Ok(()) => {
                if inner.state == ConnectionState::Connecting && inner.qr.is_none() {
                    if let Some(qr) = self.engine.current_qr() {
                        self.shared.record_qr(inner, qr);
                    }
                }
                Ok(inner.snapshot())
            }
            Err(error) => {
                inner.generation = inner.generation.saturating_add(1);
                self.shared
                    .transition(inner, ConnectionState::Closed, "engine_connect_failed");
                Err(InstanceError::engine(error))
            }
        }
    }

    /// Returns the pairing artifact of the in-flight connect cycle.
    pub async fn request_qr(&self) -> InstanceResult<QrArtifact> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state != ConnectionState::Connecting {
            return Err(InstanceError::State(format!(
                "qr code is only available while connecting (state is {})",
                inner.state
            )));
        }
        if let Some(qr) = inner.qr.clone() {
            return Ok(qr);
        }
        match self.engine.current_qr() {
            Some(qr) => {
                self.shared.record_qr(&mut inner, qr.clone());
                Ok(qr)
            }
            None => Err(InstanceError::State(
                "qr code has not been issued yet".to_string(),
            )),
        }
    }

    /// Ends the session. The state lands on `closed` even when the engine errors.
    pub async fn logout(&self) -> InstanceResult<ConnectionSnapshot> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state == ConnectionState::Closed {
            return Err(InstanceError::State(
                "instance is not connected".to_string(),
            ));
        }
        let result = {
            let _release = SessionRelease {
                shared: &self.shared,
                inner: &mut *inner,
                reason: "logout_requested",
            };
            self.engine.logout().await
        };
        result.map_err(InstanceError::engine)?;
        Ok(inner.snapshot())
    }

    /// Releases the live session and immediately starts a new connect cycle.
    pub async fn reload(&self, number: Option<&str>) -> InstanceResult<ConnectionSnapshot> {
        let mut inner = self.shared.inner.lock().await;
        inner.ensure_active()?;
        if inner.state == ConnectionState::Closed {
            return Err(InstanceError::State(
                "instance is not connected; connect it instead".to_string(),
            ));
        }
        let result = {
            let _release = SessionRelease {
                shared: &self.shared,
                inner: &mut *inner,
                reason: "reload_requested",
            };
            self.engine.reload().await
        };
        result.map_err(InstanceError::engine)?;
        self.start_cycle(&mut *inner, number, "reload_requested").await
    }

    /// Prepares the session for instance removal under one lock acquisition.
    ///
    /// An open session is left untouched and yields `StateError`. A connecting
    /// session is logged out on a best-effort basis. Once retired, `connect`
    /// and `reload` are refused.
    pub async fn retire(&self) -> InstanceResult<ConnectionSnapshot> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state == ConnectionState::Open {
            return Err(InstanceError::State(format!(
                "instance '{}' is connected; log out before removing it",
                self.shared.events.instance_name()
            )));
        }
        let logout = {
            let release = SessionRelease {
                shared: &self.shared,
                inner: &mut *inner,
                reason: "instance_removed",
            };
            if release.inner.state == ConnectionState::Connecting {
                Some(self.engine.logout().await)
            } else {
                None
            }
        };
        if let Some(Err(error)) = logout {
            warn!(
                instance = self.shared.events.instance_name(),
                error = %format!("{error:#}"),
                "session logout failed while retiring"
            );
        }
        inner.retired = true;
        Ok(inner.snapshot())
    }

    /// Waits for the QR artifact to settle after a connect.
    pub async fn wait_for_settle(&self, mode: QrCaptureMode, interval: Duration) -> ConnectionSnapshot {
        match mode {
            QrCaptureMode::FixedDelay => tokio::time::sleep(interval).await,
            QrCaptureMode::EventDriven => {
                let mut updates = self.subscribe();
                let elapsed = tokio::time::timeout(
                    interval,
                    updates.wait_for(|snapshot| {
                        snapshot.state != ConnectionState::Connecting || snapshot.qr.is_some()
                    }),
                )
                .await
                .is_err();
                if elapsed {
                    debug!(
                        instance = self.shared.events.instance_name(),
                        interval_ms = interval.as_millis() as u64,
                        "qr settle interval elapsed"
                    );
                }
            }
        }
        self.snapshot()
    }
}

impl std::fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("instance", &self.shared.events.instance_name())
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

async fn run_engine_listener(
    shared: Arc<ConnectionShared>,
    generation: u64,
    mut updates: mpsc::UnboundedReceiver<EngineUpdate>,
) {
    while let Some(update) = updates.recv().await {
        let mut inner = shared.inner.lock().await;
        if inner.generation != generation {
            debug!(
                instance = shared.events.instance_name(),
                stale_generation = generation,
                current_generation = inner.generation,
                "dropping engine updates from a superseded connect cycle"
            );
            return;
        }
        match update {
            EngineUpdate::Qr(qr) => {
                if inner.state == ConnectionState::Connecting {
                    shared.record_qr(&mut inner, qr);
                }
            }
            EngineUpdate::Opened => {
                shared.transition(&mut inner, ConnectionState::Open, "engine_opened");
            }
            EngineUpdate::Closed { reason } => {
                if inner.state != ConnectionState::Closed {
                    shared.transition(&mut inner, ConnectionState::Closed, &reason);
                }
            }
        }
    }
}
