use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use httpmock::{Method::POST, MockServer};
use relay_channels::{
    ChannelKind, ChannelRequest, ChannelTransports, WebhookRequest, WebhookTransport,
    WebhookTransportConfig,
};
use relay_instance::{
    CreateInstanceRequest, EngineUpdate, InMemoryInstanceRepository, QrArtifact, QrCaptureMode,
    RelayRuntimeConfig, RelayService, SessionEngine, SessionEngineFactory, SessionIntegration,
};
use tokio::sync::mpsc;

struct InstantQrEngine;

#[async_trait]
impl SessionEngine for InstantQrEngine {
    async fn connect(
        &self,
        _number: Option<&str>,
        updates: mpsc::UnboundedSender<EngineUpdate>,
    ) -> Result<()> {
        updates
            .send(EngineUpdate::Qr(QrArtifact {
                code: "pair".to_string(),
                base64: "data:image/png;base64,pair".to_string(),
                pairing_code: Some("ABCD-EFGH".to_string()),
            }))?;
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

struct InstantQrFactory;

impl SessionEngineFactory for InstantQrFactory {
    fn build(
        &self,
        _integration: SessionIntegration,
        _instance_name: &str,
    ) -> Result<Arc<dyn SessionEngine>> {
        Ok(Arc::new(InstantQrEngine))
    }
}

fn webhook_service() -> Arc<RelayService> {
    let webhook = WebhookTransport::new(WebhookTransportConfig {
        http_timeout_ms: 2_000,
        default_headers: BTreeMap::from([("x-relay-node".to_string(), "node-1".to_string())]),
    })
    .expect("webhook transport");
    let config = RelayRuntimeConfig {
        qr_settle_interval: Duration::from_millis(500),
        qr_capture_mode: QrCaptureMode::EventDriven,
        ..RelayRuntimeConfig::default()
    };
    Arc::new(RelayService::new(
        config,
        Arc::new(InMemoryInstanceRepository::new()),
        Arc::new(InstantQrFactory),
        ChannelTransports::default().with_transport(ChannelKind::Webhook, Arc::new(webhook)),
    ))
}

#[tokio::test]
async fn integration_webhook_by_events_posts_lifecycle_events_to_routed_paths() {
    let server = MockServer::start_async().await;
    let connection_update = server.mock(|when, then| {
        when.method(POST)
            .path("/hooks/connection-update")
            .header("x-relay-node", "node-1")
            .header("x-tenant", "acme")
            .json_body_includes(r#"{"event":"connection.update","instance":"ivy"}"#);
        then.status(200);
    });
    let qrcode_updated = server.mock(|when, then| {
        when.method(POST)
            .path("/hooks/qrcode-updated")
            .json_body_includes(r#"{"event":"qrcode.updated","instance":"ivy"}"#);
        then.status(200);
    });

    let service = webhook_service();
    let mut request = CreateInstanceRequest::named("ivy");
    request.qrcode = true;
    request.webhook = Some(WebhookRequest {
        enabled: true,
        url: Some(server.url("/hooks")),
        by_events: true,
        headers: BTreeMap::from([("x-tenant".to_string(), "acme".to_string())]),
        events: vec![
            "CONNECTION_UPDATE".to_string(),
            "QRCODE_UPDATED".to_string(),
        ],
        ..WebhookRequest::default()
    });
    let result = service
        .create_instance(request)
        .await
        .expect("ivy should be created");
    assert_eq!(
        result.qrcode.expect("qr captured").pairing_code.as_deref(),
        Some("ABCD-EFGH")
    );

    service.shutdown().await;
    connection_update.assert_calls(1);
    qrcode_updated.assert_calls(1);
}

#[tokio::test]
async fn integration_webhook_failures_do_not_fail_channel_operations() {
    let server = MockServer::start_async().await;
    let failing = server.mock(|when, then| {
        when.method(POST).path("/down");
        then.status(503).body("maintenance");
    });

    let service = webhook_service();
    service
        .create_instance(CreateInstanceRequest::named("jade"))
        .await
        .expect("jade should be created");
    service
        .configure_channel(
            "jade",
            &ChannelRequest::Webhook(WebhookRequest {
                enabled: true,
                url: Some(server.url("/down")),
                events: vec!["CALL".to_string()],
                ..WebhookRequest::default()
            }),
        )
        .await
        .expect("webhook configured");

    let report = service
        .emit_event("jade", relay_events::EventKind::Call, serde_json::json!({"from": "x"}))
        .expect("emit should succeed regardless of delivery");
    assert_eq!(report.enqueued, vec![ChannelKind::Webhook]);

    service.shutdown().await;
    failing.assert_calls(1);
}
