//! Seam to the chat-protocol session engine.
//!
//! The engine itself lives outside this crate. An instance picks one of two
//! engine variants through its [`SessionIntegration`] tag; both expose the same
//! capability surface and report progress as [`EngineUpdate`]s.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
/// Selects the session engine variant backing an instance.
pub enum SessionIntegration {
    /// Standard multi-device session paired through a QR code.
    #[default]
    Baileys,
    /// Token-based business API session; needs a number and token up front.
    BusinessApi,
}

impl SessionIntegration {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baileys => "baileys",
            Self::BusinessApi => "business_api",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Pairing material issued while a session is connecting.
pub struct QrArtifact {
    pub code: String,
    pub base64: String,
    #[serde(default)]
    pub pairing_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Progress reported by an engine for one connect cycle.
pub enum EngineUpdate {
    Qr(QrArtifact),
    Opened,
    Closed { reason: String },
}

#[async_trait]
pub trait SessionEngine: Send + Sync {
    /// Starts a session. Progress arrives on `updates` until the cycle ends.
    ///
    /// Sends on `updates` never wait, so progress may be reported before
    /// `connect` returns.
    async fn connect(
        &self,
        number: Option<&str>,
        updates: mpsc::UnboundedSender<EngineUpdate>,
    ) -> Result<()>;

    async fn logout(&self) -> Result<()>;

    /// Tears the live session down so a fresh connect cycle can follow.
    async fn reload(&self) -> Result<()>;

    fn current_qr(&self) -> Option<QrArtifact>;
}

/// Builds the engine variant selected by an integration tag.
pub trait SessionEngineFactory: Send + Sync {
    fn build(
        &self,
        integration: SessionIntegration,
        instance_name: &str,
    ) -> Result<Arc<dyn SessionEngine>>;
}
