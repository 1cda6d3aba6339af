//! Durable per-instance configuration blob and its storage backends.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use relay_channels::{ChannelConfig, ChannelKind};
use relay_core::write_json_atomic;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::session_engine::SessionIntegration;

pub const INSTANCE_CONFIG_SCHEMA_VERSION: u32 = 1;

fn instance_config_schema_version() -> u32 {
    INSTANCE_CONFIG_SCHEMA_VERSION
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
/// Baseline behaviour applied to the session of one instance.
pub struct InstanceSettings {
    #[serde(default)]
    pub reject_call: bool,
    #[serde(default)]
    pub msg_call: String,
    #[serde(default)]
    pub groups_ignore: bool,
    #[serde(default)]
    pub always_online: bool,
    #[serde(default)]
    pub read_messages: bool,
    #[serde(default)]
    pub read_status: bool,
    #[serde(default)]
    pub sync_full_history: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub instance_name: String,
    pub instance_id: String,
    pub integration: SessionIntegration,
    #[serde(default)]
    pub number: Option<String>,
    pub created_unix_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Everything persisted for one instance, written as a single unit.
pub struct InstanceConfigBlob {
    #[serde(default = "instance_config_schema_version")]
    pub schema_version: u32,
    pub identity: InstanceIdentity,
    #[serde(default)]
    pub channels: BTreeMap<ChannelKind, ChannelConfig>,
    #[serde(default)]
    pub settings: InstanceSettings,
    pub credential_hash: String,
    #[serde(default)]
    pub token_fingerprint: String,
}

#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn get(&self, instance_name: &str) -> Result<Option<InstanceConfigBlob>>;
    async fn put(&self, instance_name: &str, blob: &InstanceConfigBlob) -> Result<()>;
    async fn delete(&self, instance_name: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryInstanceRepository {
    blobs: RwLock<HashMap<String, InstanceConfigBlob>>,
}

impl InMemoryInstanceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl InstanceRepository for InMemoryInstanceRepository {
    async fn get(&self, instance_name: &str) -> Result<Option<InstanceConfigBlob>> {
        Ok(self.blobs.read().await.get(instance_name).cloned())
    }

    async fn put(&self, instance_name: &str, blob: &InstanceConfigBlob) -> Result<()> {
        self.blobs
            .write()
            .await
            .insert(instance_name.to_string(), blob.clone());
        Ok(())
    }

    async fn delete(&self, instance_name: &str) -> Result<()> {
        self.blobs.write().await.remove(instance_name);
        Ok(())
    }
}

#[derive(Debug, Clone)]
/// One pretty-printed JSON file per instance under `root`.
pub struct FileInstanceRepository {
    root: PathBuf,
}

impl FileInstanceRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    fn path_for(&self, instance_name: &str) -> Result<PathBuf> {
        if instance_name.is_empty()
            || instance_name.starts_with('.')
            || instance_name.contains(['/', '\\'])
        {
            bail!("instance name '{instance_name}' cannot be used as a file name");
        }
        Ok(self.root.join(format!("{instance_name}.json")))
    }
}

#[async_trait]
impl InstanceRepository for FileInstanceRepository {
    async fn get(&self, instance_name: &str) -> Result<Option<InstanceConfigBlob>> {
        let path = self.path_for(instance_name)?;
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read instance config {}", path.display()))?;
        let parsed = serde_json::from_str::<InstanceConfigBlob>(&raw)
            .with_context(|| format!("failed to parse instance config {}", path.display()))?;
        if parsed.schema_version != INSTANCE_CONFIG_SCHEMA_VERSION {
            bail!(
                "unsupported instance config schema_version {} in {} (expected {})",
                parsed.schema_version,
                path.display(),
                INSTANCE_CONFIG_SCHEMA_VERSION
            );
        }
        Ok(Some(parsed))
    }

    async fn put(&self, instance_name: &str, blob: &InstanceConfigBlob) -> Result<()> {
        let path = self.path_for(instance_name)?;
        write_json_atomic(&path, blob)
            .with_context(|| format!("failed to write instance config {}", path.display()))
    }

    async fn delete(&self, instance_name: &str) -> Result<()> {
        let path = self.path_for(instance_name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error)
                .with_context(|| format!("failed to delete instance config {}", path.display())),
        }
    }
}
