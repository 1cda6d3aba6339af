//! Instance lifecycle for the relay: provisioning, connection state, idle
//! eviction and teardown of messaging-session instances.
//!
//! [`RelayService`] is the entry point. It owns the [`InstanceRegistry`] and
//! drives each instance's [`ConnectionStateMachine`] and channel fan-out.

pub mod connection_state;
pub mod credentials;
pub mod error;
pub mod idle_sweep;
pub mod instance_events;
pub mod instance_record;
pub mod instance_registry;
pub mod instance_repository;
pub mod instance_teardown;
pub mod provisioning;
pub mod relay_service;
pub mod runtime_config;
pub mod session_engine;

#[cfg(test)]
pub(crate) mod test_support;

pub use connection_state::{ConnectionSnapshot, ConnectionState, ConnectionStateMachine};
pub use credentials::{credential_hash, generate_token, token_fingerprint};
pub use error::{InstanceError, InstanceResult};
pub use idle_sweep::IdleSweepHandle;
pub use instance_events::InstanceEvents;
pub use instance_record::{InstanceRecord, InstanceSummary};
pub use instance_registry::InstanceRegistry;
pub use instance_repository::{
    FileInstanceRepository, InMemoryInstanceRepository, InstanceConfigBlob, InstanceIdentity,
    InstanceRepository, InstanceSettings, INSTANCE_CONFIG_SCHEMA_VERSION,
};
pub use instance_teardown::{ReleaseFailure, TeardownReport};
pub use provisioning::{
    validate_instance_name, ChannelOutcome, CreateInstanceRequest, ProvisionResult,
    ProvisionedInstance, ResolvedChannel,
};
pub use relay_service::{CredentialRefresh, RelayService};
pub use runtime_config::{QrCaptureMode, RelayRuntimeConfig};
pub use session_engine::{
    EngineUpdate, QrArtifact, SessionEngine, SessionEngineFactory, SessionIntegration,
};
