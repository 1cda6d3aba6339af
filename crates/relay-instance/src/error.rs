use relay_channels::{ChannelConfigError, ChannelKind};
use thiserror::Error;

/// Result type for instance operations.
pub type InstanceResult<T> = Result<T, InstanceError>;

/// Errors surfaced by instance lifecycle and provisioning operations.
#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("instance '{0}' already exists")]
    Conflict(String),
    #[error("token is already assigned to another instance")]
    DuplicateToken,
    #[error("instance '{0}' not found")]
    NotFound(String),
    #[error("invalid connection state: {0}")]
    State(String),
    #[error("session engine failure: {0}")]
    Engine(String),
    #[error("{channel} configuration failed: {detail}")]
    AdapterConfig { channel: ChannelKind, detail: String },
    #[error("repository failure: {0:#}")]
    Repository(#[source] anyhow::Error),
}

impl InstanceError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "instance_validation_failed",
            Self::Conflict(_) => "instance_name_conflict",
            Self::DuplicateToken => "instance_duplicate_token",
            Self::NotFound(_) => "instance_not_found",
            Self::State(_) => "instance_invalid_state",
            Self::Engine(_) => "instance_engine_failure",
            Self::AdapterConfig { .. } => "instance_adapter_config_failed",
            Self::Repository(_) => "instance_repository_failure",
        }
    }

    /// Caller-input errors are surfaced verbatim and never retried.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::Conflict(_)
                | Self::DuplicateToken
                | Self::NotFound(_)
                | Self::State(_)
        )
    }

    pub(crate) fn engine(error: anyhow::Error) -> Self {
        Self::Engine(format!("{error:#}"))
    }

    pub(crate) fn adapter(error: &ChannelConfigError) -> Self {
        Self::AdapterConfig {
            channel: error.channel(),
            detail: error.to_string(),
        }
    }
}

impl From<ChannelConfigError> for InstanceError {
    fn from(error: ChannelConfigError) -> Self {
        Self::Validation(error.to_string())
    }
}
