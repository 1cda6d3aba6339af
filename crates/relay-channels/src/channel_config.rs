use std::collections::BTreeMap;
use std::fmt;

use relay_events::{default_events, EventKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
/// Enumerates the delivery channel variants an instance can configure.
pub enum ChannelKind {
    Webhook,
    Websocket,
    Rabbitmq,
    Sqs,
    Chatwoot,
    Typebot,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 6] = [
        ChannelKind::Webhook,
        ChannelKind::Websocket,
        ChannelKind::Rabbitmq,
        ChannelKind::Sqs,
        ChannelKind::Chatwoot,
        ChannelKind::Typebot,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Websocket => "websocket",
            Self::Rabbitmq => "rabbitmq",
            Self::Sqs => "sqs",
            Self::Chatwoot => "chatwoot",
            Self::Typebot => "typebot",
        }
    }

    /// Queue-backed channels own broker resources that teardown releases.
    pub fn is_queue(self) -> bool {
        matches!(self, Self::Rabbitmq | Self::Sqs)
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Validation failures raised while resolving a channel configuration.
pub enum ChannelConfigError {
    #[error("{channel} destination '{value}' is not a well-formed http(s) url: {detail}")]
    InvalidDestination {
        channel: ChannelKind,
        value: String,
        detail: String,
    },
    #[error("{channel} requires field '{field}'")]
    MissingField {
        channel: ChannelKind,
        field: &'static str,
    },
    #[error("{channel} subscribes to unknown event '{name}'")]
    UnknownEvent { channel: ChannelKind, name: String },
    #[error("configuration for {actual} cannot be applied to the {expected} adapter")]
    KindMismatch {
        expected: ChannelKind,
        actual: ChannelKind,
    },
}

impl ChannelConfigError {
    pub fn channel(&self) -> ChannelKind {
        match self {
            Self::InvalidDestination { channel, .. }
            | Self::MissingField { channel, .. }
            | Self::UnknownEvent { channel, .. } => *channel,
            Self::KindMismatch { expected, .. } => *expected,
        }
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::InvalidDestination { .. } => "channel_invalid_destination",
            Self::MissingField { .. } => "channel_missing_field",
            Self::UnknownEvent { .. } => "channel_unknown_event",
            Self::KindMismatch { .. } => "channel_kind_mismatch",
        }
    }
}

/// Accepts absolute `http`/`https` urls with a host.
pub fn validate_destination_url(channel: ChannelKind, raw: &str) -> Result<Url, ChannelConfigError> {
    let invalid = |detail: String| ChannelConfigError::InvalidDestination {
        channel,
        value: raw.to_string(),
        detail,
    };
    let url = Url::parse(raw.trim()).map_err(|error| invalid(error.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookDestination {
    pub url: String,
    #[serde(default)]
    pub by_events: bool,
    /// Media in event data is inlined as base64; posted bodies carry `"base64": true`.
    #[serde(default)]
    pub base64: bool,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl WebhookDestination {
    /// Target url for one event; `by_events` routes each kind to its own path segment.
    pub fn url_for(&self, event: EventKind) -> String {
        let base = self.url.trim();
        if !self.by_events {
            return base.to_string();
        }
        format!("{}/{}", base.trim_end_matches('/'), event.route_segment())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatwootDestination {
    pub account_id: String,
    pub token: String,
    pub url: String,
    pub sign_msg: bool,
    pub reopen_conversation: bool,
    pub conversation_pending: bool,
    #[serde(default)]
    pub name_inbox: Option<String>,
    #[serde(default)]
    pub import_contacts: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypebotDestination {
    pub url: String,
    pub typebot: String,
    #[serde(default)]
    pub expire_minutes: u32,
    #[serde(default)]
    pub keyword_finish: String,
    #[serde(default)]
    pub delay_message_ms: u64,
    #[serde(default)]
    pub unknown_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
/// Adapter-specific address and credentials.
pub enum ChannelDestination {
    Webhook(WebhookDestination),
    Websocket,
    Rabbitmq,
    Sqs,
    Chatwoot(ChatwootDestination),
    Typebot(TypebotDestination),
}

impl ChannelDestination {
    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::Webhook(_) => ChannelKind::Webhook,
            Self::Websocket => ChannelKind::Websocket,
            Self::Rabbitmq => ChannelKind::Rabbitmq,
            Self::Sqs => ChannelKind::Sqs,
            Self::Chatwoot(_) => ChannelKind::Chatwoot,
            Self::Typebot(_) => ChannelKind::Typebot,
        }
    }

    /// Empty destination for a kind, used for disabled placeholders.
    pub fn empty(kind: ChannelKind) -> Self {
        match kind {
            ChannelKind::Webhook => Self::Webhook(WebhookDestination::default()),
            ChannelKind::Websocket => Self::Websocket,
            ChannelKind::Rabbitmq => Self::Rabbitmq,
            ChannelKind::Sqs => Self::Sqs,
            ChannelKind::Chatwoot => Self::Chatwoot(ChatwootDestination::default()),
            ChannelKind::Typebot => Self::Typebot(TypebotDestination::default()),
        }
    }

    fn validate(&self) -> Result<(), ChannelConfigError> {
        match self {
            Self::Webhook(webhook) => {
                require_text(ChannelKind::Webhook, "url", &webhook.url)?;
                validate_destination_url(ChannelKind::Webhook, &webhook.url)?;
            }
            Self::Websocket | Self::Rabbitmq | Self::Sqs => {}
            Self::Chatwoot(chatwoot) => {
                require_text(ChannelKind::Chatwoot, "account_id", &chatwoot.account_id)?;
                require_text(ChannelKind::Chatwoot, "token", &chatwoot.token)?;
                require_text(ChannelKind::Chatwoot, "url", &chatwoot.url)?;
                validate_destination_url(ChannelKind::Chatwoot, &chatwoot.url)?;
            }
            Self::Typebot(typebot) => {
                require_text(ChannelKind::Typebot, "url", &typebot.url)?;
                validate_destination_url(ChannelKind::Typebot, &typebot.url)?;
                require_text(ChannelKind::Typebot, "typebot", &typebot.typebot)?;
            }
        }
        Ok(())
    }
}

pub(crate) fn require_text(
    channel: ChannelKind,
    field: &'static str,
    value: &str,
) -> Result<(), ChannelConfigError> {
    if value.trim().is_empty() {
        return Err(ChannelConfigError::MissingField { channel, field });
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Resolved per-channel configuration cached on the instance and persisted with it.
pub struct ChannelConfig {
    pub enabled: bool,
    pub events: Vec<EventKind>,
    pub destination: ChannelDestination,
}

impl ChannelConfig {
    /// Disabled placeholder subscribed to the default catalog.
    pub fn disabled(kind: ChannelKind) -> Self {
        Self {
            enabled: false,
            events: default_events(),
            destination: ChannelDestination::empty(kind),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.destination.kind()
    }

    pub fn subscribes(&self, event: EventKind) -> bool {
        self.enabled && self.events.contains(&event)
    }

    /// Enabled configs must carry a well-formed destination; disabled ones are stored as given.
    pub fn validate(&self) -> Result<(), ChannelConfigError> {
        if !self.enabled {
            return Ok(());
        }
        self.destination.validate()
    }
}
