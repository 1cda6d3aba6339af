//! Caller-supplied channel requests and their resolution into [`ChannelConfig`].
//!
//! Requests carry raw event names and optional fields. Resolution adopts the
//! default catalog when no events are named, otherwise exactly the named set,
//! and validates destinations of enabled channels.

use std::collections::BTreeMap;

use relay_events::{resolve_event_filter, EventKind};
use serde::{Deserialize, Serialize};

use crate::channel_config::{
    validate_destination_url, ChannelConfig, ChannelConfigError, ChannelDestination,
    ChannelKind, ChatwootDestination, TypebotDestination, WebhookDestination,
};

fn resolve_events(kind: ChannelKind, events: &[String]) -> Result<Vec<EventKind>, ChannelConfigError> {
    resolve_event_filter(events).map_err(|error| ChannelConfigError::UnknownEvent {
        channel: kind,
        name: error.name,
    })
}

fn non_empty(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|value| !value.is_empty())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
/// Enable flag plus event filter, for channels without an address.
pub struct ToggleRequest {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookRequest {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub by_events: bool,
    #[serde(default)]
    pub base64: bool,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
/// CRM-sync request. Supplying any of `account_id`, `token` or `url` opts in and
/// makes all three plus the three behaviour flags mandatory.
pub struct ChatwootRequest {
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub sign_msg: Option<bool>,
    #[serde(default)]
    pub reopen_conversation: Option<bool>,
    #[serde(default)]
    pub conversation_pending: Option<bool>,
    #[serde(default)]
    pub name_inbox: Option<String>,
    #[serde(default)]
    pub import_contacts: bool,
    #[serde(default)]
    pub events: Vec<String>,
}

impl ChatwootRequest {
    pub fn is_requested(&self) -> bool {
        non_empty(self.account_id.as_deref()).is_some()
            || non_empty(self.token.as_deref()).is_some()
            || non_empty(self.url.as_deref()).is_some()
    }

    fn required_text(field: &'static str, value: Option<&str>) -> Result<String, ChannelConfigError> {
        non_empty(value)
            .map(str::to_string)
            .ok_or(ChannelConfigError::MissingField {
                channel: ChannelKind::Chatwoot,
                field,
            })
    }

    fn required_flag(field: &'static str, value: Option<bool>) -> Result<bool, ChannelConfigError> {
        value.ok_or(ChannelConfigError::MissingField {
            channel: ChannelKind::Chatwoot,
            field,
        })
    }

    /// Strict validation applied whenever [`Self::is_requested`] is true.
    pub fn validate_strict(&self) -> Result<ChatwootDestination, ChannelConfigError> {
        let account_id = Self::required_text("account_id", self.account_id.as_deref())?;
        let token = Self::required_text("token", self.token.as_deref())?;
        let url = Self::required_text("url", self.url.as_deref())?;
        validate_destination_url(ChannelKind::Chatwoot, &url)?;
        let sign_msg = Self::required_flag("sign_msg", self.sign_msg)?;
        let reopen_conversation =
            Self::required_flag("reopen_conversation", self.reopen_conversation)?;
        let conversation_pending =
            Self::required_flag("conversation_pending", self.conversation_pending)?;
        Ok(ChatwootDestination {
            account_id,
            token,
            url,
            sign_msg,
            reopen_conversation,
            conversation_pending,
            name_inbox: non_empty(self.name_inbox.as_deref()).map(str::to_string),
            import_contacts: self.import_contacts,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypebotRequest {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub typebot: Option<String>,
    #[serde(default)]
    pub expire_minutes: u32,
    #[serde(default)]
    pub keyword_finish: String,
    #[serde(default)]
    pub delay_message_ms: u64,
    #[serde(default)]
    pub unknown_message: String,
    #[serde(default)]
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
/// One channel configuration call as issued by the request layer.
pub enum ChannelRequest {
    Webhook(WebhookRequest),
    Websocket(ToggleRequest),
    Rabbitmq(ToggleRequest),
    Sqs(ToggleRequest),
    Chatwoot(ChatwootRequest),
    Typebot(TypebotRequest),
}

impl ChannelRequest {
    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::Webhook(_) => ChannelKind::Webhook,
            Self::Websocket(_) => ChannelKind::Websocket,
            Self::Rabbitmq(_) => ChannelKind::Rabbitmq,
            Self::Sqs(_) => ChannelKind::Sqs,
            Self::Chatwoot(_) => ChannelKind::Chatwoot,
            Self::Typebot(_) => ChannelKind::Typebot,
        }
    }

    /// Resolves events and destination; enabled channels get their destination validated.
    pub fn resolve(&self) -> Result<ChannelConfig, ChannelConfigError> {
        let kind = self.kind();
        let config = match self {
            Self::Webhook(request) => ChannelConfig {
                enabled: request.enabled,
                events: resolve_events(kind, &request.events)?,
                destination: ChannelDestination::Webhook(WebhookDestination {
                    url: request.url.clone().unwrap_or_default().trim().to_string(),
                    by_events: request.by_events,
                    base64: request.base64,
                    headers: request.headers.clone(),
                }),
            },
            Self::Websocket(request) | Self::Rabbitmq(request) | Self::Sqs(request) => {
                ChannelConfig {
                    enabled: request.enabled,
                    events: resolve_events(kind, &request.events)?,
                    destination: ChannelDestination::empty(kind),
                }
            }
            Self::Chatwoot(request) => {
                let events = resolve_events(kind, &request.events)?;
                if !request.is_requested() {
                    ChannelConfig {
                        enabled: false,
                        events,
                        destination: ChannelDestination::empty(kind),
                    }
                } else {
                    ChannelConfig {
                        enabled: true,
                        events,
                        destination: ChannelDestination::Chatwoot(request.validate_strict()?),
                    }
                }
            }
            Self::Typebot(request) => ChannelConfig {
                enabled: request.enabled,
                events: resolve_events(kind, &request.events)?,
                destination: ChannelDestination::Typebot(TypebotDestination {
                    url: request.url.clone().unwrap_or_default().trim().to_string(),
                    typebot: request.typebot.clone().unwrap_or_default().trim().to_string(),
                    expire_minutes: request.expire_minutes,
                    keyword_finish: request.keyword_finish.clone(),
                    delay_message_ms: request.delay_message_ms,
                    unknown_message: request.unknown_message.clone(),
                }),
            },
        };
        config.validate()?;
        Ok(config)
    }
}
