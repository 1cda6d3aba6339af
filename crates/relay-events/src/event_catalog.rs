use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
/// Enumerates the closed set of events an instance can emit.
pub enum EventKind {
    ApplicationStartup,
    InstanceCreate,
    InstanceDelete,
    QrcodeUpdated,
    MessagesSet,
    MessagesUpsert,
    MessagesUpdate,
    MessagesDelete,
    SendMessage,
    ContactsSet,
    ContactsUpsert,
    ContactsUpdate,
    PresenceUpdate,
    ChatsSet,
    ChatsUpsert,
    ChatsUpdate,
    ChatsDelete,
    GroupsUpsert,
    GroupUpdate,
    GroupParticipantsUpdate,
    ConnectionUpdate,
    LabelsEdit,
    LabelsAssociation,
    Call,
    NewJwtToken,
    TypebotStart,
    TypebotChangeStatus,
}

const DEFAULT_EVENTS: [EventKind; 27] = [
    EventKind::ApplicationStartup,
    EventKind::InstanceCreate,
    EventKind::InstanceDelete,
    EventKind::QrcodeUpdated,
    EventKind::MessagesSet,
    EventKind::MessagesUpsert,
    EventKind::MessagesUpdate,
    EventKind::MessagesDelete,
    EventKind::SendMessage,
    EventKind::ContactsSet,
    EventKind::ContactsUpsert,
    EventKind::ContactsUpdate,
    EventKind::PresenceUpdate,
    EventKind::ChatsSet,
    EventKind::ChatsUpsert,
    EventKind::ChatsUpdate,
    EventKind::ChatsDelete,
    EventKind::GroupsUpsert,
    EventKind::GroupUpdate,
    EventKind::GroupParticipantsUpdate,
    EventKind::ConnectionUpdate,
    EventKind::LabelsEdit,
    EventKind::LabelsAssociation,
    EventKind::Call,
    EventKind::NewJwtToken,
    EventKind::TypebotStart,
    EventKind::TypebotChangeStatus,
];

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ApplicationStartup => "APPLICATION_STARTUP",
            Self::InstanceCreate => "INSTANCE_CREATE",
            Self::InstanceDelete => "INSTANCE_DELETE",
            Self::QrcodeUpdated => "QRCODE_UPDATED",
            Self::MessagesSet => "MESSAGES_SET",
            Self::MessagesUpsert => "MESSAGES_UPSERT",
            Self::MessagesUpdate => "MESSAGES_UPDATE",
            Self::MessagesDelete => "MESSAGES_DELETE",
            Self::SendMessage => "SEND_MESSAGE",
            Self::ContactsSet => "CONTACTS_SET",
            Self::ContactsUpsert => "CONTACTS_UPSERT",
            Self::ContactsUpdate => "CONTACTS_UPDATE",
            Self::PresenceUpdate => "PRESENCE_UPDATE",
            Self::ChatsSet => "CHATS_SET",
            Self::ChatsUpsert => "CHATS_UPSERT",
            Self::ChatsUpdate => "CHATS_UPDATE",
            Self::ChatsDelete => "CHATS_DELETE",
            Self::GroupsUpsert => "GROUPS_UPSERT",
            Self::GroupUpdate => "GROUP_UPDATE",
            Self::GroupParticipantsUpdate => "GROUP_PARTICIPANTS_UPDATE",
            Self::ConnectionUpdate => "CONNECTION_UPDATE",
            Self::LabelsEdit => "LABELS_EDIT",
            Self::LabelsAssociation => "LABELS_ASSOCIATION",
            Self::Call => "CALL",
            Self::NewJwtToken => "NEW_JWT_TOKEN",
            Self::TypebotStart => "TYPEBOT_START",
            Self::TypebotChangeStatus => "TYPEBOT_CHANGE_STATUS",
        }
    }

    /// Dotted lowercase name carried in delivered envelopes, e.g. `messages.upsert`.
    pub fn delivery_name(self) -> String {
        self.as_str().to_ascii_lowercase().replace('_', ".")
    }

    /// Path segment used when a webhook routes by event, e.g. `messages-upsert`.
    pub fn route_segment(self) -> String {
        self.as_str().to_ascii_lowercase().replace('_', "-")
    }

    /// Every value of the closed enum is a valid kind.
    pub fn is_valid(self) -> bool {
        DEFAULT_EVENTS.contains(&self)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The default subscription, stable and ordered: the full catalog.
pub fn default_events() -> Vec<EventKind> {
    DEFAULT_EVENTS.to_vec()
}

/// Parses `MESSAGES_UPSERT`, `messages.upsert` or `messages-upsert`, case-insensitively.
pub fn parse_event_kind(raw: &str) -> Option<EventKind> {
    let normalized = raw.trim().to_ascii_uppercase().replace(['.', '-'], "_");
    if normalized.is_empty() {
        return None;
    }
    DEFAULT_EVENTS
        .iter()
        .copied()
        .find(|kind| kind.as_str() == normalized)
}

pub fn is_valid_event_name(raw: &str) -> bool {
    parse_event_kind(raw).is_some()
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Returned when a requested subscription names an event outside the catalog.
pub struct UnknownEventError {
    pub name: String,
}

impl fmt::Display for UnknownEventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event '{}'", self.name)
    }
}

impl std::error::Error for UnknownEventError {}

/// Resolves a requested subscription: empty adopts [`default_events`], otherwise
/// exactly the requested kinds in request order with duplicates removed.
pub fn resolve_event_filter<S: AsRef<str>>(
    requested: &[S],
) -> Result<Vec<EventKind>, UnknownEventError> {
    let requested: Vec<&str> = requested
        .iter()
        .map(AsRef::as_ref)
        .filter(|name| !name.trim().is_empty())
        .collect();
    if requested.is_empty() {
        return Ok(default_events());
    }
    let mut seen = HashSet::new();
    let mut resolved = Vec::with_capacity(requested.len());
    for name in requested {
        let kind = parse_event_kind(name).ok_or_else(|| UnknownEventError {
            name: name.trim().to_string(),
        })?;
        if seen.insert(kind) {
            resolved.push(kind);
        }
    }
    Ok(resolved)
}
