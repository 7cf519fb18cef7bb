use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::moderation::{MuteStatus, RecordOutcome, ToxicityScores};

pub const SYSTEM_SENDER: &str = "System";
pub const MAX_CONTENT_CHARS: usize = 4096;
pub const MAX_SENDER_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Chat,
    System,
    Join,
    Leave,
    Error,
    Delete,
    Sync,
    Warning,
    Muted,
    Unmuted,
    MuteStatus,
    MuteRejected,
}

/// Mute details attached to warning/muted/unmuted/mute_status events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MuteInfo {
    #[serde(flatten)]
    pub status: MuteStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings_until_mute: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub toxic_threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mute_duration_minutes: Option<i64>,
}

impl From<MuteStatus> for MuteInfo {
    fn from(status: MuteStatus) -> Self {
        MuteInfo {
            status,
            warnings_until_mute: None,
            toxic_threshold: None,
            mute_duration_minutes: None,
        }
    }
}

impl From<&RecordOutcome> for MuteInfo {
    fn from(outcome: &RecordOutcome) -> Self {
        MuteInfo {
            status: outcome.status.clone(),
            warnings_until_mute: Some(outcome.warnings_until_mute),
            toxic_threshold: Some(outcome.toxic_threshold),
            mute_duration_minutes: Some(outcome.mute_duration_minutes),
        }
    }
}

/// Everything the server pushes down a socket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub content: String,
    pub sender: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub toxicity: Option<ToxicityScores>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mute_info: Option<MuteInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl ChatEvent {
    pub fn new(kind: EventKind, content: impl Into<String>, sender: impl Into<String>) -> ChatEvent {
        ChatEvent {
            kind,
            content: content.into(),
            sender: sender.into(),
            timestamp: OffsetDateTime::now_utc(),
            room_id: None,
            users: None,
            toxicity: None,
            mute_info: None,
            message_id: None,
            username: None,
        }
    }

    pub fn system(kind: EventKind, content: impl Into<String>) -> ChatEvent {
        ChatEvent::new(kind, content, SYSTEM_SENDER)
    }

    pub fn chat(content: &str, sender: &str, room_id: &str, toxicity: ToxicityScores, message_id: Option<i64>) -> ChatEvent {
        let mut event = ChatEvent::new(EventKind::Chat, content, sender).in_room(room_id);
        event.toxicity = Some(toxicity);
        event.message_id = message_id;
        event
    }

    pub fn in_room(mut self, room_id: &str) -> ChatEvent {
        self.room_id = Some(room_id.to_owned());
        self
    }

    pub fn with_users(mut self, users: Vec<String>) -> ChatEvent {
        self.users = Some(users);
        self
    }

    pub fn with_mute_info(mut self, info: impl Into<MuteInfo>) -> ChatEvent {
        self.mute_info = Some(info.into());
        self
    }

    pub fn with_message_id(mut self, message_id: i64) -> ChatEvent {
        self.message_id = Some(message_id);
        self
    }

    pub fn about(mut self, username: &str) -> ChatEvent {
        self.username = Some(username.to_owned());
        self
    }
}

/// Envelope a client sends. Every field is optional; the sender is always
/// taken from the authenticated connection, never from the payload.
#[derive(Debug, Default, Deserialize)]
pub struct InboundPayload {
    #[serde(rename = "type", default)]
    pub kind: Option<EventKind>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub message_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Chat(String),
    Delete(i64),
}

impl Inbound {
    /// Anything that isn't a JSON envelope is chat text, verbatim.
    pub fn parse(raw: &str) -> Inbound {
        match serde_json::from_str::<InboundPayload>(raw) {
            Ok(InboundPayload { kind: Some(EventKind::Delete), message_id: Some(id), .. }) => Inbound::Delete(id),
            Ok(InboundPayload { content, .. }) => Inbound::Chat(content.unwrap_or_default()),
            Err(_) => Inbound::Chat(raw.to_owned()),
        }
    }
}

pub fn valid_content(content: &str) -> bool {
    let chars = content.chars().count();
    (1..=MAX_CONTENT_CHARS).contains(&chars)
}

pub fn valid_sender(sender: &str) -> bool {
    let chars = sender.chars().count();
    (1..=MAX_SENDER_CHARS).contains(&chars)
}
