use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;
use tungstenite::Message;

use crate::utils::error::ChatError;

/// Represents different types of errors that can occur when decoding or
/// validating protocol messages.
#[derive(Error, Debug)]
pub enum MessageError {
    /// The frame was not a JSON object of a known shape.
    #[error("Invalid message format")]
    InvalidFormat,

    /// The `type` field named an event the server does not accept.
    #[error("Unsupported message type: {0}")]
    UnsupportedType(String),

    /// Error when message serialization or deserialization fails.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A field is longer than allowed.
    #[error("{field} exceeds {max} characters")]
    FieldTooLong { field: &'static str, max: usize },

    /// A field is empty once trimmed.
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
}

/// Identifier assigned by the durable store.
///
/// Totally ordered; travels over the wire as a decimal string so it can be
/// handed back verbatim as a pagination cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(MessageId)
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A validated message that has not been persisted yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub room: String,
    pub username: String,
    pub content: String,
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A persisted message in its serialized (wire and cache) form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub room: String,
    pub username: String,
    pub content: String,
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Attaches the store-assigned identifier to a validated message.
    pub fn persisted(id: MessageId, message: NewMessage) -> Self {
        Self {
            id,
            room: message.room,
            username: message.username,
            content: message.content,
            avatar: message.avatar,
            created_at: message.created_at,
        }
    }
}

/// A candidate chat post as submitted by a client, before validation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PostEvent {
    #[serde(default = "anonymous")]
    pub username: String,
    pub content: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

fn anonymous() -> String {
    "anon".to_string()
}

/// Events a client may send over its connection.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Keeps the user's presence entry fresh.
    Heartbeat { username: String },
    /// A chat message to persist and fan out.
    Post(PostEvent),
}

#[derive(Deserialize)]
struct RawInbound {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(flatten)]
    rest: Value,
}

impl InboundEvent {
    /// Decodes one inbound text frame.
    ///
    /// Frames without a `type` (or with `"type": "message"`) are posts;
    /// `"type": "heartbeat"` frames carry only a username. Anything else is an
    /// error, which the connection handler treats as a silent drop.
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| MessageError::SerializationError(e.to_string()))?;
        if !value.is_object() {
            return Err(MessageError::InvalidFormat);
        }

        let raw: RawInbound =
            serde_json::from_value(value).map_err(|_| MessageError::InvalidFormat)?;

        match raw.kind.as_deref() {
            Some("heartbeat") => {
                let username = raw
                    .rest
                    .get("username")
                    .and_then(Value::as_str)
                    .ok_or(MessageError::InvalidFormat)?;
                Ok(InboundEvent::Heartbeat {
                    username: username.to_string(),
                })
            }
            None | Some("message") => serde_json::from_value(raw.rest)
                .map(InboundEvent::Post)
                .map_err(|_| MessageError::InvalidFormat),
            Some(other) => Err(MessageError::UnsupportedType(other.to_string())),
        }
    }
}

/// Represents messages that the server sends to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Recent messages of the room, oldest first. Sent once on join.
    History { items: Vec<ChatMessage> },

    /// A newly created message fanned out to the room.
    Message { item: ChatMessage },

    /// A policy rejection, sent only to the offending connection.
    Error { detail: String },
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, ChatError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Converts a `ServerMessage` into a Tungstenite text frame.
impl TryFrom<ServerMessage> for Message {
    type Error = ChatError;

    fn try_from(msg: ServerMessage) -> Result<Self, Self::Error> {
        Ok(Message::Text(msg.to_json()?))
    }
}

/// Creates a WebSocket error message with a given detail string.
pub fn create_error_message(detail: &str) -> Result<Message, ChatError> {
    ServerMessage::Error {
        detail: detail.to_string(),
    }
    .try_into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untyped_frame_is_a_post() {
        let event = InboundEvent::parse(r#"{"username":"alice","content":"hi"}"#).unwrap();
        assert_eq!(
            event,
            InboundEvent::Post(PostEvent {
                username: "alice".into(),
                content: "hi".into(),
                avatar: None,
            })
        );
    }

    #[test]
    fn post_without_username_defaults_to_anon() {
        match InboundEvent::parse(r#"{"type":"message","content":"hey","avatar":"a.png"}"#) {
            Ok(InboundEvent::Post(post)) => {
                assert_eq!(post.username, "anon");
                assert_eq!(post.avatar.as_deref(), Some("a.png"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn heartbeat_frame() {
        let event = InboundEvent::parse(r#"{"type":"heartbeat","username":"bob"}"#).unwrap();
        assert_eq!(
            event,
            InboundEvent::Heartbeat {
                username: "bob".into()
            }
        );
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(InboundEvent::parse("not json").is_err());
        assert!(InboundEvent::parse(r#"["alice","hi"]"#).is_err());
        assert!(InboundEvent::parse(r#"{"username":"alice"}"#).is_err());
        assert!(InboundEvent::parse(r#"{"type":"heartbeat"}"#).is_err());
        assert!(InboundEvent::parse(r#"{"username":7,"content":"x"}"#).is_err());
        assert!(matches!(
            InboundEvent::parse(r#"{"type":"typing","username":"a"}"#),
            Err(MessageError::UnsupportedType(_))
        ));
    }

    #[test]
    fn serialized_message_shape() {
        let created_at = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let msg = ServerMessage::Message {
            item: ChatMessage {
                id: MessageId(42),
                room: "lobby".into(),
                username: "alice".into(),
                content: "hi".into(),
                avatar: None,
                created_at,
            },
        };
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["item"]["id"], "42");
        assert_eq!(value["item"]["avatar"], Value::Null);
        assert_eq!(value["item"]["created_at"], "2024-05-01T12:00:00Z");

        let back: ServerMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }
}
