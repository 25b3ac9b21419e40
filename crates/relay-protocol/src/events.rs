//! Event types for the relay protocol.
//!
//! Every WebSocket message carries exactly one event, encoded as an object
//! with an `event` name and an optional `data` payload:
//!
//! ```json
//! {"event": "post_comment", "data": {"room_id": "42", "text": "hello"}}
//! ```

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Author of a comment or typing signal, as seen by other clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    /// User identifier.
    pub id: String,
    /// Display name.
    pub name: String,
}

/// Payload of an inbound `post_comment` event.
///
/// Only the room and text are read from the client. Unknown fields (such as
/// a forged `author`) are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostComment {
    /// Circle identifier.
    #[serde(alias = "circle_id", deserialize_with = "circle_id")]
    pub room_id: String,
    /// Comment body.
    pub text: String,
}

/// Payload of an inbound `typing` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Typing {
    /// Circle identifier.
    #[serde(alias = "circle_id", deserialize_with = "circle_id")]
    pub room_id: String,
}

/// Circle identifier carried by `join_circle` / `leave_circle`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CircleRef(pub String);

impl<'de> Deserialize<'de> for CircleRef {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        circle_id(deserializer).map(CircleRef)
    }
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Join a circle's room.
    JoinCircle(CircleRef),
    /// Leave a circle's room.
    LeaveCircle(CircleRef),
    /// Post a comment to a circle's room.
    PostComment(PostComment),
    /// Signal that the user is typing in a circle's room.
    Typing(Typing),
    /// Application-level keepalive.
    Ping,
}

impl ClientEvent {
    /// Event name as it appears on the wire.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinCircle(_) => "join_circle",
            ClientEvent::LeaveCircle(_) => "leave_circle",
            ClientEvent::PostComment(_) => "post_comment",
            ClientEvent::Typing(_) => "typing",
            ClientEvent::Ping => "ping",
        }
    }

    /// Create a `join_circle` event.
    #[must_use]
    pub fn join(circle_id: impl Into<String>) -> Self {
        ClientEvent::JoinCircle(CircleRef(circle_id.into()))
    }

    /// Create a `leave_circle` event.
    #[must_use]
    pub fn leave(circle_id: impl Into<String>) -> Self {
        ClientEvent::LeaveCircle(CircleRef(circle_id.into()))
    }

    /// Create a `post_comment` event.
    #[must_use]
    pub fn post(circle_id: impl Into<String>, text: impl Into<String>) -> Self {
        ClientEvent::PostComment(PostComment {
            room_id: circle_id.into(),
            text: text.into(),
        })
    }

    /// Create a `typing` event.
    #[must_use]
    pub fn typing(circle_id: impl Into<String>) -> Self {
        ClientEvent::Typing(Typing {
            room_id: circle_id.into(),
        })
    }
}

/// Sent once after a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connected {
    /// Server-assigned connection identifier.
    pub connection_id: String,
    /// Identity attached from the credential.
    pub user: Author,
    /// Interval at which the server pings, in milliseconds.
    pub heartbeat: u64,
}

/// A comment fanned out to room members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewComment {
    /// Server-assigned comment identifier.
    pub id: String,
    /// Circle identifier.
    pub room_id: String,
    /// Comment body.
    pub text: String,
    /// Author taken from the poster's credential.
    pub author: Author,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Someone else in the room is typing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTyping {
    /// Circle identifier.
    pub room_id: String,
    pub author_id: String,
    pub author_name: String,
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected(Connected),
    NewComment(NewComment),
    UserTyping(UserTyping),
    Pong,
}

impl ServerEvent {
    /// Event name as it appears on the wire.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected(_) => "connected",
            ServerEvent::NewComment(_) => "new_comment",
            ServerEvent::UserTyping(_) => "user_typing",
            ServerEvent::Pong => "pong",
        }
    }
}

/// Accept a circle id given either as a string or as an integer.
///
/// Browser clients frequently pass numeric database ids straight through.
fn circle_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    struct CircleIdVisitor;

    impl<'de> Visitor<'de> for CircleIdVisitor {
        type Value = String;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a circle id as a string or integer")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_string<E: de::Error>(self, v: String) -> Result<String, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<String, E> {
            Ok(v.to_string())
        }
    }

    deserializer.deserialize_any(CircleIdVisitor)
}
