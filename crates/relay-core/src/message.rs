//! Messages routed through rooms.

use crate::identity::{ConnectionId, Identity};
use crate::room::RoomId;
use circle_relay_protocol::{NewComment, ServerEvent, UserTyping};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Atomic counter for ensuring unique IDs even within the same millisecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Generate a unique message ID.
///
/// The counter makes IDs unique within the process; the timestamp prefix
/// keeps them roughly sortable across restarts.
#[must_use]
pub fn generate_message_id(timestamp: u64) -> String {
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:06x}", timestamp, counter)
}

/// What a routed message carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// A comment posted to the room.
    Comment { text: String },
    /// The author is typing.
    Typing,
}

/// A message routed to the members of one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Server-assigned identifier.
    pub id: String,
    /// Target room.
    pub room: RoomId,
    /// Connection that produced the message.
    pub source: ConnectionId,
    /// Identity attached to the source connection.
    pub author: Identity,
    pub kind: MessageKind,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Message {
    /// Create a comment message.
    #[must_use]
    pub fn comment(
        room: RoomId,
        source: ConnectionId,
        author: Identity,
        text: impl Into<String>,
    ) -> Self {
        Self::new(room, source, author, MessageKind::Comment { text: text.into() })
    }

    /// Create a typing signal.
    #[must_use]
    pub fn typing(room: RoomId, source: ConnectionId, author: Identity) -> Self {
        Self::new(room, source, author, MessageKind::Typing)
    }

    fn new(room: RoomId, source: ConnectionId, author: Identity, kind: MessageKind) -> Self {
        let timestamp = now_millis();
        Self {
            id: generate_message_id(timestamp),
            room,
            source,
            author,
            kind,
            timestamp,
        }
    }

    /// Whether delivery skips the source connection.
    #[must_use]
    pub fn excludes_source(&self) -> bool {
        matches!(self.kind, MessageKind::Typing)
    }

    /// Build the outbound wire event for this message.
    #[must_use]
    pub fn to_event(&self) -> ServerEvent {
        match &self.kind {
            MessageKind::Comment { text } => ServerEvent::NewComment(NewComment {
                id: self.id.clone(),
                room_id: self.room.circle_id().to_string(),
                text: text.clone(),
                author: (&self.author).into(),
                timestamp: self.timestamp,
            }),
            MessageKind::Typing => ServerEvent::UserTyping(UserTyping {
                room_id: self.room.circle_id().to_string(),
                author_id: self.author.id.clone(),
                author_name: self.author.name.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomId {
        RoomId::for_circle("42").unwrap()
    }

    #[test]
    fn test_comment_event() {
        let msg = Message::comment(room(), "conn-1".into(), Identity::new("u1", "Alice"), "hi");
        assert!(!msg.excludes_source());

        match msg.to_event() {
            ServerEvent::NewComment(comment) => {
                assert_eq!(comment.id, msg.id);
                assert_eq!(comment.room_id, "42");
                assert_eq!(comment.text, "hi");
                assert_eq!(comment.author.id, "u1");
                assert_eq!(comment.timestamp, msg.timestamp);
            }
            other => panic!("Expected new_comment, got {:?}", other),
        }
    }

    #[test]
    fn test_typing_event() {
        let msg = Message::typing(room(), "conn-1".into(), Identity::new("u1", "Alice"));
        assert!(msg.excludes_source());
        assert!(matches!(msg.to_event(), ServerEvent::UserTyping(_)));
    }

    #[test]
    fn test_unique_message_ids() {
        let id1 = generate_message_id(1);
        let id2 = generate_message_id(1);
        assert_ne!(id1, id2);
    }
}
