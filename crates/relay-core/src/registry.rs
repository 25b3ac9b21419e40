//! Room registry for the relay.
//!
//! The registry owns all sessions and room memberships. It is constructed
//! once per process and shared by reference with the connection handlers.
//!
//! Lock order: a session entry is always taken before a room entry.

use crate::identity::{ConnectionId, Identity};
use crate::message::Message;
use crate::room::{Inbox, Outbox, Room, RoomId};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Invalid circle id.
    #[error("Invalid room: {0}")]
    InvalidRoom(&'static str),

    /// The connection was never registered or has already disconnected.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// A session with this ID is already registered.
    #[error("Connection already registered: {0}")]
    DuplicateConnection(ConnectionId),

    /// Comment text is empty or whitespace.
    #[error("Comment text is empty")]
    EmptyComment,
}

/// Per-connection state.
struct Session {
    identity: Identity,
    outbox: Outbox,
    rooms: HashSet<RoomId>,
}

/// Result of a fan-out.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The message as delivered to members.
    pub message: Arc<Message>,
    /// Number of members the message was queued for.
    pub recipients: usize,
}

/// Registry statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of non-empty rooms.
    pub room_count: usize,
    /// Number of registered connections.
    pub connection_count: usize,
    /// Total number of memberships.
    pub total_memberships: usize,
}

/// Owned registry of sessions and rooms.
#[derive(Default)]
pub struct RoomRegistry {
    /// Sessions indexed by connection.
    sessions: DashMap<ConnectionId, Session>,
    /// Rooms indexed by key.
    rooms: DashMap<RoomId, Room>,
}

impl RoomRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated connection.
    ///
    /// Returns the receiving end of the connection's outbox. Everything
    /// delivered to the connection arrives there until it disconnects.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID is already registered.
    pub fn connect(
        &self,
        connection_id: ConnectionId,
        identity: Identity,
    ) -> Result<Inbox, RegistryError> {
        let entry = match self.sessions.entry(connection_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(RegistryError::DuplicateConnection(connection_id));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => entry,
        };

        let (outbox, inbox) = mpsc::unbounded_channel();
        info!(connection = %connection_id, user = %identity, "Connected");
        entry.insert(Session {
            identity,
            outbox,
            rooms: HashSet::new(),
        });
        Ok(inbox)
    }

    /// Remove a connection and all of its memberships.
    ///
    /// Membership cleanup completes before this returns, so no broadcast
    /// started afterwards can reach the connection. Returns the rooms the
    /// connection was in; unknown connections yield an empty list.
    pub fn disconnect(&self, connection_id: &ConnectionId) -> Vec<RoomId> {
        let Some((_, session)) = self.sessions.remove(connection_id) else {
            return Vec::new();
        };

        let rooms: Vec<RoomId> = session.rooms.into_iter().collect();
        for room_id in &rooms {
            self.remove_member(room_id, connection_id);
        }

        info!(
            connection = %connection_id,
            user = %session.identity,
            rooms = rooms.len(),
            "Disconnected"
        );
        rooms
    }

    /// Add a connection to a circle's room.
    ///
    /// Joining a room the connection is already in has no effect. Returns
    /// `true` if the membership changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the circle id is invalid or the connection is
    /// unknown.
    pub fn join(&self, connection_id: &ConnectionId, circle_id: &str) -> Result<bool, RegistryError> {
        let room_id = RoomId::for_circle(circle_id).map_err(RegistryError::InvalidRoom)?;
        let mut session = self
            .sessions
            .get_mut(connection_id)
            .ok_or_else(|| RegistryError::UnknownConnection(connection_id.clone()))?;

        if !session.rooms.insert(room_id.clone()) {
            trace!(room = %room_id, connection = %connection_id, "Already a member");
            return Ok(false);
        }

        let mut room = self.rooms.entry(room_id.clone()).or_insert_with(|| {
            debug!(room = %room_id, "Creating room");
            Room::new(room_id.clone())
        });
        room.insert(connection_id.clone(), session.outbox.clone());

        debug!(
            room = %room_id,
            connection = %connection_id,
            members = room.member_count(),
            "Joined"
        );
        Ok(true)
    }

    /// Remove a connection from a circle's room.
    ///
    /// Leaving a room the connection is not in is a no-op. Returns `true` if
    /// the membership changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the circle id is invalid or the connection is
    /// unknown.
    pub fn leave(&self, connection_id: &ConnectionId, circle_id: &str) -> Result<bool, RegistryError> {
        let room_id = RoomId::for_circle(circle_id).map_err(RegistryError::InvalidRoom)?;
        let mut session = self
            .sessions
            .get_mut(connection_id)
            .ok_or_else(|| RegistryError::UnknownConnection(connection_id.clone()))?;

        if !session.rooms.remove(&room_id) {
            return Ok(false);
        }

        self.remove_member(&room_id, connection_id);
        debug!(room = %room_id, connection = %connection_id, "Left");
        Ok(true)
    }

    /// Post a comment to a circle's room.
    ///
    /// The message ID, timestamp and author are assigned here; the author is
    /// always the identity attached to the posting connection. Every current
    /// member receives the comment once, the poster included if it is a
    /// member.
    ///
    /// # Errors
    ///
    /// Returns an error if the circle id is invalid, the text is blank, or
    /// the connection is unknown.
    pub fn post(
        &self,
        connection_id: &ConnectionId,
        circle_id: &str,
        text: &str,
    ) -> Result<Delivery, RegistryError> {
        let room_id = RoomId::for_circle(circle_id).map_err(RegistryError::InvalidRoom)?;
        if text.trim().is_empty() {
            return Err(RegistryError::EmptyComment);
        }
        let author = self.identity(connection_id)?;

        Ok(self.deliver(Message::comment(
            room_id,
            connection_id.clone(),
            author,
            text,
        )))
    }

    /// Signal that a connection is typing in a circle's room.
    ///
    /// Every member except the sender receives the signal.
    ///
    /// # Errors
    ///
    /// Returns an error if the circle id is invalid or the connection is
    /// unknown.
    pub fn typing(
        &self,
        connection_id: &ConnectionId,
        circle_id: &str,
    ) -> Result<Delivery, RegistryError> {
        let room_id = RoomId::for_circle(circle_id).map_err(RegistryError::InvalidRoom)?;
        let author = self.identity(connection_id)?;

        Ok(self.deliver(Message::typing(room_id, connection_id.clone(), author)))
    }

    /// Fan a message out to the current members of its room.
    fn deliver(&self, message: Message) -> Delivery {
        let message = Arc::new(message);
        let exclude = message.excludes_source().then_some(&message.source);

        let recipients = self
            .rooms
            .get(&message.room)
            .map(|room| room.deliver(&message, exclude))
            .unwrap_or(0);

        trace!(
            room = %message.room,
            connection = %message.source,
            recipients,
            "Fanned out"
        );
        Delivery {
            message,
            recipients,
        }
    }

    /// Remove one membership from a room, deleting the room once empty.
    fn remove_member(&self, room_id: &RoomId, connection_id: &ConnectionId) {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            room.remove(connection_id);
        }
        if self.rooms.remove_if(room_id, |_, room| room.is_empty()).is_some() {
            debug!(room = %room_id, "Deleted empty room");
        }
    }

    /// Get the identity attached to a connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown.
    pub fn identity(&self, connection_id: &ConnectionId) -> Result<Identity, RegistryError> {
        self.sessions
            .get(connection_id)
            .map(|session| session.identity.clone())
            .ok_or_else(|| RegistryError::UnknownConnection(connection_id.clone()))
    }

    /// Check if a connection is a member of a circle's room.
    #[must_use]
    pub fn is_member(&self, connection_id: &ConnectionId, circle_id: &str) -> bool {
        RoomId::for_circle(circle_id)
            .ok()
            .and_then(|room_id| self.rooms.get(&room_id))
            .map(|room| room.is_member(connection_id))
            .unwrap_or(false)
    }

    /// Get the member count of a circle's room.
    #[must_use]
    pub fn member_count(&self, circle_id: &str) -> usize {
        RoomId::for_circle(circle_id)
            .ok()
            .and_then(|room_id| self.rooms.get(&room_id))
            .map(|room| room.member_count())
            .unwrap_or(0)
    }

    /// Check if a circle's room currently exists.
    #[must_use]
    pub fn room_exists(&self, circle_id: &str) -> bool {
        RoomId::for_circle(circle_id)
            .map(|room_id| self.rooms.contains_key(&room_id))
            .unwrap_or(false)
    }

    /// Get all room keys.
    #[must_use]
    pub fn room_names(&self) -> Vec<String> {
        self.rooms.iter().map(|e| e.key().to_string()).collect()
    }

    /// Get the rooms a connection is in.
    #[must_use]
    pub fn connection_rooms(&self, connection_id: &ConnectionId) -> Vec<RoomId> {
        self.sessions
            .get(connection_id)
            .map(|s| s.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            room_count: self.rooms.len(),
            connection_count: self.sessions.len(),
            total_memberships: self.sessions.iter().map(|s| s.rooms.len()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    fn connect(registry: &RoomRegistry, id: &str, name: &str) -> (ConnectionId, Inbox) {
        let conn: ConnectionId = id.into();
        let inbox = registry
            .connect(conn.clone(), Identity::new(format!("user-{id}"), name))
            .unwrap();
        (conn, inbox)
    }

    fn drain(inbox: &mut Inbox) -> Vec<Arc<Message>> {
        let mut out = Vec::new();
        while let Ok(msg) = inbox.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_join_leave() {
        let registry = RoomRegistry::new();
        let (a, _rx) = connect(&registry, "a", "Alice");

        assert!(registry.join(&a, "42").unwrap());
        assert!(registry.room_exists("42"));
        assert!(registry.is_member(&a, "42"));
        assert_eq!(registry.member_count("42"), 1);

        assert!(registry.leave(&a, "42").unwrap());
        assert!(!registry.is_member(&a, "42"));
        // Room should be auto-deleted
        assert!(!registry.room_exists("42"));

        // Leaving again is a no-op
        assert!(!registry.leave(&a, "42").unwrap());
    }

    #[test]
    fn test_join_is_idempotent() {
        let registry = RoomRegistry::new();
        let (a, mut rx_a) = connect(&registry, "a", "Alice");

        assert!(registry.join(&a, "42").unwrap());
        assert!(!registry.join(&a, "42").unwrap());
        assert_eq!(registry.member_count("42"), 1);

        let delivery = registry.post(&a, "42", "once").unwrap();
        assert_eq!(delivery.recipients, 1);
        assert_eq!(drain(&mut rx_a).len(), 1);
    }

    #[test]
    fn test_post_reaches_every_member_once() {
        let registry = RoomRegistry::new();
        let (a, mut rx_a) = connect(&registry, "a", "Alice");
        let (b, mut rx_b) = connect(&registry, "b", "Bob");
        registry.join(&a, "42").unwrap();
        registry.join(&b, "42").unwrap();

        let delivery = registry.post(&a, "42", "hello").unwrap();
        assert_eq!(delivery.recipients, 2);

        let received_b = drain(&mut rx_b);
        assert_eq!(received_b.len(), 1);
        assert_eq!(
            received_b[0].kind,
            MessageKind::Comment {
                text: "hello".into()
            }
        );
        assert_eq!(received_b[0].author, Identity::new("user-a", "Alice"));
        assert_eq!(received_b[0].room.as_str(), "circle:42");

        let received_a = drain(&mut rx_a);
        assert_eq!(received_a.len(), 1);
        assert_eq!(received_a[0].id, received_b[0].id);
    }

    #[test]
    fn test_post_from_non_member() {
        let registry = RoomRegistry::new();
        let (a, mut rx_a) = connect(&registry, "a", "Alice");
        let (b, mut rx_b) = connect(&registry, "b", "Bob");
        registry.join(&b, "42").unwrap();

        let delivery = registry.post(&a, "42", "drive-by").unwrap();
        assert_eq!(delivery.recipients, 1);
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[test]
    fn test_post_to_empty_room() {
        let registry = RoomRegistry::new();
        let (a, _rx) = connect(&registry, "a", "Alice");

        let delivery = registry.post(&a, "nobody-here", "hello?").unwrap();
        assert_eq!(delivery.recipients, 0);
        assert!(!registry.room_exists("nobody-here"));
    }

    #[test]
    fn test_post_rejects_blank_and_invalid() {
        let registry = RoomRegistry::new();
        let (a, _rx) = connect(&registry, "a", "Alice");

        assert_eq!(
            registry.post(&a, "42", "   ").unwrap_err(),
            RegistryError::EmptyComment
        );
        assert!(matches!(
            registry.post(&a, "", "hi"),
            Err(RegistryError::InvalidRoom(_))
        ));
        assert!(matches!(
            registry.join(&a, "$admin"),
            Err(RegistryError::InvalidRoom(_))
        ));
    }

    #[test]
    fn test_typing_excludes_sender() {
        let registry = RoomRegistry::new();
        let (a, mut rx_a) = connect(&registry, "a", "Alice");
        let (b, mut rx_b) = connect(&registry, "b", "Bob");
        let (c, mut rx_c) = connect(&registry, "c", "Carol");
        for conn in [&a, &b, &c] {
            registry.join(conn, "42").unwrap();
        }

        let delivery = registry.typing(&a, "42").unwrap();
        assert_eq!(delivery.recipients, 2);

        assert!(drain(&mut rx_a).is_empty());
        for rx in [&mut rx_b, &mut rx_c] {
            let received = drain(rx);
            assert_eq!(received.len(), 1);
            assert_eq!(received[0].kind, MessageKind::Typing);
            assert_eq!(received[0].author.name, "Alice");
        }
    }

    #[test]
    fn test_no_delivery_after_leave() {
        let registry = RoomRegistry::new();
        let (a, _rx_a) = connect(&registry, "a", "Alice");
        let (b, mut rx_b) = connect(&registry, "b", "Bob");
        registry.join(&a, "42").unwrap();
        registry.join(&b, "42").unwrap();

        registry.leave(&b, "42").unwrap();
        registry.post(&a, "42", "after leave").unwrap();
        registry.typing(&a, "42").unwrap();

        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn test_disconnect_cleans_up_memberships() {
        let registry = RoomRegistry::new();
        let (a, _rx_a) = connect(&registry, "a", "Alice");
        let (b, _rx_b) = connect(&registry, "b", "Bob");
        registry.join(&a, "1").unwrap();
        registry.join(&a, "2").unwrap();
        registry.join(&b, "2").unwrap();

        let mut left = registry.disconnect(&a);
        left.sort();
        assert_eq!(
            left,
            vec![
                RoomId::for_circle("1").unwrap(),
                RoomId::for_circle("2").unwrap()
            ]
        );

        assert!(!registry.room_exists("1"));
        assert!(registry.room_exists("2"));
        assert!(!registry.is_member(&a, "2"));
        assert_eq!(registry.member_count("2"), 1);

        // Operations on a disconnected connection fail
        assert_eq!(
            registry.join(&a, "1").unwrap_err(),
            RegistryError::UnknownConnection(a.clone())
        );
        assert!(registry.disconnect(&a).is_empty());
    }

    #[test]
    fn test_no_delivery_after_disconnect() {
        let registry = RoomRegistry::new();
        let (a, _rx_a) = connect(&registry, "a", "Alice");
        let (b, mut rx_b) = connect(&registry, "b", "Bob");
        registry.join(&a, "42").unwrap();
        registry.join(&b, "42").unwrap();

        registry.disconnect(&b);
        let delivery = registry.post(&a, "42", "still there?").unwrap();

        assert_eq!(delivery.recipients, 1);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn test_duplicate_connect_rejected() {
        let registry = RoomRegistry::new();
        let (a, _rx) = connect(&registry, "a", "Alice");

        assert_eq!(
            registry
                .connect(a.clone(), Identity::new("x", "Mallory"))
                .unwrap_err(),
            RegistryError::DuplicateConnection(a.clone())
        );
        assert_eq!(registry.identity(&a).unwrap().name, "Alice");
    }

    #[test]
    fn test_registry_stats() {
        let registry = RoomRegistry::new();
        let (a, _rx_a) = connect(&registry, "a", "Alice");
        let (b, _rx_b) = connect(&registry, "b", "Bob");

        registry.join(&a, "1").unwrap();
        registry.join(&a, "2").unwrap();
        registry.join(&b, "1").unwrap();

        assert_eq!(
            registry.stats(),
            RegistryStats {
                room_count: 2,
                connection_count: 2,
                total_memberships: 3,
            }
        );

        let mut names = registry.room_names();
        names.sort();
        assert_eq!(names, vec!["circle:1", "circle:2"]);
        assert_eq!(registry.connection_rooms(&b).len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_joins_and_posts() {
        let registry = Arc::new(RoomRegistry::new());
        let (listener, mut rx) = connect(&registry, "listener", "Lee");
        registry.join(&listener, "busy").unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let conn = ConnectionId::new(format!("poster-{i}"));
                let _inbox = registry
                    .connect(conn.clone(), Identity::new(format!("u{i}"), "poster"))
                    .unwrap();
                registry.join(&conn, "busy").unwrap();
                registry.post(&conn, "busy", "hi").unwrap();
                registry.disconnect(&conn);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(drain(&mut rx).len(), 16);
        assert_eq!(registry.member_count("busy"), 1);
        assert_eq!(registry.stats().connection_count, 1);
    }
}
