//! Room abstraction for the relay.
//!
//! A room is the membership set of one circle. Rooms exist only while they
//! have members.

use crate::identity::ConnectionId;
use crate::message::Message;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Maximum circle id length.
pub const MAX_CIRCLE_ID_LENGTH: usize = 256;

/// Prefix of every room key.
pub const ROOM_PREFIX: &str = "circle:";

/// Sending half of a connection's outbound queue.
pub type Outbox = mpsc::UnboundedSender<Arc<Message>>;

/// Receiving half of a connection's outbound queue.
pub type Inbox = mpsc::UnboundedReceiver<Arc<Message>>;

/// Validate a circle id.
///
/// # Errors
///
/// Returns an error message if the id is invalid.
pub fn validate_circle_id(circle_id: &str) -> Result<(), &'static str> {
    if circle_id.is_empty() {
        return Err("Circle id cannot be empty");
    }
    if circle_id.len() > MAX_CIRCLE_ID_LENGTH {
        return Err("Circle id too long");
    }
    if circle_id.starts_with('$') {
        return Err("Circle ids starting with '$' are reserved");
    }
    if !circle_id.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Circle id contains invalid characters");
    }
    Ok(())
}

/// Room key derived from a circle id (`circle:<id>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(String);

impl RoomId {
    /// Derive the room key for a circle.
    ///
    /// # Errors
    ///
    /// Returns an error message if the circle id is invalid.
    pub fn for_circle(circle_id: &str) -> Result<Self, &'static str> {
        validate_circle_id(circle_id)?;
        Ok(Self(format!("{ROOM_PREFIX}{circle_id}")))
    }

    /// The full room key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The circle id this room was derived from.
    #[must_use]
    pub fn circle_id(&self) -> &str {
        &self.0[ROOM_PREFIX.len()..]
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Membership set of a room.
#[derive(Debug)]
pub struct Room {
    id: RoomId,
    members: HashMap<ConnectionId, Outbox>,
}

impl Room {
    /// Create an empty room.
    #[must_use]
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            members: HashMap::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &RoomId {
        &self.id
    }

    /// Get the number of members.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Check if a connection is a member.
    #[must_use]
    pub fn is_member(&self, connection_id: &ConnectionId) -> bool {
        self.members.contains_key(connection_id)
    }

    /// Add a connection to the room.
    ///
    /// Returns `true` if the connection was not already a member.
    pub fn insert(&mut self, connection_id: ConnectionId, outbox: Outbox) -> bool {
        if self.members.contains_key(&connection_id) {
            return false;
        }
        debug!(room = %self.id, connection = %connection_id, "Member added");
        self.members.insert(connection_id, outbox);
        true
    }

    /// Remove a connection from the room.
    ///
    /// Returns `true` if the connection was a member.
    pub fn remove(&mut self, connection_id: &ConnectionId) -> bool {
        let removed = self.members.remove(connection_id).is_some();
        if removed {
            debug!(room = %self.id, connection = %connection_id, "Member removed");
        }
        removed
    }

    /// Deliver a message to every member except `exclude`.
    ///
    /// Returns the number of members whose outbox accepted the message.
    /// Members whose connection is already closing are skipped.
    pub fn deliver(&self, message: &Arc<Message>, exclude: Option<&ConnectionId>) -> usize {
        let delivered = self
            .members
            .iter()
            .filter(|(id, _)| Some(*id) != exclude)
            .filter(|(_, outbox)| outbox.send(Arc::clone(message)).is_ok())
            .count();
        trace!(room = %self.id, recipients = delivered, "Delivered message");
        delivered
    }

    /// Get all member connection IDs.
    #[must_use]
    pub fn members(&self) -> Vec<ConnectionId> {
        self.members.keys().cloned().collect()
    }

    /// Check if the room has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
