//! # circle-relay-protocol
//!
//! Wire protocol for the circle comment relay.
//!
//! Clients and the server exchange named events over a WebSocket. Each
//! message is `{"event": <name>, "data": <payload>}`, as JSON in text
//! messages or MessagePack in binary messages.
//!
//! ## Events
//!
//! - `join_circle` / `leave_circle` - Room membership
//! - `post_comment` -> `new_comment` - Comments fanned out to a room
//! - `typing` -> `user_typing` - Ephemeral typing signals
//! - `connected`, `ping` / `pong` - Session housekeeping
//!
//! ## Example
//!
//! ```rust
//! use circle_relay_protocol::{codec, ClientEvent, DEFAULT_MAX_FRAME_SIZE};
//!
//! let text = r#"{"event":"post_comment","data":{"room_id":"42","text":"hello"}}"#;
//! let event = codec::decode_text(text, DEFAULT_MAX_FRAME_SIZE).unwrap();
//! assert_eq!(event, ClientEvent::post("42", "hello"));
//! ```

pub mod codec;
pub mod events;

pub use codec::{encode, Encoded, ProtocolError, WireFormat, DEFAULT_MAX_FRAME_SIZE};
pub use events::{
    Author, CircleRef, ClientEvent, Connected, NewComment, PostComment, ServerEvent, Typing,
    UserTyping,
};
