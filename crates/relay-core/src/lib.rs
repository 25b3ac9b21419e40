//! # circle-relay-core
//!
//! Room membership and message fan-out for the circle comment relay.
//!
//! - **Identity** - Connection IDs and the user attached to each connection
//! - **Room** - Membership set of one circle (`circle:<id>`)
//! - **Message** - Comments and typing signals routed through rooms
//! - **Registry** - Owned service tracking sessions and rooms
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────┐
//! │  Connection │────▶│ RoomRegistry │────▶│    Room     │
//! └─────────────┘     └──────────────┘     └─────────────┘
//!        ▲                                        │
//!        └──────────────── outbox ◀───────────────┘
//! ```

pub mod identity;
pub mod message;
pub mod registry;
pub mod room;

pub use identity::{ConnectionId, Identity};
pub use message::{Message, MessageKind};
pub use registry::{Delivery, RegistryError, RegistryStats, RoomRegistry};
pub use room::{Inbox, Outbox, Room, RoomId};
