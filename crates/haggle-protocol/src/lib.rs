//! Wire formats for the haggle chat subsystem.
//!
//! This crate defines everything that crosses a process boundary: the
//! legacy in-band marker codec, message rows and their viewer-side
//! normalization, presence channel payloads, and transport status/event
//! types. The runtime lives in `haggle-client`.

pub mod conversation;
pub mod error;
pub mod marker;
pub mod message;
pub mod presence;
pub mod transport;

pub use conversation::{Conversation, ParticipantRecord, ParticipantRow};
pub use error::ProtocolError;
pub use marker::{decode, append_marker, BodyMeta, DecodedBody, Marker, MarkerKind};
pub use message::{normalize, DeliveryState, Message, MessageRow, Role};
pub use presence::{PresencePayload, SnapshotEntry};
pub use transport::{ChannelEvent, ChannelStatus, RowEvent};
