use serde::{Deserialize, Serialize};

use crate::message::MessageRow;

/// Health of a conversation's realtime channel, as reported by the transport.
///
/// The sync scheduler keys its fallback polling off this: anything other
/// than `Subscribed` means push events may be getting lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

impl ChannelStatus {
    /// Whether push delivery can currently be trusted.
    pub fn is_healthy(self) -> bool {
        matches!(self, Self::Subscribed)
    }
}

/// A push notification for one message row, scoped to a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "row")]
pub enum RowEvent {
    Inserted(MessageRow),
    Updated(MessageRow),
    Deleted { id: String },
}

/// Presence-side channel events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelEvent {
    /// The full presence snapshot changed; consumers rebuild from scratch.
    Sync,
    Join,
    Leave,
}
