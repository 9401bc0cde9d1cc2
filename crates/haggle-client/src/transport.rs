use std::sync::Arc;

use async_trait::async_trait;
use haggle_protocol::{ChannelEvent, ChannelStatus, PresencePayload, RowEvent, SnapshotEntry};
use tokio::sync::{mpsc, watch};

use crate::error::ChatError;

/// The pub/sub channel a transport hands out per conversation.
///
/// Owned exclusively by the currently active view; the previous view's
/// channel is unsubscribed before a new one is attached.
#[async_trait]
pub trait PresenceChannel: Send + Sync {
    /// Publish (or refresh) this client's presence payload.
    async fn track(&self, payload: PresencePayload) -> Result<(), ChatError>;

    /// Read the channel's full presence snapshot.
    async fn presence_state(&self) -> Result<Vec<SnapshotEntry>, ChatError>;

    /// Leave the channel. Idempotent.
    async fn unsubscribe(&self);
}

/// Event streams delivered alongside a channel subscription.
pub struct ChannelStreams {
    /// Presence-side events; `Sync` triggers a full snapshot rebuild.
    pub presence_events: mpsc::Receiver<ChannelEvent>,
    /// Row INSERT/UPDATE/DELETE push events scoped to the conversation.
    pub row_events: mpsc::Receiver<RowEvent>,
    /// Transport-reported channel health; drives fallback polling.
    pub status: watch::Receiver<ChannelStatus>,
}

/// Transport collaborator: subscribes conversation-scoped channels.
#[async_trait]
pub trait ConversationTransport: Send + Sync {
    async fn subscribe(
        &self,
        conversation_id: &str,
    ) -> Result<(Arc<dyn PresenceChannel>, ChannelStreams), ChatError>;
}
