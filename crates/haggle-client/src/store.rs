use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use haggle_protocol::{normalize, MessageRow, ParticipantRow, Role};
use parking_lot::Mutex;

use crate::error::ChatError;
use crate::state::ChatState;

/// Response of a full message fetch.
#[derive(Debug, Clone)]
pub struct MessageBatch {
    pub messages: Vec<MessageRow>,
    /// The id the store knows the requesting actor by; `is_me` is derived
    /// against this.
    pub actor_user_id: String,
    pub participants: Vec<ParticipantRow>,
}

/// Request/response contract of the message store collaborator.
///
/// Network details live behind this trait; the client layers its local
/// guarantees (validation, single-flight, idempotent delete) on top.
#[async_trait]
pub trait MessageStoreApi: Send + Sync {
    async fn fetch_messages(&self, conversation_id: &str) -> Result<MessageBatch, ChatError>;

    async fn send_message(
        &self,
        conversation_id: &str,
        body: &str,
    ) -> Result<MessageRow, ChatError>;

    async fn edit_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        body: &str,
    ) -> Result<MessageRow, ChatError>;

    async fn delete_message(&self, conversation_id: &str, message_id: &str)
        -> Result<(), ChatError>;

    /// Wipes the whole conversation.
    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), ChatError>;

    /// Best-effort delivery acknowledgment for whole conversations.
    async fn ack_delivered(&self, proposal_ids: &[String]) -> Result<(), ChatError>;
}

/// Key used for the conversation-wide delete in the single-flight set.
/// Contains a NUL so it can never collide with a message id off the wire.
const CONVERSATION_DELETE_KEY: &str = "\0conversation-delete";

/// Client-side wrapper around the store API for one conversation.
pub struct MessageStoreClient {
    api: Arc<dyn MessageStoreApi>,
    state: Arc<ChatState>,
    conversation_id: String,
    actor_id: String,
    viewer_role: Role,
    /// Message ids (plus the conversation-delete key) with a mutation in
    /// flight. Duplicate requests are ignored client-side.
    in_flight: Mutex<HashSet<String>>,
}

impl MessageStoreClient {
    pub fn new(
        api: Arc<dyn MessageStoreApi>,
        state: Arc<ChatState>,
        conversation_id: String,
        actor_id: String,
        viewer_role: Role,
    ) -> Self {
        Self {
            api,
            state,
            conversation_id,
            actor_id,
            viewer_role,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Send a message.
    ///
    /// Empty/whitespace-only text is rejected before any network call; the
    /// caller keeps the draft for retry on failure. On success the returned
    /// row is appended unless a push event for the same send got there first.
    pub async fn send(&self, text: &str) -> Result<(), ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::Validation(
                "message text must not be empty".to_string(),
            ));
        }

        let row = self
            .api
            .send_message(&self.conversation_id, text)
            .await?;
        let message = normalize(&row, &self.actor_id, self.viewer_role);
        self.state.insert_message(message);
        Ok(())
    }

    /// Edit a message. Only permitted on the actor's own messages; a server
    /// rejection surfaces as `Forbidden` and is not retried.
    pub async fn edit(&self, message_id: &str, text: &str) -> Result<(), ChatError> {
        match self.state.message(message_id) {
            Some(local) if local.is_me => {}
            Some(_) => {
                return Err(ChatError::Forbidden(format!(
                    "message {message_id} is not editable by this actor"
                )))
            }
            None => {
                return Err(ChatError::NotFound(format!(
                    "message {message_id} is not in the local list"
                )))
            }
        }

        let Some(_guard) = self.begin(message_id) else {
            tracing::debug!(message = %message_id, "edit already in flight; ignoring duplicate");
            return Ok(());
        };

        let row = self
            .api
            .edit_message(&self.conversation_id, message_id, text)
            .await?;
        self.state
            .upsert_message(normalize(&row, &self.actor_id, self.viewer_role));
        Ok(())
    }

    /// Delete a message. Idempotent: a target that is already gone counts
    /// as success, and a duplicate request while one is in flight is ignored.
    pub async fn delete(&self, message_id: &str) -> Result<(), ChatError> {
        let Some(_guard) = self.begin(message_id) else {
            tracing::debug!(message = %message_id, "delete already in flight; ignoring duplicate");
            return Ok(());
        };

        match self
            .api
            .delete_message(&self.conversation_id, message_id)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                tracing::debug!(message = %message_id, "delete target already gone");
            }
            Err(e) => return Err(e),
        }
        self.state.remove_message(message_id);
        Ok(())
    }

    /// Delete the whole conversation and clear the local list.
    pub async fn delete_conversation(&self) -> Result<(), ChatError> {
        let Some(_guard) = self.begin(CONVERSATION_DELETE_KEY) else {
            tracing::debug!("conversation delete already in flight; ignoring duplicate");
            return Ok(());
        };

        self.api.delete_conversation(&self.conversation_id).await?;
        self.state.clear_messages();
        Ok(())
    }

    /// Acknowledge delivery for the given proposals. Best-effort: failures
    /// are logged and swallowed, never surfaced.
    pub async fn ack_delivered(&self, proposal_ids: &[String]) {
        if proposal_ids.is_empty() {
            return;
        }
        if let Err(e) = self.api.ack_delivered(proposal_ids).await {
            tracing::debug!(error = %e, "delivery ack failed; ignoring");
        }
    }

    fn begin(&self, key: &str) -> Option<FlightGuard<'_>> {
        let mut in_flight = self.in_flight.lock();
        if !in_flight.insert(key.to_string()) {
            return None;
        }
        Some(FlightGuard {
            set: &self.in_flight,
            key: key.to_string(),
        })
    }
}

/// Removes its key from the in-flight set on drop, including on error paths.
struct FlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}
