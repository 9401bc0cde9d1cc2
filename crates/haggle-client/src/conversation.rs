use std::sync::Arc;

use haggle_protocol::{normalize, Conversation, Message, ParticipantRecord, Role};

use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::identity::{IdentityRecord, IdentityResolver};
use crate::presence::PresenceEntry;
use crate::services::sync_service::{start_sync_service, SyncContext};
use crate::services::ServiceHandle;
use crate::session::{build_payload, PresenceRegistry};
use crate::state::ChatState;
use crate::store::{MessageStoreApi, MessageStoreClient};
use crate::sync::RefetchGate;
use crate::transport::ConversationTransport;

/// The live view of one conversation.
///
/// `attach` wires up everything a conversation screen needs: identity
/// resolution, the channel subscription, the initial message load, delivery
/// acknowledgment, the presence loops and the sync scheduler. Exactly one
/// handle per conversation should be alive at a time; `detach` tears the
/// previous one down before a new view attaches.
pub struct ConversationHandle {
    conversation: Conversation,
    viewer_role: Role,
    counterpart: IdentityRecord,
    state: Arc<ChatState>,
    store: MessageStoreClient,
    registry: PresenceRegistry,
    sync: ServiceHandle,
}

impl ConversationHandle {
    /// Attach to a conversation.
    ///
    /// Fails only when the channel subscription does. A failed initial
    /// message load attaches with an empty list instead; the background
    /// poll fills it in as soon as the store responds.
    pub async fn attach(
        config: &ChatConfig,
        transport: Arc<dyn ConversationTransport>,
        api: Arc<dyn MessageStoreApi>,
        resolver: &IdentityResolver,
        conversation: Conversation,
        viewer_role: Role,
    ) -> Result<Self, ChatError> {
        let (viewer, counterpart_participant) = match viewer_role {
            Role::Buyer => (&conversation.buyer, &conversation.vendor),
            Role::Vendor => (&conversation.vendor, &conversation.buyer),
        };
        let viewer_record = resolver.resolve_participant(viewer).await;
        let counterpart = resolver.resolve_participant(counterpart_participant).await;

        let (channel, streams) = transport.subscribe(&conversation.id).await?;
        let state = ChatState::new();

        // Initial load. The store tells us which id it knows us by; `is_me`
        // must use that, not the resolver's canonical key, because the two
        // can differ for legacy accounts.
        let actor_id = match api.fetch_messages(&conversation.id).await {
            Ok(batch) => {
                let actor_id = if batch.actor_user_id.is_empty() {
                    viewer_record.canonical_key.clone()
                } else {
                    batch.actor_user_id.clone()
                };
                let messages = batch
                    .messages
                    .iter()
                    .map(|row| normalize(row, &actor_id, viewer_role))
                    .collect();
                state.replace_messages(messages);
                actor_id
            }
            Err(e) => {
                tracing::warn!(
                    conversation = %conversation.id,
                    error = %e,
                    "initial load failed; attaching empty, background poll recovers"
                );
                viewer_record.canonical_key.clone()
            }
        };

        let store = MessageStoreClient::new(
            api.clone(),
            state.clone(),
            conversation.id.clone(),
            actor_id.clone(),
            viewer_role,
        );
        // Everything visible after the initial load counts as delivered.
        store.ack_delivered(&[conversation.id.clone()]).await;

        let payload = build_payload(&viewer_record, viewer_role, viewer_email(viewer));
        let registry = PresenceRegistry::start(
            state.clone(),
            channel,
            payload,
            config,
            streams.presence_events,
            conversation.id.clone(),
        );

        let sync = start_sync_service(
            SyncContext {
                state: state.clone(),
                api,
                conversation_id: conversation.id.clone(),
                actor_id,
                viewer_role,
                gate: RefetchGate::new(),
            },
            config,
            streams.row_events,
            streams.status,
        );

        Ok(Self {
            conversation,
            viewer_role,
            counterpart,
            state,
            store,
            registry,
            sync,
        })
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn viewer_role(&self) -> Role {
        self.viewer_role
    }

    /// The normalized message list as currently synced.
    pub fn messages(&self) -> Vec<Message> {
        self.state.messages()
    }

    /// Message mutations (send/edit/delete) go through here.
    pub fn store(&self) -> &MessageStoreClient {
        &self.store
    }

    /// Presence of the other side, by any identifier we know them under.
    /// `None` means unknown and renders as offline.
    pub fn counterpart_presence(&self) -> Option<Arc<PresenceEntry>> {
        let mut user_ids = self.counterpart.alias_user_ids();
        let mut emails = self.counterpart.alias_emails();
        if self.counterpart.canonical_key.contains('@') {
            emails.insert(0, self.counterpart.canonical_key.clone());
        } else {
            user_ids.insert(0, self.counterpart.canonical_key.clone());
        }
        self.state.presence_of(&user_ids, &emails)
    }

    /// Feed a local input-field change into the typing debounce.
    pub async fn notify_input(&self, text: &str) {
        self.registry.notify_input(text).await;
    }

    /// Tear the view down.
    ///
    /// Invalidates in-flight requests first so a slow response cannot
    /// resurrect this conversation's messages under the next view.
    pub async fn detach(self) {
        self.state.bump_generation();
        self.sync.shutdown().await;
        self.registry.teardown().await;
        tracing::debug!(conversation = %self.conversation.id, "view detached");
    }
}

/// The email to advertise in our presence payload, if the participant row
/// carried one.
fn viewer_email(viewer: &ParticipantRecord) -> Option<String> {
    if viewer.email.is_empty() {
        None
    } else {
        Some(viewer.email.clone())
    }
}
