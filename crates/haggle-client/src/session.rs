use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::Utc;
use haggle_protocol::{ChannelEvent, ParticipantRecord, PresencePayload, Role};
use tokio::sync::mpsc;

use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::identity::{IdentityRecord, IdentityResolver};
use crate::presence::PresenceEntry;
use crate::services::presence_service::{start_presence_service, PresenceContext};
use crate::services::ServiceHandle;
use crate::state::ChatState;
use crate::transport::{ConversationTransport, PresenceChannel};

/// Build this client's presence payload from its resolved identity.
///
/// The canonical key doubles as the subscription key, so every other client
/// can collapse our contributions no matter which identifier they know us by.
pub fn build_payload(record: &IdentityRecord, role: Role, email: Option<String>) -> PresencePayload {
    let mut payload = PresencePayload::online_now(record.canonical_key.clone(), role, email);
    payload.alias_user_ids = record.alias_user_ids();
    payload.alias_emails = record.alias_emails();
    payload
}

/// Owns this client's registration on one conversation's presence channel.
///
/// Holds the channel, the presence loops and the typing input feed together
/// so teardown can retract our presence before the channel goes away.
pub struct PresenceRegistry {
    channel: Arc<dyn PresenceChannel>,
    payload: PresencePayload,
    services: ServiceHandle,
    input_tx: mpsc::Sender<String>,
    conversation_id: String,
}

impl PresenceRegistry {
    /// Register on the channel and start the presence loops.
    pub fn start(
        state: Arc<ChatState>,
        channel: Arc<dyn PresenceChannel>,
        payload: PresencePayload,
        config: &ChatConfig,
        presence_events: mpsc::Receiver<ChannelEvent>,
        conversation_id: String,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::channel(32);
        let ctx = PresenceContext {
            state,
            channel: channel.clone(),
            payload: payload.clone(),
            typing: Arc::new(AtomicBool::new(false)),
            conversation_id: conversation_id.clone(),
        };
        let services = start_presence_service(ctx, config, presence_events, input_rx);
        Self {
            channel,
            payload,
            services,
            input_tx,
            conversation_id,
        }
    }

    /// Feed a local input-field change into the typing debounce.
    pub async fn notify_input(&self, text: &str) {
        if self.input_tx.send(text.to_string()).await.is_err() {
            tracing::trace!(conversation = %self.conversation_id, "typing feed closed");
        }
    }

    /// Stop the loops, retract our presence and leave the channel.
    ///
    /// The offline track is best-effort: heartbeat timeouts on the server
    /// side clean up after us if it does not land.
    pub async fn teardown(self) {
        self.services.shutdown().await;

        let mut offline = self.payload;
        offline.online = false;
        offline.typing = false;
        offline.at = Utc::now();
        if let Err(e) = self.channel.track(offline).await {
            tracing::debug!(
                conversation = %self.conversation_id,
                error = %e,
                "offline track failed; server-side timeout cleans up"
            );
        }
        self.channel.unsubscribe().await;
    }
}

/// Channel key for the portal-wide presence lobby.
const PORTAL_CHANNEL: &str = "portal:presence";

/// Portal-wide "online while logged in" presence.
///
/// Explicit lifecycle, deliberately not tied to any view's mount timing:
/// `login` registers on the lobby channel and starts the heartbeat, `logout`
/// retracts and leaves. Conversation views carry their own registry on the
/// conversation channel independently of this one.
pub struct PortalSession {
    state: Arc<ChatState>,
    registry: PresenceRegistry,
}

impl PortalSession {
    pub async fn login(
        config: &ChatConfig,
        transport: Arc<dyn ConversationTransport>,
        resolver: &IdentityResolver,
        participant: &ParticipantRecord,
    ) -> Result<Self, ChatError> {
        let record = resolver.resolve_participant(participant).await;
        let (channel, streams) = transport.subscribe(PORTAL_CHANNEL).await?;
        let state = ChatState::new();

        let email = (!participant.email.is_empty()).then(|| participant.email.clone());
        let payload = build_payload(&record, participant.role, email);
        let registry = PresenceRegistry::start(
            state.clone(),
            channel,
            payload,
            config,
            streams.presence_events,
            PORTAL_CHANNEL.to_string(),
        );
        tracing::info!(user = %record.canonical_key, "portal presence registered");
        Ok(Self { state, registry })
    }

    /// Portal-wide presence lookup; `None` renders as offline.
    pub fn presence_of(
        &self,
        user_ids: &[String],
        emails: &[String],
    ) -> Option<Arc<PresenceEntry>> {
        self.state.presence_of(user_ids, emails)
    }

    pub async fn logout(self) {
        self.registry.teardown().await;
        tracing::info!("portal presence retracted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryChannel;
    use std::collections::BTreeSet;

    fn record() -> IdentityRecord {
        IdentityRecord {
            canonical_key: "auth-1".to_string(),
            aliases: BTreeSet::from(["prof-1".to_string(), "b@x.com".to_string()]),
        }
    }

    fn start_registry(channel: &Arc<MemoryChannel>) -> (PresenceRegistry, Arc<ChatState>) {
        let state = ChatState::new();
        let payload = build_payload(&record(), Role::Buyer, Some("b@x.com".to_string()));
        let (_event_tx, event_rx) = mpsc::channel(4);
        let registry = PresenceRegistry::start(
            state.clone(),
            channel.clone(),
            payload,
            &ChatConfig::default(),
            event_rx,
            "c1".to_string(),
        );
        (registry, state)
    }

    #[test]
    fn test_payload_carries_aliases_from_identity() {
        let payload = build_payload(&record(), Role::Buyer, Some("b@x.com".to_string()));
        assert_eq!(payload.user_id, "auth-1");
        assert_eq!(payload.alias_user_ids, vec!["prof-1".to_string()]);
        assert_eq!(payload.alias_emails, vec!["b@x.com".to_string()]);
        assert!(payload.online);
        assert!(!payload.typing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_retracts_presence_and_unsubscribes() {
        let channel = Arc::new(MemoryChannel::new());
        let (registry, _state) = start_registry(&channel);
        tokio::task::yield_now().await;
        assert!(!channel.tracked().is_empty());

        registry.teardown().await;
        let tracked = channel.tracked();
        let last = tracked.last().unwrap();
        assert!(!last.online);
        assert!(channel.unsubscribed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_portal_session_login_logout_lifecycle() {
        let transport = Arc::new(crate::testing::MemoryTransport::new());
        let resolver = crate::identity::IdentityResolver::new(Arc::new(
            crate::testing::MemoryDirectory::new(vec![]),
        ));
        let participant = ParticipantRecord {
            role: Role::Buyer,
            candidate_ids: vec!["buyer-1".to_string()],
            email: "buyer@x.com".to_string(),
            display_name: "Bea".to_string(),
        };

        let session = PortalSession::login(
            &ChatConfig::default(),
            transport.clone(),
            &resolver,
            &participant,
        )
        .await
        .unwrap();
        tokio::task::yield_now().await;

        let channel = transport.channel();
        assert!(channel.tracked().last().is_some_and(|p| p.online));

        session.logout().await;
        assert!(channel.tracked().last().is_some_and(|p| !p.online));
        assert!(channel.unsubscribed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_survives_track_failure() {
        let channel = Arc::new(MemoryChannel::new());
        let (registry, _state) = start_registry(&channel);
        tokio::task::yield_now().await;

        channel.fail_tracks(true);
        registry.teardown().await;
        assert!(channel.unsubscribed());
    }
}
