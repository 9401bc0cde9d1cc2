//! In-memory collaborator implementations for tests.
//!
//! Backed by plain maps and counters; failure modes are toggled per call
//! site so error paths can be exercised without a real transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use haggle_protocol::{
    ChannelEvent, ChannelStatus, MessageRow, ParticipantRow, PresencePayload, RowEvent,
    SnapshotEntry,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::error::ChatError;
use crate::identity::{DirectoryProfile, IdentityDirectory};
use crate::store::{MessageBatch, MessageStoreApi};
use crate::transport::{ChannelStreams, ConversationTransport, PresenceChannel};

/// Identity directory over a fixed list of profiles.
#[derive(Default)]
pub struct MemoryDirectory {
    profiles: Vec<DirectoryProfile>,
    fail_lookups: AtomicBool,
    id_lookups: AtomicUsize,
}

impl MemoryDirectory {
    pub fn new(profiles: Vec<DirectoryProfile>) -> Self {
        Self {
            profiles,
            ..Self::default()
        }
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    /// How many id lookups actually reached the directory.
    pub fn id_lookups(&self) -> usize {
        self.id_lookups.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), ChatError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(ChatError::Network("directory unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityDirectory for MemoryDirectory {
    async fn lookup_by_id(&self, id: &str) -> Result<Option<DirectoryProfile>, ChatError> {
        self.id_lookups.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self.profiles.iter().find(|p| p.user_id == id).cloned())
    }

    async fn lookup_by_email(&self, email: &str) -> Result<Vec<DirectoryProfile>, ChatError> {
        self.check_available()?;
        Ok(self
            .profiles
            .iter()
            .filter(|p| {
                p.email
                    .as_deref()
                    .is_some_and(|e| e.eq_ignore_ascii_case(email))
            })
            .cloned()
            .collect())
    }
}

/// Message store over per-conversation row vectors.
pub struct MemoryStore {
    actor_id: String,
    rows: Mutex<HashMap<String, Vec<MessageRow>>>,
    participants: Mutex<Vec<ParticipantRow>>,
    next_id: AtomicUsize,
    fetch_calls: AtomicUsize,
    send_calls: AtomicUsize,
    edit_calls: AtomicUsize,
    ack_calls: AtomicUsize,
    fail_fetches: AtomicBool,
    fail_sends: AtomicBool,
    fail_acks: AtomicBool,
    forbid_edits: AtomicBool,
    fetch_delay: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new(actor_id: &str) -> Self {
        Self {
            actor_id: actor_id.to_string(),
            rows: Mutex::new(HashMap::new()),
            participants: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
            fetch_calls: AtomicUsize::new(0),
            send_calls: AtomicUsize::new(0),
            edit_calls: AtomicUsize::new(0),
            ack_calls: AtomicUsize::new(0),
            fail_fetches: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            fail_acks: AtomicBool::new(false),
            forbid_edits: AtomicBool::new(false),
            fetch_delay: Mutex::new(None),
        }
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub fn edit_calls(&self) -> usize {
        self.edit_calls.load(Ordering::SeqCst)
    }

    pub fn ack_calls(&self) -> usize {
        self.ack_calls.load(Ordering::SeqCst)
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn fail_acks(&self, fail: bool) {
        self.fail_acks.store(fail, Ordering::SeqCst);
    }

    pub fn forbid_edits(&self, forbid: bool) {
        self.forbid_edits.store(forbid, Ordering::SeqCst);
    }

    /// Make fetches take this long; used to race in-flight requests.
    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock() = Some(delay);
    }

    pub fn set_participants(&self, participants: Vec<ParticipantRow>) {
        *self.participants.lock() = participants;
    }

    pub fn rows(&self, conversation_id: &str) -> Vec<MessageRow> {
        self.rows
            .lock()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Insert a row directly, bypassing the API. Returns the stored row.
    pub fn seed_row(&self, conversation_id: &str, sender_id: &str, body: &str) -> MessageRow {
        let row = self.make_row(conversation_id, sender_id, body);
        self.rows
            .lock()
            .entry(conversation_id.to_string())
            .or_default()
            .push(row.clone());
        row
    }

    /// Overwrite a stored row's body, as a server-side mutation would.
    pub fn set_row_body(&self, conversation_id: &str, message_id: &str, body: &str) {
        if let Some(row) = self
            .rows
            .lock()
            .get_mut(conversation_id)
            .and_then(|rows| rows.iter_mut().find(|r| r.id == message_id))
        {
            row.body = body.to_string();
            row.updated_at = Utc::now();
        }
    }

    fn make_row(&self, conversation_id: &str, sender_id: &str, body: &str) -> MessageRow {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        MessageRow {
            id: format!("m{n}"),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            body: body.to_string(),
            created_at: now,
            updated_at: now,
            is_edited: false,
            delivered_at: None,
            read_at: None,
        }
    }
}

#[async_trait]
impl MessageStoreApi for MemoryStore {
    async fn fetch_messages(&self, conversation_id: &str) -> Result<MessageBatch, ChatError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(ChatError::Network("fetch failed".to_string()));
        }
        Ok(MessageBatch {
            messages: self.rows(conversation_id),
            actor_user_id: self.actor_id.clone(),
            participants: self.participants.lock().clone(),
        })
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        body: &str,
    ) -> Result<MessageRow, ChatError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ChatError::Network("send failed".to_string()));
        }
        Ok(self.seed_row(conversation_id, &self.actor_id, body))
    }

    async fn edit_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        body: &str,
    ) -> Result<MessageRow, ChatError> {
        self.edit_calls.fetch_add(1, Ordering::SeqCst);
        if self.forbid_edits.load(Ordering::SeqCst) {
            return Err(ChatError::Forbidden("edit rejected".to_string()));
        }
        let mut rows = self.rows.lock();
        let row = rows
            .get_mut(conversation_id)
            .and_then(|rows| rows.iter_mut().find(|r| r.id == message_id))
            .ok_or_else(|| ChatError::NotFound(format!("message {message_id}")))?;
        row.body = body.to_string();
        row.is_edited = true;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn delete_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<(), ChatError> {
        let mut rows = self.rows.lock();
        let conversation = rows
            .get_mut(conversation_id)
            .ok_or_else(|| ChatError::NotFound(format!("conversation {conversation_id}")))?;
        let before = conversation.len();
        conversation.retain(|r| r.id != message_id);
        if conversation.len() == before {
            return Err(ChatError::NotFound(format!("message {message_id}")));
        }
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), ChatError> {
        self.rows.lock().remove(conversation_id);
        Ok(())
    }

    async fn ack_delivered(&self, _proposal_ids: &[String]) -> Result<(), ChatError> {
        self.ack_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_acks.load(Ordering::SeqCst) {
            return Err(ChatError::Network("ack failed".to_string()));
        }
        Ok(())
    }
}

/// Presence channel that records tracks and serves a settable snapshot.
#[derive(Default)]
pub struct MemoryChannel {
    tracked: Mutex<Vec<PresencePayload>>,
    snapshot: Mutex<Vec<SnapshotEntry>>,
    fail_presence_state: AtomicBool,
    fail_tracks: AtomicBool,
    unsubscribed: AtomicBool,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every payload tracked so far, in order.
    pub fn tracked(&self) -> Vec<PresencePayload> {
        self.tracked.lock().clone()
    }

    pub fn set_snapshot(&self, snapshot: Vec<SnapshotEntry>) {
        *self.snapshot.lock() = snapshot;
    }

    pub fn fail_presence_state(&self, fail: bool) {
        self.fail_presence_state.store(fail, Ordering::SeqCst);
    }

    pub fn fail_tracks(&self, fail: bool) {
        self.fail_tracks.store(fail, Ordering::SeqCst);
    }

    pub fn unsubscribed(&self) -> bool {
        self.unsubscribed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PresenceChannel for MemoryChannel {
    async fn track(&self, payload: PresencePayload) -> Result<(), ChatError> {
        if self.fail_tracks.load(Ordering::SeqCst) {
            return Err(ChatError::Network("track failed".to_string()));
        }
        self.tracked.lock().push(payload);
        Ok(())
    }

    async fn presence_state(&self) -> Result<Vec<SnapshotEntry>, ChatError> {
        if self.fail_presence_state.load(Ordering::SeqCst) {
            return Err(ChatError::Network("presence state failed".to_string()));
        }
        Ok(self.snapshot.lock().clone())
    }

    async fn unsubscribe(&self) {
        self.unsubscribed.store(true, Ordering::SeqCst);
    }
}

/// Sender sides of one subscription's streams, for driving tests.
#[derive(Clone)]
pub struct ChannelControls {
    pub row_tx: mpsc::Sender<RowEvent>,
    pub presence_tx: mpsc::Sender<ChannelEvent>,
    pub status_tx: Arc<watch::Sender<ChannelStatus>>,
}

/// Transport handing out one [`MemoryChannel`] per subscription.
#[derive(Default)]
pub struct MemoryTransport {
    channel: Mutex<Option<Arc<MemoryChannel>>>,
    controls: Mutex<Option<ChannelControls>>,
    snapshot: Mutex<Vec<SnapshotEntry>>,
    subscribe_calls: AtomicUsize,
    fail_subscribes: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn fail_subscribes(&self, fail: bool) {
        self.fail_subscribes.store(fail, Ordering::SeqCst);
    }

    /// Snapshot served by channels created from here on.
    pub fn set_snapshot(&self, snapshot: Vec<SnapshotEntry>) {
        *self.snapshot.lock() = snapshot;
    }

    /// The channel of the most recent subscription.
    pub fn channel(&self) -> Arc<MemoryChannel> {
        self.channel.lock().clone().expect("no subscription yet")
    }

    /// Sender sides of the most recent subscription's streams.
    pub fn controls(&self) -> ChannelControls {
        self.controls.lock().clone().expect("no subscription yet")
    }
}

#[async_trait]
impl ConversationTransport for MemoryTransport {
    async fn subscribe(
        &self,
        _conversation_id: &str,
    ) -> Result<(Arc<dyn PresenceChannel>, ChannelStreams), ChatError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribes.load(Ordering::SeqCst) {
            return Err(ChatError::Network("subscribe failed".to_string()));
        }

        let channel = Arc::new(MemoryChannel::new());
        channel.set_snapshot(self.snapshot.lock().clone());

        let (row_tx, row_events) = mpsc::channel(16);
        let (presence_tx, presence_events) = mpsc::channel(16);
        let (status_tx, status) = watch::channel(ChannelStatus::Subscribed);

        *self.channel.lock() = Some(channel.clone());
        *self.controls.lock() = Some(ChannelControls {
            row_tx,
            presence_tx,
            status_tx: Arc::new(status_tx),
        });

        Ok((
            channel,
            ChannelStreams {
                presence_events,
                row_events,
                status,
            },
        ))
    }
}
