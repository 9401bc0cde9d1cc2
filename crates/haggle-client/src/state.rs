use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use haggle_protocol::{Message, Role, RowEvent};
use parking_lot::RwLock;

use crate::presence::{self, PresenceEntry, PresenceMap};
use crate::sync;

/// In-memory state of the active conversation view.
///
/// Shared between the sync scheduler, the presence engine and the message
/// store client. Guards are never held across await points; everything is
/// cloned out first.
#[derive(Default)]
pub struct ChatState {
    messages: RwLock<Vec<Message>>,
    presence: RwLock<PresenceMap>,
    /// Bumped when the view detaches. Results of requests issued under an
    /// older generation are discarded instead of mutating fresh state.
    generation: AtomicU64,
}

impl ChatState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The generation to capture when issuing a request.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Whether a captured generation still refers to the live view.
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    /// Invalidate every in-flight request issued so far.
    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.read().clone()
    }

    pub fn message(&self, id: &str) -> Option<Message> {
        self.messages.read().iter().find(|m| m.id == id).cloned()
    }

    /// Apply a push/poll row event with the idempotent merge rules.
    pub fn apply_event(&self, event: &RowEvent, actor_id: &str, viewer_role: Role) -> bool {
        sync::apply_event(&mut self.messages.write(), event, actor_id, viewer_role)
    }

    /// Append a message if its id is not already present.
    pub fn insert_message(&self, message: Message) -> bool {
        let mut messages = self.messages.write();
        if messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        messages.push(message);
        true
    }

    /// Replace an existing message by id, or append it. Receipt facts are
    /// monotone across the replace.
    pub fn upsert_message(&self, mut message: Message) {
        let mut messages = self.messages.write();
        if let Some(existing) = messages.iter_mut().find(|m| m.id == message.id) {
            sync::clamp_receipts(existing, &mut message);
            *existing = message;
        } else {
            messages.push(message);
        }
    }

    pub fn remove_message(&self, id: &str) {
        self.messages.write().retain(|m| m.id != id);
    }

    /// Swap in a freshly fetched message list (silent full refetch).
    pub fn replace_messages(&self, messages: Vec<Message>) {
        *self.messages.write() = messages;
    }

    pub fn clear_messages(&self) {
        self.messages.write().clear();
    }

    /// Atomically replace the presence map (rebuilt on every `sync` event).
    pub fn replace_presence(&self, map: PresenceMap) {
        *self.presence.write() = map;
    }

    /// Presence lookup by any known id/email; `None` means unknown, which
    /// callers treat as offline.
    pub fn presence_of(&self, user_ids: &[String], emails: &[String]) -> Option<Arc<PresenceEntry>> {
        presence::resolve_presence(&self.presence.read(), user_ids, emails)
    }
}
