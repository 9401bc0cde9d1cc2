use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use haggle_protocol::{Role, SnapshotEntry};

/// The merged online/typing record for one participant in a conversation.
///
/// One person shows up in a channel snapshot under several subscription
/// keys (auth id, profile-row id, email). All of them collapse into one
/// entry here: booleans are OR-merged, everything else comes from the
/// contribution with the latest `at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub canonical_key: String,
    pub user_id: String,
    pub email: Option<String>,
    pub role: Role,
    pub online: bool,
    pub typing: bool,
    pub alias_user_ids: BTreeSet<String>,
    pub alias_emails: BTreeSet<String>,
    pub at: DateTime<Utc>,
}

/// Map from every known key of a participant to their merged entry.
pub type PresenceMap = HashMap<String, Arc<PresenceEntry>>;

impl PresenceEntry {
    /// Build an entry from one snapshot contribution.
    ///
    /// The subscription key becomes the canonical key. Self-references are
    /// dropped from the alias sets so that merging is idempotent.
    pub fn from_snapshot(entry: &SnapshotEntry) -> Self {
        let payload = &entry.payload;
        let mut alias_user_ids: BTreeSet<String> =
            payload.alias_user_ids.iter().cloned().collect();
        alias_user_ids.insert(payload.user_id.clone());
        alias_user_ids.remove(&entry.key);
        alias_user_ids.retain(|a| !a.is_empty());

        let mut alias_emails: BTreeSet<String> = payload.alias_emails.iter().cloned().collect();
        if let Some(email) = &payload.email {
            alias_emails.insert(email.clone());
        }
        alias_emails.remove(&entry.key);
        alias_emails.retain(|a| !a.is_empty());

        Self {
            canonical_key: entry.key.clone(),
            user_id: payload.user_id.clone(),
            email: payload.email.clone(),
            role: payload.role,
            online: payload.online,
            typing: payload.typing,
            alias_user_ids,
            alias_emails,
            at: payload.at,
        }
    }

    /// Every map key this entry should be reachable under.
    pub fn keys(&self) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        keys.insert(self.canonical_key.clone());
        keys.insert(self.user_id.clone());
        if let Some(email) = &self.email {
            keys.insert(email.clone());
        }
        keys.extend(self.alias_user_ids.iter().cloned());
        keys.extend(self.alias_emails.iter().cloned());
        keys.retain(|k| !k.is_empty());
        keys
    }
}

/// Merge two contributions for the same participant.
///
/// `online`/`typing` are OR-merged; scalar fields come from the entry with
/// the latest `at` (ties broken by canonical key so the merge stays
/// commutative); identifiers of the losing entry survive as aliases.
pub fn merge(a: &PresenceEntry, b: &PresenceEntry) -> PresenceEntry {
    let (newer, older) = if (a.at, &a.canonical_key) >= (b.at, &b.canonical_key) {
        (a, b)
    } else {
        (b, a)
    };

    // Alias convention shared with `from_snapshot`: everything except the
    // canonical key (and empties) stays an alias, `user_id` included. The
    // two must agree or self-merges stop being identities.
    let mut alias_user_ids: BTreeSet<String> = newer
        .alias_user_ids
        .union(&older.alias_user_ids)
        .cloned()
        .collect();
    alias_user_ids.insert(older.canonical_key.clone());
    alias_user_ids.insert(older.user_id.clone());
    alias_user_ids.insert(newer.user_id.clone());
    alias_user_ids.remove(&newer.canonical_key);
    alias_user_ids.retain(|a| !a.is_empty());

    let mut alias_emails: BTreeSet<String> = newer
        .alias_emails
        .union(&older.alias_emails)
        .cloned()
        .collect();
    if let Some(email) = &older.email {
        alias_emails.insert(email.clone());
    }
    if let Some(email) = &newer.email {
        alias_emails.insert(email.clone());
    }
    alias_emails.remove(&newer.canonical_key);
    alias_emails.retain(|a| !a.is_empty());

    PresenceEntry {
        canonical_key: newer.canonical_key.clone(),
        user_id: newer.user_id.clone(),
        email: newer.email.clone(),
        role: newer.role,
        online: a.online || b.online,
        typing: a.typing || b.typing,
        alias_user_ids,
        alias_emails,
        at: newer.at,
    }
}

/// Rebuild the presence map from a full channel snapshot.
///
/// No incremental patching: each `sync` event replaces the whole map. Every
/// snapshot entry is expanded under all of its keys; entries that share any
/// key (directly or through a chain of earlier entries) collapse into one
/// merged entry.
pub fn rebuild_map(snapshot: &[SnapshotEntry]) -> PresenceMap {
    let mut map: PresenceMap = HashMap::new();

    for entry in snapshot {
        let mut merged = PresenceEntry::from_snapshot(entry);
        let mut keys = merged.keys();

        // Absorb every existing entry reachable from any of our keys.
        let mut absorbed: Vec<Arc<PresenceEntry>> = Vec::new();
        for key in &keys {
            if let Some(existing) = map.get(key) {
                if !absorbed.iter().any(|e| Arc::ptr_eq(e, existing)) {
                    absorbed.push(existing.clone());
                }
            }
        }
        for existing in &absorbed {
            keys.extend(existing.keys());
            merged = merge(&merged, existing);
        }
        keys.extend(merged.keys());

        let merged = Arc::new(merged);
        for key in keys {
            map.insert(key, merged.clone());
        }
    }

    map
}

/// Look up the presence entry for a participant by any of their ids/emails.
///
/// Fast path is a direct key hit; the slow path scans every entry's own
/// id/email and alias sets. `None` means presence unknown; callers must
/// treat that as offline, never as an error.
pub fn resolve_presence(
    map: &PresenceMap,
    user_ids: &[String],
    emails: &[String],
) -> Option<Arc<PresenceEntry>> {
    for key in user_ids.iter().chain(emails.iter()) {
        if let Some(entry) = map.get(key) {
            return Some(entry.clone());
        }
    }

    map.values()
        .find(|entry| {
            user_ids.iter().any(|id| {
                !id.is_empty() && (entry.user_id == *id || entry.alias_user_ids.contains(id))
            }) || emails.iter().any(|email| {
                !email.is_empty()
                    && (entry.email.as_deref() == Some(email)
                        || entry.alias_emails.contains(email))
            })
        })
        .cloned()
}
