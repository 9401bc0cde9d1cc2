use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use haggle_protocol::{ParticipantRecord, ParticipantRow};
use parking_lot::Mutex;

use crate::error::ChatError;

/// A profile record as the identity directory returns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryProfile {
    pub user_id: String,
    pub email: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Lookup contract of the identity directory collaborator.
///
/// Consulted only by the resolver; lookups are side-effect-free.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn lookup_by_id(&self, id: &str) -> Result<Option<DirectoryProfile>, ChatError>;

    /// Case-insensitive email lookup. May return several records when an
    /// address was re-registered; callers pick by `updated_at`.
    async fn lookup_by_email(&self, email: &str) -> Result<Vec<DirectoryProfile>, ChatError>;
}

/// The resolved mapping for one set of candidate identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    /// The single stable key used for presence/identity data.
    pub canonical_key: String,
    /// Every remaining identifier known to refer to the same participant.
    pub aliases: BTreeSet<String>,
}

impl IdentityRecord {
    /// Aliases that look like user ids (everything that is not an email).
    pub fn alias_user_ids(&self) -> Vec<String> {
        self.aliases
            .iter()
            .filter(|a| !a.contains('@'))
            .cloned()
            .collect()
    }

    /// Aliases that look like email addresses.
    pub fn alias_emails(&self) -> Vec<String> {
        self.aliases
            .iter()
            .filter(|a| a.contains('@'))
            .cloned()
            .collect()
    }
}

/// Canonicalizes a participant's many identifiers into one stable key.
///
/// Results are cached for the lifetime of the resolver (one session), so
/// identical inputs against an unchanged directory always resolve the same.
pub struct IdentityResolver {
    directory: Arc<dyn IdentityDirectory>,
    cache: Mutex<HashMap<(Vec<String>, String), IdentityRecord>>,
}

impl IdentityResolver {
    pub fn new(directory: Arc<dyn IdentityDirectory>) -> Self {
        Self {
            directory,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve candidate ids plus an email to a canonical key and aliases.
    ///
    /// Never fails: directory trouble is logged and degrades to the naive
    /// fallback, because identity is an enhancement, not a correctness
    /// requirement for message delivery.
    pub async fn resolve(&self, candidate_ids: &[String], email: &str) -> IdentityRecord {
        let cache_key = (candidate_ids.to_vec(), email.to_ascii_lowercase());
        if let Some(hit) = self.cache.lock().get(&cache_key) {
            return hit.clone();
        }

        let canonical = self.resolve_canonical(candidate_ids, email).await;
        let record = build_record(canonical, candidate_ids, email);
        self.cache.lock().insert(cache_key, record.clone());
        record
    }

    /// Convenience: resolve a normalized participant record.
    pub async fn resolve_participant(&self, participant: &ParticipantRecord) -> IdentityRecord {
        self.resolve(&participant.candidate_ids, &participant.email)
            .await
    }

    /// Steps 1–3 of the resolution algorithm, returning the canonical key.
    async fn resolve_canonical(&self, candidate_ids: &[String], email: &str) -> String {
        // Step 1: ordered id lookup, first hit wins
        for id in candidate_ids.iter().filter(|id| !id.is_empty()) {
            match self.directory.lookup_by_id(id).await {
                Ok(Some(profile)) => return profile.user_id,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        error = %ChatError::IdentityResolution(e.to_string()),
                        id = %id,
                        "directory id lookup failed; falling back to naive resolution"
                    );
                    return naive_fallback(candidate_ids, email);
                }
            }
        }

        // Step 2: case-insensitive email lookup, most recently updated wins
        if !email.is_empty() {
            match self.directory.lookup_by_email(email).await {
                Ok(profiles) => {
                    if let Some(profile) = profiles.into_iter().max_by_key(|p| p.updated_at) {
                        return profile.user_id;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        error = %ChatError::IdentityResolution(e.to_string()),
                        email = %email,
                        "directory email lookup failed; falling back to naive resolution"
                    );
                }
            }
        }

        // Step 3: naive fallback
        naive_fallback(candidate_ids, email)
    }
}

/// First non-empty candidate id, else the email.
fn naive_fallback(candidate_ids: &[String], email: &str) -> String {
    candidate_ids
        .iter()
        .find(|id| !id.is_empty())
        .cloned()
        .unwrap_or_else(|| email.to_string())
}

fn build_record(canonical_key: String, candidate_ids: &[String], email: &str) -> IdentityRecord {
    let aliases = candidate_ids
        .iter()
        .cloned()
        .chain(std::iter::once(email.to_string()))
        .filter(|a| !a.is_empty() && *a != canonical_key)
        .collect();
    IdentityRecord {
        canonical_key,
        aliases,
    }
}

/// Flatten a raw buyer/vendor participant row into one canonical shape.
///
/// The raw tables disagree on field names; after this boundary nothing
/// branches on table shape again.
pub fn normalize_participant(row: &ParticipantRow) -> ParticipantRecord {
    let candidate_ids: Vec<String> = [&row.auth_user_id, &row.profile_id, &row.vendor_id]
        .into_iter()
        .filter_map(|id| id.clone())
        .filter(|id| !id.is_empty())
        .collect();
    let email = row
        .email
        .clone()
        .filter(|e| !e.is_empty())
        .or_else(|| row.contact_email.clone())
        .unwrap_or_default();
    let display_name = row
        .display_name
        .clone()
        .filter(|n| !n.is_empty())
        .or_else(|| row.business_name.clone())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| email.clone());
    ParticipantRecord {
        role: row.role,
        candidate_ids,
        email,
        display_name,
    }
}
