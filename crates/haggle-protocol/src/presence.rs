use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::Role;

/// The payload a client tracks on a conversation's presence channel.
///
/// One participant can be subscribed under several identities (auth id,
/// linked profile-row id, email), so the payload declares every alias the
/// publisher knows about; consumers merge entries that share any of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub user_id: String,
    pub role: Role,
    pub online: bool,
    pub typing: bool,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub alias_user_ids: Vec<String>,
    #[serde(default)]
    pub alias_emails: Vec<String>,
    pub at: DateTime<Utc>,
}

impl PresencePayload {
    /// A fresh payload with no typing activity, stamped `at` now.
    pub fn online_now(user_id: String, role: Role, email: Option<String>) -> Self {
        Self {
            user_id,
            role,
            online: true,
            typing: false,
            email,
            alias_user_ids: Vec::new(),
            alias_emails: Vec::new(),
            at: Utc::now(),
        }
    }
}

/// One entry of a full channel presence snapshot: the transport-level
/// subscription key plus the payload last tracked under it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub key: String,
    pub payload: PresencePayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_wire_shape_is_camel_case() {
        let payload = PresencePayload {
            user_id: "u1".to_string(),
            role: Role::Buyer,
            online: true,
            typing: false,
            email: Some("u1@example.com".to_string()),
            alias_user_ids: vec!["p1".to_string()],
            alias_emails: vec![],
            at: "2024-03-01T10:00:00Z".parse().unwrap(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["aliasUserIds"][0], "p1");
        assert_eq!(json["role"], "buyer");
        assert_eq!(json["at"], "2024-03-01T10:00:00Z");
    }

    #[test]
    fn test_missing_alias_fields_default_empty() {
        let payload: PresencePayload = serde_json::from_str(
            r#"{"userId":"u1","role":"vendor","online":true,"typing":false,"at":"2024-03-01T10:00:00Z"}"#,
        )
        .unwrap();
        assert!(payload.alias_user_ids.is_empty());
        assert!(payload.email.is_none());
    }
}
