use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::marker::{self, Marker};

/// Which side of the conversation a participant sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Buyer,
    Vendor,
}

impl Role {
    /// The opposite side of the conversation.
    pub fn counterpart(self) -> Self {
        match self {
            Self::Buyer => Self::Vendor,
            Self::Vendor => Self::Buyer,
        }
    }
}

impl std::str::FromStr for Role {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buyer" => Ok(Self::Buyer),
            "vendor" => Ok(Self::Vendor),
            other => Err(ProtocolError::UnknownRole(other.to_string())),
        }
    }
}

/// Derived status of a message as seen by one viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    /// Someone else's message on our own view; no tick UI is meaningful.
    Received,
    /// Our message, accepted by the store but not yet at the recipient.
    Sent,
    /// Our message, known to have reached the recipient's client.
    Delivered,
    /// Our message, seen by the recipient.
    Read,
}

/// A message row as returned by the message store.
///
/// `body` is the raw stored text and may contain legacy marker lines.
/// `delivered_at`/`read_at` are the structured receipt columns; when
/// populated they are authoritative over any marker conveying the same fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

/// A message normalized for one viewer: markers stripped, receipts resolved,
/// delivery state derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_edited: bool,
    pub is_me: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub delivery_state: DeliveryState,
}

/// Resolve one receipt fact from the structured column and the parsed marker.
///
/// Returns `(fact_known, timestamp)`. The column wins when both disagree;
/// the divergence is logged for audit since legacy rows can carry both.
fn resolve_receipt(
    message_id: &str,
    what: &str,
    column: Option<DateTime<Utc>>,
    marker: Option<Marker>,
) -> (bool, Option<DateTime<Utc>>) {
    match (column, marker) {
        (Some(col), Some(m)) => {
            if m.at.is_some_and(|at| at != col) {
                tracing::warn!(
                    message = %message_id,
                    receipt = what,
                    column = %col,
                    marker = ?m.at,
                    "receipt column and marker disagree; column wins"
                );
            }
            (true, Some(col))
        }
        (Some(col), None) => (true, Some(col)),
        (None, Some(m)) => (true, m.at),
        (None, None) => (false, None),
    }
}

/// Normalize a stored row for the given viewer.
///
/// `is_me` compares `sender_id` to `actor_id`. Receipts always describe the
/// counterpart's side: a buyer looking at their own message reads the
/// vendor's delivered/read markers, and vice versa. `delivery_state` is only
/// derived for the viewer's own messages; incoming ones are `Received`.
pub fn normalize(row: &MessageRow, actor_id: &str, viewer_role: Role) -> Message {
    let decoded = marker::decode(&row.body);
    let meta = decoded.meta;
    let is_me = row.sender_id == actor_id;

    let (delivered_marker, read_marker) = match viewer_role.counterpart() {
        Role::Buyer => (meta.delivered_buyer, meta.read_buyer),
        Role::Vendor => (meta.delivered_vendor, meta.read_vendor),
    };

    let (delivered_known, delivered_at) =
        resolve_receipt(&row.id, "delivered", row.delivered_at, delivered_marker);
    let (read_known, read_at) = resolve_receipt(&row.id, "read", row.read_at, read_marker);

    let delivery_state = if is_me {
        if read_known {
            DeliveryState::Read
        } else if delivered_known {
            DeliveryState::Delivered
        } else {
            DeliveryState::Sent
        }
    } else {
        DeliveryState::Received
    };

    Message {
        id: row.id.clone(),
        conversation_id: row.conversation_id.clone(),
        sender_id: row.sender_id.clone(),
        text: decoded.visible_text,
        created_at: row.created_at,
        updated_at: row.updated_at,
        is_edited: row.is_edited || meta.edited,
        is_me,
        delivered_at,
        read_at,
        delivery_state,
    }
}
