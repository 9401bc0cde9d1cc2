use serde::{Deserialize, Serialize};

use crate::message::Role;

/// A participant row as the store returns it, before identity normalization.
///
/// The buyer and vendor tables grew different column names over the years,
/// so nearly everything here is optional. The identity resolver flattens
/// this into a [`ParticipantRecord`]; nothing downstream of that boundary
/// should touch this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRow {
    pub role: Role,
    #[serde(default)]
    pub auth_user_id: Option<String>,
    #[serde(default)]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub vendor_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub business_name: Option<String>,
}

/// One canonical participant, produced at the identity-resolver boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRecord {
    pub role: Role,
    /// Every id this participant is known by, in lookup-preference order.
    pub candidate_ids: Vec<String>,
    pub email: String,
    pub display_name: String,
}

/// A conversation between one buyer and one vendor.
///
/// Created by the external proposal workflow; its identity is immutable,
/// only the message list changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub buyer: ParticipantRecord,
    pub vendor: ParticipantRecord,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub product_name: Option<String>,
}
