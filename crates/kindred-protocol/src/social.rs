//! Swipe and match payloads (`/social/swipes/`, `/social/matches/`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::profiles::PublicProfile;

/// Direction of a swipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SwipeAction {
    Like,
    Dislike,
}

/// Body of `POST /social/swipes/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwipeRequest {
    /// Profile id being swiped.
    pub target: String,
    pub value: SwipeAction,
}

/// A mutual like.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    #[serde(deserialize_with = "crate::deserialize_id")]
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// The other participant; `None` when the backend cannot resolve them.
    #[serde(default)]
    pub other_user: Option<PublicProfile>,
}

/// Response of `POST /social/swipes/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwipeResponse {
    #[serde(rename = "match")]
    pub is_match: bool,
    #[serde(
        default,
        deserialize_with = "crate::deserialize_optional_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub swipe_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_details: Option<Match>,
}
