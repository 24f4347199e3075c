use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ParseError;
use crate::api::Filter;

/// Tables exposed by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Profiles,
    ChatMessages,
    RidePhotos,
    PhotoLikes,
}

impl Resource {
    pub const ALL: [Resource; 4] = [
        Resource::Profiles,
        Resource::ChatMessages,
        Resource::RidePhotos,
        Resource::PhotoLikes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Profiles => "profiles",
            Self::ChatMessages => "chat_messages",
            Self::RidePhotos => "ride_photos",
            Self::PhotoLikes => "photo_likes",
        }
    }

    /// Columns that may appear in filters and orderings.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Self::Profiles => &["id", "username", "created_at", "updated_at"],
            Self::ChatMessages => &["id", "user_id", "channel", "message_type", "created_at"],
            Self::RidePhotos => &["id", "user_id", "location", "likes_count", "created_at"],
            Self::PhotoLikes => &["id", "user_id", "photo_id", "created_at"],
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resource {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| ParseError::Resource(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 3] = [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete];
}

/// A row-level change, delivered to subscribers in commit order.
///
/// `record` is the raw table row: joined data such as the author profile is
/// never included, subscribers fetch by `id` when they need it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub resource: Resource,
    pub kind: ChangeKind,
    pub id: Uuid,
    pub record: Value,
    pub commit_timestamp: DateTime<Utc>,
}

/// Commands sent FROM client TO server over the realtime socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RealtimeCommand {
    /// Start receiving changes for one resource. One subscription per socket.
    Subscribe {
        resource: Resource,
        #[serde(default)]
        filter: Filter,
        #[serde(default = "all_kinds")]
        events: Vec<ChangeKind>,
    },
}

fn all_kinds() -> Vec<ChangeKind> {
    ChangeKind::ALL.to_vec()
}

/// Frames sent FROM server TO client over the realtime socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RealtimeEvent {
    /// Server confirms the subscription is live; changes follow.
    Subscribed { resource: Resource },

    /// A row changed.
    Change(ChangeEvent),

    /// The last command was rejected.
    Error { message: String },
}
