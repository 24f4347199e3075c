use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::api::Direction;
use crate::events::Resource;

/// A row type that lives in one of the store's tables.
///
/// `RESOURCE` names the table, `ORDER` is the canonical order a synchronized
/// view keeps its rows in (by `created_at`, ties broken by `id`).
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const RESOURCE: Resource;
    const ORDER: Direction;

    fn id(&self) -> Uuid;
    fn created_at(&self) -> DateTime<Utc>;
}

// -- Identity --

/// The authenticated identity behind the current session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: Uuid,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub username: String,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Author data joined onto messages and photos. Serialized under the
/// `profiles` key; `null` when the author has no profile row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorProfile {
    pub username: String,
    pub avatar_url: Option<String>,
}

// -- Chat --

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    /// Placeholder text standing in for a recorded clip.
    Voice,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Voice => "voice",
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = crate::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "voice" => Ok(Self::Voice),
            other => Err(crate::ParseError::MessageKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub user_id: Uuid,
    pub channel: String,
    pub message: String,
    #[serde(default)]
    pub message_type: MessageKind,
    pub created_at: DateTime<Utc>,
    #[serde(default, rename = "profiles")]
    pub profile: Option<AuthorProfile>,
}

impl Record for Message {
    const RESOURCE: Resource = Resource::ChatMessages;
    const ORDER: Direction = Direction::Asc;

    fn id(&self) -> Uuid {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

// -- Photos --

/// Ride metrics captured alongside a photo.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RideData {
    /// km/h
    pub speed: f64,
    /// metres
    pub elevation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Photo {
    pub id: Uuid,
    pub user_id: Uuid,
    pub photo_url: String,
    pub caption: Option<String>,
    pub location: Option<String>,
    pub ride_data: Option<RideData>,
    #[serde(default)]
    pub likes_count: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default, rename = "profiles")]
    pub profile: Option<AuthorProfile>,
}

impl Record for Photo {
    const RESOURCE: Resource = Resource::RidePhotos;
    const ORDER: Direction = Direction::Desc;

    fn id(&self) -> Uuid {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// At most one per (user, photo). Presence means "liked".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Like {
    pub id: Uuid,
    pub user_id: Uuid,
    pub photo_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Record for Like {
    const RESOURCE: Resource = Resource::PhotoLikes;
    const ORDER: Direction = Direction::Asc;

    fn id(&self) -> Uuid {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl Record for Profile {
    const RESOURCE: Resource = Resource::Profiles;
    const ORDER: Direction = Direction::Asc;

    fn id(&self) -> Uuid {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

// -- Channels --

/// Channel labels offered by the chat screen.
pub const CHANNEL_LABELS: [&str; 3] = ["Group Chat", "Safety Channel", "Powder Alerts"];

/// Derive the stored channel key from a human label: "Group Chat" -> "group_chat".
pub fn channel_slug(label: &str) -> String {
    label
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_from_label() {
        assert_eq!(channel_slug("Group Chat"), "group_chat");
        assert_eq!(channel_slug("Safety Channel"), "safety_channel");
        assert_eq!(channel_slug("  Powder   Alerts "), "powder_alerts");
        assert_eq!(channel_slug("general"), "general");
    }

    #[test]
    fn message_decodes_with_joined_profile() {
        let raw = serde_json::json!({
            "id": "6f1d0c3a-4a57-4b8e-9a43-3e1c5d2f0a11",
            "user_id": "0b6a4c9e-2d1f-4e3a-8b7c-1a2b3c4d5e6f",
            "channel": "group_chat",
            "message": "Hello",
            "message_type": "voice",
            "created_at": "2024-01-05T10:00:00.000000Z",
            "profiles": { "username": "alex", "avatar_url": null }
        });

        let message: Message = serde_json::from_value(raw).unwrap();
        assert_eq!(message.message_type, MessageKind::Voice);
        assert_eq!(message.profile.unwrap().username, "alex");
    }

    #[test]
    fn raw_row_without_profile_still_decodes() {
        let raw = serde_json::json!({
            "id": "6f1d0c3a-4a57-4b8e-9a43-3e1c5d2f0a11",
            "user_id": "0b6a4c9e-2d1f-4e3a-8b7c-1a2b3c4d5e6f",
            "photo_url": "file:///tmp/shot.jpg",
            "caption": null,
            "location": null,
            "ride_data": { "speed": 41.0, "elevation": 2210.0 },
            "created_at": "2024-01-05T10:00:00Z"
        });

        let photo: Photo = serde_json::from_value(raw).unwrap();
        assert_eq!(photo.likes_count, 0);
        assert!(photo.profile.is_none());
        assert_eq!(photo.ride_data.unwrap().elevation, 2210.0);
    }
}
