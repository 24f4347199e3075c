//! Database row types: these map directly to SQLite rows.
//! Conversion into the slope-types records happens here so the rest of the
//! workspace never sees raw text columns.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use slope_types::models::{AuthorProfile, Like, Message, Photo, Profile, RideData};

pub struct ProfileRow {
    pub id: String,
    pub username: String,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub user_id: String,
    pub channel: String,
    pub message: String,
    pub message_type: String,
    pub created_at: String,
    pub author_username: Option<String>,
    pub author_avatar_url: Option<String>,
}

pub struct PhotoRow {
    pub id: String,
    pub user_id: String,
    pub photo_url: String,
    pub caption: Option<String>,
    pub location: Option<String>,
    pub ride_data: Option<String>,
    pub likes_count: i64,
    pub created_at: String,
    pub author_username: Option<String>,
    pub author_avatar_url: Option<String>,
}

pub struct LikeRow {
    pub id: String,
    pub user_id: String,
    pub photo_id: String,
    pub created_at: String,
}

/// Result of a like toggle. `like` is the row that was inserted or removed.
pub struct ToggleOutcome {
    pub liked: bool,
    pub like: LikeRow,
    pub likes_count: i64,
}

impl ProfileRow {
    pub fn into_model(self) -> Result<Profile> {
        Ok(Profile {
            id: parse_id(&self.id)?,
            username: self.username,
            full_name: self.full_name,
            avatar_url: self.avatar_url,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

impl MessageRow {
    pub fn into_model(self) -> Result<Message> {
        Ok(Message {
            id: parse_id(&self.id)?,
            user_id: parse_id(&self.user_id)?,
            message_type: self
                .message_type
                .parse()
                .with_context(|| format!("message {}", self.id))?,
            created_at: parse_timestamp(&self.created_at)?,
            profile: author(self.author_username, self.author_avatar_url),
            channel: self.channel,
            message: self.message,
        })
    }
}

impl PhotoRow {
    pub fn into_model(self) -> Result<Photo> {
        let ride_data = match self.ride_data.as_deref() {
            Some(raw) => Some(
                serde_json::from_str::<RideData>(raw)
                    .with_context(|| format!("corrupt ride_data on photo {}", self.id))?,
            ),
            None => None,
        };

        Ok(Photo {
            id: parse_id(&self.id)?,
            user_id: parse_id(&self.user_id)?,
            created_at: parse_timestamp(&self.created_at)?,
            profile: author(self.author_username, self.author_avatar_url),
            photo_url: self.photo_url,
            caption: self.caption,
            location: self.location,
            ride_data,
            likes_count: self.likes_count,
        })
    }
}

impl LikeRow {
    pub fn into_model(self) -> Result<Like> {
        Ok(Like {
            id: parse_id(&self.id)?,
            user_id: parse_id(&self.user_id)?,
            photo_id: parse_id(&self.photo_id)?,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

fn author(username: Option<String>, avatar_url: Option<String>) -> Option<AuthorProfile> {
    username.map(|username| AuthorProfile { username, avatar_url })
}

fn parse_id(raw: &str) -> Result<Uuid> {
    raw.parse().with_context(|| format!("corrupt id '{}'", raw))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // Rows written by hand through the sqlite shell use datetime('now'),
            // which has no timezone. Treat it as UTC.
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .with_context(|| format!("corrupt timestamp '{}'", raw))
}
