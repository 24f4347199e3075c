use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ParseError;
use crate::events::Resource;
use crate::models::{MessageKind, RideData};

/// Hard ceiling on rows returned by a single query.
pub const MAX_LIMIT: u32 = 200;

// -- JWT Claims --

/// Access token claims issued by the identity provider and verified by the
/// server on REST and realtime requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub email: Option<String>,
    pub exp: usize,
}

// -- Queries --

/// Exact-match equality predicates, one per column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Filter(BTreeMap<String, String>);

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(column.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether a raw row satisfies every predicate. Non-string columns are
    /// compared through their JSON text form, so `likes_count=eq.3` works.
    pub fn matches(&self, row: &Value) -> bool {
        self.0.iter().all(|(column, expected)| match row.get(column) {
            Some(Value::String(s)) => s == expected,
            Some(Value::Null) | None => false,
            Some(other) => other.to_string() == *expected,
        })
    }

    /// Encode as `column=eq.value` query pairs.
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), format!("eq.{}", v)))
            .collect()
    }

    /// Decode `column=eq.value` pairs. Only the `eq` operator exists.
    pub fn from_query_pairs<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, ParseError> {
        let mut filter = Self::new();
        for (column, raw) in pairs {
            let value = raw
                .strip_prefix("eq.")
                .ok_or_else(|| ParseError::Operator(raw.to_string()))?;
            filter = filter.eq(column, value);
        }
        Ok(filter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub column: String,
    pub direction: Direction,
}

impl Order {
    pub fn asc(column: impl Into<String>) -> Self {
        Self { column: column.into(), direction: Direction::Asc }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self { column: column.into(), direction: Direction::Desc }
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.direction {
            Direction::Asc => "asc",
            Direction::Desc => "desc",
        };
        write!(f, "{}.{}", self.column, dir)
    }
}

impl FromStr for Order {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (column, dir) = s.rsplit_once('.').unwrap_or((s, "asc"));
        let direction = match dir {
            "asc" => Direction::Asc,
            "desc" => Direction::Desc,
            other => return Err(ParseError::Direction(other.to_string())),
        };
        if column.is_empty() {
            return Err(ParseError::Direction(s.to_string()));
        }
        Ok(Self { column: column.to_string(), direction })
    }
}

/// A filtered, ordered, limited read of one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub resource: Resource,
    pub filter: Filter,
    pub order: Option<Order>,
    pub limit: Option<u32>,
}

impl Query {
    pub fn new(resource: Resource) -> Self {
        Self { resource, filter: Filter::new(), order: None, limit: None }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter = self.filter.eq(column, value);
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The limit a store applies: requested value capped at `MAX_LIMIT`.
    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(MAX_LIMIT).min(MAX_LIMIT)
    }
}

// -- Inserts --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewMessage {
    pub user_id: Uuid,
    #[serde(default = "default_channel")]
    pub channel: String,
    pub message: String,
    #[serde(default)]
    pub message_type: MessageKind,
}

fn default_channel() -> String {
    "group_chat".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewPhoto {
    pub user_id: Uuid,
    pub photo_url: String,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub ride_data: Option<RideData>,
}

/// Profiles are keyed by the principal id; inserting an existing id updates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewProfile {
    pub id: Uuid,
    pub username: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewLike {
    pub user_id: Uuid,
    pub photo_id: Uuid,
}

// -- Likes --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToggleLikeRequest {
    pub photo_id: Uuid,
    /// Ignored by the server, which always toggles for the token subject.
    #[serde(default)]
    pub user_id: Option<Uuid>,
}

/// Outcome of a like toggle, read inside the same transaction as the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikeToggle {
    pub liked: bool,
    pub likes_count: i64,
}

// -- Errors --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// The principal that owns a row: `id` for profiles, `user_id` everywhere else.
pub fn owner_of(resource: Resource, row: &Value) -> Option<Uuid> {
    let column = match resource {
        Resource::Profiles => "id",
        _ => "user_id",
    };
    row.get(column)?.as_str()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_matches_strings_and_numbers() {
        let row = json!({ "channel": "group_chat", "likes_count": 3, "caption": null });

        assert!(Filter::new().matches(&row));
        assert!(Filter::new().eq("channel", "group_chat").matches(&row));
        assert!(!Filter::new().eq("channel", "safety_channel").matches(&row));
        assert!(Filter::new().eq("likes_count", "3").matches(&row));
        assert!(!Filter::new().eq("caption", "null").matches(&row));
        assert!(!Filter::new().eq("missing", "x").matches(&row));
    }

    #[test]
    fn filter_query_pairs() {
        let filter = Filter::new().eq("channel", "group_chat");
        let pairs = filter.to_query_pairs();
        assert_eq!(pairs, vec![("channel".to_string(), "eq.group_chat".to_string())]);

        let decoded =
            Filter::from_query_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))).unwrap();
        assert_eq!(decoded, filter);

        assert!(Filter::from_query_pairs([("channel", "like.group%")]).is_err());
    }

    #[test]
    fn order_parsing() {
        assert_eq!("created_at.desc".parse::<Order>().unwrap(), Order::desc("created_at"));
        assert_eq!("created_at".parse::<Order>().unwrap(), Order::asc("created_at"));
        assert!("created_at.sideways".parse::<Order>().is_err());
        assert_eq!(Order::asc("created_at").to_string(), "created_at.asc");
    }

    #[test]
    fn limit_is_capped() {
        assert_eq!(Query::new(Resource::ChatMessages).limit(50).effective_limit(), 50);
        assert_eq!(Query::new(Resource::ChatMessages).limit(5000).effective_limit(), MAX_LIMIT);
        assert_eq!(Query::new(Resource::ChatMessages).effective_limit(), MAX_LIMIT);
    }

    #[test]
    fn owner_column_depends_on_resource() {
        let id = Uuid::new_v4();
        assert_eq!(owner_of(Resource::Profiles, &json!({ "id": id })), Some(id));
        assert_eq!(owner_of(Resource::ChatMessages, &json!({ "user_id": id })), Some(id));
        assert_eq!(owner_of(Resource::ChatMessages, &json!({ "id": id })), None);
    }
}
