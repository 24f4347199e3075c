use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use rusqlite::ErrorCode;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use slope_db::models::LikeRow;
use slope_db::queries::NewPhotoRow;
use slope_db::{Database, format_timestamp};
use slope_types::api::{Filter, LikeToggle, NewLike, NewMessage, NewPhoto, NewProfile, Query};
use slope_types::events::{ChangeEvent, ChangeKind, Resource};

use crate::{ChangeStream, DataStore, StoreError};

/// Embedded store: SQLite tables plus an in-process change feed.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<LocalInner>,
}

struct LocalInner {
    db: Database,
    feed: ChangeFeed,
    /// Held across "write, then publish" so the feed emits in commit order.
    write_lock: Mutex<()>,
}

/// Fans change events out to every live subscriber whose filter matches.
#[derive(Default)]
struct ChangeFeed {
    subscribers: Mutex<Vec<Subscriber>>,
}

struct Subscriber {
    resource: Resource,
    filter: Filter,
    kinds: Vec<ChangeKind>,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

impl Subscriber {
    fn wants(&self, event: &ChangeEvent) -> bool {
        self.resource == event.resource
            && self.kinds.contains(&event.kind)
            && self.filter.matches(&event.record)
    }
}

impl ChangeFeed {
    fn register(&self, subscriber: Subscriber) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscriber);
    }

    fn publish(&self, resource: Resource, kind: ChangeKind, record: Value) {
        let Some(id) = record.get("id").and_then(Value::as_str).and_then(|s| s.parse().ok()) else {
            debug!("Skipping {} change without an id", resource);
            return;
        };

        let event = ChangeEvent {
            resource,
            kind,
            id,
            record,
            commit_timestamp: Utc::now(),
        };

        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|s| !s.tx.is_closed());
        for subscriber in subscribers.iter().filter(|s| s.wants(&event)) {
            let _ = subscriber.tx.send(event.clone());
        }
    }

    fn disconnect_all(&self) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let dropped = subscribers.len();
        subscribers.clear();
        dropped
    }

    fn len(&self) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|s| !s.tx.is_closed());
        subscribers.len()
    }
}

impl LocalStore {
    pub fn new(db: Database) -> Self {
        Self {
            inner: Arc::new(LocalInner {
                db,
                feed: ChangeFeed::default(),
                write_lock: Mutex::new(()),
            }),
        }
    }

    pub fn open(path: &Path) -> anyhow::Result<Self> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    /// Drop every live subscription, as a lost connection would. Returns how
    /// many were dropped.
    pub fn disconnect_subscribers(&self) -> usize {
        let dropped = self.inner.feed.disconnect_all();
        info!("Disconnected {} realtime subscribers", dropped);
        dropped
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.feed.len()
    }

    /// Run blocking DB work off the async runtime.
    async fn blocking<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&LocalInner) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| StoreError::Transient(format!("store task failed: {}", e)))?
    }
}

impl LocalInner {
    fn query(&self, query: &Query) -> Result<Vec<Value>, StoreError> {
        let columns = query.resource.columns();
        if let Some((column, _)) = query.filter.iter().find(|(c, _)| !columns.contains(c)) {
            return Err(StoreError::Rejected(format!("unknown column '{}' on {}", column, query.resource)));
        }
        if let Some(order) = &query.order {
            if !columns.contains(&order.column.as_str()) {
                return Err(StoreError::Rejected(format!(
                    "unknown column '{}' on {}",
                    order.column, query.resource
                )));
            }
        }

        let filter = &query.filter;
        let order = query.order.as_ref();
        let limit = query.effective_limit();

        match query.resource {
            Resource::Profiles => to_values(self.db.list_profiles(filter, order, limit).map_err(classify)?, |r| r.into_model()),
            Resource::ChatMessages => to_values(self.db.list_messages(filter, order, limit).map_err(classify)?, |r| r.into_model()),
            Resource::RidePhotos => to_values(self.db.list_photos(filter, order, limit).map_err(classify)?, |r| r.into_model()),
            Resource::PhotoLikes => to_values(self.db.list_likes(filter, order, limit).map_err(classify)?, |r| r.into_model()),
        }
    }

    fn fetch(&self, resource: Resource, id: Uuid) -> Result<Value, StoreError> {
        let key = id.to_string();
        let row = match resource {
            Resource::Profiles => self.db.get_profile(&key).map_err(classify)?.map(|r| to_value(r.into_model())),
            Resource::ChatMessages => self.db.get_message(&key).map_err(classify)?.map(|r| to_value(r.into_model())),
            Resource::RidePhotos => self.db.get_photo(&key).map_err(classify)?.map(|r| to_value(r.into_model())),
            Resource::PhotoLikes => self.db.get_like(&key).map_err(classify)?.map(|r| to_value(r.into_model())),
        };

        row.unwrap_or_else(|| Err(StoreError::NotFound(format!("{} {}", resource, id))))
    }

    fn insert(&self, resource: Resource, row: Value) -> Result<Value, StoreError> {
        let id = Uuid::new_v4();
        let now = format_timestamp(Utc::now());
        let key = id.to_string();

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut liked_photo = None;

        let (kind, id, committed) = match resource {
            Resource::ChatMessages => {
                let new: NewMessage = parse_row(resource, row)?;
                let text = new.message.trim();
                if text.is_empty() {
                    return Err(StoreError::Rejected("message must not be empty".into()));
                }
                if new.channel.trim().is_empty() {
                    return Err(StoreError::Rejected("channel must not be empty".into()));
                }
                self.db
                    .insert_message(
                        &key,
                        &new.user_id.to_string(),
                        &new.channel,
                        text,
                        new.message_type.as_str(),
                        &now,
                    )
                    .map_err(classify)?;
                let committed = json!({
                    "id": id,
                    "user_id": new.user_id,
                    "channel": new.channel,
                    "message": text,
                    "message_type": new.message_type,
                    "created_at": &now,
                });
                (ChangeKind::Insert, id, committed)
            }
            Resource::RidePhotos => {
                let new: NewPhoto = parse_row(resource, row)?;
                if new.photo_url.trim().is_empty() {
                    return Err(StoreError::Rejected("photo_url must not be empty".into()));
                }
                let ride_data = new
                    .ride_data
                    .map(|d| serde_json::to_string(&d))
                    .transpose()
                    .map_err(|e| StoreError::Rejected(e.to_string()))?;
                self.db
                    .insert_photo(&NewPhotoRow {
                        id: &key,
                        user_id: &new.user_id.to_string(),
                        photo_url: &new.photo_url,
                        caption: new.caption.as_deref(),
                        location: new.location.as_deref(),
                        ride_data: ride_data.as_deref(),
                        created_at: &now,
                    })
                    .map_err(classify)?;
                let committed = json!({
                    "id": id,
                    "user_id": new.user_id,
                    "photo_url": new.photo_url,
                    "caption": new.caption,
                    "location": new.location,
                    "ride_data": new.ride_data,
                    "likes_count": 0,
                    "created_at": &now,
                });
                (ChangeKind::Insert, id, committed)
            }
            Resource::Profiles => {
                let new: NewProfile = parse_row(resource, row)?;
                if new.username.trim().is_empty() {
                    return Err(StoreError::Rejected("username must not be empty".into()));
                }
                let created = self
                    .db
                    .upsert_profile(
                        &new.id.to_string(),
                        new.username.trim(),
                        new.full_name.as_deref(),
                        new.avatar_url.as_deref(),
                        &now,
                    )
                    .map_err(classify)?;
                let kind = if created { ChangeKind::Insert } else { ChangeKind::Update };
                let committed = json!({
                    "id": new.id,
                    "username": new.username.trim(),
                    "full_name": new.full_name,
                    "avatar_url": new.avatar_url,
                    "created_at": &now,
                    "updated_at": &now,
                });
                (kind, new.id, committed)
            }
            Resource::PhotoLikes => {
                let new: NewLike = parse_row(resource, row)?;
                self.db
                    .insert_like(&key, &new.user_id.to_string(), &new.photo_id.to_string(), &now)
                    .map_err(classify)?
                    .ok_or_else(|| StoreError::NotFound(format!("ride_photos {}", new.photo_id)))?;
                liked_photo = Some(new.photo_id);
                let committed = json!({
                    "id": id,
                    "user_id": new.user_id,
                    "photo_id": new.photo_id,
                    "created_at": &now,
                });
                (ChangeKind::Insert, id, committed)
            }
        };

        // The row is committed at this point, so a failed re-read must not fail the write
        let stored = stored_or_committed(resource, id, self.fetch(resource, id), committed);
        self.feed.publish(resource, kind, raw_record(&stored));
        if let Some(photo_id) = liked_photo {
            self.publish_photo_update(photo_id);
        }
        debug!("{:?} {} {}", kind, resource, id);
        Ok(stored)
    }

    fn toggle_like(&self, user_id: Uuid, photo_id: Uuid) -> Result<LikeToggle, StoreError> {
        let like_id = Uuid::new_v4().to_string();
        let now = format_timestamp(Utc::now());

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let outcome = self
            .db
            .toggle_like(&like_id, &user_id.to_string(), &photo_id.to_string(), &now)
            .map_err(classify)?
            .ok_or_else(|| StoreError::NotFound(format!("ride_photos {}", photo_id)))?;

        let kind = if outcome.liked { ChangeKind::Insert } else { ChangeKind::Delete };
        self.feed.publish(Resource::PhotoLikes, kind, like_record(outcome.like)?);
        self.publish_photo_update(photo_id);

        Ok(LikeToggle {
            liked: outcome.liked,
            likes_count: outcome.likes_count,
        })
    }

    fn publish_photo_update(&self, photo_id: Uuid) {
        match self.fetch(Resource::RidePhotos, photo_id) {
            Ok(photo) => self.feed.publish(Resource::RidePhotos, ChangeKind::Update, raw_record(&photo)),
            Err(e) => warn!("Like count change on ride_photos {} not published: {}", photo_id, e),
        }
    }

    fn subscribe(&self, resource: Resource, filter: Filter, kinds: Vec<ChangeKind>) -> ChangeStream {
        let (tx, rx) = mpsc::unbounded_channel();
        debug!("New {} subscription (filter: {:?})", resource, filter);
        self.feed.register(Subscriber { resource, filter, kinds, tx });
        ChangeStream::new(rx)
    }
}

impl DataStore for LocalStore {
    async fn query(&self, query: Query) -> Result<Vec<Value>, StoreError> {
        self.blocking(move |inner| inner.query(&query)).await
    }

    async fn fetch(&self, resource: Resource, id: Uuid) -> Result<Value, StoreError> {
        self.blocking(move |inner| inner.fetch(resource, id)).await
    }

    async fn insert(&self, resource: Resource, row: Value) -> Result<Value, StoreError> {
        self.blocking(move |inner| inner.insert(resource, row)).await
    }

    async fn toggle_like(&self, user_id: Uuid, photo_id: Uuid) -> Result<LikeToggle, StoreError> {
        self.blocking(move |inner| inner.toggle_like(user_id, photo_id)).await
    }

    async fn subscribe(
        &self,
        resource: Resource,
        filter: Filter,
        events: Vec<ChangeKind>,
    ) -> Result<ChangeStream, StoreError> {
        Ok(self.inner.subscribe(resource, filter, events))
    }
}

fn parse_row<T: DeserializeOwned>(resource: Resource, row: Value) -> Result<T, StoreError> {
    serde_json::from_value(row).map_err(|e| StoreError::Rejected(format!("invalid {} row: {}", resource, e)))
}

fn to_value<M: serde::Serialize>(model: anyhow::Result<M>) -> Result<Value, StoreError> {
    let model = model.map_err(|e| StoreError::Rejected(format!("{:#}", e)))?;
    serde_json::to_value(model).map_err(|e| StoreError::Rejected(e.to_string()))
}

fn to_values<R, M: serde::Serialize>(
    rows: Vec<R>,
    convert: impl Fn(R) -> anyhow::Result<M>,
) -> Result<Vec<Value>, StoreError> {
    rows.into_iter().map(|r| to_value(convert(r))).collect()
}

fn like_record(like: LikeRow) -> Result<Value, StoreError> {
    to_value(like.into_model())
}

/// The joined row as re-read after a write, or the columns just written when
/// that read fails.
fn stored_or_committed(
    resource: Resource,
    id: Uuid,
    reread: Result<Value, StoreError>,
    committed: Value,
) -> Value {
    match reread {
        Ok(stored) => stored,
        Err(e) => {
            warn!("{} {} stored but could not be re-read: {}", resource, id, e);
            committed
        }
    }
}

/// Change events carry the bare table row, without joined author data.
fn raw_record(stored: &Value) -> Value {
    let mut raw = stored.clone();
    if let Value::Object(map) = &mut raw {
        map.remove("profiles");
    }
    raw
}

/// Map database failures onto the store taxonomy.
fn classify(err: anyhow::Error) -> StoreError {
    match err.downcast_ref::<rusqlite::Error>() {
        Some(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            StoreError::Rejected(err.to_string())
        }
        Some(_) => StoreError::Transient(err.to_string()),
        // Errors raised by the query layer itself (unknown column, corrupt row)
        None => StoreError::Rejected(format!("{:#}", err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreExt;
    use serde_json::json;
    use slope_types::api::Order;
    use slope_types::models::{Message, Photo, Profile};

    async fn store_with_user(username: &str) -> (LocalStore, Uuid) {
        let store = LocalStore::in_memory().unwrap();
        let user = Uuid::new_v4();
        store
            .insert(Resource::Profiles, json!({ "id": user, "username": username }))
            .await
            .unwrap();
        (store, user)
    }

    #[tokio::test]
    async fn insert_returns_joined_row() {
        let (store, user) = store_with_user("alex").await;

        let message: Message = store
            .insert_as::<Message, _>(&NewMessage {
                user_id: user,
                channel: "group_chat".into(),
                message: "  Hello  ".into(),
                message_type: Default::default(),
            })
            .await
            .unwrap();

        assert_eq!(message.message, "Hello");
        assert_eq!(message.profile.unwrap().username, "alex");
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let (store, user) = store_with_user("alex").await;
        let err = store
            .insert(Resource::ChatMessages, json!({ "user_id": user, "message": "   " }))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }

    #[tokio::test]
    async fn message_from_unknown_author_violates_constraint() {
        let store = LocalStore::in_memory().unwrap();
        let err = store
            .insert(Resource::ChatMessages, json!({ "user_id": Uuid::new_v4(), "message": "hi" }))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }

    #[test]
    fn failed_reread_falls_back_to_committed_columns() {
        let id = Uuid::new_v4();
        let committed = json!({
            "id": id,
            "user_id": Uuid::new_v4(),
            "channel": "group_chat",
            "message": "first chair",
            "message_type": "text",
            "created_at": format_timestamp(Utc::now()),
        });

        let stored = stored_or_committed(
            Resource::ChatMessages,
            id,
            Err(StoreError::Transient("database is locked".into())),
            committed.clone(),
        );
        assert_eq!(stored, committed);

        let message: Message = crate::decode(stored).unwrap();
        assert_eq!(message.id, id);
        assert!(message.profile.is_none());

        let joined = json!({ "id": id, "profiles": { "username": "alex" } });
        assert_eq!(
            stored_or_committed(Resource::ChatMessages, id, Ok(joined.clone()), committed),
            joined
        );
    }

    #[tokio::test]
    async fn fetch_missing_row_is_not_found() {
        let store = LocalStore::in_memory().unwrap();
        let err = store.fetch(Resource::ChatMessages, Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn query_rejects_unknown_columns() {
        let store = LocalStore::in_memory().unwrap();
        let err = store
            .query(Query::new(Resource::ChatMessages).eq("body", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }

    #[tokio::test]
    async fn subscribers_only_see_matching_rows() {
        let (store, user) = store_with_user("sarah").await;
        let mut group = store
            .subscribe(
                Resource::ChatMessages,
                Filter::new().eq("channel", "group_chat"),
                vec![ChangeKind::Insert],
            )
            .await
            .unwrap();

        store
            .insert(Resource::ChatMessages, json!({ "user_id": user, "channel": "safety_channel", "message": "careful" }))
            .await
            .unwrap();
        store
            .insert(Resource::ChatMessages, json!({ "user_id": user, "channel": "group_chat", "message": "hi" }))
            .await
            .unwrap();

        let event = group.next().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.record["message"], "hi");
        assert!(event.record.get("profiles").is_none());
    }

    #[tokio::test]
    async fn toggle_like_emits_like_and_photo_changes() {
        let (store, user) = store_with_user("mike").await;
        let photo: Photo = store
            .insert_as::<Photo, _>(&NewPhoto {
                user_id: user,
                photo_url: "file:///shot.jpg".into(),
                caption: Some("New ride photo".into()),
                location: Some("Current Location".into()),
                ride_data: None,
            })
            .await
            .unwrap();

        let mut photos = store
            .subscribe(Resource::RidePhotos, Filter::new(), vec![ChangeKind::Update])
            .await
            .unwrap();
        let mut likes = store
            .subscribe(Resource::PhotoLikes, Filter::new(), ChangeKind::ALL.to_vec())
            .await
            .unwrap();

        let first = store.toggle_like(user, photo.id).await.unwrap();
        assert_eq!(first, LikeToggle { liked: true, likes_count: 1 });
        let second = store.toggle_like(user, photo.id).await.unwrap();
        assert_eq!(second, LikeToggle { liked: false, likes_count: 0 });

        assert_eq!(likes.next().await.unwrap().kind, ChangeKind::Insert);
        assert_eq!(likes.next().await.unwrap().kind, ChangeKind::Delete);
        assert_eq!(photos.next().await.unwrap().record["likes_count"], 1);
        assert_eq!(photos.next().await.unwrap().record["likes_count"], 0);

        let refreshed: Photo = store.fetch_as(photo.id).await.unwrap();
        assert_eq!(refreshed.likes_count, 0);
    }

    #[tokio::test]
    async fn toggle_like_on_unknown_photo() {
        let (store, user) = store_with_user("mike").await;
        let err = store.toggle_like(user, Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn profile_reinsert_is_an_update() {
        let (store, user) = store_with_user("emma").await;
        let mut changes = store
            .subscribe(Resource::Profiles, Filter::new(), ChangeKind::ALL.to_vec())
            .await
            .unwrap();

        let profile: Profile = store
            .insert_as::<Profile, _>(&NewProfile {
                id: user,
                username: "emma_rides".into(),
                full_name: None,
                avatar_url: None,
            })
            .await
            .unwrap();

        assert_eq!(profile.username, "emma_rides");
        assert_eq!(changes.next().await.unwrap().kind, ChangeKind::Update);
    }

    #[tokio::test]
    async fn disconnect_ends_streams() {
        let store = LocalStore::in_memory().unwrap();
        let mut stream = store
            .subscribe(Resource::ChatMessages, Filter::new(), ChangeKind::ALL.to_vec())
            .await
            .unwrap();
        assert_eq!(store.subscriber_count(), 1);

        assert_eq!(store.disconnect_subscribers(), 1);
        assert!(stream.next().await.is_none());
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn typed_query_orders_newest_first() {
        let (store, user) = store_with_user("alex").await;
        for text in ["one", "two", "three"] {
            store
                .insert(Resource::ChatMessages, json!({ "user_id": user, "message": text }))
                .await
                .unwrap();
        }

        let messages: Vec<Message> = store
            .query_as(Filter::new().eq("channel", "group_chat"), Some(Order::desc("created_at")), Some(2))
            .await
            .unwrap();
        let texts: Vec<_> = messages.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(texts, vec!["three", "two"]);
    }
}
