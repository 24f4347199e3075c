use std::collections::HashSet;

use uuid::Uuid;

use slope_types::api::Direction;
use slope_types::models::Record;

/// Ordered, id-deduplicated rows of one resource.
///
/// Order is `(created_at, id)` in the record's canonical direction, so ties
/// on timestamp still sort the same way on every client.
pub struct Timeline<R: Record> {
    items: Vec<R>,
    seen: HashSet<Uuid>,
}

impl<R: Record> Timeline<R> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn reset(&mut self, rows: Vec<R>) {
        self.items.clear();
        self.seen.clear();
        for row in rows {
            self.upsert(row);
        }
    }

    /// Insert a row that has not been seen. Returns false for duplicates.
    pub fn insert(&mut self, row: R) -> bool {
        if !self.seen.insert(row.id()) {
            return false;
        }
        let at = self.position(&row);
        self.items.insert(at, row);
        true
    }

    /// Insert, or replace the row with the same id. Returns true if the
    /// row was new.
    pub fn upsert(&mut self, row: R) -> bool {
        let Some(index) = self.index_of(row.id()) else {
            return self.insert(row);
        };

        if self.items[index].created_at() == row.created_at() {
            self.items[index] = row;
        } else {
            self.items.remove(index);
            let at = self.position(&row);
            self.items.insert(at, row);
        }
        false
    }

    /// Upsert every row. Returns how many were new.
    pub fn merge(&mut self, rows: Vec<R>) -> usize {
        let mut added = 0;
        for row in rows {
            if self.upsert(row) {
                added += 1;
            }
        }
        added
    }

    pub fn remove(&mut self, id: Uuid) -> bool {
        if !self.seen.remove(&id) {
            return false;
        }
        if let Some(index) = self.index_of(id) {
            self.items.remove(index);
        }
        true
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.seen.contains(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<&R> {
        self.index_of(id).map(|i| &self.items[i])
    }

    pub fn items(&self) -> &[R] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn index_of(&self, id: Uuid) -> Option<usize> {
        if !self.seen.contains(&id) {
            return None;
        }
        self.items.iter().position(|r| r.id() == id)
    }

    fn position(&self, row: &R) -> usize {
        let key = (row.created_at(), row.id());
        match R::ORDER {
            Direction::Asc => self.items.partition_point(|r| (r.created_at(), r.id()) < key),
            Direction::Desc => self.items.partition_point(|r| (r.created_at(), r.id()) > key),
        }
    }
}

impl<R: Record> Default for Timeline<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use slope_types::models::{Message, MessageKind, Photo};

    fn base() -> DateTime<Utc> {
        "2024-01-05T10:00:00Z".parse().unwrap()
    }

    fn message(offset_secs: i64, text: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            user_id: Uuid::nil(),
            channel: "group_chat".into(),
            message: text.into(),
            message_type: MessageKind::Text,
            created_at: base() + Duration::seconds(offset_secs),
            profile: None,
        }
    }

    fn photo(offset_secs: i64) -> Photo {
        Photo {
            id: Uuid::new_v4(),
            user_id: Uuid::nil(),
            photo_url: "file:///p.jpg".into(),
            caption: None,
            location: None,
            ride_data: None,
            likes_count: 0,
            created_at: base() + Duration::seconds(offset_secs),
            profile: None,
        }
    }

    fn texts(timeline: &Timeline<Message>) -> Vec<&str> {
        timeline.items().iter().map(|m| m.message.as_str()).collect()
    }

    #[test]
    fn messages_sort_ascending_regardless_of_arrival() {
        let mut timeline = Timeline::new();
        timeline.insert(message(20, "third"));
        timeline.insert(message(0, "first"));
        timeline.insert(message(10, "second"));
        assert_eq!(texts(&timeline), ["first", "second", "third"]);
    }

    #[test]
    fn photos_sort_newest_first() {
        let mut timeline = Timeline::new();
        let old = photo(0);
        let new = photo(60);
        timeline.insert(old.clone());
        timeline.insert(new.clone());
        let ids: Vec<Uuid> = timeline.items().iter().map(|p| p.id).collect();
        assert_eq!(ids, [new.id, old.id]);
    }

    #[test]
    fn equal_timestamps_tie_break_on_id() {
        let mut a = message(0, "a");
        let mut b = message(0, "b");
        a.id = Uuid::from_u128(1);
        b.id = Uuid::from_u128(2);

        let mut forward = Timeline::new();
        forward.insert(a.clone());
        forward.insert(b.clone());
        let mut backward = Timeline::new();
        backward.insert(b);
        backward.insert(a);
        assert_eq!(texts(&forward), texts(&backward));
        assert_eq!(texts(&forward), ["a", "b"]);
    }

    #[test]
    fn duplicates_are_ignored() {
        let mut timeline = Timeline::new();
        let hello = message(0, "Hello");
        assert!(timeline.insert(hello.clone()));
        assert!(!timeline.insert(hello.clone()));
        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn upsert_replaces_in_place() {
        let mut timeline = Timeline::new();
        let mut liked = photo(0);
        timeline.insert(photo(30));
        timeline.insert(liked.clone());
        liked.likes_count = 1;
        assert!(!timeline.upsert(liked.clone()));
        assert_eq!(timeline.get(liked.id).unwrap().likes_count, 1);
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline.items()[1].id, liked.id);
    }

    #[test]
    fn merge_counts_new_rows_and_remove_forgets_ids() {
        let mut timeline = Timeline::new();
        let first = message(0, "first");
        timeline.insert(first.clone());
        let added = timeline.merge(vec![first.clone(), message(5, "second")]);
        assert_eq!(added, 1);
        assert_eq!(timeline.len(), 2);

        assert!(timeline.remove(first.id));
        assert!(!timeline.contains(first.id));
        assert!(!timeline.remove(first.id));
        assert!(timeline.insert(first));
    }
}
