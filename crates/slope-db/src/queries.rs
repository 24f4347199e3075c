use crate::Database;
use crate::models::{LikeRow, MessageRow, PhotoRow, ProfileRow, ToggleOutcome};
use anyhow::{Result, bail};
use rusqlite::types::ToSql;
use rusqlite::{Connection, Row};

use slope_types::api::{Filter, Order};
use slope_types::events::Resource;

const PROFILE_COLUMNS: &str = "p.id, p.username, p.full_name, p.avatar_url, p.created_at, p.updated_at";

const MESSAGE_SELECT: &str =
    "SELECT m.id, m.user_id, m.channel, m.message, m.message_type, m.created_at, a.username, a.avatar_url
     FROM chat_messages m
     LEFT JOIN profiles a ON m.user_id = a.id";

const PHOTO_SELECT: &str =
    "SELECT m.id, m.user_id, m.photo_url, m.caption, m.location, m.ride_data, m.likes_count, m.created_at,
            a.username, a.avatar_url
     FROM ride_photos m
     LEFT JOIN profiles a ON m.user_id = a.id";

const LIKE_COLUMNS: &str = "m.id, m.user_id, m.photo_id, m.created_at";

pub struct NewPhotoRow<'a> {
    pub id: &'a str,
    pub user_id: &'a str,
    pub photo_url: &'a str,
    pub caption: Option<&'a str>,
    pub location: Option<&'a str>,
    pub ride_data: Option<&'a str>,
    pub created_at: &'a str,
}

impl Database {
    // -- Profiles --

    /// Insert or update a profile. Returns true when a new row was created.
    pub fn upsert_profile(
        &self,
        id: &str,
        username: &str,
        full_name: Option<&str>,
        avatar_url: Option<&str>,
        now: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let exists = tx
                .query_row("SELECT 1 FROM profiles WHERE id = ?1", [id], |_| Ok(()))
                .optional()?
                .is_some();

            if exists {
                tx.execute(
                    "UPDATE profiles SET username = ?2, full_name = ?3, avatar_url = ?4, updated_at = ?5
                     WHERE id = ?1",
                    rusqlite::params![id, username, full_name, avatar_url, now],
                )?;
            } else {
                tx.execute(
                    "INSERT INTO profiles (id, username, full_name, avatar_url, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    rusqlite::params![id, username, full_name, avatar_url, now],
                )?;
            }
            tx.commit()?;
            Ok(!exists)
        })
    }

    pub fn get_profile(&self, id: &str) -> Result<Option<ProfileRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM profiles p WHERE p.id = ?1", PROFILE_COLUMNS);
            conn.query_row(&sql, [id], profile_from_row).optional()
        })
    }

    pub fn list_profiles(&self, filter: &Filter, order: Option<&Order>, limit: u32) -> Result<Vec<ProfileRow>> {
        let select = format!("SELECT {} FROM profiles p", PROFILE_COLUMNS);
        self.with_conn(|conn| list(conn, Resource::Profiles, "p", &select, filter, order, limit, profile_from_row))
    }

    // -- Messages --

    pub fn insert_message(
        &self,
        id: &str,
        user_id: &str,
        channel: &str,
        message: &str,
        message_type: &str,
        created_at: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_messages (id, user_id, channel, message, message_type, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![id, user_id, channel, message, message_type, created_at],
            )?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!("{} WHERE m.id = ?1", MESSAGE_SELECT);
            conn.query_row(&sql, [id], message_from_row).optional()
        })
    }

    pub fn list_messages(&self, filter: &Filter, order: Option<&Order>, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            list(conn, Resource::ChatMessages, "m", MESSAGE_SELECT, filter, order, limit, message_from_row)
        })
    }

    // -- Photos --

    pub fn insert_photo(&self, photo: &NewPhotoRow<'_>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO ride_photos (id, user_id, photo_url, caption, location, ride_data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    photo.id,
                    photo.user_id,
                    photo.photo_url,
                    photo.caption,
                    photo.location,
                    photo.ride_data,
                    photo.created_at
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_photo(&self, id: &str) -> Result<Option<PhotoRow>> {
        self.with_conn(|conn| {
            let sql = format!("{} WHERE m.id = ?1", PHOTO_SELECT);
            conn.query_row(&sql, [id], photo_from_row).optional()
        })
    }

    pub fn list_photos(&self, filter: &Filter, order: Option<&Order>, limit: u32) -> Result<Vec<PhotoRow>> {
        self.with_conn(|conn| {
            list(conn, Resource::RidePhotos, "m", PHOTO_SELECT, filter, order, limit, photo_from_row)
        })
    }

    // -- Likes --

    /// Add a like and recount. Fails on a duplicate (user, photo) pair.
    /// Returns the new count, or None when the photo does not exist.
    pub fn insert_like(&self, id: &str, user_id: &str, photo_id: &str, now: &str) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            if !photo_exists(&tx, photo_id)? {
                return Ok(None);
            }
            tx.execute(
                "INSERT INTO photo_likes (id, user_id, photo_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id, user_id, photo_id, now],
            )?;
            let count = recount_likes(&tx, photo_id)?;
            tx.commit()?;
            Ok(Some(count))
        })
    }

    /// Toggle a like: removes it if present, inserts it if not, then
    /// recomputes `likes_count` from the like rows. All in one transaction,
    /// so concurrent toggles by the same user serialize instead of racing.
    /// Returns None when the photo does not exist.
    pub fn toggle_like(&self, id: &str, user_id: &str, photo_id: &str, now: &str) -> Result<Option<ToggleOutcome>> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            if !photo_exists(&tx, photo_id)? {
                return Ok(None);
            }

            let existing = tx
                .query_row(
                    &format!("SELECT {} FROM photo_likes m WHERE m.user_id = ?1 AND m.photo_id = ?2", LIKE_COLUMNS),
                    [user_id, photo_id],
                    like_from_row,
                )
                .optional()?;

            let (liked, like) = match existing {
                Some(like) => {
                    tx.execute("DELETE FROM photo_likes WHERE id = ?1", [&like.id])?;
                    (false, like)
                }
                None => {
                    tx.execute(
                        "INSERT INTO photo_likes (id, user_id, photo_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                        rusqlite::params![id, user_id, photo_id, now],
                    )?;
                    let like = LikeRow {
                        id: id.to_string(),
                        user_id: user_id.to_string(),
                        photo_id: photo_id.to_string(),
                        created_at: now.to_string(),
                    };
                    (true, like)
                }
            };

            let likes_count = recount_likes(&tx, photo_id)?;
            tx.commit()?;

            Ok(Some(ToggleOutcome { liked, like, likes_count }))
        })
    }

    pub fn get_like(&self, id: &str) -> Result<Option<LikeRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM photo_likes m WHERE m.id = ?1", LIKE_COLUMNS);
            conn.query_row(&sql, [id], like_from_row).optional()
        })
    }

    pub fn list_likes(&self, filter: &Filter, order: Option<&Order>, limit: u32) -> Result<Vec<LikeRow>> {
        let select = format!("SELECT {} FROM photo_likes m", LIKE_COLUMNS);
        self.with_conn(|conn| list(conn, Resource::PhotoLikes, "m", &select, filter, order, limit, like_from_row))
    }
}

fn photo_exists(conn: &Connection, photo_id: &str) -> Result<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM ride_photos WHERE id = ?1", [photo_id], |_| Ok(()))
        .optional()?
        .is_some())
}

fn recount_likes(conn: &Connection, photo_id: &str) -> Result<i64> {
    conn.execute(
        "UPDATE ride_photos SET likes_count = (SELECT COUNT(*) FROM photo_likes WHERE photo_id = ?1)
         WHERE id = ?1",
        [photo_id],
    )?;
    let count = conn.query_row("SELECT likes_count FROM ride_photos WHERE id = ?1", [photo_id], |row| row.get(0))?;
    Ok(count)
}

/// Shared filtered/ordered/limited SELECT. Column names come from the
/// resource whitelist, values are always bound as parameters.
#[allow(clippy::too_many_arguments)]
fn list<T>(
    conn: &Connection,
    resource: Resource,
    alias: &str,
    select: &str,
    filter: &Filter,
    order: Option<&Order>,
    limit: u32,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> Result<Vec<T>> {
    let allowed = resource.columns();
    let mut clauses = Vec::new();
    let mut values: Vec<&str> = Vec::new();

    for (column, value) in filter.iter() {
        if !allowed.contains(&column) {
            bail!("unknown column '{}' on {}", column, resource);
        }
        values.push(value);
        clauses.push(format!("{}.{} = ?{}", alias, column, values.len()));
    }

    let order_sql = match order {
        Some(order) => {
            if !allowed.contains(&order.column.as_str()) {
                bail!("unknown column '{}' on {}", order.column, resource);
            }
            let dir = order.direction.as_sql();
            format!("{a}.{c} {d}, {a}.rowid {d}", a = alias, c = order.column, d = dir)
        }
        None => format!("{}.rowid ASC", alias),
    };

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };

    let sql = format!(
        "{}{} ORDER BY {} LIMIT ?{}",
        select,
        where_sql,
        order_sql,
        values.len() + 1
    );

    let mut params: Vec<&dyn ToSql> = values.iter().map(|v| v as &dyn ToSql).collect();
    params.push(&limit);

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params.as_slice(), map)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<ProfileRow> {
    Ok(ProfileRow {
        id: row.get(0)?,
        username: row.get(1)?,
        full_name: row.get(2)?,
        avatar_url: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        channel: row.get(2)?,
        message: row.get(3)?,
        message_type: row.get(4)?,
        created_at: row.get(5)?,
        author_username: row.get(6)?,
        author_avatar_url: row.get(7)?,
    })
}

fn photo_from_row(row: &Row<'_>) -> rusqlite::Result<PhotoRow> {
    Ok(PhotoRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        photo_url: row.get(2)?,
        caption: row.get(3)?,
        location: row.get(4)?,
        ride_data: row.get(5)?,
        likes_count: row.get(6)?,
        created_at: row.get(7)?,
        author_username: row.get(8)?,
        author_avatar_url: row.get(9)?,
    })
}

fn like_from_row(row: &Row<'_>) -> rusqlite::Result<LikeRow> {
    Ok(LikeRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        photo_id: row.get(2)?,
        created_at: row.get(3)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
