use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS profiles (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            full_name   TEXT,
            avatar_url  TEXT,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS chat_messages (
            id              TEXT PRIMARY KEY,
            user_id         TEXT NOT NULL REFERENCES profiles(id),
            channel         TEXT NOT NULL DEFAULT 'group_chat',
            message         TEXT NOT NULL,
            message_type    TEXT NOT NULL DEFAULT 'text'
                            CHECK (message_type IN ('text', 'voice')),
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_chat_messages_channel
            ON chat_messages(channel, created_at);

        CREATE TABLE IF NOT EXISTS ride_photos (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL REFERENCES profiles(id),
            photo_url   TEXT NOT NULL,
            caption     TEXT,
            location    TEXT,
            ride_data   TEXT,
            likes_count INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_ride_photos_created
            ON ride_photos(created_at);

        CREATE TABLE IF NOT EXISTS photo_likes (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL REFERENCES profiles(id),
            photo_id    TEXT NOT NULL REFERENCES ride_photos(id),
            created_at  TEXT NOT NULL,
            UNIQUE(user_id, photo_id)
        );

        CREATE INDEX IF NOT EXISTS idx_photo_likes_photo
            ON photo_likes(photo_id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
