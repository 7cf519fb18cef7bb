use async_trait::async_trait;
use serde::Serialize;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use thiserror::Error;
use time::OffsetDateTime;

use crate::moderation::{AbuseKey, AbuseRecord, ToxicityScores};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("could not encode toxicity scores: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(with = "time::serde::rfc3339")]
    pub joined_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Room {
    pub id: String,
    pub name: String,
    pub created_by: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub content: String,
    pub sender: String,
    pub room_id: String,
    pub toxicity: Option<ToxicityScores>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Durable rooms, users, memberships and message history.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Returns the room, creating it with `creator` as owner if it's new.
    async fn get_or_create_room(&self, room_id: &str, creator: &str) -> StoreResult<Room>;

    async fn room(&self, room_id: &str) -> StoreResult<Option<Room>>;

    async fn get_or_create_user(&self, username: &str) -> StoreResult<User>;

    /// Stores a message and returns its id.
    async fn save_message(&self, content: &str, sender: &str, room_id: &str, scores: &ToxicityScores) -> StoreResult<i64>;

    /// Records a membership. `true` if the user had never joined this room before.
    async fn join_room(&self, username: &str, room_id: &str) -> StoreResult<bool>;

    /// Deletes a message if `requester` wrote it, returning the room it was in.
    async fn delete_message(&self, message_id: i64, requester: &str) -> StoreResult<Option<String>>;

    async fn rooms_for_user(&self, username: &str) -> StoreResult<Vec<Room>>;

    /// Latest `limit` messages in chronological order.
    async fn recent_messages(&self, room_id: &str, limit: u32) -> StoreResult<Vec<StoredMessage>>;

    /// `(sender, toxicity)` for every stored message in the room.
    async fn message_toxicity(&self, room_id: &str) -> StoreResult<Vec<(String, f64)>>;

    async fn load_abuse(&self, username: &str, room_id: &str) -> StoreResult<Option<AbuseRecord>>;

    async fn abuse_in_room(&self, room_id: &str) -> StoreResult<Vec<(AbuseKey, AbuseRecord)>>;

    async fn abuse_of_user(&self, username: &str) -> StoreResult<Vec<(AbuseKey, AbuseRecord)>>;

    /// Upserts a record; a write older than the stored revision is ignored.
    async fn save_abuse(&self, key: &AbuseKey, record: &AbuseRecord) -> StoreResult<()>;
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        joined_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS rooms (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        created_by TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS room_members (
        username TEXT NOT NULL,
        room_id TEXT NOT NULL,
        joined_at TEXT NOT NULL,
        PRIMARY KEY (username, room_id)
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        content TEXT NOT NULL,
        sender TEXT NOT NULL,
        room_id TEXT NOT NULL,
        toxicity_scores TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS messages_room ON messages (room_id, id)",
    "CREATE TABLE IF NOT EXISTS user_mutes (
        username TEXT NOT NULL,
        room_id TEXT NOT NULL,
        consecutive_toxic_count INTEGER NOT NULL,
        warning_count INTEGER NOT NULL,
        is_muted BOOLEAN NOT NULL,
        muted_at TEXT,
        mute_expires_at TEXT,
        total_mute_count INTEGER NOT NULL,
        revision INTEGER NOT NULL,
        PRIMARY KEY (username, room_id)
    )",
    "CREATE TABLE IF NOT EXISTS auth_tokens (
        token TEXT PRIMARY KEY,
        username TEXT NOT NULL,
        expires_at TEXT
    )",
];

#[derive(Clone)]
pub struct SqliteStore {
    db_pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> StoreResult<SqliteStore> {
        let db_pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;

        let store = SqliteStore { db_pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Single-connection in-memory database.
    pub async fn in_memory() -> StoreResult<SqliteStore> {
        let db_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = SqliteStore { db_pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.db_pool).await?;
        }
        Ok(())
    }

    /// Registers a bearer token. Tokens are normally issued elsewhere.
    pub async fn insert_token(&self, token: &str, username: &str, expires_at: Option<OffsetDateTime>) -> StoreResult<()> {
        sqlx::query("INSERT OR REPLACE INTO auth_tokens (token,username,expires_at) VALUES (?,?,?)")
            .bind(token)
            .bind(username)
            .bind(expires_at)
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }

    pub async fn token_owner(&self, token: &str, now: OffsetDateTime) -> StoreResult<Option<String>> {
        let row: Option<(String, Option<OffsetDateTime>)> =
            sqlx::query_as("SELECT username,expires_at FROM auth_tokens WHERE token=?")
                .bind(token)
                .fetch_optional(&self.db_pool)
                .await?;

        Ok(row.and_then(|(username, expires_at)| match expires_at {
            Some(expires_at) if expires_at <= now => None,
            _ => Some(username),
        }))
    }
}

const ABUSE_COLUMNS: &str = "username,room_id,consecutive_toxic_count,warning_count,is_muted,\
    muted_at,mute_expires_at,total_mute_count,revision";

#[derive(sqlx::FromRow)]
struct AbuseRow {
    username: String,
    room_id: String,
    consecutive_toxic_count: u32,
    warning_count: u32,
    is_muted: bool,
    muted_at: Option<OffsetDateTime>,
    mute_expires_at: Option<OffsetDateTime>,
    total_mute_count: u32,
    revision: i64,
}

impl AbuseRow {
    fn into_entry(self) -> (AbuseKey, AbuseRecord) {
        (
            AbuseKey {
                username: self.username,
                room_id: self.room_id,
            },
            AbuseRecord {
                consecutive_toxic_count: self.consecutive_toxic_count,
                warning_count: self.warning_count,
                is_muted: self.is_muted,
                muted_at: self.muted_at,
                mute_expires_at: self.mute_expires_at,
                total_mute_count: self.total_mute_count,
                revision: self.revision,
            },
        )
    }
}

fn default_room_name(room_id: &str) -> String {
    let mut chars = room_id.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

#[async_trait]
impl PersistenceStore for SqliteStore {
    async fn get_or_create_room(&self, room_id: &str, creator: &str) -> StoreResult<Room> {
        let created = sqlx::query("INSERT OR IGNORE INTO rooms (id,name,created_by,created_at) VALUES (?,?,?,?)")
            .bind(room_id)
            .bind(default_room_name(room_id))
            .bind(creator)
            .bind(OffsetDateTime::now_utc())
            .execute(&self.db_pool)
            .await?
            .rows_affected() > 0;

        if created {
            tracing::info!(room_id, creator, "created room");
        }

        Ok(
            sqlx::query_as("SELECT id,name,created_by,created_at FROM rooms WHERE id=?")
                .bind(room_id)
                .fetch_one(&self.db_pool)
                .await?
        )
    }

    async fn room(&self, room_id: &str) -> StoreResult<Option<Room>> {
        Ok(
            sqlx::query_as("SELECT id,name,created_by,created_at FROM rooms WHERE id=?")
                .bind(room_id)
                .fetch_optional(&self.db_pool)
                .await?
        )
    }

    async fn get_or_create_user(&self, username: &str) -> StoreResult<User> {
        let created = sqlx::query("INSERT OR IGNORE INTO users (username,joined_at) VALUES (?,?)")
            .bind(username)
            .bind(OffsetDateTime::now_utc())
            .execute(&self.db_pool)
            .await?
            .rows_affected() > 0;

        if created {
            tracing::info!(username, "created user");
        }

        Ok(
            sqlx::query_as("SELECT id,username,joined_at FROM users WHERE username=?")
                .bind(username)
                .fetch_one(&self.db_pool)
                .await?
        )
    }

    async fn save_message(&self, content: &str, sender: &str, room_id: &str, scores: &ToxicityScores) -> StoreResult<i64> {
        let scores = serde_json::to_string(scores)?;

        let id = sqlx::query("INSERT INTO messages (content,sender,room_id,toxicity_scores,created_at) VALUES (?,?,?,?,?)")
            .bind(content)
            .bind(sender)
            .bind(room_id)
            .bind(scores)
            .bind(OffsetDateTime::now_utc())
            .execute(&self.db_pool)
            .await?
            .last_insert_rowid();

        tracing::debug!(message_id = id, sender, room_id, "saved message");
        Ok(id)
    }

    async fn join_room(&self, username: &str, room_id: &str) -> StoreResult<bool> {
        Ok(
            sqlx::query("INSERT OR IGNORE INTO room_members (username,room_id,joined_at) VALUES (?,?,?)")
                .bind(username)
                .bind(room_id)
                .bind(OffsetDateTime::now_utc())
                .execute(&self.db_pool)
                .await?
                .rows_affected() > 0
        )
    }

    async fn delete_message(&self, message_id: i64, requester: &str) -> StoreResult<Option<String>> {
        let deleted: Option<(String,)> = sqlx::query_as("DELETE FROM messages WHERE id=? AND sender=? RETURNING room_id")
            .bind(message_id)
            .bind(requester)
            .fetch_optional(&self.db_pool)
            .await?;

        Ok(deleted.map(|(room_id,)| room_id))
    }

    async fn rooms_for_user(&self, username: &str) -> StoreResult<Vec<Room>> {
        Ok(
            sqlx::query_as(
                "SELECT rooms.id,rooms.name,rooms.created_by,rooms.created_at FROM rooms
                 JOIN room_members ON room_members.room_id = rooms.id
                 WHERE room_members.username=?
                 ORDER BY room_members.joined_at,rooms.id",
            )
            .bind(username)
            .fetch_all(&self.db_pool)
            .await?
        )
    }

    async fn recent_messages(&self, room_id: &str, limit: u32) -> StoreResult<Vec<StoredMessage>> {
        let rows: Vec<(i64, String, String, String, Option<String>, OffsetDateTime)> = sqlx::query_as(
            "SELECT id,content,sender,room_id,toxicity_scores,created_at FROM messages
             WHERE room_id=? ORDER BY id DESC LIMIT ?",
        )
        .bind(room_id)
        .bind(limit)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(rows
            .into_iter()
            .rev()
            .map(|(id, content, sender, room_id, scores, created_at)| StoredMessage {
                id,
                content,
                sender,
                room_id,
                toxicity: scores.and_then(|s| serde_json::from_str(&s).ok()),
                created_at,
            })
            .collect())
    }

    async fn message_toxicity(&self, room_id: &str) -> StoreResult<Vec<(String, f64)>> {
        let rows: Vec<(String, Option<String>)> =
            sqlx::query_as("SELECT sender,toxicity_scores FROM messages WHERE room_id=? ORDER BY id")
                .bind(room_id)
                .fetch_all(&self.db_pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(sender, scores)| {
                let toxicity = scores
                    .and_then(|s| serde_json::from_str::<ToxicityScores>(&s).ok())
                    .map_or(0.0, |scores| scores.toxicity);
                (sender, toxicity)
            })
            .collect())
    }

    async fn load_abuse(&self, username: &str, room_id: &str) -> StoreResult<Option<AbuseRecord>> {
        let row: Option<AbuseRow> =
            sqlx::query_as(&format!("SELECT {ABUSE_COLUMNS} FROM user_mutes WHERE username=? AND room_id=?"))
                .bind(username)
                .bind(room_id)
                .fetch_optional(&self.db_pool)
                .await?;

        Ok(row.map(|row| row.into_entry().1))
    }

    async fn abuse_in_room(&self, room_id: &str) -> StoreResult<Vec<(AbuseKey, AbuseRecord)>> {
        let rows: Vec<AbuseRow> = sqlx::query_as(&format!("SELECT {ABUSE_COLUMNS} FROM user_mutes WHERE room_id=?"))
            .bind(room_id)
            .fetch_all(&self.db_pool)
            .await?;

        Ok(rows.into_iter().map(AbuseRow::into_entry).collect())
    }

    async fn abuse_of_user(&self, username: &str) -> StoreResult<Vec<(AbuseKey, AbuseRecord)>> {
        let rows: Vec<AbuseRow> = sqlx::query_as(&format!("SELECT {ABUSE_COLUMNS} FROM user_mutes WHERE username=?"))
            .bind(username)
            .fetch_all(&self.db_pool)
            .await?;

        Ok(rows.into_iter().map(AbuseRow::into_entry).collect())
    }

    async fn save_abuse(&self, key: &AbuseKey, record: &AbuseRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO user_mutes (username,room_id,consecutive_toxic_count,warning_count,is_muted,
                muted_at,mute_expires_at,total_mute_count,revision) VALUES (?,?,?,?,?,?,?,?,?)
             ON CONFLICT (username,room_id) DO UPDATE SET
                consecutive_toxic_count=excluded.consecutive_toxic_count,
                warning_count=excluded.warning_count,
                is_muted=excluded.is_muted,
                muted_at=excluded.muted_at,
                mute_expires_at=excluded.mute_expires_at,
                total_mute_count=excluded.total_mute_count,
                revision=excluded.revision
             WHERE excluded.revision > user_mutes.revision",
        )
        .bind(&key.username)
        .bind(&key.room_id)
        .bind(record.consecutive_toxic_count)
        .bind(record.warning_count)
        .bind(record.is_muted)
        .bind(record.muted_at)
        .bind(record.mute_expires_at)
        .bind(record.total_mute_count)
        .bind(record.revision)
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }
}
