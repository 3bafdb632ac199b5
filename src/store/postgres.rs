use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPool, Row};
use tracing::info;

use super::{MessageStore, StoreError};
use crate::server::message::{ChatMessage, MessageId, NewMessage};

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StoreError::Unavailable(err.to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Serialization(err.to_string())
            }
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// Durable message history in PostgreSQL.
///
/// `BIGSERIAL` ids give the total order used for history and cursors.
#[derive(Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    /// Connects to `database_url` and creates the `messages` table if needed.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        let store = Self { pool };
        store.setup().await?;
        Ok(store)
    }

    async fn setup(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id BIGSERIAL PRIMARY KEY,
                room TEXT NOT NULL,
                username TEXT NOT NULL,
                content TEXT NOT NULL,
                avatar TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS messages_room_id_idx ON messages (room, id DESC)")
            .execute(&self.pool)
            .await?;

        info!("PostgreSQL message store ready");
        Ok(())
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn insert(&self, message: NewMessage) -> Result<ChatMessage, StoreError> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO messages (room, username, content, avatar, created_at)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id",
        )
        .bind(&message.room)
        .bind(&message.username)
        .bind(&message.content)
        .bind(&message.avatar)
        .bind(message.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(ChatMessage::persisted(MessageId(id), message))
    }

    async fn query_recent(
        &self,
        room: &str,
        limit: usize,
        before: Option<MessageId>,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT id, room, username, content, avatar, created_at
             FROM messages
             WHERE room = $1 AND ($2::BIGINT IS NULL OR id < $2)
             ORDER BY id DESC
             LIMIT $3",
        )
        .bind(room)
        .bind(before.map(|cursor| cursor.0))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<ChatMessage, StoreError> {
                Ok(ChatMessage {
                    id: MessageId(row.try_get("id")?),
                    room: row.try_get("room")?,
                    username: row.try_get("username")?,
                    content: row.try_get("content")?,
                    avatar: row.try_get("avatar")?,
                    created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
                })
            })
            .collect()
    }
}
