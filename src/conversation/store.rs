//! Conversation and message persistence (SQLite).

use crate::db::{from_millis, to_millis};
use crate::error::Result;
use crate::{ConversationKey, InboundMessage};
use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row as _, SqlitePool};
use std::collections::BTreeSet;

/// Conversation-level state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conversation {
    pub key: ConversationKey,
    pub relevance_score: f64,
    pub topic_summary: Option<String>,
    pub last_response_id: Option<String>,
    pub is_shared: bool,
    pub shared_with: BTreeSet<String>,
    pub updated_at: DateTime<Utc>,
}

/// One persisted chat message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageRecord {
    pub key: ConversationKey,
    /// Platform message id.
    pub message_id: String,
    pub author_id: String,
    pub author_name: String,
    pub content: String,
    pub is_bot: bool,
    pub relevance_score: f64,
    pub has_key_info: bool,
    pub is_analyzed: bool,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    /// A message waiting for analysis.
    pub fn unanalyzed(message: &InboundMessage) -> Self {
        Self {
            key: message.key.clone(),
            message_id: message.id.clone(),
            author_id: message.author_id.clone(),
            author_name: message.author_name.clone(),
            content: message.content.clone(),
            is_bot: message.author_is_bot,
            relevance_score: 0.0,
            has_key_info: false,
            is_analyzed: false,
            created_at: message.timestamp,
        }
    }

    /// A message whose verdict is already known.
    pub fn analyzed(message: &InboundMessage, relevance_score: f64) -> Self {
        Self {
            relevance_score: clamp_score(relevance_score),
            is_analyzed: true,
            ..Self::unanalyzed(message)
        }
    }
}

/// Clamp into `[0, 1]`, mapping NaN to 0.
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// Durable storage for conversations and their messages.
#[async_trait]
pub trait ConversationRepository: Send + Sync + 'static {
    async fn get_conversation(&self, key: &ConversationKey) -> Result<Option<Conversation>>;

    /// Append a message, creating the conversation row when needed.
    async fn add_message(&self, record: &MessageRecord) -> Result<()>;

    /// The newest `limit` messages, returned oldest first.
    async fn recent_messages(&self, key: &ConversationKey, limit: i64) -> Result<Vec<MessageRecord>>;

    /// Store the analysis result for one message. Returns whether the message exists.
    async fn update_message_analysis(
        &self,
        key: &ConversationKey,
        message_id: &str,
        relevance_score: f64,
        has_key_info: bool,
    ) -> Result<bool>;

    async fn update_conversation_analysis(
        &self,
        key: &ConversationKey,
        relevance_score: f64,
        topic_summary: Option<&str>,
    ) -> Result<()>;

    async fn set_last_response(&self, key: &ConversationKey, response_id: &str) -> Result<()>;

    /// Share a conversation with a user. Returns false when the conversation is unknown.
    async fn share(&self, key: &ConversationKey, user_id: &str) -> Result<bool>;

    async fn shared_with(&self, user_id: &str) -> Result<Vec<Conversation>>;

    /// Delete a conversation and its messages.
    async fn delete_conversation(&self, key: &ConversationKey) -> Result<bool>;

    /// Delete conversations not updated since `before`. Returns the number removed.
    async fn delete_inactive(&self, before: DateTime<Utc>) -> Result<u64>;
}

const CONVERSATION_COLUMNS: &str = "channel_id, guild_id, relevance_score, topic_summary, last_response_id, is_shared, shared_with, updated_at";

/// SQLite-backed conversation store.
#[derive(Debug, Clone)]
pub struct SqliteConversationStore {
    pool: SqlitePool,
}

impl SqliteConversationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the conversation tables.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL,
                guild_id TEXT NOT NULL DEFAULT '',
                relevance_score REAL NOT NULL DEFAULT 0,
                topic_summary TEXT,
                last_response_id TEXT,
                is_shared INTEGER NOT NULL DEFAULT 0,
                shared_with TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (channel_id, guild_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create conversations table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversation_messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                user_name TEXT NOT NULL,
                content TEXT NOT NULL,
                is_bot INTEGER NOT NULL DEFAULT 0,
                relevance_score REAL NOT NULL DEFAULT 0,
                has_key_info INTEGER NOT NULL DEFAULT 0,
                is_analyzed INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create conversation_messages table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conversation_messages_recent ON conversation_messages (conversation_id, created_at)",
        )
        .execute(&self.pool)
        .await
        .context("failed to create conversation_messages index")?;

        Ok(())
    }

    /// Return the conversation row id, creating the row if needed.
    async fn upsert_conversation(&self, key: &ConversationKey, at: DateTime<Utc>) -> Result<String> {
        let id: String = sqlx::query_scalar(
            r#"
            INSERT INTO conversations (id, channel_id, guild_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(channel_id, guild_id) DO UPDATE SET updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&key.channel_id)
        .bind(key.guild_column())
        .bind(to_millis(at))
        .bind(to_millis(at))
        .fetch_one(&self.pool)
        .await
        .context("failed to upsert conversation")?;

        Ok(id)
    }
}

#[async_trait]
impl ConversationRepository for SqliteConversationStore {
    async fn get_conversation(&self, key: &ConversationKey) -> Result<Option<Conversation>> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE channel_id = ? AND guild_id = ?"
        ))
        .bind(&key.channel_id)
        .bind(key.guild_column())
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch conversation")?;

        row.map(conversation_from_row).transpose()
    }

    async fn add_message(&self, record: &MessageRecord) -> Result<()> {
        let conversation_id = self.upsert_conversation(&record.key, Utc::now()).await?;

        sqlx::query(
            r#"
            INSERT INTO conversation_messages (
                id, conversation_id, message_id, user_id, user_name, content,
                is_bot, relevance_score, has_key_info, is_analyzed, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&conversation_id)
        .bind(&record.message_id)
        .bind(&record.author_id)
        .bind(&record.author_name)
        .bind(&record.content)
        .bind(record.is_bot)
        .bind(clamp_score(record.relevance_score))
        .bind(record.has_key_info)
        .bind(record.is_analyzed)
        .bind(to_millis(record.created_at))
        .execute(&self.pool)
        .await
        .context("failed to insert conversation message")?;

        Ok(())
    }

    async fn recent_messages(&self, key: &ConversationKey, limit: i64) -> Result<Vec<MessageRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT m.message_id, m.user_id, m.user_name, m.content, m.is_bot,
                   m.relevance_score, m.has_key_info, m.is_analyzed, m.created_at
            FROM conversation_messages m
            JOIN conversations c ON c.id = m.conversation_id
            WHERE c.channel_id = ? AND c.guild_id = ?
            ORDER BY m.created_at DESC, m.rowid DESC
            LIMIT ?
            "#,
        )
        .bind(&key.channel_id)
        .bind(key.guild_column())
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .context("failed to load recent messages")?;

        let mut messages = rows
            .into_iter()
            .map(|row| message_from_row(key, row))
            .collect::<Result<Vec<_>>>()?;

        // Return in chronological order
        messages.reverse();
        Ok(messages)
    }

    async fn update_message_analysis(
        &self,
        key: &ConversationKey,
        message_id: &str,
        relevance_score: f64,
        has_key_info: bool,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE conversation_messages
            SET relevance_score = ?, has_key_info = ?, is_analyzed = 1
            WHERE message_id = ?
              AND conversation_id = (
                  SELECT id FROM conversations WHERE channel_id = ? AND guild_id = ?
              )
            "#,
        )
        .bind(clamp_score(relevance_score))
        .bind(has_key_info)
        .bind(message_id)
        .bind(&key.channel_id)
        .bind(key.guild_column())
        .execute(&self.pool)
        .await
        .context("failed to update message analysis")?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_conversation_analysis(
        &self,
        key: &ConversationKey,
        relevance_score: f64,
        topic_summary: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now();
        self.upsert_conversation(key, now).await?;

        sqlx::query(
            r#"
            UPDATE conversations
            SET relevance_score = ?, topic_summary = COALESCE(?, topic_summary), updated_at = ?
            WHERE channel_id = ? AND guild_id = ?
            "#,
        )
        .bind(clamp_score(relevance_score))
        .bind(topic_summary)
        .bind(to_millis(now))
        .bind(&key.channel_id)
        .bind(key.guild_column())
        .execute(&self.pool)
        .await
        .context("failed to update conversation analysis")?;

        Ok(())
    }

    async fn set_last_response(&self, key: &ConversationKey, response_id: &str) -> Result<()> {
        let now = Utc::now();
        self.upsert_conversation(key, now).await?;

        sqlx::query(
            "UPDATE conversations SET last_response_id = ?, updated_at = ? WHERE channel_id = ? AND guild_id = ?",
        )
        .bind(response_id)
        .bind(to_millis(now))
        .bind(&key.channel_id)
        .bind(key.guild_column())
        .execute(&self.pool)
        .await
        .context("failed to set last response")?;

        Ok(())
    }

    async fn share(&self, key: &ConversationKey, user_id: &str) -> Result<bool> {
        let Some(mut conversation) = self.get_conversation(key).await? else {
            return Ok(false);
        };
        conversation.shared_with.insert(user_id.to_string());
        let shared_with =
            serde_json::to_string(&conversation.shared_with).context("failed to encode shared_with")?;

        sqlx::query(
            "UPDATE conversations SET is_shared = 1, shared_with = ? WHERE channel_id = ? AND guild_id = ?",
        )
        .bind(shared_with)
        .bind(&key.channel_id)
        .bind(key.guild_column())
        .execute(&self.pool)
        .await
        .context("failed to share conversation")?;

        Ok(true)
    }

    async fn shared_with(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE is_shared = 1 AND EXISTS (SELECT 1 FROM json_each(conversations.shared_with) WHERE value = ?) \
             ORDER BY updated_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list shared conversations")?;

        rows.into_iter().map(conversation_from_row).collect()
    }

    async fn delete_conversation(&self, key: &ConversationKey) -> Result<bool> {
        sqlx::query(
            r#"
            DELETE FROM conversation_messages
            WHERE conversation_id IN (
                SELECT id FROM conversations WHERE channel_id = ? AND guild_id = ?
            )
            "#,
        )
        .bind(&key.channel_id)
        .bind(key.guild_column())
        .execute(&self.pool)
        .await
        .context("failed to delete conversation messages")?;

        let result = sqlx::query("DELETE FROM conversations WHERE channel_id = ? AND guild_id = ?")
            .bind(&key.channel_id)
            .bind(key.guild_column())
            .execute(&self.pool)
            .await
            .context("failed to delete conversation")?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_inactive(&self, before: DateTime<Utc>) -> Result<u64> {
        sqlx::query(
            r#"
            DELETE FROM conversation_messages
            WHERE conversation_id IN (SELECT id FROM conversations WHERE updated_at < ?)
            "#,
        )
        .bind(to_millis(before))
        .execute(&self.pool)
        .await
        .context("failed to delete inactive conversation messages")?;

        let result = sqlx::query("DELETE FROM conversations WHERE updated_at < ?")
            .bind(to_millis(before))
            .execute(&self.pool)
            .await
            .context("failed to delete inactive conversations")?;

        Ok(result.rows_affected())
    }
}

fn conversation_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Conversation> {
    let shared_with: String = row.try_get("shared_with").unwrap_or_default();

    Ok(Conversation {
        key: ConversationKey::from_columns(
            row.try_get("channel_id")
                .context("failed to read conversation channel_id")?,
            row.try_get("guild_id").unwrap_or_default(),
        ),
        relevance_score: row.try_get("relevance_score").unwrap_or(0.0),
        topic_summary: row.try_get::<Option<String>, _>("topic_summary").ok().flatten(),
        last_response_id: row
            .try_get::<Option<String>, _>("last_response_id")
            .ok()
            .flatten(),
        is_shared: row.try_get::<i64, _>("is_shared").unwrap_or(0) != 0,
        shared_with: serde_json::from_str(&shared_with).unwrap_or_default(),
        updated_at: from_millis(
            row.try_get("updated_at")
                .context("failed to read conversation updated_at")?,
            "updated_at",
        )?,
    })
}

fn message_from_row(key: &ConversationKey, row: sqlx::sqlite::SqliteRow) -> Result<MessageRecord> {
    Ok(MessageRecord {
        key: key.clone(),
        message_id: row
            .try_get("message_id")
            .context("failed to read message_id")?,
        author_id: row.try_get("user_id").context("failed to read user_id")?,
        author_name: row.try_get("user_name").unwrap_or_default(),
        content: row.try_get("content").unwrap_or_default(),
        is_bot: row.try_get::<i64, _>("is_bot").unwrap_or(0) != 0,
        relevance_score: row.try_get("relevance_score").unwrap_or(0.0),
        has_key_info: row.try_get::<i64, _>("has_key_info").unwrap_or(0) != 0,
        is_analyzed: row.try_get::<i64, _>("is_analyzed").unwrap_or(0) != 0,
        created_at: from_millis(
            row.try_get("created_at")
                .context("failed to read message created_at")?,
            "created_at",
        )?,
    })
}
