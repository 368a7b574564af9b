use crate::chat::{Conversation, Message, NewMessage, Role};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteConnectOptions, ConnectOptions, Row, SqlitePool};
use std::{path::Path, str::FromStr};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open the store at a file path, creating the database (and its
    /// parent directory) if missing.
    pub async fn new(db_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        use anyhow::Context;

        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());
        let options = SqliteConnectOptions::from_str(&db_url)
            .context("Invalid database path")?
            .create_if_missing(true)
            .foreign_keys(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self { pool })
    }

    /// In-memory store for tests. A single pooled connection, because every
    /// `:memory:` connection is its own database.
    pub async fn in_memory() -> anyhow::Result<Self> {
        use anyhow::Context;
        use sqlx::sqlite::SqlitePoolOptions;

        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("Invalid in-memory options")?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> anyhow::Result<()> {
        use anyhow::Context;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                user_id TEXT,
                title TEXT NOT NULL,
                language TEXT NOT NULL DEFAULT 'en',
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
                content TEXT NOT NULL,
                image_url TEXT,
                audio_url TEXT,
                metadata TEXT,
                created_at DATETIME NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation_created
                ON messages(conversation_id, created_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        Ok(())
    }

    // --- Conversations ---

    pub async fn create_conversation(
        &self,
        user_id: Option<String>,
        title: &str,
        language: &str,
    ) -> StoreResult<Conversation> {
        let convo = Conversation::new(user_id, title, language);

        sqlx::query(
            r#"
            INSERT INTO conversations (id, user_id, title, language, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&convo.id)
        .bind(&convo.user_id)
        .bind(&convo.title)
        .bind(&convo.language)
        .bind(convo.created_at)
        .bind(convo.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(convo)
    }

    pub async fn get_conversation(&self, id: &str) -> StoreResult<Conversation> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, title, language, created_at, updated_at
            FROM conversations WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row_to_conversation(&row)?),
            None => Err(StoreError::ConversationNotFound(id.to_string())),
        }
    }

    /// Refresh `updated_at`; called after every completed message append.
    pub async fn touch_conversation(&self, id: &str) -> StoreResult<()> {
        let result = sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ConversationNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn get_user_conversations(&self, user_id: &str) -> StoreResult<Vec<Conversation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, title, language, created_at, updated_at
            FROM conversations
            WHERE user_id = ?
            ORDER BY updated_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_conversation).collect::<Result<_, _>>().map_err(Into::into)
    }

    // --- Messages ---

    pub async fn create_message(
        &self,
        conversation_id: &str,
        role: Role,
        new: NewMessage,
    ) -> StoreResult<Message> {
        // Explicit existence check so the caller gets a typed not-found
        // instead of a bare FK violation.
        let exists = sqlx::query("SELECT 1 FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(StoreError::ConversationNotFound(conversation_id.to_string()));
        }

        let msg = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role,
            content: new.content,
            image_url: new.image_url,
            audio_url: new.audio_url,
            metadata: new.metadata,
            created_at: Utc::now(),
        };

        let metadata_json = match &msg.metadata {
            Some(value) => Some(serde_json::to_string(value).map_err(|e| {
                StoreError::Database(sqlx::Error::Decode(Box::new(e)))
            })?),
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, role, content, image_url, audio_url, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&msg.id)
        .bind(&msg.conversation_id)
        .bind(msg.role.as_str())
        .bind(&msg.content)
        .bind(&msg.image_url)
        .bind(&msg.audio_url)
        .bind(&metadata_json)
        .bind(msg.created_at)
        .execute(&self.pool)
        .await?;

        Ok(msg)
    }

    /// Full history for a conversation, oldest to newest. `rowid` breaks
    /// ties between same-instant inserts so order stays insertion order.
    pub async fn get_conversation_messages(&self, conversation_id: &str) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, role, content, image_url, audio_url, metadata, created_at
            FROM messages
            WHERE conversation_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            messages.push(row_to_message(row)?);
        }
        Ok(messages)
    }
}

fn row_to_conversation(row: &sqlx::sqlite::SqliteRow) -> Result<Conversation, sqlx::Error> {
    Ok(Conversation {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        title: row.try_get("title")?,
        language: row.try_get("language")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message, sqlx::Error> {
    let role_str: String = row.try_get("role")?;
    let role = Role::parse(&role_str).unwrap_or(Role::User);

    let metadata: Option<String> = row.try_get("metadata")?;
    let metadata = metadata.and_then(|raw| serde_json::from_str(&raw).ok());

    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        role,
        content: row.try_get("content")?,
        image_url: row.try_get("image_url")?,
        audio_url: row.try_get("audio_url")?,
        metadata,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}
