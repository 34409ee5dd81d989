//! Postgres-backed conversation store.
//!
//! Writers that touch a conversation's log lock its row with
//! `SELECT ... FOR UPDATE`, so remove-and-append steps from concurrent
//! requests serialize per conversation.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    types::Json,
    PgPool, Postgres, Row, Transaction,
};

use crate::error::StoreError;
use crate::store::{ConversationStore, MessagePredicate};
use crate::types::{ChatMessage, Conversation, Sender};

const CONVERSATION_COLUMNS: &str = "id, visitor_id, assigned_agent_id, category_id, \
     status_message_id, started_at, ended_at, archived, last_message_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender, text, metadata, created_at";

pub struct PgConversationStore {
    pool: PgPool,
}

impl PgConversationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects and brings the schema up to date.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self::new(pool))
    }

    async fn lock_conversation(
        tx: &mut Transaction<'_, Postgres>,
        conversation_id: &str,
    ) -> Result<Option<Option<String>>, StoreError> {
        let row = sqlx::query("SELECT status_message_id FROM conversations WHERE id = $1 FOR UPDATE")
            .bind(conversation_id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get::<Option<String>, _>("status_message_id")?),
            None => None,
        })
    }

    async fn messages_in(
        tx: &mut Transaction<'_, Postgres>,
        conversation_id: &str,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 ORDER BY seq ASC"
        ))
        .bind(conversation_id)
        .fetch_all(&mut **tx)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    /// Deletes the matching messages inside `tx` and releases the status slot
    /// if its occupant was among them.
    async fn delete_matching(
        tx: &mut Transaction<'_, Postgres>,
        conversation_id: &str,
        status_message_id: Option<&str>,
        predicate: MessagePredicate<'_>,
    ) -> Result<usize, StoreError> {
        let messages = Self::messages_in(tx, conversation_id).await?;
        let ids = matching_ids(&messages, predicate);
        if ids.is_empty() {
            return Ok(0);
        }

        sqlx::query("DELETE FROM messages WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut **tx)
            .await?;

        if let Some(status_id) = status_message_id {
            if ids.iter().any(|id| id == status_id) {
                sqlx::query("UPDATE conversations SET status_message_id = NULL WHERE id = $1")
                    .bind(conversation_id)
                    .execute(&mut **tx)
                    .await?;
            }
        }
        Ok(ids.len())
    }

    async fn insert_message(
        tx: &mut Transaction<'_, Postgres>,
        message: &ChatMessage,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, sender, text, metadata, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6)",
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(message.sender.as_str())
        .bind(&message.text)
        .bind(Json(&message.metadata))
        .bind(message.created_at)
        .execute(&mut **tx)
        .await?;

        sqlx::query("UPDATE conversations SET last_message_at = $2 WHERE id = $1")
            .bind(&message.conversation_id)
            .bind(message.created_at)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn update_returning(
        &self,
        conversation_id: &str,
        assignment: &str,
        value: Option<&str>,
    ) -> Result<Conversation, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE conversations SET {assignment} WHERE id = $1 RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(conversation_id)
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => conversation_from_row(&row),
            None => Err(not_found(conversation_id)),
        }
    }
}

fn not_found(conversation_id: &str) -> StoreError {
    StoreError::ConversationNotFound {
        id: conversation_id.to_string(),
    }
}

fn matching_ids(messages: &[ChatMessage], predicate: MessagePredicate<'_>) -> Vec<String> {
    messages
        .iter()
        .filter(|message| predicate(message))
        .map(|message| message.id.clone())
        .collect()
}

fn conversation_from_row(row: &PgRow) -> Result<Conversation, StoreError> {
    Ok(Conversation {
        id: row.try_get("id")?,
        visitor_id: row.try_get("visitor_id")?,
        assigned_agent_id: row.try_get("assigned_agent_id")?,
        category_id: row.try_get("category_id")?,
        status_message_id: row.try_get("status_message_id")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        archived: row.try_get("archived")?,
        last_message_at: row.try_get("last_message_at")?,
    })
}

fn message_from_row(row: &PgRow) -> Result<ChatMessage, StoreError> {
    let raw_sender: String = row.try_get("sender")?;
    let sender = Sender::parse(&raw_sender)
        .ok_or_else(|| StoreError::InvalidRow(format!("unknown sender {raw_sender:?}")))?;
    let Json(metadata) = row.try_get::<Json<Map<String, Value>>, _>("metadata")?;
    Ok(ChatMessage {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        sender,
        text: row.try_get("text")?,
        created_at: row.try_get("created_at")?,
        metadata,
    })
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn ensure_conversation(
        &self,
        conversation_id: &str,
        visitor_id: &str,
    ) -> Result<Conversation, StoreError> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO conversations (id, visitor_id, started_at, last_message_at) \
             VALUES ($1,$2,$3,$3) ON CONFLICT (id) DO NOTHING",
        )
        .bind(conversation_id)
        .bind(visitor_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_conversation(conversation_id)
            .await?
            .ok_or_else(|| not_found(conversation_id))
    }

    async fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn append_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        if Self::lock_conversation(&mut tx, &message.conversation_id)
            .await?
            .is_none()
        {
            return Err(not_found(&message.conversation_id));
        }
        Self::insert_message(&mut tx, message).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_status_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let previous = Self::lock_conversation(&mut tx, &message.conversation_id)
            .await?
            .ok_or_else(|| not_found(&message.conversation_id))?;
        if let Some(previous) = previous {
            sqlx::query("DELETE FROM messages WHERE id = $1")
                .bind(previous)
                .execute(&mut *tx)
                .await?;
        }
        Self::insert_message(&mut tx, message).await?;
        sqlx::query("UPDATE conversations SET status_message_id = $2 WHERE id = $1")
            .bind(&message.conversation_id)
            .bind(&message.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 ORDER BY seq ASC"
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn remove_messages_matching(
        &self,
        conversation_id: &str,
        predicate: MessagePredicate<'_>,
    ) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let Some(status_id) = Self::lock_conversation(&mut tx, conversation_id).await? else {
            return Ok(0);
        };
        let removed =
            Self::delete_matching(&mut tx, conversation_id, status_id.as_deref(), predicate)
                .await?;
        tx.commit().await?;
        Ok(removed)
    }

    async fn replace_messages_matching(
        &self,
        conversation_id: &str,
        predicate: MessagePredicate<'_>,
        replacement: &ChatMessage,
    ) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let status_id = Self::lock_conversation(&mut tx, conversation_id)
            .await?
            .ok_or_else(|| not_found(conversation_id))?;
        let removed =
            Self::delete_matching(&mut tx, conversation_id, status_id.as_deref(), predicate)
                .await?;
        Self::insert_message(&mut tx, replacement).await?;
        tx.commit().await?;
        Ok(removed)
    }

    async fn set_assigned_agent(
        &self,
        conversation_id: &str,
        agent_id: Option<&str>,
    ) -> Result<Conversation, StoreError> {
        self.update_returning(conversation_id, "assigned_agent_id = $2", agent_id)
            .await
    }

    async fn set_category(
        &self,
        conversation_id: &str,
        category_id: Option<&str>,
    ) -> Result<Conversation, StoreError> {
        self.update_returning(conversation_id, "category_id = $2", category_id)
            .await
    }

    async fn end_conversation(&self, conversation_id: &str) -> Result<Conversation, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE conversations SET ended_at = COALESCE(ended_at, $2) \
             WHERE id = $1 RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(conversation_id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => conversation_from_row(&row),
            None => Err(not_found(conversation_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_ids_follow_log_order() {
        let first = ChatMessage::new("c1", Sender::System, "a");
        let visitor = ChatMessage::new("c1", Sender::Visitor, "b");
        let second = ChatMessage::new("c1", Sender::System, "c");
        let messages = vec![first.clone(), visitor, second.clone()];

        let ids = matching_ids(&messages, &|message: &ChatMessage| {
            message.sender == Sender::System
        });

        assert_eq!(ids, vec![first.id, second.id]);
    }
}
