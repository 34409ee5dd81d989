//! Conversation persistence boundary and the in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::types::{ChatMessage, Conversation};

pub type MessagePredicate<'a> = &'a (dyn Fn(&ChatMessage) -> bool + Send + Sync);

/// Append-only message log plus the mutable conversation record.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Returns the conversation, creating it for `visitor_id` if it is unknown.
    async fn ensure_conversation(
        &self,
        conversation_id: &str,
        visitor_id: &str,
    ) -> Result<Conversation, StoreError>;

    async fn get_conversation(&self, conversation_id: &str)
        -> Result<Option<Conversation>, StoreError>;

    /// Appends to the log and bumps `last_message_at`.
    async fn append_message(&self, message: &ChatMessage) -> Result<(), StoreError>;

    /// Installs `message` as the conversation's single status message,
    /// removing the previous occupant of the slot.
    async fn set_status_message(&self, message: &ChatMessage) -> Result<(), StoreError>;

    /// Messages in creation order.
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, StoreError>;

    /// Deletes every matching message and returns how many went away.
    async fn remove_messages_matching(
        &self,
        conversation_id: &str,
        predicate: MessagePredicate<'_>,
    ) -> Result<usize, StoreError>;

    /// Removes every matching message and appends `replacement` as one step,
    /// so concurrent writers cannot both leave a match behind.
    async fn replace_messages_matching(
        &self,
        conversation_id: &str,
        predicate: MessagePredicate<'_>,
        replacement: &ChatMessage,
    ) -> Result<usize, StoreError>;

    async fn set_assigned_agent(
        &self,
        conversation_id: &str,
        agent_id: Option<&str>,
    ) -> Result<Conversation, StoreError>;

    async fn set_category(
        &self,
        conversation_id: &str,
        category_id: Option<&str>,
    ) -> Result<Conversation, StoreError>;

    async fn end_conversation(&self, conversation_id: &str) -> Result<Conversation, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    conversations: HashMap<String, Conversation>,
    messages: HashMap<String, Vec<ChatMessage>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn not_found(conversation_id: &str) -> StoreError {
        StoreError::ConversationNotFound {
            id: conversation_id.to_string(),
        }
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn ensure_conversation(
        &self,
        conversation_id: &str,
        visitor_id: &str,
    ) -> Result<Conversation, StoreError> {
        let mut state = self.inner.write().await;
        let conversation = state
            .conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| Conversation::new(conversation_id, visitor_id))
            .clone();
        state
            .messages
            .entry(conversation_id.to_string())
            .or_default();
        Ok(conversation)
    }

    async fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let state = self.inner.read().await;
        Ok(state.conversations.get(conversation_id).cloned())
    }

    async fn append_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        let mut state = self.inner.write().await;
        let conversation = state
            .conversations
            .get_mut(&message.conversation_id)
            .ok_or_else(|| Self::not_found(&message.conversation_id))?;
        conversation.last_message_at = message.created_at;
        state
            .messages
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn set_status_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        let mut state = self.inner.write().await;
        let MemoryState {
            conversations,
            messages,
        } = &mut *state;
        let conversation = conversations
            .get_mut(&message.conversation_id)
            .ok_or_else(|| Self::not_found(&message.conversation_id))?;
        let log = messages.entry(message.conversation_id.clone()).or_default();
        if let Some(previous) = conversation.status_message_id.take() {
            log.retain(|existing| existing.id != previous);
        }
        log.push(message.clone());
        conversation.status_message_id = Some(message.id.clone());
        conversation.last_message_at = message.created_at;
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let state = self.inner.read().await;
        Ok(state
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn remove_messages_matching(
        &self,
        conversation_id: &str,
        predicate: MessagePredicate<'_>,
    ) -> Result<usize, StoreError> {
        let mut state = self.inner.write().await;
        let MemoryState {
            conversations,
            messages,
        } = &mut *state;
        let Some(log) = messages.get_mut(conversation_id) else {
            return Ok(0);
        };
        let before = log.len();
        log.retain(|message| !predicate(message));
        if let Some(conversation) = conversations.get_mut(conversation_id) {
            if let Some(status_id) = conversation.status_message_id.as_deref() {
                if !log.iter().any(|message| message.id == status_id) {
                    conversation.status_message_id = None;
                }
            }
        }
        Ok(before - log.len())
    }

    async fn replace_messages_matching(
        &self,
        conversation_id: &str,
        predicate: MessagePredicate<'_>,
        replacement: &ChatMessage,
    ) -> Result<usize, StoreError> {
        let mut state = self.inner.write().await;
        let MemoryState {
            conversations,
            messages,
        } = &mut *state;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| Self::not_found(conversation_id))?;
        let log = messages.entry(conversation_id.to_string()).or_default();
        let before = log.len();
        log.retain(|message| !predicate(message));
        let removed = before - log.len();
        if let Some(status_id) = conversation.status_message_id.as_deref() {
            if !log.iter().any(|message| message.id == status_id) {
                conversation.status_message_id = None;
            }
        }
        log.push(replacement.clone());
        conversation.last_message_at = replacement.created_at;
        Ok(removed)
    }

    async fn set_assigned_agent(
        &self,
        conversation_id: &str,
        agent_id: Option<&str>,
    ) -> Result<Conversation, StoreError> {
        let mut state = self.inner.write().await;
        let conversation = state
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| Self::not_found(conversation_id))?;
        conversation.assigned_agent_id = agent_id.map(str::to_string);
        Ok(conversation.clone())
    }

    async fn set_category(
        &self,
        conversation_id: &str,
        category_id: Option<&str>,
    ) -> Result<Conversation, StoreError> {
        let mut state = self.inner.write().await;
        let conversation = state
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| Self::not_found(conversation_id))?;
        conversation.category_id = category_id.map(str::to_string);
        Ok(conversation.clone())
    }

    async fn end_conversation(&self, conversation_id: &str) -> Result<Conversation, StoreError> {
        let mut state = self.inner.write().await;
        let conversation = state
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| Self::not_found(conversation_id))?;
        if conversation.ended_at.is_none() {
            conversation.ended_at = Some(Utc::now());
        }
        Ok(conversation.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Sender;

    #[tokio::test]
    async fn status_slot_holds_a_single_message() {
        let store = MemoryStore::new();
        store.ensure_conversation("c1", "v1").await.unwrap();
        store
            .append_message(&ChatMessage::new("c1", Sender::Visitor, "hi"))
            .await
            .unwrap();

        let first = ChatMessage::new("c1", Sender::System, "offline");
        let second = ChatMessage::new("c1", Sender::System, "still offline");
        store.set_status_message(&first).await.unwrap();
        store.set_status_message(&second).await.unwrap();

        let messages = store.list_messages("c1").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text, "hi");
        assert_eq!(messages[1].id, second.id);

        let conversation = store.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(conversation.status_message_id.as_deref(), Some(second.id.as_str()));
    }

    #[tokio::test]
    async fn removing_the_status_message_clears_the_slot() {
        let store = MemoryStore::new();
        store.ensure_conversation("c1", "v1").await.unwrap();
        let status = ChatMessage::new("c1", Sender::System, "offline");
        store.set_status_message(&status).await.unwrap();

        let removed = store
            .remove_messages_matching("c1", &|message: &ChatMessage| message.sender == Sender::System)
            .await
            .unwrap();

        assert_eq!(removed, 1);
        let conversation = store.get_conversation("c1").await.unwrap().unwrap();
        assert!(conversation.status_message_id.is_none());
    }

    #[tokio::test]
    async fn replace_matching_swaps_in_one_step() {
        let store = MemoryStore::new();
        store.ensure_conversation("c1", "v1").await.unwrap();
        let old = ChatMessage::new("c1", Sender::System, "old draft");
        store.append_message(&old).await.unwrap();
        store
            .append_message(&ChatMessage::new("c1", Sender::Visitor, "hello"))
            .await
            .unwrap();

        let new = ChatMessage::new("c1", Sender::System, "new draft");
        let removed = store
            .replace_messages_matching(
                "c1",
                &|message: &ChatMessage| message.sender == Sender::System,
                &new,
            )
            .await
            .unwrap();

        assert_eq!(removed, 1);
        let texts = store
            .list_messages("c1")
            .await
            .unwrap()
            .into_iter()
            .map(|message| message.text)
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["hello", "new draft"]);
    }

    #[tokio::test]
    async fn append_to_unknown_conversation_fails() {
        let store = MemoryStore::new();
        let err = store
            .append_message(&ChatMessage::new("missing", Sender::Visitor, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConversationNotFound { .. }));
    }

    #[tokio::test]
    async fn ensure_conversation_is_idempotent() {
        let store = MemoryStore::new();
        let first = store.ensure_conversation("c1", "v1").await.unwrap();
        store.set_assigned_agent("c1", Some("agent-1")).await.unwrap();
        let second = store.ensure_conversation("c1", "other").await.unwrap();
        assert_eq!(first.started_at, second.started_at);
        assert_eq!(second.visitor_id, "v1");
        assert_eq!(second.assigned_agent_id.as_deref(), Some("agent-1"));
    }
}
