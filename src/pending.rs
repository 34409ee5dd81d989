//! Pending suggestion bookkeeping.
//!
//! A conversation holds at most one live pending suggestion: a system message
//! whose metadata carries `pendingAgent: true`. Every path that creates one
//! swaps out the previous one in the same store operation.

use std::sync::Arc;

use chrono::Utc;

use crate::config::ContextLimits;
use crate::context::{build_conversation_context, context_excerpt};
use crate::error::{Result, StoreError, SuggestionError};
use crate::generator::{generate_suggestion, Suggestion, SuggestionGenerator};
use crate::store::ConversationStore;
use crate::types::{
    ChatMessage, ManualSuggestion, PendingSuggestionMetadata, Sender, SuggestionView,
};

const PLACEHOLDER_ASSIGNED: &str = "AI suggestion pending agent response";
const PLACEHOLDER_UNASSIGNED: &str = "AI suggestion awaiting agent assignment";

pub fn is_pending(message: &ChatMessage) -> bool {
    message.is_pending_suggestion()
}

/// Latest pending suggestion by `lastUpdated` (else creation time), ties
/// broken by message id.
pub fn select_most_recent_pending(messages: &[ChatMessage]) -> Option<&ChatMessage> {
    messages
        .iter()
        .filter(|message| message.is_pending_suggestion() && message.ai_suggestion().is_some())
        .max_by(|a, b| {
            a.last_updated()
                .cmp(&b.last_updated())
                .then_with(|| a.id.cmp(&b.id))
        })
}

pub(crate) fn pending_metadata(
    suggestion: &Suggestion,
    context: &str,
    assigned_agent: Option<String>,
    manual_generation: bool,
) -> PendingSuggestionMetadata {
    let unassigned = assigned_agent.is_none();
    PendingSuggestionMetadata {
        pending_agent: true,
        ai_suggestion: suggestion.text.clone(),
        confidence: suggestion.confidence,
        context: context_excerpt(context),
        assigned_agent,
        unseen_by_agents: unassigned,
        needs_manual_assignment: unassigned,
        manual_generation,
        last_updated: Utc::now(),
        provenance: suggestion.provenance.clone(),
        debug_info: suggestion.debug_info.clone(),
    }
}

pub(crate) fn pending_message(
    conversation_id: &str,
    metadata: &PendingSuggestionMetadata,
) -> std::result::Result<ChatMessage, StoreError> {
    let placeholder = if metadata.assigned_agent.is_some() {
        PLACEHOLDER_ASSIGNED
    } else {
        PLACEHOLDER_UNASSIGNED
    };
    Ok(ChatMessage::new(conversation_id, Sender::System, placeholder).with_metadata(metadata)?)
}

pub struct PendingSuggestions {
    store: Arc<dyn ConversationStore>,
    generator: Arc<dyn SuggestionGenerator>,
    limits: ContextLimits,
    use_retrieval: bool,
}

impl PendingSuggestions {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        generator: Arc<dyn SuggestionGenerator>,
        limits: ContextLimits,
        use_retrieval: bool,
    ) -> Self {
        Self {
            store,
            generator,
            limits,
            use_retrieval,
        }
    }

    /// Drops stale drafts before a new visitor message is handled in HITL mode.
    pub async fn clear_on_new_visitor_message(&self, conversation_id: &str) -> Result<usize> {
        let removed = self.clear(conversation_id).await?;
        if removed > 0 {
            tracing::debug!(conversation_id, removed, "cleared pending suggestions on new visitor message");
        }
        Ok(removed)
    }

    pub async fn clear(&self, conversation_id: &str) -> Result<usize> {
        Ok(self
            .store
            .remove_messages_matching(conversation_id, &is_pending)
            .await?)
    }

    /// Stores `message` as the conversation's only pending suggestion.
    pub(crate) async fn install(&self, message: &ChatMessage) -> Result<()> {
        let replaced = self
            .store
            .replace_messages_matching(&message.conversation_id, &is_pending, message)
            .await?;
        if replaced > 0 {
            tracing::debug!(
                conversation_id = %message.conversation_id,
                replaced,
                "superseded pending suggestion"
            );
        }
        Ok(())
    }

    /// Agent-triggered regeneration from the full conversation history.
    pub async fn generate_manual(&self, conversation_id: &str) -> Result<ManualSuggestion> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| StoreError::ConversationNotFound {
                id: conversation_id.to_string(),
            })?;
        let messages = self.store.list_messages(conversation_id).await?;
        let context = build_conversation_context(&messages, &self.limits);
        if messages.is_empty() || context.trim().is_empty() {
            return Err(SuggestionError::EmptyContext {
                conversation_id: conversation_id.to_string(),
            }
            .into());
        }

        let suggestion = generate_suggestion(
            self.generator.as_ref(),
            conversation_id,
            &context,
            self.use_retrieval,
        )
        .await?;

        let metadata = pending_metadata(&suggestion, &context, conversation.assigned_agent_id, true);
        let message = pending_message(conversation_id, &metadata)?;
        self.install(&message).await?;

        tracing::info!(
            conversation_id,
            confidence = suggestion.confidence,
            provider = %suggestion.provenance.provider,
            "manual suggestion generated"
        );

        Ok(ManualSuggestion {
            suggestion_text: suggestion.text,
            confidence: suggestion.confidence,
            metadata,
        })
    }

    pub async fn current(&self, conversation_id: &str) -> Result<Option<SuggestionView>> {
        let messages = self.store.list_messages(conversation_id).await?;
        Ok(select_most_recent_pending(&messages).and_then(SuggestionView::from_message))
    }
}
