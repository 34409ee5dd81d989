//! Entry points used by the HTTP layer and in-process dashboards.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use crate::assignment::AssignmentResolver;
use crate::config::ContextLimits;
use crate::dispatch::{DispatcherParts, ModeDispatcher};
use crate::error::{HelpdeskError, Result, StoreError};
use crate::generator::SuggestionGenerator;
use crate::pending::PendingSuggestions;
use crate::realtime::{notify, Notifier, EVENT_MESSAGE_NEW, EVENT_SUGGESTION_PENDING};
use crate::store::ConversationStore;
use crate::types::{
    ChatMessage, Conversation, ManualSuggestion, NewMessageEvent, Sender, SuggestionView,
    SystemMode, VisitorExchange,
};

const ANONYMOUS_VISITOR: &str = "anonymous";

pub struct ServiceParts {
    pub store: Arc<dyn ConversationStore>,
    pub generator: Arc<dyn SuggestionGenerator>,
    pub resolver: Arc<dyn AssignmentResolver>,
    pub notifier: Arc<dyn Notifier>,
    pub limits: ContextLimits,
    pub use_retrieval: bool,
    pub offline_notice: String,
}

pub struct HelpdeskService {
    store: Arc<dyn ConversationStore>,
    resolver: Arc<dyn AssignmentResolver>,
    notifier: Arc<dyn Notifier>,
    pending: Arc<PendingSuggestions>,
    dispatcher: ModeDispatcher,
}

impl HelpdeskService {
    pub fn new(parts: ServiceParts) -> Self {
        let pending = Arc::new(PendingSuggestions::new(
            parts.store.clone(),
            parts.generator.clone(),
            parts.limits,
            parts.use_retrieval,
        ));
        let dispatcher = ModeDispatcher::new(DispatcherParts {
            store: parts.store.clone(),
            generator: parts.generator,
            resolver: parts.resolver.clone(),
            notifier: parts.notifier.clone(),
            pending: pending.clone(),
            limits: parts.limits,
            use_retrieval: parts.use_retrieval,
            offline_notice: parts.offline_notice,
        });
        Self {
            store: parts.store,
            resolver: parts.resolver,
            notifier: parts.notifier,
            pending,
            dispatcher,
        }
    }

    pub async fn open_conversation(&self, visitor_id: Option<&str>) -> Result<Conversation> {
        let visitor_id = visitor_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(ANONYMOUS_VISITOR);
        let conversation_id = Uuid::new_v4().to_string();
        let conversation = self
            .store
            .ensure_conversation(&conversation_id, visitor_id)
            .await?;
        tracing::info!(%conversation_id, visitor_id, "conversation opened");
        Ok(conversation)
    }

    /// Stores the visitor's message and produces the reply for `mode`.
    pub async fn process_incoming_visitor_message(
        &self,
        conversation_id: &str,
        text: &str,
        mode: SystemMode,
    ) -> Result<VisitorExchange> {
        let text = text.trim();
        if text.is_empty() {
            return Err(HelpdeskError::EmptyMessage);
        }

        self.store
            .ensure_conversation(conversation_id, ANONYMOUS_VISITOR)
            .await?;
        if mode == SystemMode::Hitl {
            self.pending
                .clear_on_new_visitor_message(conversation_id)
                .await?;
        }

        let user_message = ChatMessage::new(conversation_id, Sender::Visitor, text);
        self.store.append_message(&user_message).await?;
        self.announce_message(conversation_id, &user_message).await?;

        let ai_message = self
            .dispatcher
            .dispatch(conversation_id, &user_message, mode)
            .await?;

        match mode {
            SystemMode::Autopilot => {
                self.announce_message(conversation_id, &ai_message).await?;
            }
            SystemMode::Hitl => {
                if let Some(view) = SuggestionView::from_message(&ai_message) {
                    notify(self.notifier.as_ref(), EVENT_SUGGESTION_PENDING, &view).await;
                }
            }
            SystemMode::Off => {}
        }

        Ok(VisitorExchange {
            user_message,
            ai_message,
        })
    }

    pub async fn generate_manual_suggestion(&self, conversation_id: &str) -> Result<ManualSuggestion> {
        let manual = self.pending.generate_manual(conversation_id).await?;
        if let Some(view) = self.pending.current(conversation_id).await? {
            notify(self.notifier.as_ref(), EVENT_SUGGESTION_PENDING, &view).await;
        }
        Ok(manual)
    }

    pub async fn current_suggestion(&self, conversation_id: &str) -> Result<Option<SuggestionView>> {
        self.require_conversation(conversation_id).await?;
        self.pending.current(conversation_id).await
    }

    /// Posts an agent's answer. Answering consumes any pending suggestion.
    pub async fn agent_reply(
        &self,
        conversation_id: &str,
        agent_id: &str,
        text: &str,
    ) -> Result<ChatMessage> {
        let text = text.trim();
        if text.is_empty() {
            return Err(HelpdeskError::EmptyMessage);
        }
        self.require_conversation(conversation_id).await?;

        let cleared = self.pending.clear(conversation_id).await?;
        let reply = ChatMessage::new(conversation_id, Sender::Agent, text)
            .with_metadata(&json!({ "agentId": agent_id }))
            .map_err(StoreError::from)?;
        self.store.append_message(&reply).await?;
        self.announce_message(conversation_id, &reply).await?;

        tracing::info!(conversation_id, agent_id, cleared, "agent replied");
        Ok(reply)
    }

    pub async fn messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>> {
        self.require_conversation(conversation_id).await?;
        Ok(self.store.list_messages(conversation_id).await?)
    }

    pub async fn close_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        let conversation = self.require_conversation(conversation_id).await?;
        if conversation.ended_at.is_some() {
            return Ok(conversation);
        }

        self.pending.clear(conversation_id).await?;
        let closed = self.store.end_conversation(conversation_id).await?;
        if let Some(agent_id) = closed.assigned_agent_id.as_deref() {
            self.resolver.release_assignment(agent_id).await;
        }
        tracing::info!(conversation_id, "conversation closed");
        Ok(closed)
    }

    pub async fn set_category(
        &self,
        conversation_id: &str,
        category_id: Option<&str>,
    ) -> Result<Conversation> {
        let category_id = category_id.map(str::trim).filter(|id| !id.is_empty());
        Ok(self.store.set_category(conversation_id, category_id).await?)
    }

    async fn require_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        self.store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| {
                StoreError::ConversationNotFound {
                    id: conversation_id.to_string(),
                }
                .into()
            })
    }

    async fn announce_message(&self, conversation_id: &str, message: &ChatMessage) -> Result<()> {
        let conversation = self.require_conversation(conversation_id).await?;
        notify(
            self.notifier.as_ref(),
            EVENT_MESSAGE_NEW,
            &NewMessageEvent::new(&conversation, message),
        )
        .await;
        Ok(())
    }
}
