//! Per-message routing across the OFF, AUTOPILOT and HITL pipelines.

use std::sync::Arc;

use chrono::Utc;

use crate::assignment::AssignmentResolver;
use crate::config::ContextLimits;
use crate::context::build_conversation_context;
use crate::error::{Result, StoreError};
use crate::generator::{generate_suggestion, Suggestion, SuggestionGenerator};
use crate::pending::{pending_message, pending_metadata, PendingSuggestions};
use crate::prompting::{render_offline_notice, OfflineNoticeContext};
use crate::realtime::{notify, Notifier, EVENT_CONVERSATION_ASSIGNED};
use crate::store::ConversationStore;
use crate::types::{
    AssignmentEvent, AutopilotAttribution, AutopilotMetadata, ChatMessage, OfflineNoticeMetadata,
    Sender, SystemMode,
};

const AUTOPILOT_NAME: &str = "Autopilot";

pub struct ModeDispatcher {
    store: Arc<dyn ConversationStore>,
    generator: Arc<dyn SuggestionGenerator>,
    resolver: Arc<dyn AssignmentResolver>,
    notifier: Arc<dyn Notifier>,
    pending: Arc<PendingSuggestions>,
    limits: ContextLimits,
    use_retrieval: bool,
    offline_notice: String,
}

pub struct DispatcherParts {
    pub store: Arc<dyn ConversationStore>,
    pub generator: Arc<dyn SuggestionGenerator>,
    pub resolver: Arc<dyn AssignmentResolver>,
    pub notifier: Arc<dyn Notifier>,
    pub pending: Arc<PendingSuggestions>,
    pub limits: ContextLimits,
    pub use_retrieval: bool,
    pub offline_notice: String,
}

impl ModeDispatcher {
    pub fn new(parts: DispatcherParts) -> Self {
        Self {
            store: parts.store,
            generator: parts.generator,
            resolver: parts.resolver,
            notifier: parts.notifier,
            pending: parts.pending,
            limits: parts.limits,
            use_retrieval: parts.use_retrieval,
            offline_notice: parts.offline_notice,
        }
    }

    /// Produces the outgoing message for a stored visitor message.
    ///
    /// `mode` is the value read when handling of the message began; a mode
    /// change mid-flight does not affect this call.
    pub async fn dispatch(
        &self,
        conversation_id: &str,
        visitor_message: &ChatMessage,
        mode: SystemMode,
    ) -> Result<ChatMessage> {
        tracing::debug!(
            conversation_id,
            message_id = %visitor_message.id,
            %mode,
            "dispatching visitor message"
        );
        match mode {
            SystemMode::Off => self.offline(conversation_id).await,
            SystemMode::Autopilot => self.autopilot(conversation_id).await,
            SystemMode::Hitl => self.human_in_the_loop(conversation_id).await,
        }
    }

    async fn offline(&self, conversation_id: &str) -> Result<ChatMessage> {
        match self.store.list_messages(conversation_id).await {
            Ok(messages) => {
                if let Some(existing) = messages.into_iter().find(ChatMessage::is_offline_notice) {
                    return Ok(existing);
                }
            }
            Err(error) => {
                tracing::warn!(conversation_id, %error, "could not check for an existing offline notice");
            }
        }

        let text = render_offline_notice(&OfflineNoticeContext {
            notice: &self.offline_notice,
            conversation_id,
        });
        let notice = ChatMessage::new(conversation_id, Sender::System, text)
            .with_metadata(&OfflineNoticeMetadata::default())
            .map_err(StoreError::from)?;

        if let Err(error) = self.store.set_status_message(&notice).await {
            tracing::warn!(conversation_id, %error, "failed to store offline notice");
        }
        Ok(notice)
    }

    async fn suggest(&self, conversation_id: &str) -> Result<(Suggestion, String)> {
        let messages = self.store.list_messages(conversation_id).await?;
        let context = build_conversation_context(&messages, &self.limits);
        let suggestion = generate_suggestion(
            self.generator.as_ref(),
            conversation_id,
            &context,
            self.use_retrieval,
        )
        .await
        .inspect_err(|error| {
            tracing::warn!(conversation_id, %error, "suggestion generation failed");
        })?;
        Ok((suggestion, context))
    }

    async fn autopilot(&self, conversation_id: &str) -> Result<ChatMessage> {
        let (suggestion, _context) = self.suggest(conversation_id).await?;

        let metadata = AutopilotMetadata {
            is_autopilot_response: true,
            attribution: AutopilotAttribution {
                responded_by: AUTOPILOT_NAME.to_string(),
                label: format!("Responded by {AUTOPILOT_NAME}"),
                responded_at: Utc::now(),
            },
            original_suggestion: suggestion.text.clone(),
            confidence: suggestion.confidence,
            provenance: suggestion.provenance,
        };
        let reply = ChatMessage::new(conversation_id, Sender::Agent, suggestion.text)
            .with_metadata(&metadata)
            .map_err(StoreError::from)?;
        self.store.append_message(&reply).await?;

        tracing::info!(conversation_id, confidence = metadata.confidence, "autopilot replied");
        Ok(reply)
    }

    async fn human_in_the_loop(&self, conversation_id: &str) -> Result<ChatMessage> {
        let (suggestion, context) = self.suggest(conversation_id).await?;

        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| StoreError::ConversationNotFound {
                id: conversation_id.to_string(),
            })?;
        let assigned_agent = match conversation.assigned_agent_id {
            Some(agent_id) => Some(agent_id),
            None => self.auto_assign(conversation_id).await,
        };

        let metadata = pending_metadata(&suggestion, &context, assigned_agent, false);
        let message = pending_message(conversation_id, &metadata)?;
        self.pending.install(&message).await?;

        tracing::info!(
            conversation_id,
            assigned_agent = metadata.assigned_agent.as_deref().unwrap_or("none"),
            confidence = metadata.confidence,
            "pending suggestion stored"
        );
        Ok(message)
    }

    /// Never fails: an unavailable resolver or store leaves the conversation
    /// unassigned.
    async fn auto_assign(&self, conversation_id: &str) -> Option<String> {
        let agent_id = match self.resolver.best_available_agent().await {
            Ok(Some(agent_id)) => agent_id,
            Ok(None) => {
                tracing::debug!(conversation_id, "no agent available for assignment");
                return None;
            }
            Err(error) => {
                tracing::warn!(conversation_id, %error, "assignment resolver failed");
                return None;
            }
        };

        if let Err(error) = self
            .store
            .set_assigned_agent(conversation_id, Some(&agent_id))
            .await
        {
            tracing::warn!(conversation_id, %agent_id, %error, "failed to persist assignment");
            return None;
        }
        self.resolver.record_assignment(&agent_id).await;

        notify(
            self.notifier.as_ref(),
            EVENT_CONVERSATION_ASSIGNED,
            &AssignmentEvent {
                conversation_id: conversation_id.to_string(),
                assigned_agent_id: agent_id.clone(),
            },
        )
        .await;
        tracing::info!(conversation_id, %agent_id, "conversation auto-assigned");
        Some(agent_id)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;

    use crate::assignment::AssignmentResolver;
    use crate::error::AssignmentError;

    pub struct FixedResolver(pub Option<&'static str>);

    #[async_trait]
    impl AssignmentResolver for FixedResolver {
        async fn best_available_agent(&self) -> Result<Option<String>, AssignmentError> {
            Ok(self.0.map(str::to_string))
        }
    }

    pub struct FailingResolver;

    #[async_trait]
    impl AssignmentResolver for FailingResolver {
        async fn best_available_agent(&self) -> Result<Option<String>, AssignmentError> {
            Err(AssignmentError::Unavailable("roster offline".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FailingResolver, FixedResolver};
    use super::*;
    use async_trait::async_trait;
    use crate::error::{HelpdeskError, SuggestionError};
    use crate::pending::testing::ScriptedGenerator;
    use crate::realtime::testing::RecordingNotifier;
    use crate::store::{MemoryStore, MessagePredicate};
    use crate::types::Conversation;
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryStore>,
        generator: Arc<ScriptedGenerator>,
        notifier: Arc<RecordingNotifier>,
        dispatcher: ModeDispatcher,
    }

    fn dispatcher_over(
        store: Arc<dyn ConversationStore>,
        generator: Arc<ScriptedGenerator>,
        resolver: Arc<dyn AssignmentResolver>,
        notifier: Arc<RecordingNotifier>,
    ) -> ModeDispatcher {
        let pending = Arc::new(PendingSuggestions::new(
            store.clone(),
            generator.clone(),
            ContextLimits::default(),
            true,
        ));
        ModeDispatcher::new(DispatcherParts {
            store,
            generator,
            resolver,
            notifier,
            pending,
            limits: ContextLimits::default(),
            use_retrieval: true,
            offline_notice: "We are offline.\nBack at 9am.".into(),
        })
    }

    fn fixture(resolver: Arc<dyn AssignmentResolver>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let generator = Arc::new(ScriptedGenerator::always("How can I help?"));
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher =
            dispatcher_over(store.clone(), generator.clone(), resolver, notifier.clone());
        Fixture {
            store,
            generator,
            notifier,
            dispatcher,
        }
    }

    /// Memory store whose status-slot and assignment writes always fail.
    #[derive(Default)]
    struct BrokenWritesStore {
        inner: MemoryStore,
    }

    fn write_failure() -> StoreError {
        StoreError::Database(sqlx::Error::PoolTimedOut)
    }

    #[async_trait]
    impl ConversationStore for BrokenWritesStore {
        async fn ensure_conversation(
            &self,
            conversation_id: &str,
            visitor_id: &str,
        ) -> std::result::Result<Conversation, StoreError> {
            self.inner.ensure_conversation(conversation_id, visitor_id).await
        }

        async fn get_conversation(
            &self,
            conversation_id: &str,
        ) -> std::result::Result<Option<Conversation>, StoreError> {
            self.inner.get_conversation(conversation_id).await
        }

        async fn append_message(&self, message: &ChatMessage) -> std::result::Result<(), StoreError> {
            self.inner.append_message(message).await
        }

        async fn set_status_message(
            &self,
            _message: &ChatMessage,
        ) -> std::result::Result<(), StoreError> {
            Err(write_failure())
        }

        async fn list_messages(
            &self,
            conversation_id: &str,
        ) -> std::result::Result<Vec<ChatMessage>, StoreError> {
            self.inner.list_messages(conversation_id).await
        }

        async fn remove_messages_matching(
            &self,
            conversation_id: &str,
            predicate: MessagePredicate<'_>,
        ) -> std::result::Result<usize, StoreError> {
            self.inner
                .remove_messages_matching(conversation_id, predicate)
                .await
        }

        async fn replace_messages_matching(
            &self,
            conversation_id: &str,
            predicate: MessagePredicate<'_>,
            replacement: &ChatMessage,
        ) -> std::result::Result<usize, StoreError> {
            self.inner
                .replace_messages_matching(conversation_id, predicate, replacement)
                .await
        }

        async fn set_assigned_agent(
            &self,
            _conversation_id: &str,
            _agent_id: Option<&str>,
        ) -> std::result::Result<Conversation, StoreError> {
            Err(write_failure())
        }

        async fn set_category(
            &self,
            conversation_id: &str,
            category_id: Option<&str>,
        ) -> std::result::Result<Conversation, StoreError> {
            self.inner.set_category(conversation_id, category_id).await
        }

        async fn end_conversation(
            &self,
            conversation_id: &str,
        ) -> std::result::Result<Conversation, StoreError> {
            self.inner.end_conversation(conversation_id).await
        }
    }

    async fn visitor_says(store: &MemoryStore, text: &str) -> ChatMessage {
        store.ensure_conversation("c1", "v1").await.unwrap();
        let message = ChatMessage::new("c1", Sender::Visitor, text);
        store.append_message(&message).await.unwrap();
        message
    }

    #[tokio::test]
    async fn autopilot_replies_as_agent() {
        let fx = fixture(Arc::new(FixedResolver(Some("agent-1"))));
        let visitor = visitor_says(&fx.store, "Do you ship abroad?").await;

        let reply = fx
            .dispatcher
            .dispatch("c1", &visitor, SystemMode::Autopilot)
            .await
            .unwrap();

        assert_eq!(reply.sender, Sender::Agent);
        assert_eq!(reply.text, "How can I help?");
        assert!(reply.is_autopilot_response());
        assert!(!reply.is_pending_suggestion());
        assert_eq!(reply.metadata["originalSuggestion"], json!("How can I help?"));
        assert_eq!(reply.metadata["attribution"]["label"], json!("Responded by Autopilot"));
        assert_eq!(reply.metadata["confidence"], json!(0.8));

        let conversation = fx.store.get_conversation("c1").await.unwrap().unwrap();
        assert!(conversation.assigned_agent_id.is_none());
        assert_eq!(fx.store.list_messages("c1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn hitl_stores_pending_system_message() {
        let fx = fixture(Arc::new(FixedResolver(Some("agent-7"))));
        let visitor = visitor_says(&fx.store, "Hello").await;

        let message = fx
            .dispatcher
            .dispatch("c1", &visitor, SystemMode::Hitl)
            .await
            .unwrap();

        assert_eq!(message.sender, Sender::System);
        assert!(message.is_pending_suggestion());
        assert!(!message.is_autopilot_response());
        assert_eq!(message.text, "AI suggestion pending agent response");
        assert_ne!(message.text, "How can I help?");
        assert_eq!(message.metadata["assignedAgent"], json!("agent-7"));
        assert_eq!(message.metadata["needsManualAssignment"], json!(false));
        assert_eq!(message.metadata["unseenByAgents"], json!(false));
        assert_eq!(message.metadata["manualGeneration"], json!(false));
        assert_eq!(message.metadata["context"], json!("Visitor: Hello"));

        let conversation = fx.store.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(conversation.assigned_agent_id.as_deref(), Some("agent-7"));

        let assigned = fx.notifier.named(EVENT_CONVERSATION_ASSIGNED);
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0]["assignedAgentId"], json!("agent-7"));
    }

    #[tokio::test]
    async fn hitl_keeps_existing_assignment() {
        let fx = fixture(Arc::new(FixedResolver(Some("agent-7"))));
        let visitor = visitor_says(&fx.store, "Hello").await;
        fx.store.set_assigned_agent("c1", Some("agent-2")).await.unwrap();

        let message = fx
            .dispatcher
            .dispatch("c1", &visitor, SystemMode::Hitl)
            .await
            .unwrap();

        assert_eq!(message.metadata["assignedAgent"], json!("agent-2"));
        assert!(fx.notifier.named(EVENT_CONVERSATION_ASSIGNED).is_empty());
    }

    #[tokio::test]
    async fn resolver_failure_leaves_conversation_unassigned() {
        let fx = fixture(Arc::new(FailingResolver));
        let visitor = visitor_says(&fx.store, "Hello").await;

        let message = fx
            .dispatcher
            .dispatch("c1", &visitor, SystemMode::Hitl)
            .await
            .unwrap();

        assert_eq!(message.text, "AI suggestion awaiting agent assignment");
        assert_eq!(message.metadata["assignedAgent"], json!(null));
        assert_eq!(message.metadata["needsManualAssignment"], json!(true));
        assert_eq!(message.metadata["unseenByAgents"], json!(true));
    }

    #[tokio::test]
    async fn generator_failure_propagates() {
        let fx = fixture(Arc::new(FixedResolver(None)));
        fx.generator
            .push(Err(SuggestionError::Generation("provider returned 503".into())));
        let visitor = visitor_says(&fx.store, "Hello").await;

        let err = fx
            .dispatcher
            .dispatch("c1", &visitor, SystemMode::Hitl)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            HelpdeskError::Suggestion(SuggestionError::Generation(_))
        ));
        assert!(fx
            .store
            .list_messages("c1")
            .await
            .unwrap()
            .iter()
            .all(|m| !m.is_pending_suggestion()));
    }

    #[tokio::test]
    async fn offline_notice_is_created_once() {
        let fx = fixture(Arc::new(FixedResolver(None)));
        let first_visitor = visitor_says(&fx.store, "Hi").await;
        let first = fx
            .dispatcher
            .dispatch("c1", &first_visitor, SystemMode::Off)
            .await
            .unwrap();

        let second_visitor = visitor_says(&fx.store, "Still there?").await;
        let second = fx
            .dispatcher
            .dispatch("c1", &second_visitor, SystemMode::Off)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.text, second.text);
        assert!(first.text.starts_with("We are offline.\nBack at 9am."));
        assert_eq!(fx.generator.calls(), 0);

        let messages = fx.store.list_messages("c1").await.unwrap();
        let notices = messages.iter().filter(|m| m.is_offline_notice()).count();
        assert_eq!(notices, 1);
        assert_eq!(messages.len(), 3);
    }

    #[tokio::test]
    async fn offline_notice_survives_store_failure() {
        let store = Arc::new(BrokenWritesStore::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = dispatcher_over(
            store.clone(),
            Arc::new(ScriptedGenerator::always("unused")),
            Arc::new(FixedResolver(None)),
            notifier,
        );
        let visitor = visitor_says(&store.inner, "Hi").await;

        let notice = dispatcher
            .dispatch("c1", &visitor, SystemMode::Off)
            .await
            .unwrap();

        assert!(notice.is_offline_notice());
        assert_eq!(notice.sender, Sender::System);
        assert!(notice.text.starts_with("We are offline.\nBack at 9am."));
        assert_eq!(store.list_messages("c1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn assignment_store_failure_leaves_suggestion_unassigned() {
        let store = Arc::new(BrokenWritesStore::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = dispatcher_over(
            store.clone(),
            Arc::new(ScriptedGenerator::always("How can I help?")),
            Arc::new(FixedResolver(Some("agent-7"))),
            notifier.clone(),
        );
        let visitor = visitor_says(&store.inner, "Hello").await;

        let message = dispatcher
            .dispatch("c1", &visitor, SystemMode::Hitl)
            .await
            .unwrap();

        assert!(message.is_pending_suggestion());
        assert_eq!(message.text, "AI suggestion awaiting agent assignment");
        assert_eq!(message.metadata["assignedAgent"], json!(null));
        assert_eq!(message.metadata["needsManualAssignment"], json!(true));
        assert!(notifier.named(EVENT_CONVERSATION_ASSIGNED).is_empty());

        let conversation = store.get_conversation("c1").await.unwrap().unwrap();
        assert!(conversation.assigned_agent_id.is_none());
    }
}
