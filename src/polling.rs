//! Dashboard-side polling for a conversation's pending suggestion.
//!
//! One session is live at a time. Starting a new one, switching conversation
//! or answering the visitor cancels the old session; a cancelled session never
//! invokes its callback, even if its last fetch was already in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::PollSettings;
use crate::error::PollError;
use crate::service::HelpdeskService;
use crate::types::SuggestionView;

#[async_trait]
pub trait PendingSuggestionSource: Send + Sync {
    async fn fetch_pending(&self, conversation_id: &str) -> Result<Option<SuggestionView>, PollError>;
}

#[async_trait]
impl PendingSuggestionSource for HelpdeskService {
    async fn fetch_pending(&self, conversation_id: &str) -> Result<Option<SuggestionView>, PollError> {
        Ok(self.current_suggestion(conversation_id).await?)
    }
}

#[derive(Debug, Deserialize)]
struct SuggestionEnvelope {
    #[serde(default)]
    suggestion: Option<SuggestionView>,
}

/// Reads `GET {base}/api/conversations/{id}/suggestion` from a remote server.
pub struct HttpSuggestionSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSuggestionSource {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PendingSuggestionSource for HttpSuggestionSource {
    async fn fetch_pending(&self, conversation_id: &str) -> Result<Option<SuggestionView>, PollError> {
        let url = format!(
            "{}/api/conversations/{}/suggestion",
            self.base_url, conversation_id
        );
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PollError::Status {
                status: status.as_u16(),
            });
        }
        let envelope = response.json::<SuggestionEnvelope>().await?;
        Ok(envelope.suggestion)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollToken(u64);

struct ActiveSession {
    token: PollToken,
    conversation_id: String,
    cancel: CancellationToken,
}

type SessionSlot = Arc<Mutex<Option<ActiveSession>>>;

fn lock_slot(slot: &Mutex<Option<ActiveSession>>) -> MutexGuard<'_, Option<ActiveSession>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the slot if `token` still owns it. Only the winner may deliver.
fn take_if_current(slot: &Mutex<Option<ActiveSession>>, token: PollToken) -> bool {
    let mut active = lock_slot(slot);
    if active.as_ref().map(|session| session.token) == Some(token) {
        *active = None;
        true
    } else {
        false
    }
}

pub struct SuggestionPoller {
    source: Arc<dyn PendingSuggestionSource>,
    settings: PollSettings,
    active: SessionSlot,
    next_token: AtomicU64,
}

impl SuggestionPoller {
    pub fn new(source: Arc<dyn PendingSuggestionSource>, settings: PollSettings) -> Self {
        Self {
            source,
            settings,
            active: Arc::new(Mutex::new(None)),
            next_token: AtomicU64::new(1),
        }
    }

    /// Supersedes any running session and polls `conversation_id` until a
    /// suggestion shows up or the attempts run out.
    pub fn start<F>(&self, conversation_id: &str, on_ready: F) -> PollToken
    where
        F: FnOnce(SuggestionView) + Send + 'static,
    {
        let token = PollToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let cancel = CancellationToken::new();
        let previous = lock_slot(&self.active).replace(ActiveSession {
            token,
            conversation_id: conversation_id.to_string(),
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
            tracing::debug!(
                conversation_id = %previous.conversation_id,
                "superseded suggestion poll"
            );
        }

        tokio::spawn(run_session(
            self.source.clone(),
            self.settings,
            self.active.clone(),
            token,
            conversation_id.to_string(),
            cancel,
            on_ready,
        ));
        token
    }

    /// Stops the active session, if any. Returns whether one was running.
    pub fn cancel(&self) -> bool {
        let previous = lock_slot(&self.active).take();
        match previous {
            Some(session) => {
                session.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// The dashboard moved to `conversation_id`; polling for any other
    /// conversation stops.
    pub fn switch_conversation(&self, conversation_id: &str) -> bool {
        self.cancel_unless(|session| session.conversation_id == conversation_id)
    }

    /// An agent answered `conversation_id`; its suggestion is no longer wanted.
    pub fn agent_responded(&self, conversation_id: &str) -> bool {
        self.cancel_unless(|session| session.conversation_id != conversation_id)
    }

    pub fn active_token(&self) -> Option<PollToken> {
        lock_slot(&self.active).as_ref().map(|session| session.token)
    }

    fn cancel_unless(&self, keep: impl FnOnce(&ActiveSession) -> bool) -> bool {
        let previous = {
            let mut active = lock_slot(&self.active);
            if active.as_ref().is_some_and(|session| !keep(session)) {
                active.take()
            } else {
                None
            }
        };
        match previous {
            Some(session) => {
                session.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

impl Drop for SuggestionPoller {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run_session<F>(
    source: Arc<dyn PendingSuggestionSource>,
    settings: PollSettings,
    slot: SessionSlot,
    token: PollToken,
    conversation_id: String,
    cancel: CancellationToken,
    on_ready: F,
) where
    F: FnOnce(SuggestionView) + Send + 'static,
{
    for attempt in 1..=settings.max_attempts {
        if cancel.is_cancelled() {
            return;
        }

        let fetched = tokio::select! {
            _ = cancel.cancelled() => return,
            fetched = source.fetch_pending(&conversation_id) => fetched,
        };

        match fetched {
            Ok(Some(view)) => {
                if take_if_current(&slot, token) {
                    tracing::debug!(%conversation_id, attempt, "pending suggestion ready");
                    on_ready(view);
                }
                return;
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(%conversation_id, attempt, %error, "suggestion poll failed");
            }
        }

        if attempt < settings.max_attempts {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(settings.interval) => {}
            }
        }
    }

    if take_if_current(&slot, token) {
        tracing::debug!(
            %conversation_id,
            attempts = settings.max_attempts,
            "suggestion poll timed out"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use chrono::Utc;
    use tokio::sync::mpsc;

    struct FakeSource {
        ready: Mutex<Option<SuggestionView>>,
        delay: Duration,
        failing: bool,
        calls: AtomicUsize,
    }

    impl FakeSource {
        fn new(delay: Duration) -> Self {
            Self {
                ready: Mutex::new(None),
                delay,
                failing: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                failing: true,
                ..Self::new(Duration::from_millis(1))
            }
        }

        fn publish(&self, text: &str) {
            *self.ready.lock().unwrap() = Some(view("c1", text));
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PendingSuggestionSource for FakeSource {
        async fn fetch_pending(
            &self,
            _conversation_id: &str,
        ) -> Result<Option<SuggestionView>, PollError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.failing {
                return Err(PollError::Status { status: 503 });
            }
            Ok(self.ready.lock().unwrap().clone())
        }
    }

    fn view(conversation_id: &str, text: &str) -> SuggestionView {
        SuggestionView {
            message_id: format!("msg-{text}"),
            conversation_id: conversation_id.to_string(),
            suggestion_text: text.to_string(),
            confidence: 0.8,
            assigned_agent: None,
            manual_generation: false,
            last_updated: Utc::now(),
        }
    }

    fn settings(max_attempts: u32) -> PollSettings {
        PollSettings {
            max_attempts,
            interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn superseded_session_never_delivers() {
        let source = Arc::new(FakeSource::new(Duration::from_millis(30)));
        source.publish("from first request");
        let poller = SuggestionPoller::new(source.clone(), settings(15));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let first_tx = tx.clone();
        let first = poller.start("c1", move |view| {
            let _ = first_tx.send(("first", view));
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        source.publish("from second request");
        let second = poller.start("c1", move |view| {
            let _ = tx.send(("second", view));
        });
        assert_ne!(first, second);
        assert_eq!(poller.active_token(), Some(second));

        let (label, delivered) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("second session delivers")
            .expect("channel open");
        assert_eq!(label, "second");
        assert_eq!(delivered.suggestion_text, "from second request");

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(poller.active_token(), None);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let source = Arc::new(FakeSource::new(Duration::from_millis(1)));
        let poller = SuggestionPoller::new(source.clone(), settings(3));
        let (tx, mut rx) = mpsc::unbounded_channel::<SuggestionView>();

        poller.start("c1", move |view| {
            let _ = tx.send(view);
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(source.calls(), 3);
        assert_eq!(poller.active_token(), None);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fetch_errors_count_as_attempts() {
        let source = Arc::new(FakeSource::failing());
        let poller = SuggestionPoller::new(source.clone(), settings(4));

        poller.start("c1", |_| {});
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(source.calls(), 4);
        assert_eq!(poller.active_token(), None);
    }

    #[tokio::test]
    async fn switching_conversation_cancels_polling() {
        let source = Arc::new(FakeSource::new(Duration::from_millis(5)));
        let poller = SuggestionPoller::new(source.clone(), settings(15));
        let (tx, mut rx) = mpsc::unbounded_channel::<SuggestionView>();

        poller.start("c1", move |view| {
            let _ = tx.send(view);
        });
        assert!(!poller.switch_conversation("c1"));
        assert!(poller.active_token().is_some());

        assert!(poller.switch_conversation("c2"));
        assert_eq!(poller.active_token(), None);

        source.publish("too late");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn agent_response_cancels_only_matching_conversation() {
        let source = Arc::new(FakeSource::new(Duration::from_millis(5)));
        let poller = SuggestionPoller::new(source, settings(15));

        let token = poller.start("c1", |_| {});
        assert!(!poller.agent_responded("c2"));
        assert_eq!(poller.active_token(), Some(token));

        assert!(poller.agent_responded("c1"));
        assert_eq!(poller.active_token(), None);
        assert!(!poller.cancel());
    }

    #[tokio::test]
    async fn service_source_delivers_fresh_suggestion() {
        use crate::config::ContextLimits;
        use crate::dispatch::testing::FixedResolver;
        use crate::pending::testing::ScriptedGenerator;
        use crate::realtime::testing::RecordingNotifier;
        use crate::service::ServiceParts;
        use crate::store::MemoryStore;
        use crate::types::SystemMode;

        let service = Arc::new(HelpdeskService::new(ServiceParts {
            store: Arc::new(MemoryStore::new()),
            generator: Arc::new(ScriptedGenerator::always("On its way.")),
            resolver: Arc::new(FixedResolver(Some("agent-1"))),
            notifier: Arc::new(RecordingNotifier::default()),
            limits: ContextLimits::default(),
            use_retrieval: false,
            offline_notice: "Offline".into(),
        }));
        service
            .process_incoming_visitor_message("c1", "where is it?", SystemMode::Off)
            .await
            .unwrap();

        let poller = SuggestionPoller::new(service.clone(), settings(15));
        let (tx, mut rx) = mpsc::unbounded_channel::<SuggestionView>();
        poller.start("c1", move |view| {
            let _ = tx.send(view);
        });

        tokio::time::sleep(Duration::from_millis(25)).await;
        service
            .process_incoming_visitor_message("c1", "any update?", SystemMode::Hitl)
            .await
            .unwrap();

        let view = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("suggestion delivered")
            .expect("channel open");
        assert_eq!(view.suggestion_text, "On its way.");
        assert_eq!(view.assigned_agent.as_deref(), Some("agent-1"));
    }
}
