//! WebSocket fan-out to connected agent dashboards.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

pub const EVENT_MESSAGE_NEW: &str = "message:new";
pub const EVENT_SUGGESTION_PENDING: &str = "suggestion:pending";
pub const EVENT_CONVERSATION_ASSIGNED: &str = "conversation:assigned";
pub const EVENT_AGENTS_PRESENCE: &str = "agents:presence";

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Best effort: delivery problems are logged, never returned.
    async fn broadcast_to_agents(&self, event: &str, payload: Value);
}

/// Serializes `data` and broadcasts it, logging if it cannot be encoded.
pub async fn notify<T: Serialize>(notifier: &dyn Notifier, event: &str, data: &T) {
    match serde_json::to_value(data) {
        Ok(payload) => notifier.broadcast_to_agents(event, payload).await,
        Err(error) => tracing::warn!(event, %error, "failed to encode realtime payload"),
    }
}

fn event_payload(event: &str, data: &Value) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

#[derive(Default)]
struct RealtimeState {
    clients: HashMap<usize, mpsc::UnboundedSender<String>>,
    agents: HashSet<usize>,
    agent_by_client: HashMap<usize, String>,
}

/// Registry of live socket clients. Agent clients receive every broadcast.
#[derive(Default)]
pub struct RealtimeHub {
    state: Mutex<RealtimeState>,
    next_client_id: AtomicUsize,
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a socket and returns its client id and outbound queue.
    pub async fn register(&self) -> (usize, mpsc::UnboundedReceiver<String>) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        self.state.lock().await.clients.insert(client_id, tx);
        (client_id, rx)
    }

    pub async fn join_agent(&self, client_id: usize, agent_id: &str) {
        let mut rt = self.state.lock().await;
        rt.agents.insert(client_id);
        rt.agent_by_client.insert(client_id, agent_id.to_string());
    }

    /// Forgets the client and returns the agent it was signed in as.
    pub async fn unregister(&self, client_id: usize) -> Option<String> {
        let mut rt = self.state.lock().await;
        rt.clients.remove(&client_id);
        rt.agents.remove(&client_id);
        rt.agent_by_client.remove(&client_id)
    }

    pub async fn agent_for_client(&self, client_id: usize) -> Option<String> {
        self.state.lock().await.agent_by_client.get(&client_id).cloned()
    }

    pub async fn agent_client_count(&self) -> usize {
        self.state.lock().await.agents.len()
    }

    pub async fn emit_to_client(&self, client_id: usize, event: &str, data: &Value) {
        let Some(payload) = event_payload(event, data) else {
            return;
        };
        let tx = self.state.lock().await.clients.get(&client_id).cloned();
        if let Some(sender) = tx {
            let _ = sender.send(payload);
        }
    }
}

#[async_trait]
impl Notifier for RealtimeHub {
    async fn broadcast_to_agents(&self, event: &str, payload: Value) {
        let Some(payload) = event_payload(event, &payload) else {
            tracing::warn!(event, "failed to serialize realtime event");
            return;
        };

        let senders = {
            let rt = self.state.lock().await;
            rt.agents
                .iter()
                .filter_map(|id| rt.clients.get(id).map(|tx| (*id, tx.clone())))
                .collect::<Vec<_>>()
        };

        for (client_id, sender) in senders {
            if sender.send(payload.clone()).is_err() {
                tracing::debug!(client_id, event, "agent socket closed before delivery");
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_agents_only() {
        let hub = RealtimeHub::new();
        let (agent, mut agent_rx) = hub.register().await;
        let (_widget, mut widget_rx) = hub.register().await;
        hub.join_agent(agent, "agent-1").await;

        hub.broadcast_to_agents(EVENT_MESSAGE_NEW, json!({ "conversationId": "c1" }))
            .await;

        let raw = agent_rx.recv().await.expect("agent receives event");
        let envelope: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(envelope["event"], "message:new");
        assert_eq!(envelope["data"]["conversationId"], "c1");
        assert!(widget_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_returns_agent_identity() {
        let hub = RealtimeHub::new();
        let (client, _rx) = hub.register().await;
        hub.join_agent(client, "agent-9").await;
        assert_eq!(hub.agent_client_count().await, 1);

        assert_eq!(hub.unregister(client).await.as_deref(), Some("agent-9"));
        assert_eq!(hub.agent_client_count().await, 0);
        assert_eq!(hub.unregister(client).await, None);
    }

    #[tokio::test]
    async fn closed_socket_does_not_break_broadcast() {
        let hub = RealtimeHub::new();
        let (gone, gone_rx) = hub.register().await;
        let (live, mut live_rx) = hub.register().await;
        hub.join_agent(gone, "agent-1").await;
        hub.join_agent(live, "agent-2").await;
        drop(gone_rx);

        hub.broadcast_to_agents(EVENT_AGENTS_PRESENCE, json!([])).await;

        assert!(live_rx.recv().await.is_some());
    }
}
