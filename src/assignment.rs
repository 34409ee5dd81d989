//! Agent availability and automatic assignment.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::AssignmentError;

#[async_trait]
pub trait AssignmentResolver: Send + Sync {
    /// Best agent to take a new conversation, if anyone is available.
    async fn best_available_agent(&self) -> Result<Option<String>, AssignmentError>;

    /// Called once the conversation has been handed to `agent_id`.
    async fn record_assignment(&self, _agent_id: &str) {}

    /// Called when a conversation held by `agent_id` is closed.
    async fn release_assignment(&self, _agent_id: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Away,
    Offline,
}

impl AgentStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "online" => Some(AgentStatus::Online),
            "away" => Some(AgentStatus::Away),
            "offline" => Some(AgentStatus::Offline),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPresence {
    pub id: String,
    pub name: String,
    pub status: AgentStatus,
    pub open_conversations: usize,
    #[serde(skip)]
    connections: usize,
}

/// Live roster of agents fed by dashboard connections.
///
/// Picks the online agent with the fewest open conversations; ties go to the
/// lowest agent id.
#[derive(Default)]
pub struct AgentRoster {
    agents: RwLock<HashMap<String, AgentPresence>>,
}

impl AgentRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a dashboard connection for `agent_id` and marks it online.
    pub async fn connect(&self, agent_id: &str, name: &str) {
        let mut agents = self.agents.write().await;
        let entry = agents
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentPresence {
                id: agent_id.to_string(),
                name: name.to_string(),
                status: AgentStatus::Online,
                open_conversations: 0,
                connections: 0,
            });
        entry.connections += 1;
        entry.status = AgentStatus::Online;
        if !name.trim().is_empty() {
            entry.name = name.to_string();
        }
    }

    /// Drops one connection; the agent goes offline with its last one.
    pub async fn disconnect(&self, agent_id: &str) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(agent_id) {
            entry.connections = entry.connections.saturating_sub(1);
            if entry.connections == 0 {
                entry.status = AgentStatus::Offline;
            }
        }
    }

    pub async fn set_status(&self, agent_id: &str, status: AgentStatus) -> bool {
        let mut agents = self.agents.write().await;
        match agents.get_mut(agent_id) {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    pub async fn record_assignment(&self, agent_id: &str) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(agent_id) {
            entry.open_conversations += 1;
        }
    }

    pub async fn release_assignment(&self, agent_id: &str) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(agent_id) {
            entry.open_conversations = entry.open_conversations.saturating_sub(1);
        }
    }

    pub async fn online(&self) -> Vec<AgentPresence> {
        let agents = self.agents.read().await;
        let mut list = agents
            .values()
            .filter(|agent| agent.status == AgentStatus::Online)
            .cloned()
            .collect::<Vec<_>>();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }
}

#[async_trait]
impl AssignmentResolver for AgentRoster {
    async fn best_available_agent(&self) -> Result<Option<String>, AssignmentError> {
        let agents = self.agents.read().await;
        Ok(agents
            .values()
            .filter(|agent| agent.status == AgentStatus::Online)
            .min_by(|a, b| {
                a.open_conversations
                    .cmp(&b.open_conversations)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|agent| agent.id.clone()))
    }

    async fn record_assignment(&self, agent_id: &str) {
        AgentRoster::record_assignment(self, agent_id).await;
    }

    async fn release_assignment(&self, agent_id: &str) {
        AgentRoster::release_assignment(self, agent_id).await;
    }
}
