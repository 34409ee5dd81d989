use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const OFFLINE_NOTIFICATION: &str = "offline_notification";

/// Process-wide message handling pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemMode {
    Off,
    Autopilot,
    #[default]
    Hitl,
}

impl SystemMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SystemMode::Off => "off",
            SystemMode::Autopilot => "autopilot",
            SystemMode::Hitl => "hitl",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" => Some(SystemMode::Off),
            "autopilot" => Some(SystemMode::Autopilot),
            "hitl" => Some(SystemMode::Hitl),
            _ => None,
        }
    }
}

impl fmt::Display for SystemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Visitor,
    Agent,
    System,
}

impl Sender {
    pub fn as_str(self) -> &'static str {
        match self {
            Sender::Visitor => "visitor",
            Sender::Agent => "agent",
            Sender::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "visitor" => Some(Sender::Visitor),
            "agent" => Some(Sender::Agent),
            "system" => Some(Sender::System),
            _ => None,
        }
    }

    /// Label used when the message is rendered into generator context.
    pub fn role_label(self) -> &'static str {
        match self {
            Sender::Visitor => "Visitor",
            Sender::Agent => "Agent",
            Sender::System => "System",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender: Sender,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ChatMessage {
    pub fn new(conversation_id: &str, sender: Sender, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender,
            text: text.into(),
            created_at: Utc::now(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata<T: Serialize>(mut self, metadata: &T) -> serde_json::Result<Self> {
        if let Value::Object(map) = serde_json::to_value(metadata)? {
            self.metadata = map;
        }
        Ok(self)
    }

    fn meta_bool(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn is_pending_suggestion(&self) -> bool {
        self.meta_bool("pendingAgent")
    }

    pub fn ai_suggestion(&self) -> Option<&str> {
        self.meta_str("aiSuggestion").filter(|text| !text.is_empty())
    }

    pub fn is_offline_notice(&self) -> bool {
        self.meta_str("messageType") == Some(OFFLINE_NOTIFICATION)
    }

    pub fn is_autopilot_response(&self) -> bool {
        self.meta_bool("isAutopilotResponse")
    }

    /// `lastUpdated` from the metadata bag, else the creation timestamp.
    pub fn last_updated(&self) -> DateTime<Utc> {
        self.meta_str("lastUpdated")
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub visitor_id: String,
    pub assigned_agent_id: Option<String>,
    pub category_id: Option<String>,
    pub status_message_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub archived: bool,
    pub last_message_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: &str, visitor_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            visitor_id: visitor_id.to_string(),
            assigned_agent_id: None,
            category_id: None,
            status_message_id: None,
            started_at: now,
            ended_at: None,
            archived: false,
            last_message_at: now,
        }
    }
}

/// Where a suggestion came from and how it was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionProvenance {
    pub provider: String,
    #[serde(default)]
    pub rag_used: bool,
    #[serde(default)]
    pub fallback: bool,
    #[serde(default)]
    pub sources_used: u32,
    #[serde(default)]
    pub contexts_used: u32,
}

impl Default for SuggestionProvenance {
    fn default() -> Self {
        Self {
            provider: "unknown".to_string(),
            rag_used: false,
            fallback: false,
            sources_used: 0,
            contexts_used: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSuggestionMetadata {
    pub pending_agent: bool,
    pub ai_suggestion: String,
    pub confidence: f64,
    pub context: String,
    pub assigned_agent: Option<String>,
    pub unseen_by_agents: bool,
    pub needs_manual_assignment: bool,
    pub manual_generation: bool,
    pub last_updated: DateTime<Utc>,
    #[serde(flatten)]
    pub provenance: SuggestionProvenance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutopilotAttribution {
    pub responded_by: String,
    pub label: String,
    pub responded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutopilotMetadata {
    pub is_autopilot_response: bool,
    pub attribution: AutopilotAttribution,
    pub original_suggestion: String,
    pub confidence: f64,
    #[serde(flatten)]
    pub provenance: SuggestionProvenance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineNoticeMetadata {
    pub message_type: String,
    pub system_mode: SystemMode,
}

impl Default for OfflineNoticeMetadata {
    fn default() -> Self {
        Self {
            message_type: OFFLINE_NOTIFICATION.to_string(),
            system_mode: SystemMode::Off,
        }
    }
}

/// Dashboard view of the current pending suggestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionView {
    pub message_id: String,
    pub conversation_id: String,
    pub suggestion_text: String,
    pub confidence: f64,
    pub assigned_agent: Option<String>,
    pub manual_generation: bool,
    pub last_updated: DateTime<Utc>,
}

impl SuggestionView {
    pub fn from_message(message: &ChatMessage) -> Option<Self> {
        let suggestion_text = message.ai_suggestion()?.to_string();
        Some(Self {
            message_id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            suggestion_text,
            confidence: message
                .metadata
                .get("confidence")
                .and_then(Value::as_f64)
                .unwrap_or(0.8),
            assigned_agent: message
                .metadata
                .get("assignedAgent")
                .and_then(Value::as_str)
                .map(str::to_string),
            manual_generation: message.meta_bool("manualGeneration"),
            last_updated: message.last_updated(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualSuggestion {
    pub suggestion_text: String,
    pub confidence: f64,
    pub metadata: PendingSuggestionMetadata,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorExchange {
    pub user_message: ChatMessage,
    pub ai_message: ChatMessage,
}

/// Minimal message shape for `message:new`; the body and creation time go
/// out as `content` and `timestamp`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageProjection {
    pub id: String,
    #[serde(rename = "content")]
    pub text: String,
    pub sender: Sender,
    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationProjection {
    pub assigned_agent_id: Option<String>,
    pub last_message_at: DateTime<Utc>,
    pub unseen_by_agent: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessageEvent {
    pub conversation_id: String,
    pub message: MessageProjection,
    pub conversation: ConversationProjection,
}

impl NewMessageEvent {
    pub fn new(conversation: &Conversation, message: &ChatMessage) -> Self {
        Self {
            conversation_id: conversation.id.clone(),
            message: MessageProjection {
                id: message.id.clone(),
                text: message.text.clone(),
                sender: message.sender,
                created_at: message.created_at,
            },
            conversation: ConversationProjection {
                assigned_agent_id: conversation.assigned_agent_id.clone(),
                last_message_at: conversation.last_message_at,
                // Unassigned conversations carry `needsManualAssignment` instead.
                unseen_by_agent: conversation.assigned_agent_id.is_some(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentEvent {
    pub conversation_id: String,
    pub assigned_agent_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationBody {
    #[serde(default)]
    pub visitor_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorMessageBody {
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentReplyBody {
    pub agent_id: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryBody {
    #[serde(default)]
    pub category_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeBody {
    pub mode: String,
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}
