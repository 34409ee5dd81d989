//! Suggestion generator boundary.
//!
//! Generators answer with a [`GeneratorReply`]. JSON produced by a model is
//! decoded into the same union, so every accepted reply shape is spelled out
//! in one place and anything else is rejected as an invalid shape.

use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::GeneratorConfig;
use crate::error::SuggestionError;
use crate::knowledge::{KnowledgeBase, Retrieved};
use crate::prompting::{
    render_suggestion_system_prompt, render_suggestion_user_prompt, SuggestionSystemContext,
    SuggestionUserContext,
};
use crate::types::SuggestionProvenance;

pub const DEFAULT_CONFIDENCE: f64 = 0.8;
const RETRIEVAL_TOP_K: usize = 4;

#[async_trait]
pub trait SuggestionGenerator: Send + Sync {
    /// Provider name recorded when a reply does not name one itself.
    fn name(&self) -> &str;

    async fn generate(
        &self,
        conversation_id: &str,
        context: &str,
        use_retrieval: bool,
    ) -> Result<GeneratorReply, SuggestionError>;
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyMetadata {
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub rag_used: bool,
    #[serde(default)]
    pub fallback: bool,
    #[serde(default)]
    pub sources_used: u32,
    #[serde(default)]
    pub contexts_used: u32,
    #[serde(default)]
    pub debug_info: Option<Value>,
}

/// Every reply shape a generator may produce.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum GeneratorReply {
    Structured {
        response: String,
        #[serde(default)]
        metadata: ReplyMetadata,
    },
    Scored {
        suggestion: String,
        #[serde(default)]
        confidence: Option<f64>,
    },
    Plain(String),
}

/// A normalized, non-empty suggestion.
#[derive(Debug, Clone, PartialEq)]
pub struct Suggestion {
    pub text: String,
    pub confidence: f64,
    pub provenance: SuggestionProvenance,
    pub debug_info: Option<Value>,
}

impl GeneratorReply {
    pub fn from_json(value: Value) -> Result<Self, SuggestionError> {
        serde_json::from_value(value).map_err(|_| {
            SuggestionError::InvalidShape(
                "expected {response, metadata}, a string, or {suggestion, confidence}".to_string(),
            )
        })
    }

    pub fn into_suggestion(self, default_provider: &str) -> Result<Suggestion, SuggestionError> {
        let (text, confidence, metadata) = match self {
            GeneratorReply::Structured { response, metadata } => {
                (response, metadata.confidence, metadata)
            }
            GeneratorReply::Scored {
                suggestion,
                confidence,
            } => (suggestion, confidence, ReplyMetadata::default()),
            GeneratorReply::Plain(text) => (text, None, ReplyMetadata::default()),
        };

        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(SuggestionError::InvalidShape(
                "suggestion text is empty".to_string(),
            ));
        }

        Ok(Suggestion {
            text,
            confidence: normalize_confidence(confidence),
            provenance: SuggestionProvenance {
                provider: metadata
                    .provider
                    .filter(|p| !p.trim().is_empty())
                    .unwrap_or_else(|| default_provider.to_string()),
                rag_used: metadata.rag_used,
                fallback: metadata.fallback,
                sources_used: metadata.sources_used,
                contexts_used: metadata.contexts_used,
            },
            debug_info: metadata.debug_info,
        })
    }
}

fn normalize_confidence(confidence: Option<f64>) -> f64 {
    match confidence {
        Some(value) if value.is_finite() => value.clamp(0.0, 1.0),
        _ => DEFAULT_CONFIDENCE,
    }
}

/// Calls the generator and normalizes its reply.
pub async fn generate_suggestion(
    generator: &dyn SuggestionGenerator,
    conversation_id: &str,
    context: &str,
    use_retrieval: bool,
) -> Result<Suggestion, SuggestionError> {
    generator
        .generate(conversation_id, context, use_retrieval)
        .await?
        .into_suggestion(generator.name())
}

/// Decodes raw model output. Bare prose is a plain reply. When the whole
/// text (or a code fence body) is JSON it must match a known shape; a JSON
/// fragment embedded in prose is only used if it matches one.
pub fn parse_reply_text(raw: &str) -> Result<GeneratorReply, SuggestionError> {
    let trimmed = raw.trim();
    let mut candidates = vec![(trimmed.to_string(), true)];

    if trimmed.starts_with("```") {
        let stripped = trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string();
        if !stripped.is_empty() {
            candidates.push((stripped, true));
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            candidates.push((trimmed[start..=end].to_string(), false));
        }
    }

    for (candidate, whole) in candidates {
        let Ok(parsed) = serde_json::from_str::<Value>(&candidate) else {
            continue;
        };
        if !(parsed.is_object() || parsed.is_string()) {
            continue;
        }
        match GeneratorReply::from_json(parsed) {
            Ok(reply) => return Ok(reply),
            Err(error) if whole => return Err(error),
            Err(_) => continue,
        }
    }

    Ok(GeneratorReply::Plain(trimmed.to_string()))
}

/// Chat-completions backed generator with local retrieval augmentation.
///
/// Without an API key it answers with a canned fallback so the pipeline
/// keeps working in development.
pub struct OpenAiSuggestionGenerator {
    client: reqwest::Client,
    config: GeneratorConfig,
    knowledge: Arc<KnowledgeBase>,
    provider: String,
}

impl OpenAiSuggestionGenerator {
    pub fn new(client: reqwest::Client, config: GeneratorConfig, knowledge: Arc<KnowledgeBase>) -> Self {
        let provider = format!("openai:{}", config.chat_model);
        Self {
            client,
            config,
            knowledge,
            provider,
        }
    }

    fn retrieve(&self, context: &str, use_retrieval: bool) -> Retrieved {
        if !use_retrieval || !self.config.retrieval_enabled || self.knowledge.is_empty() {
            return Retrieved::default();
        }
        self.knowledge
            .retrieve(latest_visitor_turn(context), RETRIEVAL_TOP_K)
    }

    async fn chat_completion(
        &self,
        api_key: &str,
        system: &str,
        user: &str,
    ) -> Result<String, SuggestionError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(api_key)
            .json(&json!({
                "model": self.config.chat_model,
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": user }
                ],
                "temperature": 0.2
            }))
            .send()
            .await
            .map_err(|err| SuggestionError::Generation(format!("request failed: {err}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SuggestionError::Generation(format!(
                "provider returned {status}: {body}"
            )));
        }
        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| SuggestionError::Generation(format!("parse failed: {err}")))?;
        let text = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if text.is_empty() {
            return Err(SuggestionError::Generation(
                "provider response had empty content".to_string(),
            ));
        }
        Ok(text)
    }
}

#[async_trait]
impl SuggestionGenerator for OpenAiSuggestionGenerator {
    fn name(&self) -> &str {
        &self.provider
    }

    async fn generate(
        &self,
        conversation_id: &str,
        context: &str,
        use_retrieval: bool,
    ) -> Result<GeneratorReply, SuggestionError> {
        let retrieved = self.retrieve(context, use_retrieval);

        let Some(api_key) = self.config.api_key.as_deref() else {
            tracing::debug!(conversation_id, "no API key configured, using fallback suggestion");
            return Ok(fallback_reply(&retrieved));
        };

        let system = render_suggestion_system_prompt(&SuggestionSystemContext {
            assistant_name: "",
        });
        let user = render_suggestion_user_prompt(&SuggestionUserContext {
            transcript: context,
            knowledge_block: &retrieved.block,
        });

        let started = Instant::now();
        let raw = self.chat_completion(api_key, &system, &user).await?;
        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(conversation_id, latency_ms, "suggestion generated");

        let reply = parse_reply_text(&raw)?;
        Ok(annotate(reply, &self.provider, &retrieved, latency_ms))
    }
}

fn annotate(reply: GeneratorReply, provider: &str, retrieved: &Retrieved, latency_ms: u64) -> GeneratorReply {
    let (response, mut metadata) = match reply {
        GeneratorReply::Structured { response, metadata } => (response, metadata),
        GeneratorReply::Scored {
            suggestion,
            confidence,
        } => (
            suggestion,
            ReplyMetadata {
                confidence,
                ..ReplyMetadata::default()
            },
        ),
        GeneratorReply::Plain(text) => (text, ReplyMetadata::default()),
    };
    metadata.provider.get_or_insert_with(|| provider.to_string());
    metadata.rag_used = retrieved.contexts_used > 0;
    metadata.sources_used = retrieved.sources_used;
    metadata.contexts_used = retrieved.contexts_used;
    metadata
        .debug_info
        .get_or_insert_with(|| json!({ "latencyMs": latency_ms }));
    GeneratorReply::Structured { response, metadata }
}

fn fallback_reply(retrieved: &Retrieved) -> GeneratorReply {
    let mut response =
        "Thanks for reaching out! A member of our team will follow up shortly.".to_string();
    if !retrieved.block.is_empty() {
        response.push_str("\n\nIn the meantime, this may help:\n");
        response.push_str(&retrieved.block);
    }
    GeneratorReply::Structured {
        response,
        metadata: ReplyMetadata {
            confidence: Some(0.3),
            provider: Some("fallback".to_string()),
            rag_used: retrieved.contexts_used > 0,
            fallback: true,
            sources_used: retrieved.sources_used,
            contexts_used: retrieved.contexts_used,
            debug_info: None,
        },
    }
}

fn latest_visitor_turn(context: &str) -> &str {
    context
        .rsplit("\n\n")
        .find_map(|turn| turn.strip_prefix("Visitor: "))
        .unwrap_or(context)
}
