use crate::config::ContextLimits;
use crate::types::{ChatMessage, Sender};

const EXCERPT_CHARS: usize = 500;

/// Renders visitor/agent turns as generator context.
///
/// System messages never reach the generator. When the full transcript is
/// longer than `limits.max_chars`, only the last `limits.fallback_messages`
/// turns are kept.
pub fn build_conversation_context(messages: &[ChatMessage], limits: &ContextLimits) -> String {
    let turns = messages
        .iter()
        .filter(|message| matches!(message.sender, Sender::Visitor | Sender::Agent))
        .collect::<Vec<_>>();

    let full = format_turns(&turns);
    if full.chars().count() <= limits.max_chars {
        return full;
    }

    let start = turns.len().saturating_sub(limits.fallback_messages);
    format_turns(&turns[start..])
}

fn format_turns(turns: &[&ChatMessage]) -> String {
    turns
        .iter()
        .map(|message| format!("{}: {}", message.sender.role_label(), message.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Tail of the context stored alongside a pending suggestion.
pub fn context_excerpt(context: &str) -> String {
    let total = context.chars().count();
    if total <= EXCERPT_CHARS {
        return context.to_string();
    }
    let tail = context.chars().skip(total - EXCERPT_CHARS).collect::<String>();
    format!("...{tail}")
}
