use minijinja::{context, Environment};

const SUGGESTION_SYSTEM_TEMPLATE: &str = include_str!("prompts/suggestion_system.j2");
const SUGGESTION_USER_TEMPLATE: &str = include_str!("prompts/suggestion_user.j2");
const OFFLINE_NOTICE_TEMPLATE: &str = include_str!("prompts/offline_notice.j2");

pub struct SuggestionSystemContext<'a> {
    pub assistant_name: &'a str,
}

pub struct SuggestionUserContext<'a> {
    pub transcript: &'a str,
    pub knowledge_block: &'a str,
}

pub struct OfflineNoticeContext<'a> {
    pub notice: &'a str,
    pub conversation_id: &'a str,
}

fn render(name: &str, source: &str, ctx: minijinja::Value) -> Option<String> {
    let mut env = Environment::new();
    env.add_template(name, source).ok()?;
    let template = env.get_template(name).ok()?;
    match template.render(ctx) {
        Ok(text) => Some(text.trim().to_string()),
        Err(error) => {
            tracing::warn!(template = name, %error, "prompt template failed to render");
            None
        }
    }
}

fn assistant_name(ctx: &SuggestionSystemContext<'_>) -> String {
    if ctx.assistant_name.trim().is_empty() {
        "Support Assistant".to_string()
    } else {
        ctx.assistant_name.trim().to_string()
    }
}

pub fn render_suggestion_system_prompt(ctx: &SuggestionSystemContext<'_>) -> String {
    let name = assistant_name(ctx);
    render(
        "suggestion_system",
        SUGGESTION_SYSTEM_TEMPLATE,
        context! {
            assistant_name => name,
        },
    )
    .unwrap_or_else(|| fallback_suggestion_system_prompt(ctx))
}

fn fallback_suggestion_system_prompt(ctx: &SuggestionSystemContext<'_>) -> String {
    format!(
        "You are {}, drafting replies for a customer support team.\n\
         Be accurate and concise. Never invent facts.\n\
         Respond with JSON: {{\"response\": \"...\", \"metadata\": {{\"confidence\": 0.0}}}}",
        assistant_name(ctx)
    )
}

pub fn render_suggestion_user_prompt(ctx: &SuggestionUserContext<'_>) -> String {
    render(
        "suggestion_user",
        SUGGESTION_USER_TEMPLATE,
        context! {
            transcript => ctx.transcript.trim(),
            knowledge_block => ctx.knowledge_block.trim(),
            has_knowledge => !ctx.knowledge_block.trim().is_empty(),
        },
    )
    .unwrap_or_else(|| {
        let mut prompt = String::new();
        if !ctx.knowledge_block.trim().is_empty() {
            prompt.push_str("Knowledge base excerpts:\n");
            prompt.push_str(ctx.knowledge_block.trim());
            prompt.push_str("\n\n");
        }
        prompt.push_str("Conversation so far:\n");
        prompt.push_str(ctx.transcript.trim());
        prompt
    })
}

pub fn render_offline_notice(ctx: &OfflineNoticeContext<'_>) -> String {
    let reference = ctx.conversation_id.chars().take(8).collect::<String>();
    render(
        "offline_notice",
        OFFLINE_NOTICE_TEMPLATE,
        context! {
            notice => ctx.notice.trim(),
            reference => reference,
        },
    )
    .unwrap_or_else(|| ctx.notice.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_notice_is_multi_line_with_reference() {
        let text = render_offline_notice(&OfflineNoticeContext {
            notice: "We are offline.\nBack soon.",
            conversation_id: "0123456789abcdef",
        });
        assert!(text.starts_with("We are offline.\nBack soon."));
        assert!(text.ends_with("Reference: #01234567"));
    }

    #[test]
    fn user_prompt_omits_empty_knowledge() {
        let text = render_suggestion_user_prompt(&SuggestionUserContext {
            transcript: "Visitor: hi",
            knowledge_block: "  ",
        });
        assert!(!text.contains("Knowledge base"));
        assert!(text.contains("Visitor: hi"));
    }

    #[test]
    fn system_prompt_defaults_assistant_name() {
        let prompt = render_suggestion_system_prompt(&SuggestionSystemContext {
            assistant_name: "",
        });
        assert!(prompt.contains("You are Support Assistant"));
        assert!(prompt.contains("\"response\""));
    }
}
