//! Environment-driven configuration.

use std::{env, path::PathBuf, time::Duration};

use crate::types::SystemMode;

const DEFAULT_OFFLINE_NOTICE: &str = "Thanks for your message!\n\
Our support team is currently offline.\n\
We'll get back to you as soon as we're available.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

/// Bounds on the conversation context sent to the suggestion generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextLimits {
    pub max_chars: usize,
    pub fallback_messages: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            max_chars: 2000,
            fallback_messages: 5,
        }
    }
}

/// Dashboard-side suggestion polling cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            max_attempts: 15,
            interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub chat_model: String,
    pub retrieval_enabled: bool,
    pub knowledge_dir: Option<PathBuf>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            chat_model: "gpt-4.1".to_string(),
            retrieval_enabled: true,
            knowledge_dir: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub store_backend: StoreBackend,
    pub database_url: String,
    pub initial_mode: SystemMode,
    pub context: ContextLimits,
    pub generator: GeneratorConfig,
    pub offline_notice: String,
}

impl Config {
    pub fn from_env() -> Self {
        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(4000);

        let store_backend = match env::var("STORE_BACKEND")
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" => StoreBackend::Memory,
            _ => StoreBackend::Postgres,
        };

        let initial_mode = env::var("SYSTEM_MODE")
            .ok()
            .and_then(|raw| SystemMode::parse(&raw))
            .unwrap_or_default();

        let defaults = ContextLimits::default();
        let context = ContextLimits {
            max_chars: env_usize("CONTEXT_MAX_CHARS").unwrap_or(defaults.max_chars),
            fallback_messages: env_usize("CONTEXT_FALLBACK_MESSAGES")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.fallback_messages),
        };

        let generator_defaults = GeneratorConfig::default();
        let generator = GeneratorConfig {
            api_key: env::var("OPENAI_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            base_url: env::var("OPENAI_BASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty())
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(generator_defaults.base_url),
            chat_model: env::var("OPENAI_CHAT_MODEL").unwrap_or(generator_defaults.chat_model),
            retrieval_enabled: env::var("RETRIEVAL_ENABLED")
                .map(|v| !matches!(v.trim(), "0" | "false" | "no"))
                .unwrap_or(true),
            knowledge_dir: env::var("KNOWLEDGE_DIR").ok().map(PathBuf::from),
        };

        let offline_notice = env::var("OFFLINE_NOTICE")
            .ok()
            .filter(|text| !text.trim().is_empty())
            .map(|text| text.replace("\\n", "\n"))
            .unwrap_or_else(|| DEFAULT_OFFLINE_NOTICE.to_string());

        Self {
            port,
            store_backend,
            database_url: resolve_database_url(),
            initial_mode,
            context,
            generator,
            offline_notice,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4000,
            store_backend: StoreBackend::Memory,
            database_url: String::new(),
            initial_mode: SystemMode::default(),
            context: ContextLimits::default(),
            generator: GeneratorConfig::default(),
            offline_notice: DEFAULT_OFFLINE_NOTICE.to_string(),
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|v| v.trim().parse::<usize>().ok())
}

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_default();
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "helpdesk".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}
