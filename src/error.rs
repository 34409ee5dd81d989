//! Error types for the helpdesk core.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, HelpdeskError>;

/// Top-level error returned by the exposed service operations.
#[derive(Debug, thiserror::Error)]
pub enum HelpdeskError {
    #[error(transparent)]
    Suggestion(#[from] SuggestionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("message text is required")]
    EmptyMessage,
}

/// Failures producing an AI suggestion. These always reach the caller.
#[derive(Debug, thiserror::Error)]
pub enum SuggestionError {
    #[error("suggestion generation failed: {0}")]
    Generation(String),

    #[error("invalid suggestion shape: {0}")]
    InvalidShape(String),

    #[error("conversation {conversation_id} has no context to generate from")]
    EmptyContext { conversation_id: String },
}

/// The assignment resolver could not answer. Logged and treated as "no agent".
#[derive(Debug, thiserror::Error)]
pub enum AssignmentError {
    #[error("agent roster unavailable: {0}")]
    Unavailable(String),
}

/// Conversation store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conversation {id} not found")]
    ConversationNotFound { id: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("metadata serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("invalid stored row: {0}")]
    InvalidRow(String),
}

/// Failures fetching a pending suggestion from the dashboard side.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("suggestion request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("suggestion endpoint returned {status}")]
    Status { status: u16 },

    #[error(transparent)]
    Helpdesk(#[from] HelpdeskError),
}

impl HelpdeskError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            HelpdeskError::Store(StoreError::ConversationNotFound { .. })
        )
    }
}
