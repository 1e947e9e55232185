use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

/// Domain error for the send pipeline and everything it touches.
///
/// `Persistence` aborts a send before any broadcast. `Upstream` never reaches
/// the end user; the orchestrator recovers it into a fallback message.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("persistence: {0}")]
    Persistence(String),

    #[error("upstream: {0}")]
    Upstream(String),
}

impl ChatError {
    /// Stable wire-facing code, used by the `error` frame and for HTTP status
    /// mapping.
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "validation",
            ChatError::Forbidden(_) => "forbidden",
            ChatError::NotFound(_) => "not_found",
            ChatError::Persistence(_) => "internal",
            ChatError::Upstream(_) => "upstream",
        }
    }
}

impl From<redis::RedisError> for ChatError {
    fn from(e: redis::RedisError) -> Self {
        ChatError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Persistence(e.to_string())
    }
}
