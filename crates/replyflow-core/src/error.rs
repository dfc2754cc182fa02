use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplyFlowError {
    #[error("LLM authentication error: {0}")]
    ProviderAuth(String),

    #[error("LLM quota exhausted: {0}")]
    ProviderQuota(String),

    #[error("LLM API error: {0}")]
    LlmApi(String),

    #[error("LLM request timed out after {0}s")]
    Timeout(u64),

    #[error("Rate limited, retry after backoff")]
    RateLimited,

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Background task error: {0}")]
    Task(String),
}

impl ReplyFlowError {
    /// Faults that retrying cannot fix: the user gets an explanation instead.
    pub fn is_auth_or_quota(&self) -> bool {
        matches!(
            self,
            ReplyFlowError::ProviderAuth(_) | ReplyFlowError::ProviderQuota(_)
        )
    }

    /// Map a non-success provider HTTP response onto the fault taxonomy.
    pub fn from_provider_status(status: u16, body: &str) -> Self {
        let detail = extract_error_message(body);
        match status {
            401 | 403 => ReplyFlowError::ProviderAuth(format!("HTTP {status}: {detail}")),
            402 => ReplyFlowError::ProviderQuota(format!("HTTP {status}: {detail}")),
            429 if body.contains("insufficient_quota") => {
                ReplyFlowError::ProviderQuota(format!("HTTP {status}: {detail}"))
            }
            429 => ReplyFlowError::RateLimited,
            _ if body.contains("insufficient_quota") => {
                ReplyFlowError::ProviderQuota(format!("HTTP {status}: {detail}"))
            }
            _ => ReplyFlowError::LlmApi(format!("HTTP {status}: {detail}")),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReplyFlowError::LlmApi(_)
                | ReplyFlowError::Timeout(_)
                | ReplyFlowError::RateLimited
                | ReplyFlowError::Http(_)
                | ReplyFlowError::Json(_)
        )
    }
}

/// Pull `error.message` out of an OpenAI-style error body, falling back to the raw body.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}
