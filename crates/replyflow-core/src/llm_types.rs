use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Discrete reasoning effort. Each tier reserves extra completion tokens so
/// the model can think and still have room for the visible answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningTier {
    Minimal,
    Low,
    Medium,
    High,
}

impl ReasoningTier {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasoningTier::Minimal => "minimal",
            ReasoningTier::Low => "low",
            ReasoningTier::Medium => "medium",
            ReasoningTier::High => "high",
        }
    }

    pub fn token_allowance(self) -> u32 {
        match self {
            ReasoningTier::Minimal => 256,
            ReasoningTier::Low => 1024,
            ReasoningTier::Medium => 2048,
            ReasoningTier::High => 4096,
        }
    }
}

impl fmt::Display for ReasoningTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReasoningTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minimal" => Ok(ReasoningTier::Minimal),
            "low" => Ok(ReasoningTier::Low),
            "medium" => Ok(ReasoningTier::Medium),
            "high" => Ok(ReasoningTier::High),
            other => Err(format!(
                "unknown reasoning tier '{other}' (expected minimal|low|medium|high)"
            )),
        }
    }
}

/// Completion token budget for a reply capped at `max_reply_chars`.
pub fn reply_token_budget(max_reply_chars: usize, tier: ReasoningTier) -> u32 {
    let answer_tokens = ((max_reply_chars as f64) / 3.5).ceil() as u32 + 64;
    answer_tokens + tier.token_allowance()
}

/// One entry of the ordered fallback list: model plus its sampling policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens_cap: Option<u32>,
}

impl ProviderProfile {
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: None,
            max_tokens_cap: None,
        }
    }

    pub fn effective_max_tokens(&self, requested: u32) -> u32 {
        match self.max_tokens_cap {
            Some(cap) => requested.min(cap),
            None => requested,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub reasoning: ReasoningTier,
    pub profile: ProviderProfile,
}
