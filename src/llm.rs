use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::warn;

use crate::config::Config;
use crate::error::ReplyFlowError;
use replyflow_app::audio::AudioClient;
use replyflow_core::llm_types::{ChatMessage, CompletionRequest};

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ReplyFlowError>;

    async fn transcribe(&self, audio: Vec<u8>, mime: &str) -> Result<String, ReplyFlowError>;

    async fn synthesize_speech(&self, text: &str, voice: &str)
        -> Result<Vec<u8>, ReplyFlowError>;

    async fn describe_image(&self, image: Vec<u8>, mime: &str) -> Result<String, ReplyFlowError>;
}

// ---------------------------------------------------------------------------
// OpenAI-compatible provider  (OpenAI, OpenRouter, Groq, Ollama …)
// ---------------------------------------------------------------------------

pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: String,
    chat_url: String,
    vision_model: String,
    timeout_secs: u64,
    rate_limit_retries: u32,
    audio: AudioClient,
}

impl OpenAiProvider {
    pub fn new(config: &Config) -> Self {
        let base = config.llm.base_url.trim_end_matches('/');
        OpenAiProvider {
            http: reqwest::Client::new(),
            api_key: config.llm.api_key.clone(),
            chat_url: format!("{base}/chat/completions"),
            vision_model: config
                .llm
                .vision_model
                .clone()
                .unwrap_or_else(|| config.llm.model.clone()),
            timeout_secs: config.llm.request_timeout_secs,
            rate_limit_retries: config.llm.rate_limit_retries,
            audio: AudioClient::new(
                base,
                &config.llm.api_key,
                &config.llm.transcription_model,
                &config.llm.speech_model,
                config.llm.request_timeout_secs,
            ),
        }
    }

    async fn post_chat(&self, body: &serde_json::Value) -> Result<String, ReplyFlowError> {
        let mut retries = 0u32;
        loop {
            let mut req = self
                .http
                .post(&self.chat_url)
                .timeout(Duration::from_secs(self.timeout_secs))
                .json(body);
            if !self.api_key.is_empty() {
                req = req.bearer_auth(&self.api_key);
            }
            let response = req.send().await.map_err(|e| {
                if e.is_timeout() {
                    ReplyFlowError::Timeout(self.timeout_secs)
                } else {
                    ReplyFlowError::Http(e)
                }
            })?;

            let status = response.status();
            if status.is_success() {
                let text = response.text().await?;
                let oai: OaiResponse = serde_json::from_str(&text).map_err(|e| {
                    ReplyFlowError::LlmApi(format!(
                        "Failed to parse completion response: {e}\nBody: {text}"
                    ))
                })?;
                return Ok(extract_text(oai));
            }

            let text = response.text().await.unwrap_or_default();
            let err = ReplyFlowError::from_provider_status(status.as_u16(), &text);
            if matches!(err, ReplyFlowError::RateLimited) && retries < self.rate_limit_retries {
                retries += 1;
                let delay = Duration::from_secs(2u64.pow(retries));
                warn!(
                    "LLM: rate limited, retrying in {:?} (attempt {retries}/{})",
                    delay, self.rate_limit_retries
                );
                tokio::time::sleep(delay).await;
                continue;
            }
            return Err(err);
        }
    }
}

// --- OpenAI response types ---

#[derive(Debug, Deserialize)]
struct OaiResponse {
    choices: Vec<OaiChoice>,
}

#[derive(Debug, Deserialize)]
struct OaiChoice {
    message: OaiMessage,
}

#[derive(Debug, Deserialize)]
struct OaiMessage {
    content: Option<String>,
}

fn extract_text(oai: OaiResponse) -> String {
    let raw = oai
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();
    strip_think_blocks(&raw).trim().to_string()
}

/// Drop `<think>...</think>` sections some reasoning models inline in content.
pub fn strip_think_blocks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<think>") {
        out.push_str(&rest[..start]);
        match rest[start..].find("</think>") {
            Some(end) => rest = &rest[start + end + "</think>".len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn build_chat_body(request: &CompletionRequest) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = request
        .messages
        .iter()
        .map(|m: &ChatMessage| json!({"role": m.role.as_str(), "content": m.content}))
        .collect();
    let mut body = json!({
        "model": request.profile.model,
        "messages": messages,
        "max_completion_tokens": request.profile.effective_max_tokens(request.max_tokens),
        "reasoning_effort": request.reasoning.as_str(),
    });
    if let Some(t) = request.profile.temperature {
        body["temperature"] = json!(t);
    }
    body
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ReplyFlowError> {
        self.post_chat(&build_chat_body(request)).await
    }

    async fn transcribe(&self, audio: Vec<u8>, mime: &str) -> Result<String, ReplyFlowError> {
        self.audio.transcribe(audio, mime).await
    }

    async fn synthesize_speech(
        &self,
        text: &str,
        voice: &str,
    ) -> Result<Vec<u8>, ReplyFlowError> {
        self.audio.synthesize(text, voice).await
    }

    async fn describe_image(&self, image: Vec<u8>, mime: &str) -> Result<String, ReplyFlowError> {
        let data = base64::engine::general_purpose::STANDARD.encode(&image);
        let body = json!({
            "model": self.vision_model,
            "max_completion_tokens": 400,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "Descreva objetivamente esta imagem em uma ou duas frases, em português."},
                    {"type": "image_url", "image_url": {"url": format!("data:{mime};base64,{data}")}},
                ],
            }],
        });
        self.post_chat(&body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use replyflow_core::llm_types::{ProviderProfile, ReasoningTier};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn request() -> CompletionRequest {
        CompletionRequest {
            messages: vec![ChatMessage::system("persona"), ChatMessage::user("Oi")],
            max_tokens: 1200,
            reasoning: ReasoningTier::Medium,
            profile: ProviderProfile {
                model: "gpt-4o-mini".into(),
                temperature: Some(0.3),
                max_tokens_cap: Some(900),
            },
        }
    }

    async fn provider_for(app: Router) -> OpenAiProvider {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        let mut config = test_config();
        config.llm.base_url = format!("http://{addr}/v1");
        config.llm.rate_limit_retries = 0;
        OpenAiProvider::new(&config)
    }

    #[test]
    fn test_build_chat_body() {
        let body = build_chat_body(&request());
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["max_completion_tokens"], 900);
        assert_eq!(body["reasoning_effort"], "medium");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Oi");
        assert!((body["temperature"].as_f64().unwrap() - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_strip_think_blocks() {
        assert_eq!(strip_think_blocks("<think>hmm</think>Olá!"), "Olá!");
        assert_eq!(strip_think_blocks("a<think>x</think>b<think>y</think>c"), "abc");
        assert_eq!(strip_think_blocks("antes<think>sem fim"), "antes");
        assert_eq!(strip_think_blocks("sem tags"), "sem tags");
    }

    #[tokio::test]
    async fn test_complete_returns_trimmed_content() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                axum::Json(json!({
                    "choices": [{"message": {"content": "<think>plan</think>  Olá! Como posso ajudar? "}}]
                }))
            }),
        );
        let provider = provider_for(app).await;
        let text = provider.complete(&request()).await.unwrap();
        assert_eq!(text, "Olá! Como posso ajudar?");
    }

    #[tokio::test]
    async fn test_complete_null_content_is_empty() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async { axum::Json(json!({"choices": [{"message": {"content": null}}]})) }),
        );
        let provider = provider_for(app).await;
        assert_eq!(provider.complete(&request()).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_quota_error_is_classified() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    r#"{"error":{"code":"insufficient_quota","message":"quota"}}"#,
                )
            }),
        );
        let provider = provider_for(app).await;
        let err = provider.complete(&request()).await.unwrap_err();
        assert!(matches!(err, ReplyFlowError::ProviderQuota(_)));
    }

    #[tokio::test]
    async fn test_rate_limit_exhausts_into_error() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/v1/chat/completions",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::TOO_MANY_REQUESTS, "slow down")
                }
            }),
        );
        let provider = provider_for(app).await;
        let err = provider.complete(&request()).await.unwrap_err();
        assert!(matches!(err, ReplyFlowError::RateLimited));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
