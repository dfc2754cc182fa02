use std::time::Duration;

use reqwest::multipart;
use tracing::debug;

use replyflow_core::error::ReplyFlowError;

/// OpenAI-compatible audio endpoints: `/audio/transcriptions` and `/audio/speech`.
#[derive(Clone)]
pub struct AudioClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    transcription_model: String,
    speech_model: String,
    timeout_secs: u64,
}

impl AudioClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        transcription_model: &str,
        speech_model: &str,
        timeout_secs: u64,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            transcription_model: transcription_model.to_string(),
            speech_model: speech_model.to_string(),
            timeout_secs,
        }
    }

    fn map_send_error(&self, e: reqwest::Error) -> ReplyFlowError {
        if e.is_timeout() {
            ReplyFlowError::Timeout(self.timeout_secs)
        } else {
            ReplyFlowError::Http(e)
        }
    }

    pub async fn transcribe(&self, audio: Vec<u8>, mime: &str) -> Result<String, ReplyFlowError> {
        let part = multipart::Part::bytes(audio)
            .file_name(format!("audio.{}", extension_for_mime(mime)))
            .mime_str(mime)
            .map_err(|e| ReplyFlowError::LlmApi(format!("invalid audio mime '{mime}': {e}")))?;
        let form = multipart::Form::new()
            .text("model", self.transcription_model.clone())
            .part("file", part);

        let resp = self
            .http
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(self.timeout_secs))
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ReplyFlowError::from_provider_status(status.as_u16(), &body));
        }

        let body: serde_json::Value = resp.json().await?;
        let text = body
            .get("text")
            .and_then(|t| t.as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| ReplyFlowError::LlmApi("transcription missing 'text' field".into()))?;
        debug!("Audio: transcribed {} chars", text.chars().count());
        Ok(text)
    }

    pub async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>, ReplyFlowError> {
        let resp = self
            .http
            .post(format!("{}/audio/speech", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(self.timeout_secs))
            .json(&serde_json::json!({
                "model": self.speech_model,
                "input": text,
                "voice": voice,
                "response_format": "opus",
            }))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ReplyFlowError::from_provider_status(status.as_u16(), &body));
        }
        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Err(ReplyFlowError::LlmApi("speech synthesis returned no audio".into()));
        }
        Ok(bytes.to_vec())
    }
}

pub fn extension_for_mime(mime: &str) -> &'static str {
    let base = mime.split(';').next().unwrap_or("").trim();
    match base {
        "audio/ogg" | "audio/opus" => "ogg",
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => "m4a",
        "audio/wav" | "audio/x-wav" => "wav",
        "audio/webm" => "webm",
        _ => "ogg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}/v1")
    }

    #[test]
    fn test_extension_for_mime() {
        assert_eq!(extension_for_mime("audio/ogg; codecs=opus"), "ogg");
        assert_eq!(extension_for_mime("audio/mpeg"), "mp3");
        assert_eq!(extension_for_mime("application/octet-stream"), "ogg");
    }

    #[tokio::test]
    async fn test_transcribe_reads_text_field() {
        let app = Router::new().route(
            "/v1/audio/transcriptions",
            post(|| async { axum::Json(serde_json::json!({"text": "  quero um orçamento "})) }),
        );
        let base = serve(app).await;
        let client = AudioClient::new(&base, "k", "whisper-1", "tts-1", 10);
        let text = client
            .transcribe(vec![1, 2, 3], "audio/ogg; codecs=opus")
            .await
            .unwrap();
        assert_eq!(text, "quero um orçamento");
    }

    #[tokio::test]
    async fn test_synthesize_maps_auth_failure() {
        let app = Router::new().route(
            "/v1/audio/speech",
            post(|| async {
                (
                    StatusCode::UNAUTHORIZED,
                    r#"{"error":{"message":"bad key"}}"#,
                )
            }),
        );
        let base = serve(app).await;
        let client = AudioClient::new(&base, "k", "whisper-1", "tts-1", 10);
        let err = client.synthesize("Oi", "alloy").await.unwrap_err();
        assert!(err.is_auth_or_quota());
    }

    #[tokio::test]
    async fn test_synthesize_returns_bytes() {
        let app = Router::new().route("/v1/audio/speech", post(|| async { vec![7u8, 8, 9] }));
        let base = serve(app).await;
        let client = AudioClient::new(&format!("{base}/"), "k", "whisper-1", "tts-1", 10);
        assert_eq!(client.synthesize("Oi", "alloy").await.unwrap(), vec![7, 8, 9]);
    }
}
