use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::Query;
use axum::response::IntoResponse;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use reqwest::multipart;
use serde::Deserialize;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::WhatsAppConfig;
use replyflow_app::audio::extension_for_mime;
use replyflow_channels::inbound::{InboundMessage, InboundPayload, InboundSender};
use replyflow_channels::transport::{PresenceState, Transport};
use replyflow_core::text::{preview, split_text};

const TEXT_CHUNK_CHARS: usize = 3000;
const PRUNE_ABOVE_ENTRIES: usize = 1024;
/// Typing indicators are only attached to messages this recent.
const LAST_INBOUND_TTL: Duration = Duration::from_secs(3600);

/// WhatsApp Cloud API (Graph) client.
pub struct WhatsAppTransport {
    http_client: reqwest::Client,
    api_base: String,
    access_token: String,
    phone_number_id: String,
    /// Last inbound message id per contact; the typing indicator is attached to it.
    last_inbound: Mutex<HashMap<String, (String, Instant)>>,
}

impl WhatsAppTransport {
    pub fn new(config: &WhatsAppConfig) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            api_base: format!(
                "{}/{}",
                config.graph_base_url.trim().trim_end_matches('/'),
                config.api_version.trim()
            ),
            access_token: config.access_token.trim().to_string(),
            phone_number_id: config.phone_number_id.trim().to_string(),
            last_inbound: Mutex::new(HashMap::new()),
        }
    }

    pub fn remember_inbound(&self, key: &str, message_id: &str) {
        let now = Instant::now();
        let mut last = self.last_inbound.lock().unwrap_or_else(|p| p.into_inner());
        if last.len() > PRUNE_ABOVE_ENTRIES {
            last.retain(|_, (_, seen)| now.duration_since(*seen) <= LAST_INBOUND_TTL);
        }
        last.insert(key.to_string(), (message_id.to_string(), now));
    }

    fn last_inbound_id(&self, key: &str) -> Option<String> {
        let last = self.last_inbound.lock().unwrap_or_else(|p| p.into_inner());
        last.get(key)
            .filter(|(_, seen)| seen.elapsed() <= LAST_INBOUND_TTL)
            .map(|(id, _)| id.clone())
    }

    #[cfg(test)]
    fn remembered_contacts(&self) -> usize {
        self.last_inbound.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    async fn post_message(&self, body: serde_json::Value) -> Result<(), String> {
        let url = format!("{}/{}/messages", self.api_base, self.phone_number_id);
        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("WhatsApp API request failed: {e}"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("WhatsApp API error {status}: {body}"));
        }
        Ok(())
    }

    async fn upload_media(&self, bytes: Vec<u8>, mime: &str) -> Result<String, String> {
        let base_mime = mime.split(';').next().unwrap_or(mime).trim().to_string();
        let part = multipart::Part::bytes(bytes)
            .file_name(format!("reply.{}", extension_for_mime(mime)))
            .mime_str(&base_mime)
            .map_err(|e| format!("invalid media mime '{mime}': {e}"))?;
        let form = multipart::Form::new()
            .text("messaging_product", "whatsapp")
            .text("type", base_mime)
            .part("file", part);
        let url = format!("{}/{}/media", self.api_base, self.phone_number_id);
        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.access_token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| format!("WhatsApp media upload failed: {e}"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("WhatsApp media upload error {status}: {body}"));
        }
        let uploaded: MediaUploadResponse = response
            .json()
            .await
            .map_err(|e| format!("WhatsApp media upload returned invalid JSON: {e}"))?;
        Ok(uploaded.id)
    }

    /// Resolve a media id to its bytes and mime type.
    pub async fn download_media(&self, media_id: &str) -> Result<(Vec<u8>, String), String> {
        let url = format!("{}/{}", self.api_base, media_id);
        let response = self
            .http_client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| format!("WhatsApp media lookup failed: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("WhatsApp media lookup error {}", response.status()));
        }
        let info: MediaInfo = response
            .json()
            .await
            .map_err(|e| format!("WhatsApp media lookup returned invalid JSON: {e}"))?;

        let response = self
            .http_client
            .get(&info.url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| format!("WhatsApp media download failed: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("WhatsApp media download error {}", response.status()));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| format!("WhatsApp media download failed: {e}"))?;
        Ok((bytes.to_vec(), info.mime_type.unwrap_or_default()))
    }
}

#[derive(Debug, Deserialize)]
struct MediaUploadResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MediaInfo {
    url: String,
    #[serde(default)]
    mime_type: Option<String>,
}

#[async_trait]
impl Transport for WhatsAppTransport {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn send_text(&self, key: &str, text: &str) -> Result<(), String> {
        for chunk in split_text(text, TEXT_CHUNK_CHARS) {
            self.post_message(serde_json::json!({
                "messaging_product": "whatsapp",
                "to": key,
                "type": "text",
                "text": { "body": chunk }
            }))
            .await?;
        }
        Ok(())
    }

    async fn send_audio(&self, key: &str, audio: Vec<u8>, mime: &str) -> Result<(), String> {
        let media_id = self.upload_media(audio, mime).await?;
        self.post_message(serde_json::json!({
            "messaging_product": "whatsapp",
            "to": key,
            "type": "audio",
            "audio": { "id": media_id }
        }))
        .await
    }

    async fn send_contact_card(&self, key: &str, phone: &str) -> Result<(), String> {
        let wa_id: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
        self.post_message(serde_json::json!({
            "messaging_product": "whatsapp",
            "to": key,
            "type": "contacts",
            "contacts": [{
                "name": { "formatted_name": phone, "first_name": phone },
                "phones": [{ "phone": phone, "wa_id": wa_id, "type": "CELL" }]
            }]
        }))
        .await
    }

    async fn set_presence(&self, key: &str, state: PresenceState) -> Result<(), String> {
        if state == PresenceState::Paused {
            return Ok(());
        }
        let Some(message_id) = self.last_inbound_id(key) else {
            return Ok(());
        };
        self.post_message(serde_json::json!({
            "messaging_product": "whatsapp",
            "status": "read",
            "message_id": message_id,
            "typing_indicator": { "type": "text" }
        }))
        .await
    }
}

#[derive(Debug, Deserialize)]
struct WhatsAppVerifyQuery {
    #[serde(rename = "hub.mode")]
    hub_mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    hub_verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    hub_challenge: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppWebhookPayload {
    #[serde(default)]
    entry: Vec<WhatsAppWebhookEntry>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppWebhookEntry {
    #[serde(default)]
    changes: Vec<WhatsAppWebhookChange>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppWebhookChange {
    value: WhatsAppWebhookValue,
}

#[derive(Debug, Deserialize)]
struct WhatsAppWebhookValue {
    #[serde(default)]
    metadata: Option<WhatsAppWebhookMetadata>,
    #[serde(default)]
    contacts: Vec<WhatsAppWebhookContact>,
    #[serde(default)]
    messages: Vec<WhatsAppInboundMessage>,
    /// Messages the operator sent from the WhatsApp Business app.
    #[serde(default)]
    message_echoes: Vec<WhatsAppInboundMessage>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppWebhookMetadata {
    #[serde(default)]
    phone_number_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppWebhookContact {
    #[serde(default)]
    wa_id: String,
    #[serde(default)]
    profile: Option<WhatsAppProfile>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppProfile {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppInboundMessage {
    id: String,
    from: String,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    timestamp: String,
    #[serde(rename = "type")]
    message_type: String,
    #[serde(default)]
    text: Option<WhatsAppInboundText>,
    #[serde(default)]
    audio: Option<WhatsAppMedia>,
    #[serde(default)]
    image: Option<WhatsAppMedia>,
    #[serde(default)]
    document: Option<WhatsAppMedia>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppInboundText {
    body: String,
}

#[derive(Debug, Clone, Deserialize)]
struct WhatsAppMedia {
    id: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    filename: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaKind {
    Audio,
    Image,
    Document,
}

#[derive(Debug, Clone, PartialEq)]
enum RawContent {
    Text(String),
    Media {
        kind: MediaKind,
        media_id: String,
        mime: String,
        caption: Option<String>,
        filename: Option<String>,
    },
}

/// A webhook message before media is downloaded.
#[derive(Debug, Clone, PartialEq)]
struct RawInbound {
    message_id: String,
    key: String,
    contact_name: Option<String>,
    from_me: bool,
    timestamp: DateTime<Utc>,
    content: RawContent,
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now)
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|v| !v.is_empty()).map(ToOwned::to_owned)
}

fn raw_content(message: &WhatsAppInboundMessage) -> Option<RawContent> {
    let media = |kind: MediaKind, m: &WhatsAppMedia, default_mime: &str| RawContent::Media {
        kind,
        media_id: m.id.clone(),
        mime: m
            .mime_type
            .clone()
            .unwrap_or_else(|| default_mime.to_string()),
        caption: non_empty(m.caption.as_deref()),
        filename: non_empty(m.filename.as_deref()),
    };
    match message.message_type.as_str() {
        "text" => non_empty(message.text.as_ref().map(|t| t.body.as_str())).map(RawContent::Text),
        "audio" => message
            .audio
            .as_ref()
            .map(|m| media(MediaKind::Audio, m, "audio/ogg")),
        "image" => message
            .image
            .as_ref()
            .map(|m| media(MediaKind::Image, m, "image/jpeg")),
        "document" => message
            .document
            .as_ref()
            .map(|m| media(MediaKind::Document, m, "application/octet-stream")),
        _ => None,
    }
}

/// Messages addressed to `phone_number_id`, in payload order.
fn extract_inbound(payload: WhatsAppWebhookPayload, phone_number_id: &str) -> Vec<RawInbound> {
    let mut out = Vec::new();
    for change in payload.entry.into_iter().flat_map(|e| e.changes) {
        let value = change.value;
        let target = value
            .metadata
            .as_ref()
            .and_then(|m| m.phone_number_id.as_deref())
            .map(str::trim)
            .unwrap_or("");
        if !target.is_empty() && target != phone_number_id {
            debug!("WhatsApp: ignoring change for phone_number_id={target}");
            continue;
        }
        let names: HashMap<&str, &str> = value
            .contacts
            .iter()
            .filter_map(|c| {
                let name = c.profile.as_ref()?.name.as_deref()?;
                Some((c.wa_id.as_str(), name))
            })
            .collect();

        for message in &value.messages {
            let Some(content) = raw_content(message) else {
                debug!(
                    "WhatsApp: skipping unsupported message type '{}'",
                    message.message_type
                );
                continue;
            };
            out.push(RawInbound {
                message_id: message.id.clone(),
                key: message.from.trim().to_string(),
                contact_name: names.get(message.from.trim()).map(|n| n.to_string()),
                from_me: false,
                timestamp: parse_timestamp(&message.timestamp),
                content,
            });
        }
        for echo in &value.message_echoes {
            let Some(to) = non_empty(echo.to.as_deref()) else {
                continue;
            };
            let Some(content) = raw_content(echo) else {
                continue;
            };
            out.push(RawInbound {
                message_id: echo.id.clone(),
                key: to,
                contact_name: None,
                from_me: true,
                timestamp: parse_timestamp(&echo.timestamp),
                content,
            });
        }
    }
    out
}

/// Download media and build the inbound event. Failed downloads keep the
/// caption when there is one.
async fn resolve_inbound(raw: RawInbound, transport: &WhatsAppTransport) -> Option<InboundMessage> {
    let payload = match raw.content {
        RawContent::Text(text) => InboundPayload::Text(text),
        RawContent::Media {
            kind: MediaKind::Document,
            caption,
            filename,
            ..
        } => InboundPayload::Document {
            filename: filename.unwrap_or_else(|| "documento".to_string()),
            caption,
        },
        RawContent::Media {
            kind,
            media_id,
            mime,
            caption,
            ..
        } => match transport.download_media(&media_id).await {
            Ok((bytes, downloaded_mime)) => {
                let mime = if downloaded_mime.is_empty() { mime } else { downloaded_mime };
                match kind {
                    MediaKind::Audio => InboundPayload::Audio { bytes, mime },
                    _ => InboundPayload::Image {
                        bytes,
                        mime,
                        caption,
                    },
                }
            }
            Err(e) => {
                error!("WhatsApp: media {media_id} from {} unavailable: {e}", raw.key);
                InboundPayload::Text(caption?)
            }
        },
    };
    Some(InboundMessage {
        message_id: raw.message_id,
        key: raw.key,
        contact_name: raw.contact_name,
        from_me: raw.from_me,
        payload,
        timestamp: raw.timestamp,
    })
}

/// Shared state of the webhook routes.
#[derive(Clone)]
pub struct WebhookState {
    pub verify_token: String,
    pub phone_number_id: String,
    pub allowed_numbers: Vec<String>,
    pub transport: Arc<WhatsAppTransport>,
    pub inbound: InboundSender,
}

impl WebhookState {
    pub fn new(config: &WhatsAppConfig, transport: Arc<WhatsAppTransport>, inbound: InboundSender) -> Self {
        Self {
            verify_token: config.verify_token.trim().to_string(),
            phone_number_id: config.phone_number_id.trim().to_string(),
            allowed_numbers: config
                .allowed_numbers
                .iter()
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .collect(),
            transport,
            inbound,
        }
    }

    fn allowed(&self, key: &str) -> bool {
        self.allowed_numbers.is_empty() || self.allowed_numbers.iter().any(|n| n == key)
    }
}

async fn whatsapp_verify_handler(state: Arc<WebhookState>, query: WhatsAppVerifyQuery) -> impl IntoResponse {
    if query.hub_mode.as_deref() != Some("subscribe") {
        return axum::http::StatusCode::BAD_REQUEST.into_response();
    }
    let Some(challenge) = query.hub_challenge else {
        return axum::http::StatusCode::BAD_REQUEST.into_response();
    };
    let provided = query.hub_verify_token.unwrap_or_default();
    if state.verify_token.is_empty() || provided.trim() != state.verify_token {
        warn!("WhatsApp: webhook verification rejected");
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }
    info!("WhatsApp: webhook verified");
    (axum::http::StatusCode::OK, challenge).into_response()
}

async fn whatsapp_webhook_handler(
    state: Arc<WebhookState>,
    payload: WhatsAppWebhookPayload,
) -> impl IntoResponse {
    for raw in extract_inbound(payload, &state.phone_number_id) {
        if !raw.from_me && !state.allowed(&raw.key) {
            debug!("WhatsApp: dropping message from non-allowed {}", raw.key);
            continue;
        }
        if !raw.from_me {
            state.transport.remember_inbound(&raw.key, &raw.message_id);
        }
        let Some(message) = resolve_inbound(raw, &state.transport).await else {
            continue;
        };
        info!(
            "WhatsApp: {} {} from {}: {}",
            if message.from_me { "echo" } else { "message" },
            message.payload.kind(),
            message.key,
            preview(message.payload.inline_text().unwrap_or(""), 120)
        );
        if state.inbound.send(message).await.is_err() {
            error!("WhatsApp: inbound channel closed, dropping message");
            return axum::http::StatusCode::SERVICE_UNAVAILABLE;
        }
    }
    axum::http::StatusCode::OK
}

/// Mount `GET` verification and `POST` delivery on `path`.
pub fn register_whatsapp_webhook(router: Router, path: &str, state: WebhookState) -> Router {
    let state = Arc::new(state);
    let verify_state = state.clone();
    let post_state = state;
    router.route(
        path,
        axum::routing::get(move |Query(query): Query<WhatsAppVerifyQuery>| {
            let state = verify_state.clone();
            async move { whatsapp_verify_handler(state, query).await }
        })
        .post(move |Json(payload): Json<WhatsAppWebhookPayload>| {
            let state = post_state.clone();
            async move { whatsapp_webhook_handler(state, payload).await }
        }),
    )
}
