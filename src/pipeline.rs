use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::clock::{ts, Clock};
use crate::config::Config;
use crate::conversation::{ConversationStore, Turn};
use crate::db::{call_blocking, Database};
use crate::delivery::{strip_artifacts, Deliverer, DeliveryReport};
use crate::error::ReplyFlowError;
use crate::llm::CompletionProvider;
use crate::settings::RuntimeSettings;
use replyflow_channels::inbound::{InboundMessage, InboundPayload};
use replyflow_core::llm_types::{
    reply_token_budget, ChatMessage, CompletionRequest, ReasoningTier, Role,
};
use replyflow_core::text::preview;

/// Sent when the provider rejects our credentials or quota.
pub const PROVIDER_UNAVAILABLE_MESSAGE: &str = "No momento nosso atendimento automático está indisponível. Um atendente vai retornar sua mensagem assim que possível.";

/// Sent when both completion attempts fail or come back empty.
pub const FALLBACK_APOLOGY: &str =
    "Desculpe, tive um problema para responder agora. Pode me mandar sua mensagem de novo em instantes?";

const SPEECH_MIME: &str = "audio/ogg; codecs=opus";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOrigin {
    Live,
    Recovery,
    PendingSweep,
}

impl BatchOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchOrigin::Live => "live",
            BatchOrigin::Recovery => "recovery",
            BatchOrigin::PendingSweep => "pending_sweep",
        }
    }

    /// Replayed batches are already stored as user turns.
    fn is_replay(self) -> bool {
        !matches!(self, BatchOrigin::Live)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplySource {
    Model { attempts: u32 },
    ProviderUnavailable,
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedReply {
    pub text: String,
    pub source: ReplySource,
}

impl GeneratedReply {
    fn first_attempt(&self) -> bool {
        self.source == ReplySource::Model { attempts: 1 }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub reply: String,
    pub source: ReplySource,
    pub delivery: DeliveryReport,
}

#[async_trait]
pub trait ReplyEngine: Send + Sync {
    /// Reply to a batch. `Ok(None)` when the batch carried nothing to answer.
    async fn process(
        &self,
        key: &str,
        batch: &[InboundMessage],
        origin: BatchOrigin,
    ) -> Result<Option<PipelineOutcome>, ReplyFlowError>;
}

pub struct ResponsePipeline {
    config: Arc<Config>,
    db: Arc<Database>,
    store: Arc<ConversationStore>,
    provider: Arc<dyn CompletionProvider>,
    deliverer: Deliverer,
    clock: Arc<dyn Clock>,
}

struct BatchItem {
    content: String,
    kind: &'static str,
}

pub fn build_system_prompt(
    settings: &RuntimeSettings,
    contact_name: Option<&str>,
    speech: bool,
) -> String {
    let mut prompt = settings.system_prompt.trim().to_string();
    prompt.push_str(&format!(
        "\n\nResponda em no máximo {} caracteres. Nunca ultrapasse esse limite.",
        settings.max_reply_chars
    ));
    if settings.use_contact_name {
        if let Some(name) = contact_name.map(str::trim).filter(|n| !n.is_empty()) {
            prompt.push_str(&format!(
                "\nO nome do contato é {name}. Use o nome com moderação, não em toda mensagem."
            ));
        }
    }
    if speech {
        prompt.push_str(
            "\nSua resposta será enviada como áudio: escreva como fala, sem listas, emojis ou formatação.",
        );
    }
    prompt
}

/// System instruction, the recent history, then the new batch as one user turn.
pub fn build_context(system_prompt: String, history: &[Turn], batch_text: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(system_prompt));
    for turn in history {
        messages.push(ChatMessage {
            role: turn.role,
            content: turn.content.clone(),
        });
    }
    if !batch_text.trim().is_empty() {
        messages.push(ChatMessage::user(batch_text));
    }
    messages
}

impl ResponsePipeline {
    pub fn new(
        config: Arc<Config>,
        db: Arc<Database>,
        store: Arc<ConversationStore>,
        provider: Arc<dyn CompletionProvider>,
        deliverer: Deliverer,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            db,
            store,
            provider,
            deliverer,
            clock,
        }
    }

    async fn load_settings(&self) -> RuntimeSettings {
        let config = self.config.clone();
        match call_blocking(self.db.clone(), move |db| RuntimeSettings::load(&config, db)).await {
            Ok(s) => s,
            Err(e) => {
                warn!("Pipeline: failed to load settings overrides, using config: {e}");
                RuntimeSettings::from_config(&self.config)
            }
        }
    }

    async fn resolve_item(&self, key: &str, message: &InboundMessage) -> Option<BatchItem> {
        let kind = message.payload.kind();
        let content = match &message.payload {
            InboundPayload::Text(text) => text.trim().to_string(),
            InboundPayload::Audio { bytes, mime } => {
                match self.provider.transcribe(bytes.clone(), mime).await {
                    Ok(t) if !t.trim().is_empty() => t.trim().to_string(),
                    Ok(_) => "[áudio sem fala reconhecível]".to_string(),
                    Err(e) => {
                        warn!("Pipeline: transcription failed for {key}: {e}");
                        "[áudio que não pôde ser transcrito]".to_string()
                    }
                }
            }
            InboundPayload::Image {
                bytes,
                mime,
                caption,
            } => {
                let description = match self.provider.describe_image(bytes.clone(), mime).await {
                    Ok(d) => format!("[imagem: {}]", d.trim()),
                    Err(e) => {
                        warn!("Pipeline: image description failed for {key}: {e}");
                        "[imagem]".to_string()
                    }
                };
                match caption.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
                    Some(c) => format!("{description} {c}"),
                    None => description,
                }
            }
            InboundPayload::Document { filename, caption } => {
                let base = format!("[documento: {filename}]");
                match caption.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
                    Some(c) => format!("{base} {c}"),
                    None => base,
                }
            }
        };
        if content.is_empty() {
            return None;
        }
        Some(BatchItem { content, kind })
    }

    /// Completion with one retry at the minimal tier and a fixed fallback.
    pub async fn generate_reply(
        &self,
        messages: Vec<ChatMessage>,
        settings: &RuntimeSettings,
    ) -> GeneratedReply {
        let profiles = self.config.provider_profiles();
        let tiers = [settings.reasoning_tier, ReasoningTier::Minimal];

        for (attempt, tier) in tiers.into_iter().enumerate() {
            let profile = profiles[attempt.min(profiles.len() - 1)].clone();
            let request = CompletionRequest {
                messages: messages.clone(),
                max_tokens: reply_token_budget(settings.max_reply_chars, tier),
                reasoning: tier,
                profile,
            };
            match self.provider.complete(&request).await {
                Ok(text) if !text.trim().is_empty() => {
                    return GeneratedReply {
                        text: text.trim().to_string(),
                        source: ReplySource::Model {
                            attempts: attempt as u32 + 1,
                        },
                    };
                }
                Ok(_) => {
                    warn!(
                        "Pipeline: empty completion (attempt {}, tier {tier}, model {})",
                        attempt + 1,
                        request.profile.model
                    );
                }
                Err(e) if e.is_auth_or_quota() => {
                    error!("Pipeline: provider rejected request: {e}");
                    return GeneratedReply {
                        text: PROVIDER_UNAVAILABLE_MESSAGE.to_string(),
                        source: ReplySource::ProviderUnavailable,
                    };
                }
                Err(e) => {
                    warn!(
                        "Pipeline: completion failed (attempt {}, tier {tier}, model {}): {e}",
                        attempt + 1,
                        request.profile.model
                    );
                }
            }
        }

        GeneratedReply {
            text: FALLBACK_APOLOGY.to_string(),
            source: ReplySource::Fallback,
        }
    }

    /// Best-effort emoji pass. Any failure keeps the original text.
    async fn add_emojis(&self, text: &str, settings: &RuntimeSettings) -> String {
        let request = CompletionRequest {
            messages: vec![
                ChatMessage::system(
                    "Acrescente de 1 a 3 emojis adequados ao texto do usuário sem alterar, remover ou acrescentar palavras. Responda somente com o texto final.",
                ),
                ChatMessage::user(text),
            ],
            max_tokens: reply_token_budget(settings.max_reply_chars, ReasoningTier::Minimal),
            reasoning: ReasoningTier::Minimal,
            profile: self.config.provider_profiles()[0].clone(),
        };
        match self.provider.complete(&request).await {
            Ok(enhanced)
                if !enhanced.trim().is_empty()
                    && enhanced.chars().count() <= settings.max_reply_chars + 40 =>
            {
                enhanced.trim().to_string()
            }
            Ok(_) => text.to_string(),
            Err(e) => {
                debug!("Pipeline: emoji pass skipped: {e}");
                text.to_string()
            }
        }
    }

    async fn deliver(
        &self,
        key: &str,
        reply: &GeneratedReply,
        settings: &RuntimeSettings,
    ) -> DeliveryReport {
        let speech = settings.audio_replies_enabled
            && matches!(reply.source, ReplySource::Model { .. });
        if speech {
            let spoken = strip_artifacts(&reply.text);
            match self
                .provider
                .synthesize_speech(&spoken, &self.config.llm.tts_voice)
                .await
            {
                Ok(audio) => {
                    let report = self
                        .deliverer
                        .deliver_audio(
                            key,
                            &reply.text,
                            audio,
                            SPEECH_MIME,
                            settings.contact_cards_enabled,
                        )
                        .await;
                    if report.delivered_anything() {
                        return report;
                    }
                    warn!("Pipeline: audio delivery failed for {key}, falling back to text");
                }
                Err(e) => warn!("Pipeline: speech synthesis failed for {key}: {e}"),
            }
        }
        self.deliverer
            .deliver_text(key, &reply.text, settings.contact_cards_enabled)
            .await
    }
}

#[async_trait]
impl ReplyEngine for ResponsePipeline {
    async fn process(
        &self,
        key: &str,
        batch: &[InboundMessage],
        origin: BatchOrigin,
    ) -> Result<Option<PipelineOutcome>, ReplyFlowError> {
        let settings = self.load_settings().await;

        let mut items = Vec::with_capacity(batch.len());
        for message in batch {
            if let Some(item) = self.resolve_item(key, message).await {
                items.push(item);
            }
        }
        if items.is_empty() {
            debug!("Pipeline: nothing to answer for {key}");
            return Ok(None);
        }
        let batch_text = items
            .iter()
            .map(|i| i.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let history = self
            .store
            .recent_turns(key, self.config.reply.history_turns)
            .await?;
        // a replayed batch is already the tail of a live history
        let batch_in_history = origin.is_replay() && !history.is_empty();
        let contact_name = if settings.use_contact_name {
            self.store.contact_name(key).await?
        } else {
            None
        };
        let system_prompt = build_system_prompt(
            &settings,
            contact_name.as_deref(),
            settings.audio_replies_enabled,
        );
        let messages = build_context(
            system_prompt,
            &history,
            if batch_in_history { "" } else { &batch_text },
        );

        if !batch_in_history {
            for item in &items {
                self.store
                    .add_message(key, Role::User, &item.content, Some(item.kind))
                    .await?;
            }
        }

        info!(
            "Pipeline: generating reply for {key} ({} message(s), origin {}): {}",
            items.len(),
            origin.as_str(),
            preview(&batch_text, 120)
        );
        let mut reply = self.generate_reply(messages, &settings).await;
        if settings.emoji_enabled && !settings.audio_replies_enabled && reply.first_attempt() {
            reply.text = self.add_emojis(&reply.text, &settings).await;
        }

        let delivery = self.deliver(key, &reply, &settings).await;
        if delivery.delivered_anything() {
            let message_type = if delivery.as_audio { "audio" } else { "text" };
            self.store
                .add_message(key, Role::Assistant, &reply.text, Some(message_type))
                .await?;
            let now = ts(self.clock.now());
            let tracked_key = key.to_string();
            call_blocking(self.db.clone(), move |db| {
                db.mark_auto_replied(&tracked_key, &now)
            })
            .await?;
            info!(
                "Pipeline: replied to {key} in {} part(s): {}",
                delivery.parts_sent,
                preview(&reply.text, 120)
            );
        } else {
            warn!(
                "Pipeline: reply to {key} was not delivered: {}",
                delivery.error.as_deref().unwrap_or("no parts")
            );
        }

        Ok(Some(PipelineOutcome {
            reply: reply.text,
            source: reply.source,
            delivery,
        }))
    }
}
