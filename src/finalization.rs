use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::clock::{parse_ts, ts, Clock};
use crate::config::FinalizationConfig;
use crate::conversation::Turn;
use crate::db::{call_blocking, Database, FollowupType};
use crate::error::ReplyFlowError;
use crate::llm::CompletionProvider;
use replyflow_core::llm_types::{ChatMessage, CompletionRequest, ProviderProfile, ReasoningTier, Role};
use replyflow_core::text::{normalize_for_match, preview};

/// Phrases a contact uses to wrap a conversation up.
const USER_CLOSING: &[&str] = &[
    "muito obrigado",
    "muito obrigada",
    "obrigado",
    "obrigada",
    "obrigadao",
    "obg",
    "brigado",
    "brigada",
    "valeu",
    "vlw",
    "agradeco",
    "tchau",
    "tchauzinho",
    "ate mais",
    "ate logo",
    "ate amanha",
    "ate a proxima",
    "ate breve",
    "falou",
    "flw",
    "abraco",
    "abracos",
    "bom descanso",
    "boa noite",
    "de nada",
    "tudo certo",
    "combinado",
    "perfeito",
    "fechado",
    "beleza",
    "blz",
    "entendi",
    "certo",
    "otimo",
    "show",
    "top",
    "ok",
    "okay",
    "thanks",
    "thank you",
    "thx",
    "bye",
    "goodbye",
    "see you",
    "👍",
    "🙏",
    "😊",
];

/// Phrases the assistant uses when it considers the exchange done.
const BOT_CLOSING: &[&str] = &[
    "de nada",
    "por nada",
    "disponha",
    "a disposicao",
    "estou por aqui",
    "qualquer coisa",
    "qualquer duvida",
    "foi um prazer",
    "precisando",
    "ate mais",
    "ate logo",
    "ate a proxima",
    "tchau",
    "bom descanso",
    "tenha um otimo",
    "tenha uma otima",
    "abraco",
    "you're welcome",
];

/// Words that may accompany a closing phrase without making it a new topic.
const FILLERS: &[&str] = &[
    "muito", "mesmo", "entao", "e", "pra", "para", "voce", "voces", "vc", "sim", "ta", "bom",
    "boa", "dia", "tarde", "mais", "uma", "vez", "de", "novo", "tudo", "pela", "pelo", "ajuda",
    "atencao", "atendimento", "a", "o", "por", "ai", "gente", "amigo", "amiga", "ne", "kkk",
    "kkkk", "rs", "haha", "so", "isso", "mt", "mto", "viu",
];

/// Lowercased, unaccented, punctuation-free form padded with spaces so phrase
/// lookups can match on word boundaries.
fn padded_tokens(text: &str) -> String {
    let normalized = normalize_for_match(text);
    let mut out = String::with_capacity(normalized.len() + 2);
    out.push(' ');
    for c in normalized.chars() {
        if c.is_alphanumeric() || c.is_whitespace() || c == '\'' {
            out.push(c);
        } else if c.is_ascii() {
            out.push(' ');
        } else {
            // emoji and other symbols become their own token
            out.push(' ');
            out.push(c);
            out.push(' ');
        }
    }
    out.push(' ');
    let collapsed = out.split_whitespace().collect::<Vec<_>>().join(" ");
    format!(" {collapsed} ")
}

fn count_hits(padded: &str, lexicon: &[&str]) -> usize {
    lexicon
        .iter()
        .filter(|phrase| padded.contains(&format!(" {phrase} ")))
        .count()
}

pub fn closing_hits(text: &str) -> usize {
    count_hits(&padded_tokens(text), USER_CLOSING)
}

pub fn bot_closing_hits(text: &str) -> usize {
    count_hits(&padded_tokens(text), BOT_CLOSING)
}

/// True when the message is made only of closing phrases and filler, with no
/// question and no new content.
pub fn is_pure_closing(text: &str) -> bool {
    if text.contains('?') {
        return false;
    }
    let mut padded = padded_tokens(text);
    let mut hits = 0;
    // longest phrases first so "muito obrigado" wins over "obrigado"
    let mut phrases: Vec<&str> = USER_CLOSING.to_vec();
    phrases.sort_by_key(|p| std::cmp::Reverse(p.chars().count()));
    for phrase in phrases {
        let needle = format!(" {phrase} ");
        while padded.contains(&needle) {
            padded = padded.replacen(&needle, " ", 1);
            hits += 1;
        }
    }
    hits > 0
        && padded
            .split_whitespace()
            .all(|token| FILLERS.contains(&token))
}

fn is_closing_turn(turn: &Turn) -> bool {
    match turn.role {
        Role::Assistant => bot_closing_hits(&turn.content) > 0,
        _ => closing_hits(&turn.content) > 0 && !turn.content.contains('?'),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinalizationDecision {
    pub should_finalize: bool,
    pub reason: String,
    pub confidence: f32,
}

impl FinalizationDecision {
    fn keep(reason: impl Into<String>) -> Self {
        Self {
            should_finalize: false,
            reason: reason.into(),
            confidence: 0.0,
        }
    }

    fn finalize(reason: impl Into<String>, confidence: f32) -> Self {
        Self {
            should_finalize: true,
            reason: reason.into(),
            confidence,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TierOneOutcome {
    Finalize(FinalizationDecision),
    Continue(FinalizationDecision),
    /// A closing message without corroborating context.
    Ambiguous,
}

/// Pattern-based first stage. Only finalizes when the new message is a pure
/// closing and the recent turns corroborate it.
pub struct DeterministicClassifier {
    context_turns: usize,
    min_context_hits: usize,
    loop_min_pairs: usize,
}

impl DeterministicClassifier {
    pub fn new(config: &FinalizationConfig) -> Self {
        Self {
            context_turns: config.context_turns.max(2),
            min_context_hits: config.min_context_hits.max(1),
            loop_min_pairs: config.loop_min_pairs.max(1),
        }
    }

    /// Assistant-closing turns immediately answered by a user-closing turn.
    pub fn loop_pairs(&self, new_message: &str, history: &[Turn]) -> usize {
        let start = history.len().saturating_sub(self.context_turns);
        let mut closing: Vec<(Role, bool)> = history[start..]
            .iter()
            .map(|t| (t.role, is_closing_turn(t)))
            .collect();
        closing.push((Role::User, is_pure_closing(new_message)));
        closing
            .windows(2)
            .filter(|w| w[0] == (Role::Assistant, true) && w[1] == (Role::User, true))
            .count()
    }

    pub fn context_hits(&self, history: &[Turn]) -> usize {
        let start = history.len().saturating_sub(self.context_turns);
        history[start..].iter().filter(|t| is_closing_turn(t)).count()
    }

    pub fn classify(&self, new_message: &str, history: &[Turn]) -> TierOneOutcome {
        if !is_pure_closing(new_message) {
            return TierOneOutcome::Continue(FinalizationDecision::keep(
                "message carries new content",
            ));
        }
        let pairs = self.loop_pairs(new_message, history);
        if pairs >= self.loop_min_pairs {
            return TierOneOutcome::Finalize(FinalizationDecision::finalize(
                format!("closing loop: {pairs} bot/user closing exchanges"),
                0.95,
            ));
        }
        let hits = self.context_hits(history);
        if hits >= self.min_context_hits {
            return TierOneOutcome::Finalize(FinalizationDecision::finalize(
                format!("closing message with {hits} closing turns in recent context"),
                0.8,
            ));
        }
        TierOneOutcome::Ambiguous
    }
}

const ARBITRATION_PROMPT: &str = "Você avalia se uma conversa de atendimento por WhatsApp terminou de forma natural. Responda FINALIZE somente se o cliente claramente encerrou a conversa e não espera mais nenhuma resposta. Em qualquer outro caso, ou na dúvida, responda CONTINUE. Responda apenas com FINALIZE ou CONTINUE.";

/// Second stage: a binary FINALIZE/CONTINUE question to the model.
pub struct ModelArbitratedClassifier {
    provider: Arc<dyn CompletionProvider>,
    profile: ProviderProfile,
}

pub fn transcript(history: &[Turn]) -> String {
    history
        .iter()
        .map(|t| {
            let who = match t.role {
                Role::Assistant => "Atendente",
                _ => "Cliente",
            };
            format!("{who}: {}", t.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

impl ModelArbitratedClassifier {
    pub fn new(provider: Arc<dyn CompletionProvider>, profile: ProviderProfile) -> Self {
        Self { provider, profile }
    }

    pub async fn arbitrate(
        &self,
        new_message: &str,
        history: &[Turn],
    ) -> Result<FinalizationDecision, ReplyFlowError> {
        let request = CompletionRequest {
            messages: vec![
                ChatMessage::system(ARBITRATION_PROMPT),
                ChatMessage::user(format!(
                    "Conversa recente:\n{}\n\nÚltima mensagem do cliente: {new_message}",
                    transcript(history)
                )),
            ],
            max_tokens: 300,
            reasoning: ReasoningTier::Minimal,
            profile: self.profile.clone(),
        };
        let answer = self.provider.complete(&request).await?.to_uppercase();
        if answer.contains("FINALIZE") && !answer.contains("CONTINUE") {
            Ok(FinalizationDecision::finalize("model arbitration: FINALIZE", 0.7))
        } else {
            Ok(FinalizationDecision::keep("model arbitration: CONTINUE"))
        }
    }
}

struct CachedDecision {
    fingerprint: String,
    at: DateTime<Utc>,
    decision: FinalizationDecision,
}

/// Composes both stages, caches decisions briefly per key and records positive
/// decisions. Never touches the follow-up queue.
pub struct FinalizationClassifier {
    config: FinalizationConfig,
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    deterministic: DeterministicClassifier,
    model: Option<ModelArbitratedClassifier>,
    cache: Mutex<HashMap<String, CachedDecision>>,
}

impl FinalizationClassifier {
    pub fn new(
        config: FinalizationConfig,
        db: Arc<Database>,
        clock: Arc<dyn Clock>,
        model: Option<ModelArbitratedClassifier>,
    ) -> Self {
        Self {
            deterministic: DeterministicClassifier::new(&config),
            model: if config.model_arbitration { model } else { None },
            config,
            db,
            clock,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, key: &str, fingerprint: &str, now: DateTime<Utc>) -> Option<FinalizationDecision> {
        let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        let entry = cache.get(key)?;
        let fresh = now - entry.at <= Duration::seconds(self.config.cache_ttl_secs);
        (fresh && entry.fingerprint == fingerprint).then(|| entry.decision.clone())
    }

    fn forget(&self, key: &str) {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.remove(key);
    }

    pub async fn classify(
        &self,
        key: &str,
        new_message: &str,
        history: &[Turn],
    ) -> FinalizationDecision {
        if !self.config.enabled {
            return FinalizationDecision::keep("finalization disabled");
        }
        let now = self.clock.now();
        let fingerprint = normalize_for_match(new_message);
        if let Some(decision) = self.cached(key, &fingerprint, now) {
            return decision;
        }

        let decision = match self.deterministic.classify(new_message, history) {
            TierOneOutcome::Finalize(d) | TierOneOutcome::Continue(d) => d,
            TierOneOutcome::Ambiguous => {
                let short = new_message.chars().count() <= self.config.ambiguous_max_chars;
                match (&self.model, short) {
                    (Some(model), true) => match model.arbitrate(new_message, history).await {
                        Ok(d) => d,
                        Err(e) => {
                            warn!("Finalization: arbitration failed for {key}, continuing: {e}");
                            FinalizationDecision::keep("arbitration failed")
                        }
                    },
                    _ => FinalizationDecision::keep("ambiguous closing"),
                }
            }
        };

        if decision.should_finalize {
            info!(
                "Finalization: {key} finalized ({}, confidence {:.2}): {}",
                decision.reason,
                decision.confidence,
                preview(new_message, 120)
            );
            if let Err(e) = self.record(key, new_message, &decision, now).await {
                warn!("Finalization: failed to record decision for {key}: {e}");
            }
        } else {
            debug!("Finalization: {key} continues ({})", decision.reason);
        }

        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.insert(
            key.to_string(),
            CachedDecision {
                fingerprint,
                at: now,
                decision: decision.clone(),
            },
        );
        decision
    }

    async fn record(
        &self,
        key: &str,
        message: &str,
        decision: &FinalizationDecision,
        now: DateTime<Utc>,
    ) -> Result<(), ReplyFlowError> {
        let key = key.to_string();
        let message = message.to_string();
        let reason = decision.reason.clone();
        let metadata = serde_json::json!({
            "reason": decision.reason,
            "confidence": decision.confidence,
        })
        .to_string();
        let at = ts(now);
        call_blocking(self.db.clone(), move |db| {
            db.insert_history(
                &key,
                FollowupType::FinalizationDetected,
                Some(&message),
                Some(&metadata),
                &at,
            )?;
            db.insert_history(
                &key,
                FollowupType::ConversationFinalized,
                None,
                Some(&metadata),
                &at,
            )?;
            db.set_finalized(&key, &reason, &at)
        })
        .await
    }

    /// Clear the finalized marker unless the message is closing-only. Returns
    /// true if a marker was cleared.
    pub async fn observe_inbound(&self, key: &str, text: &str) -> Result<bool, ReplyFlowError> {
        if is_pure_closing(text) {
            return Ok(false);
        }
        let db_key = key.to_string();
        let cleared = call_blocking(self.db.clone(), move |db| db.clear_finalized(&db_key)).await?;
        if cleared {
            self.forget(key);
            info!("Finalization: {key} resumed, finalized marker cleared");
        }
        Ok(cleared)
    }

    /// Finalized within the suppression window.
    pub async fn is_finalized(&self, key: &str) -> Result<bool, ReplyFlowError> {
        let db_key = key.to_string();
        let row = call_blocking(self.db.clone(), move |db| db.get_conversation(&db_key)).await?;
        let window = Duration::hours(self.config.suppress_hours);
        let now = self.clock.now();
        Ok(row
            .and_then(|r| r.finalized_at)
            .and_then(|at| parse_ts(&at))
            .map(|at| now - at <= window)
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::test_support::{cleanup, start_time, test_db, MockProvider};
    use std::path::PathBuf;

    fn turn(role: Role, content: &str) -> Turn {
        Turn {
            role,
            content: content.to_string(),
            message_type: None,
            timestamp: start_time(),
        }
    }

    fn config() -> FinalizationConfig {
        FinalizationConfig::default()
    }

    fn classifier(
        model: Option<Arc<MockProvider>>,
    ) -> (FinalizationClassifier, Arc<Database>, Arc<ManualClock>, PathBuf) {
        let (db, dir) = test_db();
        let db = Arc::new(db);
        let clock = Arc::new(ManualClock::new(start_time()));
        let mut cfg = config();
        cfg.model_arbitration = model.is_some();
        let model = model.map(|p| {
            ModelArbitratedClassifier::new(p, ProviderProfile::for_model("gpt-4o-mini"))
        });
        (
            FinalizationClassifier::new(cfg, db.clone(), clock.clone(), model),
            db,
            clock,
            dir,
        )
    }

    #[test]
    fn test_pure_closing_detection() {
        assert!(is_pure_closing("Obrigado, tchau!"));
        assert!(is_pure_closing("Muito obrigada pela ajuda 🙏"));
        assert!(is_pure_closing("ok"));
        assert!(!is_pure_closing("Obrigado! Quanto fica a entrega para Campinas?"));
        assert!(!is_pure_closing("ok, me manda o catálogo"));
        assert!(!is_pure_closing("quero um orçamento"));
        assert!(!is_pure_closing("tocha"));
    }

    #[test]
    fn test_bot_closing_hits() {
        assert_eq!(bot_closing_hits("De nada! Qualquer coisa, estou por aqui."), 3);
        assert_eq!(bot_closing_hits("Temos sim, o valor é R$ 50."), 0);
    }

    #[test]
    fn test_goodbye_loop_is_finalized() {
        let det = DeterministicClassifier::new(&config());
        let history = vec![
            turn(Role::Assistant, "De nada!"),
            turn(Role::User, "tchau"),
            turn(Role::Assistant, "De nada, tchau!"),
            turn(Role::User, "tchau"),
        ];
        match det.classify("tchau", &history) {
            TierOneOutcome::Finalize(d) => {
                assert!(d.should_finalize);
                assert!(d.reason.contains("loop"));
            }
            other => panic!("expected finalize, got {other:?}"),
        }
    }

    #[test]
    fn test_single_thanks_without_context_is_ambiguous() {
        let det = DeterministicClassifier::new(&config());
        let history = vec![
            turn(Role::User, "Vocês entregam em Campinas?"),
            turn(Role::Assistant, "Entregamos sim, em até 3 dias úteis."),
        ];
        assert_eq!(det.classify("obrigado", &history), TierOneOutcome::Ambiguous);
        assert!(matches!(
            det.classify("obrigado, e qual o frete?", &history),
            TierOneOutcome::Continue(_)
        ));
    }

    #[test]
    fn test_context_density_finalizes() {
        let det = DeterministicClassifier::new(&config());
        let history = vec![
            turn(Role::User, "perfeito, combinado"),
            turn(Role::Assistant, "Seu pedido foi registrado com sucesso."),
            turn(Role::User, "beleza, valeu"),
            turn(Role::Assistant, "Seu código de rastreio chega amanhã."),
            turn(Role::User, "ok obrigado"),
        ];
        match det.classify("tchau", &history) {
            TierOneOutcome::Finalize(d) => assert!(d.reason.contains("closing turns")),
            other => panic!("expected finalize, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_finalize_records_history_and_marker() {
        let (classifier, db, _clock, dir) = classifier(None);
        let history = vec![
            turn(Role::Assistant, "De nada!"),
            turn(Role::User, "tchau"),
            turn(Role::Assistant, "De nada, tchau!"),
            turn(Role::User, "tchau"),
        ];
        let decision = classifier.classify("B", "tchau", &history).await;
        assert!(decision.should_finalize);
        assert!(classifier.is_finalized("B").await.unwrap());
        assert!(db
            .has_history("B", FollowupType::FinalizationDetected, None)
            .unwrap());
        assert!(db
            .has_history("B", FollowupType::ConversationFinalized, None)
            .unwrap());
        cleanup(&dir);
    }

    #[tokio::test]
    async fn test_non_closing_message_clears_marker() {
        let (classifier, db, _clock, dir) = classifier(None);
        db.set_finalized("B", "closing loop", &ts(start_time())).unwrap();
        assert!(classifier.is_finalized("B").await.unwrap());

        assert!(!classifier.observe_inbound("B", "valeu!").await.unwrap());
        assert!(classifier.is_finalized("B").await.unwrap());

        assert!(classifier
            .observe_inbound("B", "Oi, queria ver outro produto")
            .await
            .unwrap());
        assert!(!classifier.is_finalized("B").await.unwrap());
        cleanup(&dir);
    }

    #[tokio::test]
    async fn test_closing_word_with_new_request_clears_marker() {
        let (classifier, db, _clock, dir) = classifier(None);
        db.set_finalized("B", "closing loop", &ts(start_time())).unwrap();
        assert!(!classifier.observe_inbound("B", "ok, obrigado").await.unwrap());
        assert!(classifier
            .observe_inbound("B", "Ok, agora quero fazer um pedido de 20 camisetas")
            .await
            .unwrap());
        assert!(!classifier.is_finalized("B").await.unwrap());
        cleanup(&dir);
    }

    #[tokio::test]
    async fn test_marker_expires_after_suppress_window() {
        let (classifier, db, clock, dir) = classifier(None);
        db.set_finalized("B", "closing loop", &ts(start_time())).unwrap();
        clock.advance(Duration::hours(25));
        assert!(!classifier.is_finalized("B").await.unwrap());
        cleanup(&dir);
    }

    #[tokio::test]
    async fn test_ambiguous_short_message_asks_model() {
        let provider = Arc::new(MockProvider::new());
        provider.push_ok("FINALIZE");
        let (classifier, _db, _clock, dir) = classifier(Some(provider.clone()));
        let history = vec![turn(Role::Assistant, "Seu pedido saiu para entrega.")];
        let decision = classifier.classify("K", "obrigado", &history).await;
        assert!(decision.should_finalize);
        assert_eq!(provider.call_count(), 1);
        let prompt = &provider.calls()[0].messages[1].content;
        assert!(prompt.contains("Atendente: Seu pedido saiu para entrega."));

        // cached for the same message
        classifier.classify("K", "obrigado", &history).await;
        assert_eq!(provider.call_count(), 1);
        cleanup(&dir);
    }

    #[tokio::test]
    async fn test_arbitration_failure_fails_open() {
        let provider = Arc::new(MockProvider::new());
        provider.push_err(ReplyFlowError::Timeout(60));
        let (classifier, _db, _clock, dir) = classifier(Some(provider));
        let decision = classifier.classify("K", "valeu", &[]).await;
        assert!(!decision.should_finalize);
        assert!(!classifier.is_finalized("K").await.unwrap());
        cleanup(&dir);
    }
}
