use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::batch_queue::BatchQueue;
use crate::clock::{ts, Clock};
use crate::config::Config;
use crate::conversation::{ConversationStore, Turn};
use crate::db::{call_blocking, Database, FollowupType};
use crate::error::ReplyFlowError;
use crate::finalization::{is_pure_closing, transcript, FinalizationClassifier};
use crate::llm::CompletionProvider;
use crate::pipeline::{BatchOrigin, ReplyEngine};
use crate::settings::RuntimeSettings;
use replyflow_channels::inbound::{InboundMessage, InboundPayload};
use replyflow_core::llm_types::{ChatMessage, CompletionRequest, ReasoningTier, Role};
use replyflow_core::text::{normalize_for_match, preview};

const BARE_GREETINGS: &[&str] = &[
    "oi", "oie", "ola", "opa", "e ai", "eai", "alo", "bom dia", "boa tarde", "boa noite", "hey",
    "hi", "hello", "ok", "okay", "blz", "beleza", "certo", "ta", "ta bom", "sim", "nao", "hum",
    "hmm", "kk", "kkk", "kkkk", "rs", "rsrs",
];

/// Letters and digits only, lowercased and single-spaced.
fn bare_words(text: &str) -> String {
    normalize_for_match(text)
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether an unanswered message deserves a late reply. Bare greetings,
/// acknowledgements, emoji, punctuation and goodbyes do not.
pub fn is_meaningful(text: &str, turn_count: usize) -> bool {
    let words = bare_words(text);
    let letters = words.chars().filter(|c| c.is_alphanumeric()).count();
    if letters < 2 {
        return false;
    }
    if BARE_GREETINGS.contains(&words.as_str()) {
        return false;
    }
    if is_pure_closing(text) {
        return false;
    }
    // a lone short word opening a conversation carries no request
    !(turn_count <= 1 && letters < 4 && !text.contains('?'))
}

/// Higher is more urgent: recent, long, asking something, in an established
/// conversation.
pub fn priority_score(age: ChronoDuration, max_age: ChronoDuration, text: &str, turn_count: usize) -> f64 {
    let max_mins = max_age.num_minutes().max(1) as f64;
    let recency = (1.0 - age.num_minutes() as f64 / max_mins).clamp(0.0, 1.0) * 40.0;
    let length = (text.chars().count() as f64 / 10.0).min(20.0);
    let question = if text.contains('?') { 15.0 } else { 0.0 };
    let depth = (turn_count as f64 * 2.0).min(15.0);
    recency + length + question + depth
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub key: String,
    /// Trailing unanswered user turns, oldest first.
    pub pending: Vec<Turn>,
    pub turn_count: usize,
    pub age: ChronoDuration,
    pub score: f64,
}

impl Candidate {
    fn last_text(&self) -> &str {
        self.pending.last().map(|t| t.content.as_str()).unwrap_or("")
    }
}

/// Build a candidate when the conversation ends with a meaningful, unanswered
/// user message aged within `[min_age, max_age]`.
pub fn candidate_from_turns(
    key: &str,
    turns: &[Turn],
    now: DateTime<Utc>,
    min_age: ChronoDuration,
    max_age: ChronoDuration,
) -> Option<Candidate> {
    let last = turns.last()?;
    if last.role != Role::User {
        return None;
    }
    let age = now - last.timestamp;
    if age < min_age || age > max_age {
        return None;
    }
    if !is_meaningful(&last.content, turns.len()) {
        return None;
    }
    let tail = turns.iter().rev().take_while(|t| t.role == Role::User).count();
    let pending = turns[turns.len() - tail..].to_vec();
    let score = priority_score(age, max_age, &last.content, turns.len());
    Some(Candidate {
        key: key.to_string(),
        pending,
        turn_count: turns.len(),
        age,
        score,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub eligible: usize,
    pub filtered: usize,
    pub declined_by_model: usize,
    pub processed: usize,
    pub delivered: usize,
    pub errors: usize,
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Finds conversations whose last user message went unanswered and feeds
/// them back through the reply pipeline, a few at a time.
pub struct RecoveryScanner {
    config: Arc<Config>,
    db: Arc<Database>,
    store: Arc<ConversationStore>,
    engine: Arc<dyn ReplyEngine>,
    finalization: Arc<FinalizationClassifier>,
    provider: Arc<dyn CompletionProvider>,
    clock: Arc<dyn Clock>,
    batches: Option<BatchQueue>,
    running: AtomicBool,
}

impl RecoveryScanner {
    pub fn new(
        config: Arc<Config>,
        db: Arc<Database>,
        store: Arc<ConversationStore>,
        engine: Arc<dyn ReplyEngine>,
        finalization: Arc<FinalizationClassifier>,
        provider: Arc<dyn CompletionProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            db,
            store,
            engine,
            finalization,
            provider,
            clock,
            batches: None,
            running: AtomicBool::new(false),
        }
    }

    /// Share the live queue's per-conversation lock so a replay never runs
    /// alongside a live batch for the same key.
    pub fn with_batch_queue(mut self, batches: BatchQueue) -> Self {
        self.batches = Some(batches);
        self
    }

    /// The conversation still ends on the candidate's last pending message.
    async fn still_pending(&self, candidate: &Candidate) -> Result<bool, ReplyFlowError> {
        if let Some(batches) = &self.batches {
            if batches.pending_count(&candidate.key) > 0 {
                return Ok(false);
            }
        }
        let turns = self.store.raw_turns(&candidate.key).await?;
        Ok(match (turns.last(), candidate.pending.last()) {
            (Some(now), Some(then)) => {
                now.role == Role::User && now.timestamp == then.timestamp && now.content == then.content
            }
            _ => false,
        })
    }

    fn max_age(&self) -> ChronoDuration {
        ChronoDuration::hours(self.config.recovery.max_age_hours)
    }

    /// Conversations active within the scan window that end on an unanswered
    /// user message.
    async fn scan_recent(&self, report: &mut RecoveryReport) -> Result<Vec<Candidate>, ReplyFlowError> {
        let now = self.clock.now();
        let since = ts(now - ChronoDuration::hours(self.config.recovery.scan_window_hours));
        let rows = call_blocking(self.db.clone(), move |db| {
            db.list_conversations_active_since(&since)
        })
        .await?;
        let min_age = ChronoDuration::minutes(self.config.recovery.min_age_mins);
        let mut out = Vec::new();
        for row in rows {
            report.scanned += 1;
            let turns = self.store.raw_turns(&row.key).await?;
            if let Some(c) = candidate_from_turns(&row.key, &turns, now, min_age, self.max_age()) {
                out.push(c);
            }
        }
        Ok(out)
    }

    /// Keys whose tracked inbound messages never got any reply.
    async fn scan_unanswered(&self, report: &mut RecoveryReport) -> Result<Vec<Candidate>, ReplyFlowError> {
        let now = self.clock.now();
        let min_age = ChronoDuration::minutes(self.config.recovery.pending_after_mins);
        let older_than = ts(now - min_age);
        let newer_than = ts(now - self.max_age());
        let keys = call_blocking(self.db.clone(), move |db| {
            db.unanswered_conversation_keys(&older_than, &newer_than)
        })
        .await?;
        let mut out = Vec::new();
        for key in keys {
            report.scanned += 1;
            let turns = self.store.raw_turns(&key).await?;
            if let Some(c) = candidate_from_turns(&key, &turns, now, min_age, self.max_age()) {
                out.push(c);
            }
        }
        Ok(out)
    }

    /// Reason the key must be left alone, if any.
    async fn blocked_reason(&self, key: &str) -> Result<Option<&'static str>, ReplyFlowError> {
        let now = self.clock.now();
        let db_key = key.to_string();
        let since = ts(now - ChronoDuration::hours(self.config.recovery.recent_send_hours));
        let (stopped, recent_sends) = call_blocking(self.db.clone(), move |db| {
            let stopped = db.has_history(&db_key, FollowupType::StopMarker, None)?;
            let sends = db.count_history_since(&db_key, &FollowupType::SENDS, &since)?;
            Ok((stopped, sends))
        })
        .await?;
        if stopped {
            return Ok(Some("stop_marker"));
        }
        if recent_sends > 0 {
            return Ok(Some("recent_send"));
        }
        if self.finalization.is_finalized(key).await? {
            return Ok(Some("finalized"));
        }
        Ok(None)
    }

    /// Last word from the model on whether a late reply makes sense. Errors
    /// answer yes.
    async fn model_approves(&self, candidate: &Candidate) -> bool {
        let turns = match self.store.raw_turns(&candidate.key).await {
            Ok(t) => t,
            Err(e) => {
                warn!("Recovery: could not load {} for model check: {e}", candidate.key);
                return true;
            }
        };
        let recent = &turns[turns.len().saturating_sub(10)..];
        let request = CompletionRequest {
            messages: vec![
                ChatMessage::system(
                    "O atendimento ficou offline e algumas mensagens de clientes não foram respondidas. \
                     Decida se ainda faz sentido responder a última mensagem do cliente agora. \
                     Responda apenas RESPONDER ou IGNORAR.",
                ),
                ChatMessage::user(format!(
                    "Mensagem sem resposta há {} minutos.\n\nConversa:\n{}",
                    candidate.age.num_minutes(),
                    transcript(recent)
                )),
            ],
            max_tokens: 300,
            reasoning: ReasoningTier::Minimal,
            profile: self.config.provider_profiles()[0].clone(),
        };
        match self.provider.complete(&request).await {
            Ok(answer) => !answer.to_uppercase().contains("IGNORAR"),
            Err(e) => {
                warn!("Recovery: model check failed for {}, answering anyway: {e}", candidate.key);
                true
            }
        }
    }

    /// Highest priority first, cheap filters, then the model check until the
    /// per-run cap is reached.
    async fn select(&self, mut candidates: Vec<Candidate>, report: &mut RecoveryReport) -> Vec<Candidate> {
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        report.eligible = candidates.len();
        let cap = self.config.recovery.max_per_run;
        let mut selected = Vec::new();
        for candidate in candidates {
            if selected.len() >= cap {
                break;
            }
            match self.blocked_reason(&candidate.key).await {
                Ok(Some(reason)) => {
                    debug!("Recovery: skipping {} ({reason})", candidate.key);
                    report.filtered += 1;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Recovery: filter check failed for {}: {e}", candidate.key);
                    report.errors += 1;
                    continue;
                }
            }
            if self.config.recovery.model_check && !self.model_approves(&candidate).await {
                info!("Recovery: model declined {}", candidate.key);
                report.declined_by_model += 1;
                continue;
            }
            if candidate.score >= self.config.recovery.high_priority_threshold {
                info!(
                    "Recovery: high priority {} (score {:.1}): {}",
                    candidate.key,
                    candidate.score,
                    preview(candidate.last_text(), 80)
                );
            }
            selected.push(candidate);
        }
        selected
    }

    fn replay_batch(candidate: &Candidate, origin: BatchOrigin) -> Vec<InboundMessage> {
        candidate
            .pending
            .iter()
            .map(|turn| InboundMessage {
                message_id: format!("{}-{}-{}", origin.as_str(), candidate.key, ts(turn.timestamp)),
                key: candidate.key.clone(),
                contact_name: None,
                from_me: false,
                payload: InboundPayload::Text(turn.content.clone()),
                timestamp: turn.timestamp,
            })
            .collect()
    }

    /// Returns whether anything was delivered.
    async fn reinject_one(
        &self,
        candidate: &Candidate,
        origin: BatchOrigin,
        delay: Duration,
    ) -> Result<bool, ReplyFlowError> {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let _guard = match &self.batches {
            Some(batches) => Some(batches.lock_key(&candidate.key).await),
            None => None,
        };
        if !self.still_pending(candidate).await? {
            info!("Recovery: {} moved on since the scan, skipped", candidate.key);
            return Ok(false);
        }
        let batch = Self::replay_batch(candidate, origin);
        let Some(outcome) = self.engine.process(&candidate.key, &batch, origin).await? else {
            return Ok(false);
        };
        if !outcome.delivery.delivered_anything() {
            return Ok(false);
        }
        let key = candidate.key.clone();
        let reply = outcome.reply.clone();
        let metadata = serde_json::json!({
            "origin": origin.as_str(),
            "score": candidate.score,
            "age_mins": candidate.age.num_minutes(),
        })
        .to_string();
        let now = ts(self.clock.now());
        call_blocking(self.db.clone(), move |db| {
            db.insert_history(
                &key,
                FollowupType::RecoveryAttempt,
                Some(&reply),
                Some(&metadata),
                &now,
            )
        })
        .await?;
        Ok(true)
    }

    /// Small batches with a pause between them; items inside a batch start
    /// staggered.
    async fn reinject(&self, selected: &[Candidate], origin: BatchOrigin, report: &mut RecoveryReport) {
        let cfg = &self.config.recovery;
        let batch_size = cfg.batch_size.max(1);
        let item_delay = Duration::from_secs(cfg.item_delay_secs);
        for (i, chunk) in selected.chunks(batch_size).enumerate() {
            if i > 0 {
                tokio::time::sleep(Duration::from_secs(cfg.batch_delay_secs)).await;
            }
            let keys: Vec<&str> = chunk.iter().map(|c| c.key.as_str()).collect();
            info!("Recovery: batch {} ({}) {:?}", i + 1, origin.as_str(), keys);
            let results = join_all(
                chunk
                    .iter()
                    .enumerate()
                    .map(|(j, c)| self.reinject_one(c, origin, item_delay * j as u32)),
            )
            .await;
            for (candidate, result) in chunk.iter().zip(results) {
                report.processed += 1;
                match result {
                    Ok(true) => report.delivered += 1,
                    Ok(false) => debug!("Recovery: nothing delivered to {}", candidate.key),
                    Err(e) => {
                        report.errors += 1;
                        error!("Recovery: reprocessing {} failed: {e}", candidate.key);
                    }
                }
            }
        }
    }

    async fn settings(&self) -> RuntimeSettings {
        let config = self.config.clone();
        call_blocking(self.db.clone(), move |db| RuntimeSettings::load(&config, db))
            .await
            .unwrap_or_else(|e| {
                warn!("Recovery: falling back to config settings: {e}");
                RuntimeSettings::from_config(&self.config)
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One scan + re-injection pass. `None` when disabled or already running.
    pub async fn run(&self, origin: BatchOrigin) -> Option<RecoveryReport> {
        let settings = self.settings().await;
        let enabled = match origin {
            BatchOrigin::Recovery => settings.smart_recovery_enabled,
            BatchOrigin::PendingSweep => settings.pending_sweep_enabled,
            BatchOrigin::Live => false,
        };
        if !enabled {
            debug!("Recovery: {} disabled", origin.as_str());
            return None;
        }
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        let _guard = RunGuard(&self.running);

        let mut report = RecoveryReport::default();
        let scanned = match origin {
            BatchOrigin::PendingSweep => self.scan_unanswered(&mut report).await,
            _ => self.scan_recent(&mut report).await,
        };
        let candidates = match scanned {
            Ok(c) => c,
            Err(e) => {
                error!("Recovery: scan failed: {e}");
                report.errors += 1;
                return Some(report);
            }
        };
        let selected = self.select(candidates, &mut report).await;
        if !selected.is_empty() {
            self.reinject(&selected, origin, &mut report).await;
        }
        info!("Recovery: {} run finished {report:?}", origin.as_str());
        Some(report)
    }

    /// Scan once the connection has had time to settle.
    pub fn run_after_reconnect(self: Arc<Self>) {
        let settle = Duration::from_secs(self.config.recovery.settle_delay_secs);
        tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            self.run(BatchOrigin::Recovery).await;
        });
    }
}

pub fn spawn_pending_sweep_loop(scanner: Arc<RecoveryScanner>, config: &Config) {
    let every = Duration::from_secs(config.recovery.pending_sweep_interval_secs.max(1));
    tokio::spawn(async move {
        info!("Recovery: pending sweep loop started (every {every:?})");
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            scanner.run(BatchOrigin::PendingSweep).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch_queue::BatchHandler;
    use crate::clock::ManualClock;
    use crate::config::tests::test_config;
    use crate::config::FinalizationConfig;
    use crate::delivery::DeliveryReport;
    use crate::pipeline::{PipelineOutcome, ReplySource};
    use crate::test_support::{cleanup, inbound_text, start_time, test_db, MockProvider};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Default)]
    struct RecordingEngine {
        calls: Mutex<Vec<(String, BatchOrigin, Instant, usize)>>,
    }

    #[async_trait]
    impl ReplyEngine for RecordingEngine {
        async fn process(
            &self,
            key: &str,
            batch: &[InboundMessage],
            origin: BatchOrigin,
        ) -> Result<Option<PipelineOutcome>, ReplyFlowError> {
            self.calls
                .lock()
                .unwrap()
                .push((key.to_string(), origin, Instant::now(), batch.len()));
            Ok(Some(PipelineOutcome {
                reply: "Temos sim!".into(),
                source: ReplySource::Model { attempts: 1 },
                delivery: DeliveryReport {
                    parts_sent: 1,
                    ..DeliveryReport::default()
                },
            }))
        }
    }

    struct Harness {
        scanner: RecoveryScanner,
        engine: Arc<RecordingEngine>,
        provider: Arc<MockProvider>,
        store: Arc<ConversationStore>,
        db: Arc<Database>,
        clock: Arc<ManualClock>,
        dir: PathBuf,
    }

    fn harness(configure: impl FnOnce(&mut Config), provider: MockProvider) -> Harness {
        let mut config = test_config();
        configure(&mut config);
        let config = Arc::new(config);
        let (db, dir) = test_db();
        let db = Arc::new(db);
        let clock = Arc::new(ManualClock::new(start_time()));
        let store = Arc::new(ConversationStore::new(
            db.clone(),
            clock.clone(),
            ChronoDuration::minutes(60),
            50,
        ));
        let engine = Arc::new(RecordingEngine::default());
        let provider = Arc::new(provider);
        let finalization = Arc::new(FinalizationClassifier::new(
            FinalizationConfig::default(),
            db.clone(),
            clock.clone(),
            None,
        ));
        let scanner = RecoveryScanner::new(
            config,
            db.clone(),
            store.clone(),
            engine.clone(),
            finalization,
            provider.clone(),
            clock.clone(),
        );
        Harness {
            scanner,
            engine,
            provider,
            store,
            db,
            clock,
            dir,
        }
    }

    fn approving() -> MockProvider {
        MockProvider::with_responder(|_| Ok("RESPONDER".into()))
    }

    async fn unanswered(h: &Harness, key: &str, text: &str) {
        h.store
            .add_message(key, Role::Assistant, "Olá! Como posso ajudar?", None)
            .await
            .unwrap();
        h.store.add_message(key, Role::User, text, None).await.unwrap();
    }

    fn turn(role: Role, content: &str, at: DateTime<Utc>) -> Turn {
        Turn {
            role,
            content: content.to_string(),
            message_type: None,
            timestamp: at,
        }
    }

    #[test]
    fn test_is_meaningful() {
        assert!(!is_meaningful("oi", 1));
        assert!(!is_meaningful("Bom dia!!", 3));
        assert!(!is_meaningful("👍", 3));
        assert!(!is_meaningful("?!...", 3));
        assert!(!is_meaningful("obrigado, tchau", 6));
        assert!(is_meaningful("qual o valor da camiseta?", 1));
        assert!(is_meaningful("vocês entregam em Niterói", 4));
        assert!(!is_meaningful("abc", 1));
        assert!(is_meaningful("abc?", 1));
    }

    #[test]
    fn test_priority_prefers_recent_questions() {
        let max = ChronoDuration::hours(24);
        let recent_question =
            priority_score(ChronoDuration::minutes(10), max, "tem tamanho G?", 4);
        let old_statement =
            priority_score(ChronoDuration::hours(20), max, "tem tamanho G", 4);
        assert!(recent_question > old_statement);
        let deep = priority_score(ChronoDuration::hours(1), max, "preço", 8);
        let shallow = priority_score(ChronoDuration::hours(1), max, "preço", 1);
        assert!(deep > shallow);
    }

    #[test]
    fn test_candidate_requires_unanswered_user_message_in_age_range() {
        let now = start_time();
        let min = ChronoDuration::minutes(5);
        let max = ChronoDuration::hours(24);
        let t = |mins: i64| now - ChronoDuration::minutes(mins);

        let answered = vec![
            turn(Role::User, "qual o preço do kit?", t(60)),
            turn(Role::Assistant, "R$ 90", t(59)),
        ];
        assert!(candidate_from_turns("a", &answered, now, min, max).is_none());

        let too_fresh = vec![turn(Role::User, "qual o preço do kit?", t(2))];
        assert!(candidate_from_turns("a", &too_fresh, now, min, max).is_none());

        let too_old = vec![turn(Role::User, "qual o preço do kit?", t(25 * 60))];
        assert!(candidate_from_turns("a", &too_old, now, min, max).is_none());

        let pending = vec![
            turn(Role::Assistant, "Olá!", t(40)),
            turn(Role::User, "quero um orçamento", t(31)),
            turn(Role::User, "para 50 camisetas?", t(30)),
        ];
        let c = candidate_from_turns("a", &pending, now, min, max).unwrap();
        assert_eq!(c.pending.len(), 2);
        assert_eq!(c.pending[0].content, "quero um orçamento");
        assert_eq!(c.age, ChronoDuration::minutes(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_scan_caps_and_paces_batches() {
        let h = harness(|_| {}, approving());
        for i in 0..12 {
            h.clock.set(start_time() + ChronoDuration::minutes(i * 5));
            unanswered(&h, &format!("K{i:02}"), "Vocês têm camiseta tamanho G disponível?").await;
        }
        h.clock.set(start_time() + ChronoDuration::hours(2));

        let report = h.scanner.run(BatchOrigin::Recovery).await.unwrap();
        assert_eq!(report.eligible, 12);
        assert_eq!(report.processed, 10);
        assert_eq!(report.delivered, 10);

        let calls = h.engine.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 10);
        // the two oldest score lowest
        let keys: Vec<&str> = calls.iter().map(|c| c.0.as_str()).collect();
        assert!(!keys.contains(&"K00"));
        assert!(!keys.contains(&"K01"));
        assert!(calls.iter().all(|c| c.1 == BatchOrigin::Recovery));

        for (i, pair) in calls.windows(2).enumerate() {
            let gap = pair[1].2 - pair[0].2;
            if (i + 1) % 3 == 0 {
                assert!(gap >= Duration::from_secs(30), "gap before batch: {gap:?}");
            } else {
                assert!(gap < Duration::from_secs(30), "gap inside batch: {gap:?}");
            }
        }

        let since = ts(start_time());
        assert_eq!(
            h.db
                .count_history_since("K11", &[FollowupType::RecoveryAttempt], &since)
                .unwrap(),
            1
        );
        cleanup(&h.dir);
    }

    #[tokio::test(start_paused = true)]
    async fn test_filters_exclude_stopped_finalized_and_recently_sent() {
        let h = harness(|_| {}, approving());
        for key in ["stop", "final", "sent", "ok"] {
            unanswered(&h, key, "qual o prazo de entrega para SP?").await;
        }
        let now = ts(start_time());
        h.db
            .insert_history("stop", FollowupType::StopMarker, Some("parar"), None, &now)
            .unwrap();
        h.db.set_finalized("final", "closing loop", &now).unwrap();
        h.db
            .insert_history("sent", FollowupType::Automatic, Some("oi!"), None, &now)
            .unwrap();
        h.clock.advance(ChronoDuration::minutes(30));

        let report = h.scanner.run(BatchOrigin::Recovery).await.unwrap();
        assert_eq!(report.filtered, 3);
        let calls = h.engine.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "ok");
        cleanup(&h.dir);
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_check_declines_and_failure_fails_open() {
        let provider = MockProvider::new();
        provider.push_ok("IGNORAR");
        provider.push_err(ReplyFlowError::LlmApi("boom".into()));
        let h = harness(|_| {}, provider);
        h.clock.set(start_time());
        unanswered(&h, "first", "qual o horário de funcionamento?").await;
        h.clock.advance(ChronoDuration::minutes(1));
        unanswered(&h, "second", "qual o horário de funcionamento?").await;
        h.clock.advance(ChronoDuration::minutes(30));

        let report = h.scanner.run(BatchOrigin::Recovery).await.unwrap();
        assert_eq!(report.declined_by_model, 1);
        assert_eq!(report.processed, 1);
        // newest is checked first and declined
        let calls = h.engine.calls.lock().unwrap().clone();
        assert_eq!(calls[0].0, "first");
        assert_eq!(h.provider.call_count(), 2);
        cleanup(&h.dir);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_skips_conversation_that_moved_on() {
        let h = harness(|c| c.recovery.batch_size = 1, approving());
        h.clock.set(start_time());
        unanswered(&h, "OLD", "vocês fazem entrega em Niterói?").await;
        h.clock.set(start_time() + ChronoDuration::minutes(30));
        unanswered(&h, "NEW", "vocês fazem entrega em Niterói?").await;
        h.clock.set(start_time() + ChronoDuration::minutes(50));

        // OLD is second in line and gets a fresh message before its turn
        let contact_writes_again = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            h.store
                .add_message("OLD", Role::User, "consegui resolver por aqui", None)
                .await
                .unwrap();
        };
        let (report, ()) = tokio::join!(h.scanner.run(BatchOrigin::Recovery), contact_writes_again);
        let report = report.unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.delivered, 1);
        let keys: Vec<String> = h.engine.calls.lock().unwrap().iter().map(|c| c.0.clone()).collect();
        assert_eq!(keys, vec!["NEW".to_string()]);
        let since = ts(start_time());
        assert_eq!(
            h.db
                .count_history_since("OLD", &[FollowupType::RecoveryAttempt], &since)
                .unwrap(),
            0
        );
        cleanup(&h.dir);
    }

    struct IgnoreBatches;

    #[async_trait]
    impl BatchHandler for IgnoreBatches {
        async fn handle_batch(&self, _key: String, _batch: Vec<InboundMessage>) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_yields_to_live_batch() {
        let h = harness(|_| {}, approving());
        unanswered(&h, "L", "qual o prazo de entrega para SP?").await;
        unanswered(&h, "M", "qual o prazo de entrega para SP?").await;
        h.clock.advance(ChronoDuration::minutes(30));

        let queue = BatchQueue::new(Duration::from_secs(60), Arc::new(IgnoreBatches));
        queue.enqueue(inbound_text("L", "wamid.l2", "ainda está aí?", h.clock.now()));
        let guard = queue.lock_key("M").await;
        let scanner = h.scanner.with_batch_queue(queue.clone());

        let release_m = async {
            tokio::time::sleep(Duration::from_secs(20)).await;
            assert!(h.engine.calls.lock().unwrap().is_empty());
            drop(guard);
        };
        let (report, ()) = tokio::join!(scanner.run(BatchOrigin::Recovery), release_m);
        let report = report.unwrap();
        assert_eq!(report.processed, 2);
        let calls = h.engine.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "M");
        cleanup(&h.dir);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_recovery_does_nothing() {
        let h = harness(|c| c.recovery.smart_recovery_enabled = false, approving());
        unanswered(&h, "A", "vocês fazem entrega?").await;
        h.clock.advance(ChronoDuration::minutes(30));
        assert!(h.scanner.run(BatchOrigin::Recovery).await.is_none());
        assert!(h.engine.calls.lock().unwrap().is_empty());
        cleanup(&h.dir);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_sweep_replays_untracked_replies() {
        let h = harness(|_| {}, approving());
        unanswered(&h, "P", "quero saber o preço do frete").await;
        unanswered(&h, "Q", "quero saber o preço do frete").await;
        let now = ts(start_time());
        h.db.track_inbound("wamid.1", "P", &now).unwrap();
        h.db.track_inbound("wamid.2", "Q", &now).unwrap();
        h.db.mark_manual_replied("Q", &now).unwrap();

        // gated by the runtime setting
        h.clock.advance(ChronoDuration::minutes(20));
        assert!(h.scanner.run(BatchOrigin::PendingSweep).await.is_none());

        h.db.set_setting("pending_sweep_enabled", "true", &now).unwrap();
        let report = h.scanner.run(BatchOrigin::PendingSweep).await.unwrap();
        assert_eq!(report.processed, 1);
        let calls = h.engine.calls.lock().unwrap().clone();
        assert_eq!(calls[0].0, "P");
        assert_eq!(calls[0].1, BatchOrigin::PendingSweep);
        assert_eq!(calls[0].3, 1);
        cleanup(&h.dir);
    }
}
