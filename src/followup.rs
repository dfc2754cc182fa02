use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clock::{hours, ts, Clock};
use crate::config::Config;
use crate::conversation::{ConversationStore, Turn};
use crate::db::{
    call_blocking, Database, FollowupQueueItem, FollowupSettings, FollowupStatus, FollowupType,
};
use crate::error::ReplyFlowError;
use crate::finalization::{transcript, FinalizationClassifier};
use crate::llm::CompletionProvider;
use replyflow_channels::channel::deliver_and_store_text;
use replyflow_channels::transport::Transport;
use replyflow_core::llm_types::{
    reply_token_budget, ChatMessage, CompletionRequest, ReasoningTier, Role,
};
use replyflow_core::text::preview;

/// Why `schedule_analysis` did or did not create a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled(i64),
    Disabled,
    AlreadyActive,
    StopMarker,
    Finalized,
    RateLimited,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub examined: usize,
    pub scheduled_for_send: usize,
    pub sent: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisVerdict {
    pub decision: String,
    #[serde(default)]
    pub reason: String,
}

impl AnalysisVerdict {
    pub fn should_generate(&self) -> bool {
        matches!(
            self.decision.trim().to_ascii_lowercase().as_str(),
            "generate" | "gerar" | "yes" | "sim"
        )
    }
}

/// Read the model's verdict: a JSON object if one is present, otherwise a bare
/// keyword. Anything unclear counts as "skip".
pub fn parse_verdict(raw: &str) -> AnalysisVerdict {
    if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
        if start < end {
            if let Ok(v) = serde_json::from_str::<AnalysisVerdict>(&raw[start..=end]) {
                return v;
            }
        }
    }
    let upper = raw.to_uppercase();
    let decision = if upper.contains("GENERATE") && !upper.contains("SKIP") {
        "generate"
    } else {
        "skip"
    };
    AnalysisVerdict {
        decision: decision.to_string(),
        reason: preview(raw.trim(), 200),
    }
}

/// Resets the in-flight flag when a sweep ends, however it ends.
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn try_enter(flag: &AtomicBool) -> Option<SweepGuard<'_>> {
    flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .ok()
        .map(|_| SweepGuard(flag))
}

enum Eligibility {
    Eligible,
    Blocked(&'static str),
}

/// Owns every transition of follow-up queue items.
pub struct FollowupScheduler {
    config: Arc<Config>,
    db: Arc<Database>,
    store: Arc<ConversationStore>,
    provider: Arc<dyn CompletionProvider>,
    transport: Arc<dyn Transport>,
    finalization: Arc<FinalizationClassifier>,
    clock: Arc<dyn Clock>,
    analysis_running: AtomicBool,
    send_running: AtomicBool,
}

impl FollowupScheduler {
    pub fn new(
        config: Arc<Config>,
        db: Arc<Database>,
        store: Arc<ConversationStore>,
        provider: Arc<dyn CompletionProvider>,
        transport: Arc<dyn Transport>,
        finalization: Arc<FinalizationClassifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            db,
            store,
            provider,
            transport,
            finalization,
            clock,
            analysis_running: AtomicBool::new(false),
            send_running: AtomicBool::new(false),
        }
    }

    /// The persisted settings row, seeded from config on first use.
    pub async fn settings(&self) -> Result<FollowupSettings, ReplyFlowError> {
        let seed = self.config.followup_seed();
        let now = ts(self.clock.now());
        call_blocking(self.db.clone(), move |db| match db.get_followup_settings()? {
            Some(s) => Ok(s),
            None => {
                db.save_followup_settings(&seed, &now)?;
                Ok(seed)
            }
        })
        .await
    }

    /// Stop markers, finalization and the rolling send cap.
    async fn eligibility(
        &self,
        key: &str,
        settings: &FollowupSettings,
        now: DateTime<Utc>,
    ) -> Result<Eligibility, ReplyFlowError> {
        if self.finalization.is_finalized(key).await? {
            return Ok(Eligibility::Blocked("finalized"));
        }
        let db_key = key.to_string();
        let since = ts(now - hours(settings.followup_interval_hours));
        let (stopped, sends) = call_blocking(self.db.clone(), move |db| {
            let stopped = db.has_history(&db_key, FollowupType::StopMarker, None)?;
            let sends = db.count_history_since(&db_key, &FollowupType::SENDS, &since)?;
            Ok((stopped, sends))
        })
        .await?;
        if stopped {
            return Ok(Eligibility::Blocked("stop_marker"));
        }
        if sends >= settings.max_followups_per_conversation {
            return Ok(Eligibility::Blocked("rate_limited"));
        }
        Ok(Eligibility::Eligible)
    }

    /// Queue an analysis `inactivity_hours` from now.
    pub async fn schedule_analysis(&self, key: &str) -> Result<ScheduleOutcome, ReplyFlowError> {
        let settings = self.settings().await?;
        if !settings.enabled {
            return Ok(ScheduleOutcome::Disabled);
        }
        let now = self.clock.now();
        let db_key = key.to_string();
        if call_blocking(self.db.clone(), move |db| db.has_active_followup(&db_key)).await? {
            return Ok(ScheduleOutcome::AlreadyActive);
        }
        match self.eligibility(key, &settings, now).await? {
            Eligibility::Blocked("stop_marker") => return Ok(ScheduleOutcome::StopMarker),
            Eligibility::Blocked("finalized") => return Ok(ScheduleOutcome::Finalized),
            Eligibility::Blocked(_) => return Ok(ScheduleOutcome::RateLimited),
            Eligibility::Eligible => {}
        }

        let db_key = key.to_string();
        let scheduled_for = ts(now + hours(settings.inactivity_hours));
        let now_ts = ts(now);
        let inserted = call_blocking(self.db.clone(), move |db| {
            db.insert_followup(&db_key, &scheduled_for, &now_ts)
        })
        .await?;
        match inserted {
            Some(id) => {
                debug!(
                    "Followups: scheduled analysis #{id} for {key} in {}h",
                    settings.inactivity_hours
                );
                Ok(ScheduleOutcome::Scheduled(id))
            }
            None => Ok(ScheduleOutcome::AlreadyActive),
        }
    }

    /// Complete every active item for `key`, e.g. because the contact wrote again.
    pub async fn cancel_for(&self, key: &str, reason: &str) -> Result<usize, ReplyFlowError> {
        let key = key.to_string();
        let reason = reason.to_string();
        let now = ts(self.clock.now());
        call_blocking(self.db.clone(), move |db| {
            db.cancel_active_followups(&key, &reason, &now)
        })
        .await
    }

    async fn complete(&self, id: i64, result: Option<String>) -> Result<(), ReplyFlowError> {
        let now = ts(self.clock.now());
        call_blocking(self.db.clone(), move |db| {
            db.complete_followup(id, result.as_deref(), &now).map(|_| ())
        })
        .await
    }

    async fn fail_attempt(
        &self,
        id: i64,
        err: &str,
    ) -> Result<Option<FollowupStatus>, ReplyFlowError> {
        let now = self.clock.now();
        let retry_at = ts(now + ChronoDuration::minutes(self.config.followups.retry_backoff_mins));
        let now = ts(now);
        let err = err.to_string();
        let max_attempts = self.config.followups.max_attempts;
        call_blocking(self.db.clone(), move |db| {
            db.record_followup_failure(id, &err, &retry_at, max_attempts, &now)
        })
        .await
    }

    async fn note_failure(&self, item: &FollowupQueueItem, err: &str, stats: &mut SweepStats) {
        match self.fail_attempt(item.id, err).await {
            Ok(Some(FollowupStatus::Failed)) => {
                error!(
                    "Followups: item #{} for {} failed permanently: {err}",
                    item.id, item.conversation_key
                );
                stats.failed += 1;
            }
            Ok(_) => {
                warn!(
                    "Followups: item #{} for {} will be retried: {err}",
                    item.id, item.conversation_key
                );
                stats.retried += 1;
            }
            Err(e) => error!("Followups: failed to record failure for #{}: {e}", item.id),
        }
    }

    async fn judge(
        &self,
        settings: &FollowupSettings,
        history: &[Turn],
    ) -> Result<AnalysisVerdict, ReplyFlowError> {
        let system = format!(
            "Você decide se vale enviar uma mensagem de follow-up para retomar uma conversa de atendimento que ficou parada.\n\
             Gere follow-up quando: {}\n\
             Não gere follow-up quando: {}\n\
             Responda somente com JSON no formato {{\"decision\": \"generate\" ou \"skip\", \"reason\": \"motivo curto\"}}.",
            settings.generate_criteria.trim(),
            settings.skip_criteria.trim()
        );
        let request = CompletionRequest {
            messages: vec![
                ChatMessage::system(system),
                ChatMessage::user(format!("Conversa:\n{}", transcript(history))),
            ],
            max_tokens: 600,
            reasoning: ReasoningTier::Low,
            profile: self.config.provider_profiles()[0].clone(),
        };
        let raw = self.provider.complete(&request).await?;
        Ok(parse_verdict(&raw))
    }

    async fn compose(&self, history: &[Turn]) -> Result<String, ReplyFlowError> {
        let max_chars = self.config.reply.max_reply_chars;
        let system = format!(
            "{}\n\nEscreva uma mensagem curta de follow-up, com no máximo {max_chars} caracteres, para retomar esta conversa de forma natural e sem pressionar o cliente. Responda apenas com a mensagem.",
            self.config.reply.system_prompt.trim()
        );
        let request = CompletionRequest {
            messages: vec![
                ChatMessage::system(system),
                ChatMessage::user(format!("Conversa:\n{}", transcript(history))),
            ],
            max_tokens: reply_token_budget(max_chars, ReasoningTier::Low),
            reasoning: ReasoningTier::Low,
            profile: self.config.provider_profiles()[0].clone(),
        };
        let text = self.provider.complete(&request).await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(ReplyFlowError::LlmApi(
                "empty follow-up message".to_string(),
            ));
        }
        Ok(text.to_string())
    }

    async fn analyze_item(
        &self,
        item: &FollowupQueueItem,
        settings: &FollowupSettings,
        stats: &mut SweepStats,
    ) -> Result<(), ReplyFlowError> {
        let key = item.conversation_key.as_str();
        let now = self.clock.now();
        if !settings.enabled {
            self.complete(item.id, Some("cancelled: followups_disabled".into()))
                .await?;
            stats.completed += 1;
            return Ok(());
        }
        if let Eligibility::Blocked(why) = self.eligibility(key, settings, now).await? {
            self.complete(item.id, Some(format!("skipped: {why}"))).await?;
            stats.completed += 1;
            return Ok(());
        }

        let turns = self.store.raw_turns(key).await?;
        let active_since_scheduling = turns
            .last()
            .map(|t| ts(t.timestamp) > item.created_at)
            .unwrap_or(false);
        if active_since_scheduling {
            self.complete(item.id, Some("conversation_active".into())).await?;
            stats.completed += 1;
            return Ok(());
        }
        if turns.len() < self.config.followups.min_history_turns {
            self.complete(item.id, Some("skipped: short_history".into()))
                .await?;
            stats.completed += 1;
            return Ok(());
        }
        if turns.last().map(|t| t.role == Role::User).unwrap_or(false) {
            // unanswered contact message; recovery handles those
            self.complete(item.id, Some("skipped: awaiting_reply".into()))
                .await?;
            stats.completed += 1;
            return Ok(());
        }

        let verdict = match self.judge(settings, &turns).await {
            Ok(v) => v,
            Err(e) => {
                self.note_failure(item, &format!("analysis failed: {e}"), stats)
                    .await;
                return Ok(());
            }
        };
        let verdict_json = serde_json::to_string(&verdict)?;
        if !verdict.should_generate() {
            info!(
                "Followups: no follow-up for {key} (#{}): {}",
                item.id,
                preview(&verdict.reason, 120)
            );
            self.complete(item.id, Some(verdict_json)).await?;
            stats.completed += 1;
            return Ok(());
        }

        let message = match self.compose(&turns).await {
            Ok(m) => m,
            Err(e) => {
                self.note_failure(item, &format!("generation failed: {e}"), stats)
                    .await;
                return Ok(());
            }
        };
        let snapshot = transcript(&turns);
        let send_at = ts(now + hours(settings.delay_hours));
        let now_ts = ts(now);
        let id = item.id;
        let stored_message = message.clone();
        let moved = call_blocking(self.db.clone(), move |db| {
            db.mark_followup_scheduled_for_send(
                id,
                &stored_message,
                &snapshot,
                &verdict_json,
                &send_at,
                &now_ts,
            )
        })
        .await?;
        if moved {
            info!(
                "Followups: #{id} for {key} scheduled for send in {}h: {}",
                settings.delay_hours,
                preview(&message, 120)
            );
            stats.scheduled_for_send += 1;
        }
        Ok(())
    }

    /// Judge due `scheduled_for_analysis` items. Skipped if a sweep is running.
    pub async fn run_analysis_sweep(&self) -> Option<SweepStats> {
        let _guard = try_enter(&self.analysis_running)?;
        let mut stats = SweepStats::default();
        let settings = match self.settings().await {
            Ok(s) => s,
            Err(e) => {
                error!("Followups: failed to load settings: {e}");
                return Some(stats);
            }
        };
        let now = ts(self.clock.now());
        let limit = self.config.followups.analysis_batch_size;
        let due = match call_blocking(self.db.clone(), move |db| {
            db.due_followups(FollowupStatus::ScheduledForAnalysis, &now, limit)
        })
        .await
        {
            Ok(items) => items,
            Err(e) => {
                error!("Followups: failed to query due analyses: {e}");
                return Some(stats);
            }
        };

        for item in due {
            stats.examined += 1;
            if let Err(e) = self.analyze_item(&item, &settings, &mut stats).await {
                error!(
                    "Followups: analysis of #{} for {} failed: {e}",
                    item.id, item.conversation_key
                );
            }
        }
        Some(stats)
    }

    async fn send_item(
        &self,
        item: &FollowupQueueItem,
        settings: &FollowupSettings,
        stats: &mut SweepStats,
    ) -> Result<(), ReplyFlowError> {
        let key = item.conversation_key.as_str();
        let now = self.clock.now();
        if let Eligibility::Blocked(why) = self.eligibility(key, settings, now).await? {
            self.complete(item.id, Some(format!("skipped: {why}"))).await?;
            stats.completed += 1;
            return Ok(());
        }
        let Some(message) = item.generated_message.as_deref().filter(|m| !m.trim().is_empty())
        else {
            self.complete(item.id, Some("skipped: no_message".into())).await?;
            stats.completed += 1;
            return Ok(());
        };

        let now_ts = ts(now);
        if let Err(e) = deliver_and_store_text(
            self.transport.as_ref(),
            self.db.clone(),
            key,
            message,
            "followup",
            self.store.cap(),
            &now_ts,
        )
        .await
        {
            self.note_failure(item, &format!("send failed: {e}"), stats)
                .await;
            return Ok(());
        }

        let id = item.id;
        let db_key = key.to_string();
        let sent = message.to_string();
        let metadata = serde_json::json!({ "queue_id": id }).to_string();
        call_blocking(self.db.clone(), move |db| {
            db.insert_history(
                &db_key,
                FollowupType::Automatic,
                Some(&sent),
                Some(&metadata),
                &now_ts,
            )?;
            db.complete_followup(id, None, &now_ts)
        })
        .await?;
        info!("Followups: sent #{id} to {key}: {}", preview(message, 120));
        stats.sent += 1;
        Ok(())
    }

    /// Deliver due `scheduled_for_send` items, spaced apart. Skipped if a sweep
    /// is running.
    pub async fn run_send_sweep(&self) -> Option<SweepStats> {
        let _guard = try_enter(&self.send_running)?;
        let mut stats = SweepStats::default();
        let settings = match self.settings().await {
            Ok(s) => s,
            Err(e) => {
                error!("Followups: failed to load settings: {e}");
                return Some(stats);
            }
        };
        let now = ts(self.clock.now());
        let limit = self.config.followups.send_batch_size;
        let due = match call_blocking(self.db.clone(), move |db| {
            db.due_followups(FollowupStatus::ScheduledForSend, &now, limit)
        })
        .await
        {
            Ok(items) => items,
            Err(e) => {
                error!("Followups: failed to query due sends: {e}");
                return Some(stats);
            }
        };

        let spacing = Duration::from_secs(self.config.followups.send_spacing_secs);
        for (i, item) in due.iter().enumerate() {
            if i > 0 && !spacing.is_zero() {
                tokio::time::sleep(spacing).await;
            }
            stats.examined += 1;
            if let Err(e) = self.send_item(item, &settings, &mut stats).await {
                error!(
                    "Followups: send of #{} to {} failed: {e}",
                    item.id, item.conversation_key
                );
            }
        }
        Some(stats)
    }
}

pub fn spawn_followup_loops(scheduler: Arc<FollowupScheduler>, config: &Config) {
    let analysis_every = Duration::from_secs(config.followups.analysis_interval_secs.max(1));
    let send_every = Duration::from_secs(config.followups.send_interval_secs.max(1));

    let analysis = scheduler.clone();
    tokio::spawn(async move {
        info!("Followups: analysis loop started (every {analysis_every:?})");
        let mut ticker = tokio::time::interval(analysis_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match analysis.run_analysis_sweep().await {
                Some(stats) if stats.examined > 0 => info!("Followups: analysis sweep {stats:?}"),
                Some(_) => {}
                None => debug!("Followups: analysis sweep still running, tick skipped"),
            }
        }
    });

    tokio::spawn(async move {
        info!("Followups: send loop started (every {send_every:?})");
        let mut ticker = tokio::time::interval(send_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match scheduler.run_send_sweep().await {
                Some(stats) if stats.examined > 0 => info!("Followups: send sweep {stats:?}"),
                Some(_) => {}
                None => debug!("Followups: send sweep still running, tick skipped"),
            }
        }
    });
}
