use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Duration as ChronoDuration;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::batch_queue::{BatchHandler, BatchQueue};
use crate::channels::whatsapp::{register_whatsapp_webhook, WebhookState, WhatsAppTransport};
use crate::clock::{ts, Clock, SystemClock};
use crate::config::Config;
use crate::conversation::ConversationStore;
use crate::db::{call_blocking, Database, FollowupType};
use crate::delivery::Deliverer;
use crate::error::ReplyFlowError;
use crate::finalization::{is_pure_closing, FinalizationClassifier, ModelArbitratedClassifier};
use crate::followup::{spawn_followup_loops, FollowupScheduler};
use crate::llm::{CompletionProvider, OpenAiProvider};
use crate::loop_guard::LoopGuard;
use crate::pipeline::{BatchOrigin, ReplyEngine, ResponsePipeline};
use crate::recovery::{spawn_pending_sweep_loop, RecoveryScanner};
use replyflow_channels::inbound::{inbound_channel, InboundMessage, InboundReceiver};
use replyflow_core::llm_types::Role;
use replyflow_core::text::normalize_for_match;

/// Messages that opt the contact out of proactive messages.
const OPT_OUT_KEYWORDS: &[&str] = &["parar", "pare", "sair", "stop", "descadastrar", "cancelar mensagens"];

pub fn is_opt_out(text: &str) -> bool {
    let bare: String = normalize_for_match(text)
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let bare = bare.split_whitespace().collect::<Vec<_>>().join(" ");
    OPT_OUT_KEYWORDS.contains(&bare.as_str())
}

fn turn_text(message: &InboundMessage) -> String {
    message
        .payload
        .inline_text()
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| format!("[{}]", message.payload.kind()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundDisposition {
    Duplicate,
    ManualReply,
    Suppressed,
    Enqueued,
}

/// Single consumer of the inbound channel: dedupe, operator echoes, opt-outs,
/// loop guard, then debounce.
pub struct InboundProcessor {
    db: Arc<Database>,
    store: Arc<ConversationStore>,
    finalization: Arc<FinalizationClassifier>,
    followups: Arc<FollowupScheduler>,
    loop_guard: LoopGuard,
    batches: BatchQueue,
}

impl InboundProcessor {
    pub fn new(
        db: Arc<Database>,
        store: Arc<ConversationStore>,
        finalization: Arc<FinalizationClassifier>,
        followups: Arc<FollowupScheduler>,
        loop_guard: LoopGuard,
        batches: BatchQueue,
    ) -> Self {
        Self {
            db,
            store,
            finalization,
            followups,
            loop_guard,
            batches,
        }
    }

    pub async fn handle(&self, message: InboundMessage) -> Result<InboundDisposition, ReplyFlowError> {
        let key = message.key.clone();
        let received_at = ts(message.timestamp);

        let fresh = {
            let id = message.message_id.clone();
            let key = key.clone();
            let at = received_at.clone();
            call_blocking(self.db.clone(), move |db| db.track_inbound(&id, &key, &at)).await?
        };
        if !fresh {
            debug!("Inbound: duplicate {} for {key}", message.message_id);
            return Ok(InboundDisposition::Duplicate);
        }

        if message.from_me {
            let db_key = key.clone();
            let at = received_at.clone();
            call_blocking(self.db.clone(), move |db| db.mark_manual_replied(&db_key, &at)).await?;
            self.store
                .add_message(&key, Role::Assistant, &turn_text(&message), Some("manual"))
                .await?;
            let cancelled = self.followups.cancel_for(&key, "cancelled: manual_reply").await?;
            info!("Inbound: manual reply to {key} (cancelled {cancelled} follow-ups)");
            return Ok(InboundDisposition::ManualReply);
        }

        let text = message.payload.inline_text().unwrap_or("").to_string();
        if is_opt_out(&text) {
            let db_key = key.clone();
            let body = text.clone();
            let at = received_at.clone();
            call_blocking(self.db.clone(), move |db| {
                db.insert_history(&db_key, FollowupType::StopMarker, Some(&body), None, &at)
            })
            .await?;
            self.followups.cancel_for(&key, "cancelled: stop_marker").await?;
            info!("Inbound: {key} opted out of follow-ups");
        }

        if self.loop_guard.should_suppress(&key, &message.payload) {
            warn!("Inbound: repeated message from {key} suppressed");
            return Ok(InboundDisposition::Suppressed);
        }

        self.finalization.observe_inbound(&key, &text).await?;
        self.followups.cancel_for(&key, "cancelled: user_activity").await?;
        self.store.touch(&key, message.contact_name.as_deref()).await?;
        self.batches.enqueue(message);
        Ok(InboundDisposition::Enqueued)
    }
}

pub async fn run_inbound_loop(processor: Arc<InboundProcessor>, mut rx: InboundReceiver) {
    info!("Inbound: consumer started");
    while let Some(message) = rx.recv().await {
        let key = message.key.clone();
        if let Err(e) = processor.handle(message).await {
            error!("Inbound: failed to handle message from {key}: {e}");
        }
    }
    info!("Inbound: channel closed, consumer stopped");
}

/// Flushed batches: skip finalized conversations, reply, then queue a
/// follow-up analysis.
pub struct ReplyBatchHandler {
    config: Arc<Config>,
    store: Arc<ConversationStore>,
    engine: Arc<dyn ReplyEngine>,
    finalization: Arc<FinalizationClassifier>,
    followups: Arc<FollowupScheduler>,
}

impl ReplyBatchHandler {
    pub fn new(
        config: Arc<Config>,
        store: Arc<ConversationStore>,
        engine: Arc<dyn ReplyEngine>,
        finalization: Arc<FinalizationClassifier>,
        followups: Arc<FollowupScheduler>,
    ) -> Self {
        Self {
            config,
            store,
            engine,
            finalization,
            followups,
        }
    }

    /// Only closing-only batches can be held back by a stored marker; anything
    /// carrying new content is answered.
    async fn is_finalized(&self, key: &str, batch: &[InboundMessage]) -> bool {
        if !self.config.finalization.enabled {
            return false;
        }
        let Some(text) = batch.last().and_then(|m| m.payload.inline_text()) else {
            return false;
        };
        let history = match self
            .store
            .recent_turns(key, self.config.finalization.context_turns)
            .await
        {
            Ok(h) => h,
            Err(e) => {
                warn!("Runtime: no history for classifying {key}: {e}");
                Vec::new()
            }
        };
        if self.finalization.classify(key, text, &history).await.should_finalize {
            return true;
        }
        if !is_pure_closing(text) {
            return false;
        }
        self.finalization.is_finalized(key).await.unwrap_or_else(|e| {
            warn!("Runtime: finalized check failed for {key}: {e}");
            false
        })
    }

    async fn process(&self, key: &str, batch: &[InboundMessage]) -> Result<(), ReplyFlowError> {
        if self.config.finalization.suppress_replies && self.is_finalized(key, batch).await {
            info!("Runtime: {key} is finalized, reply suppressed");
            return Ok(());
        }
        let Some(outcome) = self.engine.process(key, batch, BatchOrigin::Live).await? else {
            return Ok(());
        };
        if outcome.delivery.delivered_anything() {
            let scheduled = self.followups.schedule_analysis(key).await?;
            debug!("Runtime: follow-up analysis for {key}: {scheduled:?}");
        }
        Ok(())
    }
}

#[async_trait]
impl BatchHandler for ReplyBatchHandler {
    async fn handle_batch(&self, key: String, batch: Vec<InboundMessage>) {
        if let Err(e) = self.process(&key, &batch).await {
            error!("Runtime: batch for {key} failed: {e}");
        }
    }
}

pub fn spawn_compaction_loop(
    store: Arc<ConversationStore>,
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    config: &Config,
) {
    let every = Duration::from_secs(config.maintenance.compaction_interval_mins.max(1) * 60);
    let stale_after = ChronoDuration::days(config.maintenance.stale_conversation_days);
    let tracking_retention = ChronoDuration::days(config.maintenance.tracking_retention_days);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match store.compact(stale_after).await {
                Ok(0) => {}
                Ok(n) => info!("Maintenance: removed {n} stale conversations"),
                Err(e) => error!("Maintenance: conversation compaction failed: {e}"),
            }
            let before = ts(clock.now() - tracking_retention);
            match call_blocking(db.clone(), move |d| d.delete_tracking_before(&before)).await {
                Ok(0) => {}
                Ok(n) => info!("Maintenance: removed {n} tracking records"),
                Err(e) => error!("Maintenance: tracking cleanup failed: {e}"),
            }
        }
    });
}

pub struct AppState {
    pub config: Arc<Config>,
    pub db: Arc<Database>,
    pub followups: Arc<FollowupScheduler>,
    pub recovery: Arc<RecoveryScanner>,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let counts = call_blocking(state.db.clone(), |db| db.followup_status_counts())
        .await
        .unwrap_or_default();
    let followups: serde_json::Map<String, serde_json::Value> = counts
        .into_iter()
        .map(|(status, n)| (status, serde_json::Value::from(n)))
        .collect();
    let followups_enabled = match state.followups.settings().await {
        Ok(s) => s.enabled,
        Err(e) => {
            warn!("Health: follow-up settings unavailable: {e}");
            false
        }
    };
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "followups_enabled": followups_enabled,
        "followups": followups,
        "recovery_running": state.recovery.is_running(),
    }))
}

pub fn build_router(state: Arc<AppState>, webhook: WebhookState) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .with_state(state.clone());
    register_whatsapp_webhook(router, &state.config.whatsapp.webhook_path, webhook)
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    if !config.whatsapp.enabled {
        return Err(anyhow!(
            "No channel is enabled. Set whatsapp.enabled=true with Cloud API credentials."
        ));
    }
    let config = Arc::new(config);
    let runtime_dir = config.runtime_data_dir();
    let db = Arc::new(Database::new(&runtime_dir.to_string_lossy())?);
    info!("Database initialized at {}", runtime_dir.display());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let provider: Arc<dyn CompletionProvider> = Arc::new(OpenAiProvider::new(&config));
    let transport = Arc::new(WhatsAppTransport::new(&config.whatsapp));
    let store = Arc::new(ConversationStore::new(
        db.clone(),
        clock.clone(),
        ChronoDuration::minutes(config.reply.memory_ttl_mins),
        config.reply.history_cap,
    ));
    let arbiter = config
        .provider_profiles()
        .into_iter()
        .next()
        .map(|profile| ModelArbitratedClassifier::new(provider.clone(), profile));
    let finalization = Arc::new(FinalizationClassifier::new(
        config.finalization.clone(),
        db.clone(),
        clock.clone(),
        arbiter,
    ));
    let engine: Arc<dyn ReplyEngine> = Arc::new(ResponsePipeline::new(
        config.clone(),
        db.clone(),
        store.clone(),
        provider.clone(),
        Deliverer::new(transport.clone(), config.humanize.clone()),
        clock.clone(),
    ));
    let followups = Arc::new(FollowupScheduler::new(
        config.clone(),
        db.clone(),
        store.clone(),
        provider.clone(),
        transport.clone(),
        finalization.clone(),
        clock.clone(),
    ));
    let seeded = followups.settings().await?;
    info!(
        "Follow-ups {} (inactivity {}h, delay {}h, max {} per {}h)",
        if seeded.enabled { "enabled" } else { "disabled" },
        seeded.inactivity_hours,
        seeded.delay_hours,
        seeded.max_followups_per_conversation,
        seeded.followup_interval_hours
    );
    let handler = Arc::new(ReplyBatchHandler::new(
        config.clone(),
        store.clone(),
        engine.clone(),
        finalization.clone(),
        followups.clone(),
    ));
    let batches = BatchQueue::new(Duration::from_secs(config.reply.debounce_secs), handler);
    // replays wait on the same per-key lock as live batches
    let recovery = Arc::new(
        RecoveryScanner::new(
            config.clone(),
            db.clone(),
            store.clone(),
            engine,
            finalization.clone(),
            provider.clone(),
            clock.clone(),
        )
        .with_batch_queue(batches.clone()),
    );
    let loop_guard = LoopGuard::new(
        clock.clone(),
        config.loop_guard.enabled,
        ChronoDuration::seconds(config.loop_guard.window_secs),
        config.loop_guard.threshold,
    );
    let processor = Arc::new(InboundProcessor::new(
        db.clone(),
        store.clone(),
        finalization,
        followups.clone(),
        loop_guard,
        batches,
    ));

    let (inbound_tx, inbound_rx) = inbound_channel(config.inbound_channel_capacity);
    tokio::spawn(run_inbound_loop(processor, inbound_rx));
    spawn_followup_loops(followups.clone(), &config);
    spawn_pending_sweep_loop(recovery.clone(), &config);
    spawn_compaction_loop(store, db.clone(), clock, &config);

    let webhook = WebhookState::new(&config.whatsapp, transport, inbound_tx);
    let state = Arc::new(AppState {
        config: config.clone(),
        db,
        followups,
        recovery: recovery.clone(),
    });
    let router = build_router(state, webhook);

    let addr = format!("{}:{}", config.web_host, config.web_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow!("Failed to bind web server at {addr}: {e}"))?;
    info!(
        "Webhook listening on http://{addr}{}",
        config.whatsapp.webhook_path
    );
    // serving webhooks again is the reconnect point
    recovery.run_after_reconnect();

    tokio::select! {
        served = axum::serve(listener, router) => {
            served.map_err(|e| anyhow!("Web server error: {e}"))?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|e| anyhow!("Failed to listen for Ctrl-C: {e}"))?;
            info!("Shutting down");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::tests::test_config;
    use crate::config::FinalizationConfig;
    use crate::db::FollowupStatus;
    use crate::delivery::DeliveryReport;
    use crate::followup::ScheduleOutcome;
    use crate::pipeline::{PipelineOutcome, ReplySource};
    use crate::test_support::{
        cleanup, inbound_text, start_time, test_db, MockProvider, RecordingTransport,
    };
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingHandler {
        batches: Mutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl BatchHandler for CollectingHandler {
        async fn handle_batch(&self, key: String, batch: Vec<InboundMessage>) {
            let texts = batch.iter().map(turn_text).collect();
            self.batches.lock().unwrap().push((key, texts));
        }
    }

    #[derive(Default)]
    struct CountingEngine {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ReplyEngine for CountingEngine {
        async fn process(
            &self,
            key: &str,
            _batch: &[InboundMessage],
            _origin: BatchOrigin,
        ) -> Result<Option<PipelineOutcome>, ReplyFlowError> {
            self.calls.lock().unwrap().push(key.to_string());
            Ok(Some(PipelineOutcome {
                reply: "Combinado!".into(),
                source: ReplySource::Model { attempts: 1 },
                delivery: DeliveryReport {
                    parts_sent: 1,
                    ..DeliveryReport::default()
                },
            }))
        }
    }

    struct Harness {
        config: Arc<Config>,
        db: Arc<Database>,
        store: Arc<ConversationStore>,
        finalization: Arc<FinalizationClassifier>,
        followups: Arc<FollowupScheduler>,
        collected: Arc<CollectingHandler>,
        processor: InboundProcessor,
        dir: PathBuf,
    }

    fn harness() -> Harness {
        let mut config = test_config();
        config.followups.enabled = true;
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
        let finalization = Arc::new(FinalizationClassifier::new(
            FinalizationConfig {
                model_arbitration: false,
                ..FinalizationConfig::default()
            },
            db.clone(),
            clock.clone(),
            None,
        ));
        let followups = Arc::new(FollowupScheduler::new(
            config.clone(),
            db.clone(),
            store.clone(),
            Arc::new(MockProvider::new()),
            Arc::new(RecordingTransport::new()),
            finalization.clone(),
            clock.clone(),
        ));
        let collected = Arc::new(CollectingHandler::default());
        let batches = BatchQueue::new(Duration::from_secs(10), collected.clone());
        let loop_guard = LoopGuard::new(clock.clone(), true, ChronoDuration::seconds(60), 3);
        let processor = InboundProcessor::new(
            db.clone(),
            store.clone(),
            finalization.clone(),
            followups.clone(),
            loop_guard,
            batches,
        );
        Harness {
            config,
            db,
            store,
            finalization,
            followups,
            collected,
            processor,
            dir,
        }
    }

    #[test]
    fn test_opt_out_keywords() {
        assert!(is_opt_out("PARAR"));
        assert!(is_opt_out("  sair. "));
        assert!(is_opt_out("Cancelar mensagens!"));
        assert!(!is_opt_out("não vou parar de comprar"));
        assert!(!is_opt_out("stop motion é legal"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_are_dropped_and_batches_coalesce() {
        let h = harness();
        let at = start_time();
        let first = inbound_text("A", "wamid.1", "Oi", at);
        assert_eq!(
            h.processor.handle(first.clone()).await.unwrap(),
            InboundDisposition::Enqueued
        );
        assert_eq!(
            h.processor.handle(first).await.unwrap(),
            InboundDisposition::Duplicate
        );
        h.processor
            .handle(inbound_text("A", "wamid.2", "quero um orçamento", at))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(15)).await;
        let batches = h.collected.batches.lock().unwrap().clone();
        assert_eq!(
            batches,
            vec![("A".to_string(), vec!["Oi".to_string(), "quero um orçamento".to_string()])]
        );
        cleanup(&h.dir);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reply_is_stored_and_cancels_followups() {
        let h = harness();
        h.store
            .add_message("M", Role::User, "vocês abrem sábado?", None)
            .await
            .unwrap();
        assert!(matches!(
            h.followups.schedule_analysis("M").await.unwrap(),
            ScheduleOutcome::Scheduled(_)
        ));
        let mut echo = inbound_text("M", "wamid.e1", "Abrimos sim, das 9h às 13h", start_time());
        echo.from_me = true;
        assert_eq!(
            h.processor.handle(echo).await.unwrap(),
            InboundDisposition::ManualReply
        );
        let turns = h.store.raw_turns("M").await.unwrap();
        let last = turns.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.message_type.as_deref(), Some("manual"));
        assert!(!h.db.has_active_followup("M").unwrap());
        let tracking = h.db.get_tracking("wamid.e1").unwrap().unwrap();
        assert!(tracking.manual_replied);
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(h.collected.batches.lock().unwrap().is_empty());
        cleanup(&h.dir);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opt_out_records_stop_marker_and_still_replies() {
        let h = harness();
        h.processor
            .handle(inbound_text("S", "wamid.s1", "Parar", start_time()))
            .await
            .unwrap();
        assert!(h.db.has_history("S", FollowupType::StopMarker, None).unwrap());
        assert_eq!(
            h.followups.schedule_analysis("S").await.unwrap(),
            ScheduleOutcome::StopMarker
        );
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(h.collected.batches.lock().unwrap().len(), 1);
        cleanup(&h.dir);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_messages_are_suppressed() {
        let h = harness();
        let mut dispositions = Vec::new();
        for i in 0..5 {
            let msg = inbound_text("L", &format!("wamid.l{i}"), "Olá", start_time());
            dispositions.push(h.processor.handle(msg).await.unwrap());
        }
        let suppressed = dispositions
            .iter()
            .filter(|d| **d == InboundDisposition::Suppressed)
            .count();
        assert_eq!(suppressed, 2);
        cleanup(&h.dir);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_activity_cancels_followup_and_clears_finalized() {
        let h = harness();
        h.store
            .add_message("U", Role::User, "qual o prazo?", None)
            .await
            .unwrap();
        let ScheduleOutcome::Scheduled(id) = h.followups.schedule_analysis("U").await.unwrap()
        else {
            panic!("expected scheduled");
        };
        h.db.set_finalized("U", "closing loop", &ts(start_time())).unwrap();

        h.processor
            .handle(inbound_text("U", "wamid.u1", "na verdade quero mais 10 peças", start_time()))
            .await
            .unwrap();
        let item = h.db.get_followup(id).unwrap().unwrap();
        assert_eq!(item.status, FollowupStatus::Completed);
        assert_eq!(item.analysis_result.as_deref(), Some("cancelled: user_activity"));
        assert!(!h.finalization.is_finalized("U").await.unwrap());
        cleanup(&h.dir);
    }

    #[tokio::test]
    async fn test_batch_handler_suppresses_finalized_and_schedules_followup() {
        let h = harness();
        let engine = Arc::new(CountingEngine::default());
        let handler = ReplyBatchHandler::new(
            h.config.clone(),
            h.store.clone(),
            engine.clone(),
            h.finalization.clone(),
            h.followups.clone(),
        );

        h.store
            .add_message("B", Role::User, "quanto custa o frete?", None)
            .await
            .unwrap();
        handler
            .handle_batch(
                "B".into(),
                vec![inbound_text("B", "wamid.b1", "e para Campinas?", start_time())],
            )
            .await;
        assert_eq!(engine.calls.lock().unwrap().len(), 1);
        assert!(h.db.has_active_followup("B").unwrap());

        h.db.set_finalized("F", "closing loop", &ts(start_time())).unwrap();
        handler
            .handle_batch(
                "F".into(),
                vec![inbound_text("F", "wamid.f1", "obrigado, tchau", start_time())],
            )
            .await;
        assert_eq!(engine.calls.lock().unwrap().len(), 1);
        cleanup(&h.dir);
    }

    #[tokio::test]
    async fn test_new_request_after_finalization_gets_reply() {
        let h = harness();
        let engine = Arc::new(CountingEngine::default());
        let handler = ReplyBatchHandler::new(
            h.config.clone(),
            h.store.clone(),
            engine.clone(),
            h.finalization.clone(),
            h.followups.clone(),
        );
        let request = "Ok, agora quero fazer um pedido de 20 camisetas";

        h.db.set_finalized("F", "closing loop", &ts(start_time())).unwrap();
        assert!(h.finalization.observe_inbound("F", request).await.unwrap());
        handler
            .handle_batch("F".into(), vec![inbound_text("F", "wamid.f1", request, start_time())])
            .await;
        assert_eq!(engine.calls.lock().unwrap().clone(), vec!["F".to_string()]);

        // a stored marker alone never holds back a batch with new content
        h.db.set_finalized("G", "closing loop", &ts(start_time())).unwrap();
        handler
            .handle_batch(
                "G".into(),
                vec![inbound_text("G", "wamid.g1", "beleza, e o prazo de entrega?", start_time())],
            )
            .await;
        assert_eq!(engine.calls.lock().unwrap().len(), 2);
        cleanup(&h.dir);
    }

    #[tokio::test]
    async fn test_health_reports_followup_counts() {
        use axum::body::Body;
        use axum::http::{Request, StatusCode};
        use replyflow_channels::inbound::inbound_channel;
        use tower::ServiceExt;

        let h = harness();
        h.store
            .add_message("H", Role::User, "tem pronta entrega?", None)
            .await
            .unwrap();
        h.followups.schedule_analysis("H").await.unwrap();

        let provider: Arc<dyn CompletionProvider> = Arc::new(MockProvider::new());
        let recovery = Arc::new(RecoveryScanner::new(
            h.config.clone(),
            h.db.clone(),
            h.store.clone(),
            Arc::new(CountingEngine::default()),
            h.finalization.clone(),
            provider,
            Arc::new(ManualClock::new(start_time())),
        ));
        let state = Arc::new(AppState {
            config: h.config.clone(),
            db: h.db.clone(),
            followups: h.followups.clone(),
            recovery,
        });
        let (tx, _rx) = inbound_channel(1);
        let webhook = WebhookState::new(
            &h.config.whatsapp,
            Arc::new(WhatsAppTransport::new(&h.config.whatsapp)),
            tx,
        );
        let app = build_router(state, webhook);
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 4096).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["followups"]["scheduled_for_analysis"], 1);
        assert_eq!(json["followups_enabled"], true);
        assert_eq!(json["recovery_running"], false);
        cleanup(&h.dir);
    }
}
