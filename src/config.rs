use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::ReplyFlowError;
use replyflow_core::llm_types::{ProviderProfile, ReasoningTier};
use replyflow_storage::db::FollowupSettings;

fn default_data_dir() -> String {
    "./replyflow.data".into()
}
fn default_log_retention_days() -> i64 {
    14
}
fn default_web_host() -> String {
    "127.0.0.1".into()
}
fn default_web_port() -> u16 {
    8088
}
fn default_inbound_channel_capacity() -> usize {
    256
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".into()
}
fn default_request_timeout_secs() -> u64 {
    60
}
fn default_rate_limit_retries() -> u32 {
    3
}
fn default_transcription_model() -> String {
    "whisper-1".into()
}
fn default_speech_model() -> String {
    "tts-1".into()
}
fn default_tts_voice() -> String {
    "alloy".into()
}

fn default_system_prompt() -> String {
    "Você é um atendente cordial e objetivo. Responda em português do Brasil, \
     de forma natural e breve, como em uma conversa de WhatsApp."
        .into()
}
fn default_max_reply_chars() -> usize {
    500
}
fn default_reasoning_tier() -> ReasoningTier {
    ReasoningTier::Low
}
fn default_history_turns() -> usize {
    10
}
fn default_debounce_secs() -> u64 {
    10
}
fn default_memory_ttl_mins() -> i64 {
    60
}
fn default_history_cap() -> usize {
    50
}

fn default_typing_ms_per_char() -> u64 {
    40
}
fn default_min_typing_delay_ms() -> u64 {
    800
}
fn default_max_typing_delay_ms() -> u64 {
    6000
}
fn default_pause_between_parts_ms() -> u64 {
    1200
}
fn default_max_parts() -> usize {
    4
}
fn default_min_part_chars() -> usize {
    40
}

fn default_loop_window_secs() -> i64 {
    60
}
fn default_loop_threshold() -> u32 {
    3
}

fn default_cache_ttl_secs() -> i64 {
    300
}
fn default_suppress_hours() -> i64 {
    24
}
fn default_context_turns() -> usize {
    6
}
fn default_min_context_hits() -> usize {
    3
}
fn default_loop_min_pairs() -> usize {
    2
}
fn default_ambiguous_max_chars() -> usize {
    40
}

fn default_generate_criteria() -> String {
    "O cliente demonstrou interesse (pediu preço, orçamento, prazo ou informações) \
     e a conversa parou sem uma conclusão."
        .into()
}
fn default_skip_criteria() -> String {
    "O cliente recusou, já foi atendido, pediu para não ser contatado \
     ou a conversa terminou naturalmente."
        .into()
}
fn default_inactivity_hours() -> f64 {
    24.0
}
fn default_delay_hours() -> f64 {
    2.0
}
fn default_max_followups_per_conversation() -> i64 {
    2
}
fn default_followup_interval_hours() -> f64 {
    168.0
}
fn default_analysis_interval_secs() -> u64 {
    300
}
fn default_send_interval_secs() -> u64 {
    60
}
fn default_analysis_batch_size() -> usize {
    20
}
fn default_send_batch_size() -> usize {
    5
}
fn default_send_spacing_secs() -> u64 {
    10
}
fn default_max_attempts() -> i64 {
    3
}
fn default_retry_backoff_mins() -> i64 {
    30
}
fn default_min_history_turns() -> usize {
    2
}

fn default_settle_delay_secs() -> u64 {
    15
}
fn default_scan_window_hours() -> i64 {
    24
}
fn default_min_age_mins() -> i64 {
    5
}
fn default_max_age_hours() -> i64 {
    24
}
fn default_max_per_run() -> usize {
    10
}
fn default_recovery_batch_size() -> usize {
    3
}
fn default_batch_delay_secs() -> u64 {
    30
}
fn default_item_delay_secs() -> u64 {
    5
}
fn default_recent_send_hours() -> i64 {
    24
}
fn default_pending_after_mins() -> i64 {
    10
}
fn default_pending_sweep_interval_secs() -> u64 {
    300
}
fn default_high_priority_threshold() -> f64 {
    30.0
}

fn default_compaction_interval_mins() -> u64 {
    60
}
fn default_stale_conversation_days() -> i64 {
    30
}
fn default_tracking_retention_days() -> i64 {
    7
}

fn default_graph_base_url() -> String {
    "https://graph.facebook.com".into()
}
fn default_graph_api_version() -> String {
    "v21.0".into()
}
fn default_webhook_path() -> String {
    "/whatsapp/webhook".into()
}

fn default_true() -> bool {
    true
}

fn is_local_web_host(host: &str) -> bool {
    let h = host.trim().to_ascii_lowercase();
    h == "127.0.0.1" || h == "localhost" || h == "::1"
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Tried in order after the primary model on provider faults.
    #[serde(default)]
    pub fallback_profiles: Vec<ProviderProfile>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_rate_limit_retries")]
    pub rate_limit_retries: u32,
    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,
    #[serde(default = "default_speech_model")]
    pub speech_model: String,
    #[serde(default = "default_tts_voice")]
    pub tts_voice: String,
    /// Falls back to `model` when unset.
    #[serde(default)]
    pub vision_model: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key: String::new(),
            model: default_llm_model(),
            temperature: None,
            fallback_profiles: Vec::new(),
            request_timeout_secs: default_request_timeout_secs(),
            rate_limit_retries: default_rate_limit_retries(),
            transcription_model: default_transcription_model(),
            speech_model: default_speech_model(),
            tts_voice: default_tts_voice(),
            vision_model: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplyConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_max_reply_chars")]
    pub max_reply_chars: usize,
    #[serde(default = "default_true")]
    pub use_contact_name: bool,
    #[serde(default = "default_reasoning_tier")]
    pub reasoning_tier: ReasoningTier,
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
    #[serde(default = "default_memory_ttl_mins")]
    pub memory_ttl_mins: i64,
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
    #[serde(default)]
    pub audio_replies_enabled: bool,
    #[serde(default)]
    pub emoji_enabled: bool,
    #[serde(default = "default_true")]
    pub contact_cards_enabled: bool,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            max_reply_chars: default_max_reply_chars(),
            use_contact_name: true,
            reasoning_tier: default_reasoning_tier(),
            history_turns: default_history_turns(),
            debounce_secs: default_debounce_secs(),
            memory_ttl_mins: default_memory_ttl_mins(),
            history_cap: default_history_cap(),
            audio_replies_enabled: false,
            emoji_enabled: false,
            contact_cards_enabled: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HumanizeConfig {
    #[serde(default = "default_typing_ms_per_char")]
    pub typing_ms_per_char: u64,
    #[serde(default = "default_min_typing_delay_ms")]
    pub min_typing_delay_ms: u64,
    #[serde(default = "default_max_typing_delay_ms")]
    pub max_typing_delay_ms: u64,
    #[serde(default = "default_pause_between_parts_ms")]
    pub pause_between_parts_ms: u64,
    #[serde(default = "default_max_parts")]
    pub max_parts: usize,
    #[serde(default = "default_min_part_chars")]
    pub min_part_chars: usize,
}

impl Default for HumanizeConfig {
    fn default() -> Self {
        Self {
            typing_ms_per_char: default_typing_ms_per_char(),
            min_typing_delay_ms: default_min_typing_delay_ms(),
            max_typing_delay_ms: default_max_typing_delay_ms(),
            pause_between_parts_ms: default_pause_between_parts_ms(),
            max_parts: default_max_parts(),
            min_part_chars: default_min_part_chars(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoopGuardConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_loop_window_secs")]
    pub window_secs: i64,
    /// Suppress once the rolling count exceeds this value.
    #[serde(default = "default_loop_threshold")]
    pub threshold: u32,
}

impl Default for LoopGuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: default_loop_window_secs(),
            threshold: default_loop_threshold(),
        }
    }
}

/// Finalization heuristics. The thresholds are tuned empirically and kept
/// overridable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FinalizationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Skip generating a reply to a finalized conversation.
    #[serde(default = "default_true")]
    pub suppress_replies: bool,
    #[serde(default = "default_true")]
    pub model_arbitration: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: i64,
    #[serde(default = "default_suppress_hours")]
    pub suppress_hours: i64,
    #[serde(default = "default_context_turns")]
    pub context_turns: usize,
    #[serde(default = "default_min_context_hits")]
    pub min_context_hits: usize,
    #[serde(default = "default_loop_min_pairs")]
    pub loop_min_pairs: usize,
    #[serde(default = "default_ambiguous_max_chars")]
    pub ambiguous_max_chars: usize,
}

impl Default for FinalizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            suppress_replies: true,
            model_arbitration: true,
            cache_ttl_secs: default_cache_ttl_secs(),
            suppress_hours: default_suppress_hours(),
            context_turns: default_context_turns(),
            min_context_hits: default_min_context_hits(),
            loop_min_pairs: default_loop_min_pairs(),
            ambiguous_max_chars: default_ambiguous_max_chars(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FollowupsConfig {
    /// Seed for the persisted settings row; later edits go through the CLI.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_generate_criteria")]
    pub generate_criteria: String,
    #[serde(default = "default_skip_criteria")]
    pub skip_criteria: String,
    #[serde(default = "default_inactivity_hours")]
    pub inactivity_hours: f64,
    #[serde(default = "default_delay_hours")]
    pub delay_hours: f64,
    #[serde(default = "default_max_followups_per_conversation")]
    pub max_followups_per_conversation: i64,
    #[serde(default = "default_followup_interval_hours")]
    pub followup_interval_hours: f64,
    #[serde(default = "default_analysis_interval_secs")]
    pub analysis_interval_secs: u64,
    #[serde(default = "default_send_interval_secs")]
    pub send_interval_secs: u64,
    #[serde(default = "default_analysis_batch_size")]
    pub analysis_batch_size: usize,
    #[serde(default = "default_send_batch_size")]
    pub send_batch_size: usize,
    #[serde(default = "default_send_spacing_secs")]
    pub send_spacing_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    #[serde(default = "default_retry_backoff_mins")]
    pub retry_backoff_mins: i64,
    #[serde(default = "default_min_history_turns")]
    pub min_history_turns: usize,
}

impl Default for FollowupsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            generate_criteria: default_generate_criteria(),
            skip_criteria: default_skip_criteria(),
            inactivity_hours: default_inactivity_hours(),
            delay_hours: default_delay_hours(),
            max_followups_per_conversation: default_max_followups_per_conversation(),
            followup_interval_hours: default_followup_interval_hours(),
            analysis_interval_secs: default_analysis_interval_secs(),
            send_interval_secs: default_send_interval_secs(),
            analysis_batch_size: default_analysis_batch_size(),
            send_batch_size: default_send_batch_size(),
            send_spacing_secs: default_send_spacing_secs(),
            max_attempts: default_max_attempts(),
            retry_backoff_mins: default_retry_backoff_mins(),
            min_history_turns: default_min_history_turns(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_true")]
    pub smart_recovery_enabled: bool,
    #[serde(default = "default_settle_delay_secs")]
    pub settle_delay_secs: u64,
    #[serde(default = "default_scan_window_hours")]
    pub scan_window_hours: i64,
    #[serde(default = "default_min_age_mins")]
    pub min_age_mins: i64,
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: i64,
    #[serde(default = "default_max_per_run")]
    pub max_per_run: usize,
    #[serde(default = "default_recovery_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_delay_secs")]
    pub batch_delay_secs: u64,
    #[serde(default = "default_item_delay_secs")]
    pub item_delay_secs: u64,
    /// A send within this window excludes the key from recovery.
    #[serde(default = "default_recent_send_hours")]
    pub recent_send_hours: i64,
    #[serde(default = "default_true")]
    pub model_check: bool,
    #[serde(default)]
    pub pending_sweep_enabled: bool,
    #[serde(default = "default_pending_after_mins")]
    pub pending_after_mins: i64,
    #[serde(default = "default_pending_sweep_interval_secs")]
    pub pending_sweep_interval_secs: u64,
    /// Scores at or above this are logged as high priority.
    #[serde(default = "default_high_priority_threshold")]
    pub high_priority_threshold: f64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            smart_recovery_enabled: true,
            settle_delay_secs: default_settle_delay_secs(),
            scan_window_hours: default_scan_window_hours(),
            min_age_mins: default_min_age_mins(),
            max_age_hours: default_max_age_hours(),
            max_per_run: default_max_per_run(),
            batch_size: default_recovery_batch_size(),
            batch_delay_secs: default_batch_delay_secs(),
            item_delay_secs: default_item_delay_secs(),
            recent_send_hours: default_recent_send_hours(),
            model_check: true,
            pending_sweep_enabled: false,
            pending_after_mins: default_pending_after_mins(),
            pending_sweep_interval_secs: default_pending_sweep_interval_secs(),
            high_priority_threshold: default_high_priority_threshold(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_compaction_interval_mins")]
    pub compaction_interval_mins: u64,
    #[serde(default = "default_stale_conversation_days")]
    pub stale_conversation_days: i64,
    #[serde(default = "default_tracking_retention_days")]
    pub tracking_retention_days: i64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            compaction_interval_mins: default_compaction_interval_mins(),
            stale_conversation_days: default_stale_conversation_days(),
            tracking_retention_days: default_tracking_retention_days(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub phone_number_id: String,
    #[serde(default)]
    pub verify_token: String,
    #[serde(default = "default_graph_base_url")]
    pub graph_base_url: String,
    #[serde(default = "default_graph_api_version")]
    pub api_version: String,
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,
    /// Empty means every sender is accepted.
    #[serde(default)]
    pub allowed_numbers: Vec<String>,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            access_token: String::new(),
            phone_number_id: String::new(),
            verify_token: String::new(),
            graph_base_url: default_graph_base_url(),
            api_version: default_graph_api_version(),
            webhook_path: default_webhook_path(),
            allowed_numbers: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: i64,
    #[serde(default = "default_web_host")]
    pub web_host: String,
    #[serde(default = "default_web_port")]
    pub web_port: u16,
    #[serde(default = "default_inbound_channel_capacity")]
    pub inbound_channel_capacity: usize,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub reply: ReplyConfig,
    #[serde(default)]
    pub humanize: HumanizeConfig,
    #[serde(default)]
    pub loop_guard: LoopGuardConfig,
    #[serde(default)]
    pub finalization: FinalizationConfig,
    #[serde(default)]
    pub followups: FollowupsConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_retention_days: default_log_retention_days(),
            web_host: default_web_host(),
            web_port: default_web_port(),
            inbound_channel_capacity: default_inbound_channel_capacity(),
            llm: LlmConfig::default(),
            reply: ReplyConfig::default(),
            humanize: HumanizeConfig::default(),
            loop_guard: LoopGuardConfig::default(),
            finalization: FinalizationConfig::default(),
            followups: FollowupsConfig::default(),
            recovery: RecoveryConfig::default(),
            maintenance: MaintenanceConfig::default(),
            whatsapp: WhatsAppConfig::default(),
        }
    }
}

fn positive(value: f64, name: &str) -> Result<(), ReplyFlowError> {
    if !(value.is_finite() && value > 0.0) {
        return Err(ReplyFlowError::Config(format!("{name} must be > 0")));
    }
    Ok(())
}

impl Config {
    /// Data root directory from config.
    pub fn data_root_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    /// Runtime data directory (database and logs).
    pub fn runtime_data_dir(&self) -> PathBuf {
        self.data_root_dir().join("runtime")
    }

    pub fn resolve_config_path() -> Result<Option<PathBuf>, ReplyFlowError> {
        if let Ok(custom) = std::env::var("REPLYFLOW_CONFIG") {
            if std::path::Path::new(&custom).exists() {
                return Ok(Some(PathBuf::from(custom)));
            }
            return Err(ReplyFlowError::Config(format!(
                "REPLYFLOW_CONFIG points to non-existent file: {custom}"
            )));
        }

        if std::path::Path::new("./replyflow.config.yaml").exists() {
            return Ok(Some(PathBuf::from("./replyflow.config.yaml")));
        }
        if std::path::Path::new("./replyflow.config.yml").exists() {
            return Ok(Some(PathBuf::from("./replyflow.config.yml")));
        }
        Ok(None)
    }

    /// Load config from YAML file.
    pub fn load() -> Result<Self, ReplyFlowError> {
        let Some(path) = Self::resolve_config_path()? else {
            return Err(ReplyFlowError::Config(
                "No replyflow.config.yaml found. Set REPLYFLOW_CONFIG or create one in the working directory.".into(),
            ));
        };
        let path_str = path.to_string_lossy().to_string();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ReplyFlowError::Config(format!("Failed to read {path_str}: {e}")))?;
        Self::from_yaml_str(&content)
            .map_err(|e| ReplyFlowError::Config(format!("{path_str}: {e}")))
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ReplyFlowError> {
        let mut config: Config = serde_yaml::from_str(content)
            .map_err(|e| ReplyFlowError::Config(format!("Failed to parse config: {e}")))?;
        config.post_deserialize()?;
        Ok(config)
    }

    /// Apply post-deserialization normalization and validation.
    pub fn post_deserialize(&mut self) -> Result<(), ReplyFlowError> {
        self.llm.api_key = self.llm.api_key.trim().to_string();
        if self.llm.api_key.is_empty() {
            return Err(ReplyFlowError::Config("llm.api_key is required".into()));
        }
        self.llm.base_url = self.llm.base_url.trim().trim_end_matches('/').to_string();
        if self.llm.base_url.is_empty() {
            self.llm.base_url = default_llm_base_url();
        }
        self.llm.model = self.llm.model.trim().to_string();
        if self.llm.model.is_empty() {
            self.llm.model = default_llm_model();
        }
        if let Some(vision) = &self.llm.vision_model {
            if vision.trim().is_empty() {
                self.llm.vision_model = None;
            }
        }
        for (i, profile) in self.llm.fallback_profiles.iter_mut().enumerate() {
            profile.model = profile.model.trim().to_string();
            if profile.model.is_empty() {
                return Err(ReplyFlowError::Config(format!(
                    "llm.fallback_profiles[{i}].model must be non-empty"
                )));
            }
        }
        if self.llm.request_timeout_secs == 0 {
            self.llm.request_timeout_secs = default_request_timeout_secs();
        }

        if self.reply.system_prompt.trim().is_empty() {
            self.reply.system_prompt = default_system_prompt();
        }
        if self.reply.max_reply_chars == 0 {
            return Err(ReplyFlowError::Config(
                "reply.max_reply_chars must be > 0".into(),
            ));
        }
        if self.reply.history_cap == 0 {
            self.reply.history_cap = default_history_cap();
        }
        if self.reply.debounce_secs == 0 {
            return Err(ReplyFlowError::Config(
                "reply.debounce_secs must be > 0".into(),
            ));
        }
        positive(self.reply.memory_ttl_mins as f64, "reply.memory_ttl_mins")?;

        if self.humanize.max_parts == 0 {
            self.humanize.max_parts = 1;
        }
        if self.humanize.max_typing_delay_ms < self.humanize.min_typing_delay_ms {
            return Err(ReplyFlowError::Config(
                "humanize.max_typing_delay_ms must be >= humanize.min_typing_delay_ms".into(),
            ));
        }

        positive(self.loop_guard.window_secs as f64, "loop_guard.window_secs")?;
        positive(
            self.finalization.cache_ttl_secs as f64,
            "finalization.cache_ttl_secs",
        )?;
        positive(
            self.finalization.suppress_hours as f64,
            "finalization.suppress_hours",
        )?;

        positive(self.followups.inactivity_hours, "followups.inactivity_hours")?;
        if !(self.followups.delay_hours.is_finite() && self.followups.delay_hours >= 0.0) {
            return Err(ReplyFlowError::Config(
                "followups.delay_hours must be >= 0".into(),
            ));
        }
        positive(
            self.followups.followup_interval_hours,
            "followups.followup_interval_hours",
        )?;
        if self.followups.max_followups_per_conversation < 0 {
            return Err(ReplyFlowError::Config(
                "followups.max_followups_per_conversation must be >= 0".into(),
            ));
        }
        if self.followups.max_attempts <= 0 {
            self.followups.max_attempts = default_max_attempts();
        }
        if self.followups.analysis_batch_size == 0 {
            self.followups.analysis_batch_size = default_analysis_batch_size();
        }
        if self.followups.send_batch_size == 0 {
            self.followups.send_batch_size = default_send_batch_size();
        }

        if self.recovery.batch_size == 0 {
            self.recovery.batch_size = default_recovery_batch_size();
        }
        if self.recovery.max_per_run == 0 {
            self.recovery.max_per_run = default_max_per_run();
        }
        if self.recovery.max_age_hours * 60 <= self.recovery.min_age_mins {
            return Err(ReplyFlowError::Config(
                "recovery.max_age_hours must exceed recovery.min_age_mins".into(),
            ));
        }

        if self.web_host.trim().is_empty() {
            self.web_host = default_web_host();
        }
        if self.inbound_channel_capacity == 0 {
            self.inbound_channel_capacity = default_inbound_channel_capacity();
        }

        let wa = &mut self.whatsapp;
        wa.access_token = wa.access_token.trim().to_string();
        wa.phone_number_id = wa.phone_number_id.trim().to_string();
        wa.verify_token = wa.verify_token.trim().to_string();
        if !wa.webhook_path.starts_with('/') {
            wa.webhook_path = format!("/{}", wa.webhook_path);
        }
        if wa.enabled && (wa.access_token.is_empty() || wa.phone_number_id.is_empty()) {
            return Err(ReplyFlowError::Config(
                "whatsapp.access_token and whatsapp.phone_number_id are required when whatsapp.enabled=true".into(),
            ));
        }
        if wa.enabled && wa.verify_token.is_empty() {
            return Err(ReplyFlowError::Config(
                "whatsapp.verify_token is required when whatsapp.enabled=true".into(),
            ));
        }
        if !is_local_web_host(&self.web_host) && self.whatsapp.verify_token.is_empty() {
            return Err(ReplyFlowError::Config(
                "whatsapp.verify_token is required when web_host is not local".into(),
            ));
        }

        Ok(())
    }

    /// Primary model first, then the configured fallbacks.
    pub fn provider_profiles(&self) -> Vec<ProviderProfile> {
        let mut profiles = vec![ProviderProfile {
            model: self.llm.model.clone(),
            temperature: self.llm.temperature,
            max_tokens_cap: None,
        }];
        profiles.extend(self.llm.fallback_profiles.iter().cloned());
        profiles
    }

    /// Initial value of the persisted follow-up settings row.
    pub fn followup_seed(&self) -> FollowupSettings {
        FollowupSettings {
            enabled: self.followups.enabled,
            generate_criteria: self.followups.generate_criteria.clone(),
            skip_criteria: self.followups.skip_criteria.clone(),
            inactivity_hours: self.followups.inactivity_hours,
            delay_hours: self.followups.delay_hours,
            max_followups_per_conversation: self.followups.max_followups_per_conversation,
            followup_interval_hours: self.followups.followup_interval_hours,
        }
    }

    /// Save config as YAML to the given path.
    pub fn save_yaml(&self, path: &str) -> Result<(), ReplyFlowError> {
        let content = serde_yaml::to_string(self)
            .map_err(|e| ReplyFlowError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
