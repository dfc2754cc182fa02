use tracing::warn;

use crate::config::Config;
use crate::db::Database;
use crate::error::ReplyFlowError;
use replyflow_core::llm_types::ReasoningTier;

/// Keys the `app_settings` table may override.
pub const SETTING_KEYS: [&str; 9] = [
    "system_prompt",
    "max_reply_chars",
    "reasoning_tier",
    "use_contact_name",
    "audio_replies_enabled",
    "emoji_enabled",
    "contact_cards_enabled",
    "smart_recovery_enabled",
    "pending_sweep_enabled",
];

/// Effective per-invocation settings: config values with `app_settings`
/// overrides applied.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    pub system_prompt: String,
    pub max_reply_chars: usize,
    pub reasoning_tier: ReasoningTier,
    pub use_contact_name: bool,
    pub audio_replies_enabled: bool,
    pub emoji_enabled: bool,
    pub contact_cards_enabled: bool,
    pub smart_recovery_enabled: bool,
    pub pending_sweep_enabled: bool,
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(format!("expected a boolean, got '{other}'")),
    }
}

impl RuntimeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            system_prompt: config.reply.system_prompt.clone(),
            max_reply_chars: config.reply.max_reply_chars,
            reasoning_tier: config.reply.reasoning_tier,
            use_contact_name: config.reply.use_contact_name,
            audio_replies_enabled: config.reply.audio_replies_enabled,
            emoji_enabled: config.reply.emoji_enabled,
            contact_cards_enabled: config.reply.contact_cards_enabled,
            smart_recovery_enabled: config.recovery.smart_recovery_enabled,
            pending_sweep_enabled: config.recovery.pending_sweep_enabled,
        }
    }

    /// Resolve the effective settings. Unparseable overrides are logged and skipped.
    pub fn load(config: &Config, db: &Database) -> Result<Self, ReplyFlowError> {
        let mut settings = Self::from_config(config);
        for (key, value) in db.list_settings()? {
            if let Err(e) = settings.apply_override(&key, &value) {
                warn!("Settings: ignoring override {key}={value:?}: {e}");
            }
        }
        Ok(settings)
    }

    pub fn apply_override(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "system_prompt" => {
                if value.trim().is_empty() {
                    return Err("system_prompt must be non-empty".into());
                }
                self.system_prompt = value.to_string();
            }
            "max_reply_chars" => {
                let n: usize = value
                    .trim()
                    .parse()
                    .map_err(|_| format!("expected a positive integer, got '{value}'"))?;
                if n == 0 {
                    return Err("max_reply_chars must be > 0".into());
                }
                self.max_reply_chars = n;
            }
            "reasoning_tier" => self.reasoning_tier = value.parse()?,
            "use_contact_name" => self.use_contact_name = parse_bool(value)?,
            "audio_replies_enabled" => self.audio_replies_enabled = parse_bool(value)?,
            "emoji_enabled" => self.emoji_enabled = parse_bool(value)?,
            "contact_cards_enabled" => self.contact_cards_enabled = parse_bool(value)?,
            "smart_recovery_enabled" => self.smart_recovery_enabled = parse_bool(value)?,
            "pending_sweep_enabled" => self.pending_sweep_enabled = parse_bool(value)?,
            other => return Err(format!("unknown setting '{other}'")),
        }
        Ok(())
    }

    /// Check a value before it is written, using config defaults as the base.
    pub fn validate(config: &Config, key: &str, value: &str) -> Result<(), String> {
        Self::from_config(config).apply_override(key, value)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            "system_prompt" => self.system_prompt.clone(),
            "max_reply_chars" => self.max_reply_chars.to_string(),
            "reasoning_tier" => self.reasoning_tier.to_string(),
            "use_contact_name" => self.use_contact_name.to_string(),
            "audio_replies_enabled" => self.audio_replies_enabled.to_string(),
            "emoji_enabled" => self.emoji_enabled.to_string(),
            "contact_cards_enabled" => self.contact_cards_enabled.to_string(),
            "smart_recovery_enabled" => self.smart_recovery_enabled.to_string(),
            "pending_sweep_enabled" => self.pending_sweep_enabled.to_string(),
            _ => return None,
        };
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::test_support::{cleanup, test_db};

    #[test]
    fn test_defaults_come_from_config() {
        let config = test_config();
        let settings = RuntimeSettings::from_config(&config);
        assert_eq!(settings.max_reply_chars, 500);
        assert_eq!(settings.reasoning_tier, ReasoningTier::Low);
        assert!(!settings.emoji_enabled);
        assert!(settings.smart_recovery_enabled);
    }

    #[test]
    fn test_load_applies_valid_and_skips_invalid_overrides() {
        let config = test_config();
        let (db, dir) = test_db();
        let now = "2024-01-01T00:00:00.000Z";
        db.set_setting("max_reply_chars", "280", now).unwrap();
        db.set_setting("emoji_enabled", "yes", now).unwrap();
        db.set_setting("reasoning_tier", "turbo", now).unwrap();
        db.set_setting("unknown_key", "1", now).unwrap();

        let settings = RuntimeSettings::load(&config, &db).unwrap();
        assert_eq!(settings.max_reply_chars, 280);
        assert!(settings.emoji_enabled);
        assert_eq!(settings.reasoning_tier, ReasoningTier::Low);
        cleanup(&dir);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = test_config();
        assert!(RuntimeSettings::validate(&config, "max_reply_chars", "0").is_err());
        assert!(RuntimeSettings::validate(&config, "emoji_enabled", "maybe").is_err());
        assert!(RuntimeSettings::validate(&config, "reasoning_tier", "high").is_ok());
        assert!(RuntimeSettings::validate(&config, "nope", "x").is_err());
    }

    #[test]
    fn test_every_key_is_readable() {
        let settings = RuntimeSettings::from_config(&test_config());
        for key in SETTING_KEYS {
            assert!(settings.get(key).is_some(), "{key}");
        }
        assert!(settings.get("missing").is_none());
    }
}
