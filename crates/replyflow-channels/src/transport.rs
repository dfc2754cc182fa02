use async_trait::async_trait;

/// Presence signal shown to the contact while a reply is being prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    Composing,
    Recording,
    Paused,
}

impl PresenceState {
    pub fn as_str(self) -> &'static str {
        match self {
            PresenceState::Composing => "composing",
            PresenceState::Recording => "recording",
            PresenceState::Paused => "paused",
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Unique name: "whatsapp", "recording", ...
    fn name(&self) -> &str;

    async fn send_text(&self, key: &str, text: &str) -> Result<(), String>;

    /// Send a voice note. Default: not supported.
    async fn send_audio(&self, _key: &str, _audio: Vec<u8>, _mime: &str) -> Result<(), String> {
        Err(format!("audio not supported for {}", self.name()))
    }

    /// Send a structured contact card. Default: the phone number as plain text.
    async fn send_contact_card(&self, key: &str, phone: &str) -> Result<(), String> {
        self.send_text(key, phone).await
    }

    /// Best-effort presence update. Default: no-op.
    async fn set_presence(&self, _key: &str, _state: PresenceState) -> Result<(), String> {
        Ok(())
    }
}
