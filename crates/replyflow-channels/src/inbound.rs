use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// Payload of an inbound message, already resolved to text or raw bytes by the
/// transport layer.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundPayload {
    Text(String),
    Audio {
        bytes: Vec<u8>,
        mime: String,
    },
    Image {
        bytes: Vec<u8>,
        mime: String,
        caption: Option<String>,
    },
    Document {
        filename: String,
        caption: Option<String>,
    },
}

impl InboundPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundPayload::Text(_) => "text",
            InboundPayload::Audio { .. } => "audio",
            InboundPayload::Image { .. } => "image",
            InboundPayload::Document { .. } => "document",
        }
    }

    /// Text carried directly by the payload, without any provider call.
    pub fn inline_text(&self) -> Option<&str> {
        match self {
            InboundPayload::Text(t) => Some(t.as_str()),
            InboundPayload::Image { caption, .. } | InboundPayload::Document { caption, .. } => {
                caption.as_deref()
            }
            InboundPayload::Audio { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Transport message id, used for redelivery dedupe.
    pub message_id: String,
    pub key: String,
    pub contact_name: Option<String>,
    /// Sent by the operator from the linked device rather than by the contact.
    pub from_me: bool,
    pub payload: InboundPayload,
    pub timestamp: DateTime<Utc>,
}

pub type InboundSender = mpsc::Sender<InboundMessage>;
pub type InboundReceiver = mpsc::Receiver<InboundMessage>;

pub fn inbound_channel(capacity: usize) -> (InboundSender, InboundReceiver) {
    mpsc::channel(capacity.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(id: &str, body: &str) -> InboundMessage {
        InboundMessage {
            message_id: id.to_string(),
            key: "5511".to_string(),
            contact_name: None,
            from_me: false,
            payload: InboundPayload::Text(body.to_string()),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_payload_kind_and_inline_text() {
        let audio = InboundPayload::Audio {
            bytes: vec![0; 4],
            mime: "audio/ogg".into(),
        };
        assert_eq!(audio.kind(), "audio");
        assert!(audio.inline_text().is_none());

        let doc = InboundPayload::Document {
            filename: "proposta.pdf".into(),
            caption: Some("segue".into()),
        };
        assert_eq!(doc.kind(), "document");
        assert_eq!(doc.inline_text(), Some("segue"));
    }

    #[tokio::test]
    async fn test_inbound_channel_preserves_order() {
        let (tx, mut rx) = inbound_channel(4);
        tx.send(text("m1", "Oi")).await.unwrap();
        tx.send(text("m2", "tudo bem?")).await.unwrap();
        drop(tx);
        assert_eq!(rx.recv().await.unwrap().message_id, "m1");
        assert_eq!(rx.recv().await.unwrap().message_id, "m2");
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let (tx, _rx) = inbound_channel(0);
        assert_eq!(tx.max_capacity(), 1);
    }
}
