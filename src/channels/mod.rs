pub mod whatsapp;

pub use whatsapp::{register_whatsapp_webhook, WebhookState, WhatsAppTransport};
