pub mod batch_queue;
pub mod channels;
pub mod clock;
pub mod config;
pub mod conversation;
pub mod delivery;
pub mod finalization;
pub mod followup;
pub mod llm;
pub mod loop_guard;
pub mod pipeline;
pub mod recovery;
pub mod runtime;
pub mod settings;

pub use channels::whatsapp;
pub use replyflow_app::audio;
pub use replyflow_app::logging;
pub use replyflow_channels::channel;
pub use replyflow_channels::inbound;
pub use replyflow_channels::transport;
pub use replyflow_core::error;
pub use replyflow_core::llm_types;
pub use replyflow_core::text;
pub use replyflow_storage::db;
