use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::clock::Clock;
use replyflow_channels::inbound::InboundPayload;
use replyflow_core::text::{normalize_for_match, preview};

const PRUNE_ABOVE_ENTRIES: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct LoopTrackEntry {
    count: u32,
    last_seen: DateTime<Utc>,
}

/// Suppresses storms of identical inbound content per conversation. The
/// counters are a soft in-memory cache and are never persisted.
pub struct LoopGuard {
    clock: Arc<dyn Clock>,
    enabled: bool,
    window: Duration,
    threshold: u32,
    entries: Mutex<HashMap<(String, String), LoopTrackEntry>>,
}

/// Normalized text for text payloads, the payload kind (plus caption) otherwise.
pub fn fingerprint(payload: &InboundPayload) -> String {
    match payload {
        InboundPayload::Text(text) => format!("text:{}", normalize_for_match(text)),
        other => match other.inline_text() {
            Some(caption) => format!("{}:{}", other.kind(), normalize_for_match(caption)),
            None => other.kind().to_string(),
        },
    }
}

impl LoopGuard {
    pub fn new(clock: Arc<dyn Clock>, enabled: bool, window: Duration, threshold: u32) -> Self {
        Self {
            clock,
            enabled,
            window,
            threshold,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn should_suppress(&self, key: &str, payload: &InboundPayload) -> bool {
        if !self.enabled {
            return false;
        }
        let now = self.clock.now();
        let fp = fingerprint(payload);
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());

        if entries.len() > PRUNE_ABOVE_ENTRIES {
            let window = self.window;
            entries.retain(|_, e| now - e.last_seen <= window);
        }

        let entry = entries
            .entry((key.to_string(), fp.clone()))
            .or_insert(LoopTrackEntry {
                count: 0,
                last_seen: now,
            });
        if now - entry.last_seen > self.window {
            entry.count = 0;
        }
        entry.count += 1;
        entry.last_seen = now;

        let suppress = entry.count > self.threshold;
        if suppress {
            warn!(
                "LoopGuard: suppressing repeated message for {key} (count={}, fingerprint={})",
                entry.count,
                preview(&fp, 60)
            );
        }
        suppress
    }

    pub fn forget(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.retain(|(k, _), _| k != key);
    }
}
