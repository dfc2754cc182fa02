use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::debug;

use replyflow_channels::inbound::InboundMessage;

/// Receives one flushed batch per quiet window.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle_batch(&self, key: String, batch: Vec<InboundMessage>);
}

struct PendingBatch {
    messages: Vec<InboundMessage>,
    generation: u64,
    timer: JoinHandle<()>,
}

type KeyLock = Arc<tokio::sync::Mutex<()>>;

/// Held while a reply is being produced for one conversation. Entries are
/// dropped from the map once nobody holds or waits on them.
pub struct KeyGuard {
    in_flight: Arc<Mutex<HashMap<String, KeyLock>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let lock = OwnedMutexGuard::mutex(&guard).clone();
        drop(guard);
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        // the map and `lock` are the only holders left
        if Arc::strong_count(&lock) == 2 {
            in_flight.remove(&self.key);
        }
    }
}

async fn lock_key(in_flight: &Arc<Mutex<HashMap<String, KeyLock>>>, key: &str) -> KeyGuard {
    let lock = {
        let mut map = in_flight.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    };
    let guard = lock.lock_owned().await;
    KeyGuard {
        in_flight: in_flight.clone(),
        key: key.to_string(),
        guard: Some(guard),
    }
}

struct Inner {
    delay: Duration,
    handler: Arc<dyn BatchHandler>,
    pending: Mutex<HashMap<String, PendingBatch>>,
    in_flight: Arc<Mutex<HashMap<String, KeyLock>>>,
}

/// Per-conversation debounce: messages arriving for a key before its timer
/// fires are merged, in arrival order, into a single handler call. Each key has
/// at most one handler call running at a time.
#[derive(Clone)]
pub struct BatchQueue {
    inner: Arc<Inner>,
}

impl BatchQueue {
    pub fn new(delay: Duration, handler: Arc<dyn BatchHandler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                delay,
                handler,
                pending: Mutex::new(HashMap::new()),
                in_flight: Arc::new(Mutex::new(HashMap::new())),
            }),
        }
    }

    pub fn enqueue(&self, message: InboundMessage) {
        let key = message.key.clone();
        let mut pending = self.inner.pending.lock().unwrap_or_else(|p| p.into_inner());

        let (mut messages, generation) = match pending.remove(&key) {
            Some(old) => {
                old.timer.abort();
                (old.messages, old.generation + 1)
            }
            None => (Vec::new(), 0),
        };
        messages.push(message);
        debug!(
            "BatchQueue: {} message(s) pending for {key}, timer reset",
            messages.len()
        );

        let inner = self.inner.clone();
        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(inner.delay).await;
            inner.flush(timer_key, generation).await;
        });
        pending.insert(
            key,
            PendingBatch {
                messages,
                generation,
                timer,
            },
        );
    }

    pub fn pending_count(&self, key: &str) -> usize {
        let pending = self.inner.pending.lock().unwrap_or_else(|p| p.into_inner());
        pending.get(key).map(|b| b.messages.len()).unwrap_or(0)
    }

    /// Wait until no batch for `key` is being handled, then keep others out
    /// until the guard is dropped.
    pub async fn lock_key(&self, key: &str) -> KeyGuard {
        lock_key(&self.inner.in_flight, key).await
    }

    pub fn pending_keys(&self) -> Vec<String> {
        let pending = self.inner.pending.lock().unwrap_or_else(|p| p.into_inner());
        pending.keys().cloned().collect()
    }
}

impl Inner {
    async fn flush(&self, key: String, generation: u64) {
        let messages = {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            let current = pending
                .get(&key)
                .map(|b| b.generation == generation)
                .unwrap_or(false);
            // superseded by a newer enqueue
            if !current {
                return;
            }
            pending.remove(&key).map(|b| b.messages).unwrap_or_default()
        };
        if messages.is_empty() {
            return;
        }

        let _guard = lock_key(&self.in_flight, &key).await;
        debug!(
            "BatchQueue: flushing {} message(s) for {key}",
            messages.len()
        );
        self.handler.handle_batch(key, messages).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{inbound_text, start_time};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, Vec<String>)>>,
        busy_for: Option<Duration>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    #[async_trait]
    impl BatchHandler for Recorder {
        async fn handle_batch(&self, key: String, batch: Vec<InboundMessage>) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            if let Some(d) = self.busy_for {
                tokio::time::sleep(d).await;
            }
            let texts = batch
                .iter()
                .filter_map(|m| m.payload.inline_text().map(str::to_string))
                .collect();
            self.calls.lock().unwrap().push((key, texts));
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn msg(key: &str, id: &str, body: &str) -> InboundMessage {
        inbound_text(key, id, body, start_time())
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_messages_coalesce_into_one_call() {
        let recorder = Arc::new(Recorder::default());
        let queue = BatchQueue::new(Duration::from_secs(10), recorder.clone());

        queue.enqueue(msg("A", "m1", "Oi"));
        tokio::time::sleep(Duration::from_secs(2)).await;
        queue.enqueue(msg("A", "m2", "quero um orçamento"));
        assert_eq!(queue.pending_count("A"), 2);

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(recorder.calls.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let calls = recorder.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "A");
        assert_eq!(calls[0].1, vec!["Oi", "quero um orçamento"]);
        assert_eq!(queue.pending_count("A"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_flush_independently() {
        let recorder = Arc::new(Recorder::default());
        let queue = BatchQueue::new(Duration::from_secs(10), recorder.clone());
        queue.enqueue(msg("A", "a1", "Oi"));
        queue.enqueue(msg("B", "b1", "Olá"));
        queue.enqueue(msg("A", "a2", "tudo bem?"));
        tokio::time::sleep(Duration::from_secs(11)).await;

        let mut calls = recorder.calls.lock().unwrap().clone();
        calls.sort();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, vec!["Oi", "tudo bem?"]);
        assert_eq!(calls[1].1, vec!["Olá"]);
        assert!(queue.pending_keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_in_flight_call_per_key() {
        let recorder = Arc::new(Recorder {
            busy_for: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let queue = BatchQueue::new(Duration::from_secs(10), recorder.clone());

        queue.enqueue(msg("A", "m1", "primeira"));
        tokio::time::sleep(Duration::from_secs(11)).await;
        // first batch is still being handled
        queue.enqueue(msg("A", "m2", "segunda"));
        tokio::time::sleep(Duration::from_secs(90)).await;

        let calls = recorder.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, vec!["primeira"]);
        assert_eq!(calls[1].1, vec!["segunda"]);
        assert_eq!(recorder.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_key_lock_holds_back_flush() {
        let recorder = Arc::new(Recorder::default());
        let queue = BatchQueue::new(Duration::from_secs(10), recorder.clone());

        let guard = queue.lock_key("A").await;
        queue.enqueue(msg("A", "m1", "Oi"));
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(recorder.calls.lock().unwrap().is_empty());

        drop(guard);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(recorder.calls.lock().unwrap().len(), 1);
        assert!(queue.inner.in_flight.lock().unwrap().is_empty());
    }
}
