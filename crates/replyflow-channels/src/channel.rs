use std::sync::Arc;

use replyflow_storage::db::{call_blocking, Database};

use crate::transport::Transport;

/// Send `text` to `key` and record it as an assistant turn. Used by proactive
/// senders (follow-ups) that bypass the reply pipeline.
pub async fn deliver_and_store_text(
    transport: &dyn Transport,
    db: Arc<Database>,
    key: &str,
    text: &str,
    message_type: &str,
    history_cap: usize,
    now: &str,
) -> Result<(), String> {
    transport.send_text(key, text).await?;

    let key = key.to_string();
    let text = text.to_string();
    let message_type = message_type.to_string();
    let now = now.to_string();
    call_blocking(db, move |d| {
        d.append_turn(
            &key,
            "assistant",
            &text,
            Some(&message_type),
            &now,
            history_cap,
        )
        .map(|_| ())
    })
    .await
    .map_err(|e| format!("Failed to store sent message: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Flaky {
        fail: bool,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn send_text(&self, _key: &str, text: &str) -> Result<(), String> {
            if self.fail {
                return Err("socket closed".into());
            }
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn test_db() -> (Arc<Database>, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("replyflow_channels_{}", uuid::Uuid::new_v4()));
        let db = Database::new(dir.to_str().unwrap()).unwrap();
        (Arc::new(db), dir)
    }

    #[tokio::test]
    async fn test_deliver_stores_assistant_turn() {
        let (db, dir) = test_db();
        let transport = Flaky {
            fail: false,
            sent: Mutex::new(Vec::new()),
        };
        deliver_and_store_text(
            &transport,
            db.clone(),
            "5511",
            "Oi, tudo certo?",
            "followup",
            50,
            "2024-01-01T00:00:00.000Z",
        )
        .await
        .unwrap();
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
        let turns = db.get_turns("5511").unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, "assistant");
        assert_eq!(turns[0].message_type.as_deref(), Some("followup"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_failed_send_stores_nothing() {
        let (db, dir) = test_db();
        let transport = Flaky {
            fail: true,
            sent: Mutex::new(Vec::new()),
        };
        let err = deliver_and_store_text(
            &transport,
            db.clone(),
            "5511",
            "Oi",
            "followup",
            50,
            "2024-01-01T00:00:00.000Z",
        )
        .await
        .unwrap_err();
        assert!(err.contains("socket closed"));
        assert!(db.get_turns("5511").unwrap().is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
