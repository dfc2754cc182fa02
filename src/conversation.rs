use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::clock::{parse_ts, ts, Clock};
use crate::db::{call_blocking, Database, StoredTurn};
use crate::error::ReplyFlowError;
use replyflow_core::llm_types::Role;

#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub message_type: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub key: String,
    pub contact_name: Option<String>,
    pub turns: Vec<Turn>,
    pub last_activity: DateTime<Utc>,
}

fn to_turns(rows: Vec<StoredTurn>) -> Vec<Turn> {
    rows.into_iter()
        .filter_map(|row| {
            Some(Turn {
                role: row.role.parse().ok()?,
                content: row.content,
                message_type: row.message_type,
                timestamp: parse_ts(&row.timestamp)?,
            })
        })
        .collect()
}

/// Drop the turns of a conversation idle past `ttl`. Returns true if it was stale.
fn expire_if_stale(
    db: &Database,
    key: &str,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Result<bool, ReplyFlowError> {
    let Some(row) = db.get_conversation(key)? else {
        return Ok(false);
    };
    let stale = parse_ts(&row.last_activity)
        .map(|last| now - last > ttl)
        .unwrap_or(true);
    if stale {
        db.clear_turns(key)?;
    }
    Ok(stale)
}

/// Bounded, TTL-expiring history per conversation key. Expiry is lazy: a
/// conversation idle past the TTL reads as absent and its turns are discarded
/// on the next write.
pub struct ConversationStore {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    cap: usize,
}

impl ConversationStore {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>, ttl: Duration, cap: usize) -> Self {
        Self {
            db,
            clock,
            ttl,
            cap: cap.max(1),
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub async fn get(&self, key: &str) -> Result<Option<Conversation>, ReplyFlowError> {
        let now = self.clock.now();
        let ttl = self.ttl;
        let key = key.to_string();
        call_blocking(self.db.clone(), move |db| {
            let Some(row) = db.get_conversation(&key)? else {
                return Ok(None);
            };
            let Some(last_activity) = parse_ts(&row.last_activity) else {
                return Ok(None);
            };
            if now - last_activity > ttl {
                return Ok(None);
            }
            let turns = to_turns(db.get_turns(&key)?);
            Ok(Some(Conversation {
                key,
                contact_name: row.contact_name,
                turns,
                last_activity,
            }))
        })
        .await
    }

    pub async fn add_message(
        &self,
        key: &str,
        role: Role,
        content: &str,
        message_type: Option<&str>,
    ) -> Result<(), ReplyFlowError> {
        let now = self.clock.now();
        let ttl = self.ttl;
        let cap = self.cap;
        let key = key.to_string();
        let content = content.to_string();
        let message_type = message_type.map(str::to_string);
        call_blocking(self.db.clone(), move |db| {
            expire_if_stale(db, &key, now, ttl)?;
            db.append_turn(
                &key,
                role.as_str(),
                &content,
                message_type.as_deref(),
                &ts(now),
                cap,
            )?;
            Ok(())
        })
        .await
    }

    /// Mark inbound activity without adding a turn.
    pub async fn touch(&self, key: &str, contact_name: Option<&str>) -> Result<(), ReplyFlowError> {
        let now = self.clock.now();
        let ttl = self.ttl;
        let key = key.to_string();
        let contact_name = contact_name.map(str::to_string);
        call_blocking(self.db.clone(), move |db| {
            expire_if_stale(db, &key, now, ttl)?;
            db.touch_conversation(&key, contact_name.as_deref(), &ts(now))
        })
        .await
    }

    /// Last `limit` turns within the TTL, oldest first.
    pub async fn recent_turns(&self, key: &str, limit: usize) -> Result<Vec<Turn>, ReplyFlowError> {
        let Some(conv) = self.get(key).await? else {
            return Ok(Vec::new());
        };
        let skip = conv.turns.len().saturating_sub(limit);
        Ok(conv.turns.into_iter().skip(skip).collect())
    }

    /// Stored turns regardless of TTL, for components reasoning over hours-old
    /// conversations.
    pub async fn raw_turns(&self, key: &str) -> Result<Vec<Turn>, ReplyFlowError> {
        let key = key.to_string();
        let rows = call_blocking(self.db.clone(), move |db| db.get_turns(&key)).await?;
        Ok(to_turns(rows))
    }

    pub async fn contact_name(&self, key: &str) -> Result<Option<String>, ReplyFlowError> {
        let key = key.to_string();
        let row = call_blocking(self.db.clone(), move |db| db.get_conversation(&key)).await?;
        Ok(row.and_then(|r| r.contact_name))
    }

    pub async fn is_expired(&self, key: &str) -> Result<bool, ReplyFlowError> {
        Ok(self.get(key).await?.is_none())
    }

    /// Delete conversations idle for longer than `stale_after`.
    pub async fn compact(&self, stale_after: Duration) -> Result<usize, ReplyFlowError> {
        let before = ts(self.clock.now() - stale_after);
        call_blocking(self.db.clone(), move |db| {
            db.delete_stale_conversations(&before)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::test_support::{cleanup, start_time, test_db};

    fn store(cap: usize) -> (ConversationStore, Arc<ManualClock>, std::path::PathBuf) {
        let (db, dir) = test_db();
        let clock = Arc::new(ManualClock::new(start_time()));
        let store = ConversationStore::new(Arc::new(db), clock.clone(), Duration::hours(1), cap);
        (store, clock, dir)
    }

    #[tokio::test]
    async fn test_history_never_exceeds_cap() {
        let (store, clock, dir) = store(50);
        for i in 0..60 {
            store
                .add_message("5511", Role::User, &format!("msg {i}"), None)
                .await
                .unwrap();
            clock.advance(Duration::seconds(1));
            let conv = store.get("5511").await.unwrap().unwrap();
            assert!(conv.turns.len() <= 50);
        }
        let conv = store.get("5511").await.unwrap().unwrap();
        assert_eq!(conv.turns.len(), 50);
        assert_eq!(conv.turns[0].content, "msg 10");
        assert_eq!(conv.turns[49].content, "msg 59");
        cleanup(&dir);
    }

    #[tokio::test]
    async fn test_expired_conversation_reads_as_absent() {
        let (store, clock, dir) = store(50);
        store
            .add_message("k", Role::User, "Oi", Some("text"))
            .await
            .unwrap();
        clock.advance(Duration::minutes(59));
        assert!(store.get("k").await.unwrap().is_some());
        clock.advance(Duration::minutes(2));
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_expired("k").await.unwrap());
        assert!(store.recent_turns("k", 10).await.unwrap().is_empty());
        // raw access still sees the stored turn
        assert_eq!(store.raw_turns("k").await.unwrap().len(), 1);
        cleanup(&dir);
    }

    #[tokio::test]
    async fn test_add_after_expiry_starts_fresh() {
        let (store, clock, dir) = store(50);
        store.add_message("k", Role::User, "antigo", None).await.unwrap();
        clock.advance(Duration::hours(2));
        store.add_message("k", Role::User, "novo", None).await.unwrap();
        let conv = store.get("k").await.unwrap().unwrap();
        assert_eq!(conv.turns.len(), 1);
        assert_eq!(conv.turns[0].content, "novo");
        cleanup(&dir);
    }

    #[tokio::test]
    async fn test_touch_after_expiry_discards_old_turns() {
        let (store, clock, dir) = store(50);
        store.add_message("k", Role::User, "antigo", None).await.unwrap();
        clock.advance(Duration::hours(2));
        store.touch("k", Some("Ana")).await.unwrap();
        let conv = store.get("k").await.unwrap().unwrap();
        assert!(conv.turns.is_empty());
        assert_eq!(conv.contact_name.as_deref(), Some("Ana"));
        assert_eq!(store.contact_name("k").await.unwrap().as_deref(), Some("Ana"));
        cleanup(&dir);
    }

    #[tokio::test]
    async fn test_recent_turns_keeps_order_and_roles() {
        let (store, _clock, dir) = store(50);
        store.add_message("k", Role::User, "1", None).await.unwrap();
        store.add_message("k", Role::Assistant, "2", None).await.unwrap();
        store.add_message("k", Role::User, "3", None).await.unwrap();
        let turns = store.recent_turns("k", 2).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::Assistant);
        assert_eq!(turns[1].content, "3");
        cleanup(&dir);
    }

    #[tokio::test]
    async fn test_compact_removes_only_stale() {
        let (store, clock, dir) = store(50);
        store.add_message("old", Role::User, "a", None).await.unwrap();
        clock.advance(Duration::days(31));
        store.add_message("new", Role::User, "b", None).await.unwrap();
        let removed = store.compact(Duration::days(30)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.raw_turns("old").await.unwrap().is_empty());
        assert_eq!(store.raw_turns("new").await.unwrap().len(), 1);
        cleanup(&dir);
    }
}
