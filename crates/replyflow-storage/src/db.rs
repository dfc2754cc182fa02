use rusqlite::OptionalExtension;
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use replyflow_core::error::ReplyFlowError;

pub struct Database {
    conn: Mutex<Connection>,
}

pub async fn call_blocking<T, F>(db: std::sync::Arc<Database>, f: F) -> Result<T, ReplyFlowError>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> Result<T, ReplyFlowError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(db.as_ref()))
        .await
        .map_err(|e| ReplyFlowError::Task(format!("DB task join error: {e}")))?
}

#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub key: String,
    pub contact_name: Option<String>,
    pub last_activity: String,
    pub finalized_at: Option<String>,
    pub finalized_reason: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct StoredTurn {
    pub id: i64,
    pub conversation_key: String,
    pub role: String,
    pub content: String,
    pub message_type: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowupStatus {
    ScheduledForAnalysis,
    ScheduledForSend,
    Completed,
    Failed,
}

impl FollowupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FollowupStatus::ScheduledForAnalysis => "scheduled_for_analysis",
            FollowupStatus::ScheduledForSend => "scheduled_for_send",
            FollowupStatus::Completed => "completed",
            FollowupStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "scheduled_for_analysis" => Some(FollowupStatus::ScheduledForAnalysis),
            "scheduled_for_send" => Some(FollowupStatus::ScheduledForSend),
            "completed" => Some(FollowupStatus::Completed),
            "failed" => Some(FollowupStatus::Failed),
            _ => None,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            FollowupStatus::ScheduledForAnalysis | FollowupStatus::ScheduledForSend
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowupType {
    Automatic,
    RecoveryAttempt,
    ConversationFinalized,
    FinalizationDetected,
    StopMarker,
}

impl FollowupType {
    pub fn as_str(self) -> &'static str {
        match self {
            FollowupType::Automatic => "automatic",
            FollowupType::RecoveryAttempt => "recovery_attempt",
            FollowupType::ConversationFinalized => "conversation_finalized",
            FollowupType::FinalizationDetected => "finalization_detected",
            FollowupType::StopMarker => "stop_marker",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "automatic" => Some(FollowupType::Automatic),
            "recovery_attempt" => Some(FollowupType::RecoveryAttempt),
            "conversation_finalized" => Some(FollowupType::ConversationFinalized),
            "finalization_detected" => Some(FollowupType::FinalizationDetected),
            "stop_marker" => Some(FollowupType::StopMarker),
            _ => None,
        }
    }

    /// History types that count as an outbound message toward rate caps.
    pub const SENDS: [FollowupType; 2] = [FollowupType::Automatic, FollowupType::RecoveryAttempt];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowupSettings {
    pub enabled: bool,
    pub generate_criteria: String,
    pub skip_criteria: String,
    pub inactivity_hours: f64,
    pub delay_hours: f64,
    pub max_followups_per_conversation: i64,
    pub followup_interval_hours: f64,
}

#[derive(Debug, Clone)]
pub struct FollowupQueueItem {
    pub id: i64,
    pub conversation_key: String,
    pub status: FollowupStatus,
    pub scheduled_for: String,
    pub attempts: i64,
    pub generated_message: Option<String>,
    pub context_snapshot: Option<String>,
    pub analysis_result: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct FollowupHistoryRecord {
    pub id: i64,
    pub conversation_key: String,
    pub followup_type: FollowupType,
    pub message: Option<String>,
    pub metadata: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct TrackingRecord {
    pub message_id: String,
    pub conversation_key: String,
    pub received_at: String,
    pub auto_replied: bool,
    pub manual_replied: bool,
    pub replied_at: Option<String>,
}

const SCHEMA_VERSION_CURRENT: i64 = 2;

const ACTIVE_STATUSES_SQL: &str = "('scheduled_for_analysis', 'scheduled_for_send')";

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, ReplyFlowError> {
    if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ReplyFlowError::Config(format!(
            "invalid table name: {table}"
        )));
    }
    // PRAGMA does not take bound parameters.
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for col in rows {
        if col? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn get_schema_version(conn: &Connection) -> Result<i64, ReplyFlowError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS db_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        [],
    )?;
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM db_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.and_then(|s| s.parse::<i64>().ok()).unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i64, note: &str) -> Result<(), ReplyFlowError> {
    conn.execute(
        "INSERT INTO db_meta(key, value) VALUES('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![version.to_string()],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL,
            note TEXT
        )",
        [],
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO schema_migrations(version, applied_at, note)
         VALUES(?1, ?2, ?3)",
        params![version, chrono::Utc::now().to_rfc3339(), note],
    )?;
    Ok(())
}

fn apply_schema_migrations(conn: &Connection) -> Result<(), ReplyFlowError> {
    let mut version = get_schema_version(conn)?;
    if version < 1 {
        set_schema_version(conn, 1, "base schema")?;
        version = 1;
    }
    if version < 2 {
        // Databases created before finalization moved onto the conversation row.
        if !table_has_column(conn, "conversations", "finalized_at")? {
            conn.execute("ALTER TABLE conversations ADD COLUMN finalized_at TEXT", [])?;
        }
        if !table_has_column(conn, "conversations", "finalized_reason")? {
            conn.execute(
                "ALTER TABLE conversations ADD COLUMN finalized_reason TEXT",
                [],
            )?;
        }
        if !table_has_column(conn, "conversations", "contact_name")? {
            conn.execute("ALTER TABLE conversations ADD COLUMN contact_name TEXT", [])?;
        }
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_followup_history_key_type_created
             ON followup_history(conversation_key, followup_type, created_at)",
            [],
        )?;
        set_schema_version(conn, 2, "finalized marker columns, history index")?;
        version = 2;
    }
    if version != SCHEMA_VERSION_CURRENT {
        set_schema_version(conn, SCHEMA_VERSION_CURRENT, "applied")?;
    }
    Ok(())
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        key: row.get(0)?,
        contact_name: row.get(1)?,
        last_activity: row.get(2)?,
        finalized_at: row.get(3)?,
        finalized_reason: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn row_to_turn(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredTurn> {
    Ok(StoredTurn {
        id: row.get(0)?,
        conversation_key: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        message_type: row.get(4)?,
        timestamp: row.get(5)?,
    })
}

fn row_to_queue_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<FollowupQueueItem> {
    let raw_status: String = row.get(2)?;
    let status = FollowupStatus::parse(&raw_status).unwrap_or(FollowupStatus::Failed);
    Ok(FollowupQueueItem {
        id: row.get(0)?,
        conversation_key: row.get(1)?,
        status,
        scheduled_for: row.get(3)?,
        attempts: row.get(4)?,
        generated_message: row.get(5)?,
        context_snapshot: row.get(6)?,
        analysis_result: row.get(7)?,
        last_error: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn row_to_history(row: &rusqlite::Row<'_>) -> rusqlite::Result<FollowupHistoryRecord> {
    let raw_type: String = row.get(2)?;
    let followup_type = FollowupType::parse(&raw_type).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown followup_type '{raw_type}'").into(),
        )
    })?;
    Ok(FollowupHistoryRecord {
        id: row.get(0)?,
        conversation_key: row.get(1)?,
        followup_type,
        message: row.get(3)?,
        metadata: row.get(4)?,
        created_at: row.get(5)?,
    })
}

const QUEUE_COLUMNS: &str = "id, conversation_key, status, scheduled_for, attempts, generated_message,
     context_snapshot, analysis_result, last_error, created_at, updated_at";

impl Database {
    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn new(data_dir: &str) -> Result<Self, ReplyFlowError> {
        let db_path = Path::new(data_dir).join("replyflow.db");
        std::fs::create_dir_all(data_dir)?;

        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                key TEXT PRIMARY KEY,
                contact_name TEXT,
                last_activity TEXT NOT NULL,
                finalized_at TEXT,
                finalized_reason TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_conversations_last_activity
                ON conversations(last_activity);

            CREATE TABLE IF NOT EXISTS conversation_turns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_key TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                message_type TEXT,
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_conversation_turns_key_id
                ON conversation_turns(conversation_key, id);

            CREATE TABLE IF NOT EXISTS followup_settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                enabled INTEGER NOT NULL DEFAULT 0,
                generate_criteria TEXT NOT NULL DEFAULT '',
                skip_criteria TEXT NOT NULL DEFAULT '',
                inactivity_hours REAL NOT NULL,
                delay_hours REAL NOT NULL,
                max_followups_per_conversation INTEGER NOT NULL,
                followup_interval_hours REAL NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS followup_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_key TEXT NOT NULL,
                status TEXT NOT NULL,
                scheduled_for TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                generated_message TEXT,
                context_snapshot TEXT,
                analysis_result TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_followup_queue_status_scheduled
                ON followup_queue(status, scheduled_for);

            CREATE UNIQUE INDEX IF NOT EXISTS idx_followup_queue_one_active
                ON followup_queue(conversation_key)
                WHERE status IN ('scheduled_for_analysis', 'scheduled_for_send');

            CREATE TABLE IF NOT EXISTS followup_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_key TEXT NOT NULL,
                followup_type TEXT NOT NULL,
                message TEXT,
                metadata TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS message_tracking (
                message_id TEXT PRIMARY KEY,
                conversation_key TEXT NOT NULL,
                received_at TEXT NOT NULL,
                auto_replied INTEGER NOT NULL DEFAULT 0,
                manual_replied INTEGER NOT NULL DEFAULT 0,
                replied_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_message_tracking_key_received
                ON message_tracking(conversation_key, received_at);

            CREATE TABLE IF NOT EXISTS app_settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS db_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
        )?;
        apply_schema_migrations(&conn)?;

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    // --- Conversations ---

    pub fn touch_conversation(
        &self,
        key: &str,
        contact_name: Option<&str>,
        now: &str,
    ) -> Result<(), ReplyFlowError> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO conversations (key, contact_name, last_activity, created_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(key) DO UPDATE SET
                contact_name = COALESCE(?2, contact_name),
                last_activity = ?3",
            params![key, contact_name, now],
        )?;
        Ok(())
    }

    pub fn get_conversation(&self, key: &str) -> Result<Option<ConversationRow>, ReplyFlowError> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT key, contact_name, last_activity, finalized_at, finalized_reason, created_at
             FROM conversations WHERE key = ?1",
            params![key],
            row_to_conversation,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Append one turn, bump `last_activity`, and prune the key down to the
    /// newest `cap` turns. Returns the new turn id.
    pub fn append_turn(
        &self,
        key: &str,
        role: &str,
        content: &str,
        message_type: Option<&str>,
        timestamp: &str,
        cap: usize,
    ) -> Result<i64, ReplyFlowError> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO conversations (key, last_activity, created_at)
             VALUES (?1, ?2, ?2)
             ON CONFLICT(key) DO UPDATE SET last_activity = ?2",
            params![key, timestamp],
        )?;
        conn.execute(
            "INSERT INTO conversation_turns (conversation_key, role, content, message_type, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![key, role, content, message_type, timestamp],
        )?;
        let id = conn.last_insert_rowid();
        conn.execute(
            "DELETE FROM conversation_turns
             WHERE conversation_key = ?1
               AND id NOT IN (
                   SELECT id FROM conversation_turns
                   WHERE conversation_key = ?1
                   ORDER BY id DESC
                   LIMIT ?2
               )",
            params![key, cap as i64],
        )?;
        Ok(id)
    }

    pub fn get_turns(&self, key: &str) -> Result<Vec<StoredTurn>, ReplyFlowError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_key, role, content, message_type, timestamp
             FROM conversation_turns
             WHERE conversation_key = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![key], row_to_turn)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// The newest `limit` turns, oldest first.
    pub fn get_recent_turns(
        &self,
        key: &str,
        limit: usize,
    ) -> Result<Vec<StoredTurn>, ReplyFlowError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_key, role, content, message_type, timestamp
             FROM conversation_turns
             WHERE conversation_key = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![key, limit as i64], row_to_turn)?;
        let mut turns = rows.collect::<Result<Vec<_>, _>>()?;
        turns.reverse();
        Ok(turns)
    }

    pub fn clear_turns(&self, key: &str) -> Result<usize, ReplyFlowError> {
        let conn = self.lock_conn();
        let n = conn.execute(
            "DELETE FROM conversation_turns WHERE conversation_key = ?1",
            params![key],
        )?;
        Ok(n)
    }

    /// Conversations whose `last_activity` is at or after `since`, newest first.
    pub fn list_conversations_active_since(
        &self,
        since: &str,
    ) -> Result<Vec<ConversationRow>, ReplyFlowError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT key, contact_name, last_activity, finalized_at, finalized_reason, created_at
             FROM conversations
             WHERE last_activity >= ?1
             ORDER BY last_activity DESC",
        )?;
        let rows = stmt.query_map(params![since], row_to_conversation)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Delete conversations idle since before `before`, along with their turns.
    pub fn delete_stale_conversations(&self, before: &str) -> Result<usize, ReplyFlowError> {
        let conn = self.lock_conn();
        conn.execute(
            "DELETE FROM conversation_turns
             WHERE conversation_key IN (
                 SELECT key FROM conversations WHERE last_activity < ?1
             )",
            params![before],
        )?;
        let n = conn.execute(
            "DELETE FROM conversations WHERE last_activity < ?1",
            params![before],
        )?;
        Ok(n)
    }

    pub fn set_finalized(&self, key: &str, reason: &str, at: &str) -> Result<(), ReplyFlowError> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO conversations (key, last_activity, finalized_at, finalized_reason, created_at)
             VALUES (?1, ?3, ?3, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                finalized_at = ?3,
                finalized_reason = ?2",
            params![key, reason, at],
        )?;
        Ok(())
    }

    /// Returns true when a marker was actually cleared.
    pub fn clear_finalized(&self, key: &str) -> Result<bool, ReplyFlowError> {
        let conn = self.lock_conn();
        let n = conn.execute(
            "UPDATE conversations
             SET finalized_at = NULL, finalized_reason = NULL
             WHERE key = ?1 AND finalized_at IS NOT NULL",
            params![key],
        )?;
        Ok(n > 0)
    }

    // --- Follow-up settings ---

    pub fn get_followup_settings(&self) -> Result<Option<FollowupSettings>, ReplyFlowError> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT enabled, generate_criteria, skip_criteria, inactivity_hours, delay_hours,
                    max_followups_per_conversation, followup_interval_hours
             FROM followup_settings WHERE id = 1",
            [],
            |row| {
                Ok(FollowupSettings {
                    enabled: row.get::<_, i64>(0)? != 0,
                    generate_criteria: row.get(1)?,
                    skip_criteria: row.get(2)?,
                    inactivity_hours: row.get(3)?,
                    delay_hours: row.get(4)?,
                    max_followups_per_conversation: row.get(5)?,
                    followup_interval_hours: row.get(6)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn save_followup_settings(
        &self,
        settings: &FollowupSettings,
        now: &str,
    ) -> Result<(), ReplyFlowError> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO followup_settings (
                id, enabled, generate_criteria, skip_criteria, inactivity_hours, delay_hours,
                max_followups_per_conversation, followup_interval_hours, updated_at
             ) VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                enabled = excluded.enabled,
                generate_criteria = excluded.generate_criteria,
                skip_criteria = excluded.skip_criteria,
                inactivity_hours = excluded.inactivity_hours,
                delay_hours = excluded.delay_hours,
                max_followups_per_conversation = excluded.max_followups_per_conversation,
                followup_interval_hours = excluded.followup_interval_hours,
                updated_at = excluded.updated_at",
            params![
                settings.enabled as i64,
                settings.generate_criteria,
                settings.skip_criteria,
                settings.inactivity_hours,
                settings.delay_hours,
                settings.max_followups_per_conversation,
                settings.followup_interval_hours,
                now,
            ],
        )?;
        Ok(())
    }

    // --- Follow-up queue ---

    pub fn has_active_followup(&self, key: &str) -> Result<bool, ReplyFlowError> {
        let conn = self.lock_conn();
        let found = conn
            .query_row(
                &format!(
                    "SELECT 1 FROM followup_queue
                     WHERE conversation_key = ?1 AND status IN {ACTIVE_STATUSES_SQL}
                     LIMIT 1"
                ),
                params![key],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Insert a new item in `scheduled_for_analysis`. Returns `None` when the
    /// key already has an active item.
    pub fn insert_followup(
        &self,
        key: &str,
        scheduled_for: &str,
        now: &str,
    ) -> Result<Option<i64>, ReplyFlowError> {
        let conn = self.lock_conn();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO followup_queue
                (conversation_key, status, scheduled_for, attempts, created_at, updated_at)
             VALUES (?1, 'scheduled_for_analysis', ?2, 0, ?3, ?3)",
            params![key, scheduled_for, now],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    pub fn get_followup(&self, id: i64) -> Result<Option<FollowupQueueItem>, ReplyFlowError> {
        let conn = self.lock_conn();
        conn.query_row(
            &format!("SELECT {QUEUE_COLUMNS} FROM followup_queue WHERE id = ?1"),
            params![id],
            row_to_queue_item,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn active_followup_for(
        &self,
        key: &str,
    ) -> Result<Option<FollowupQueueItem>, ReplyFlowError> {
        let conn = self.lock_conn();
        conn.query_row(
            &format!(
                "SELECT {QUEUE_COLUMNS} FROM followup_queue
                 WHERE conversation_key = ?1 AND status IN {ACTIVE_STATUSES_SQL}
                 LIMIT 1"
            ),
            params![key],
            row_to_queue_item,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Items in `status` whose `scheduled_for` has passed, oldest first.
    pub fn due_followups(
        &self,
        status: FollowupStatus,
        now: &str,
        limit: usize,
    ) -> Result<Vec<FollowupQueueItem>, ReplyFlowError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {QUEUE_COLUMNS} FROM followup_queue
             WHERE status = ?1 AND scheduled_for <= ?2
             ORDER BY scheduled_for ASC, id ASC
             LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![status.as_str(), now, limit as i64],
            row_to_queue_item,
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Move an analysed item to `scheduled_for_send`. Returns false if the
    /// item is no longer awaiting analysis.
    pub fn mark_followup_scheduled_for_send(
        &self,
        id: i64,
        message: &str,
        context_snapshot: &str,
        analysis_result: &str,
        send_at: &str,
        now: &str,
    ) -> Result<bool, ReplyFlowError> {
        let conn = self.lock_conn();
        let n = conn.execute(
            "UPDATE followup_queue
             SET status = 'scheduled_for_send',
                 generated_message = ?2,
                 context_snapshot = ?3,
                 analysis_result = ?4,
                 scheduled_for = ?5,
                 attempts = 0,
                 last_error = NULL,
                 updated_at = ?6
             WHERE id = ?1 AND status = 'scheduled_for_analysis'",
            params![id, message, context_snapshot, analysis_result, send_at, now],
        )?;
        Ok(n > 0)
    }

    pub fn complete_followup(
        &self,
        id: i64,
        analysis_result: Option<&str>,
        now: &str,
    ) -> Result<bool, ReplyFlowError> {
        let conn = self.lock_conn();
        let n = conn.execute(
            &format!(
                "UPDATE followup_queue
                 SET status = 'completed',
                     analysis_result = COALESCE(?2, analysis_result),
                     updated_at = ?3
                 WHERE id = ?1 AND status IN {ACTIVE_STATUSES_SQL}"
            ),
            params![id, analysis_result, now],
        )?;
        Ok(n > 0)
    }

    /// Count a failed attempt. While attempts remain the item keeps its status
    /// and is rescheduled at `retry_at`; otherwise it becomes `failed`.
    pub fn record_followup_failure(
        &self,
        id: i64,
        error: &str,
        retry_at: &str,
        max_attempts: i64,
        now: &str,
    ) -> Result<Option<FollowupStatus>, ReplyFlowError> {
        let conn = self.lock_conn();
        let current: Option<(String, i64)> = conn
            .query_row(
                "SELECT status, attempts FROM followup_queue WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((raw_status, attempts)) = current else {
            return Ok(None);
        };
        let Some(status) = FollowupStatus::parse(&raw_status).filter(|s| s.is_active()) else {
            return Ok(None);
        };
        let attempts = attempts + 1;
        let next = if attempts >= max_attempts {
            FollowupStatus::Failed
        } else {
            status
        };
        conn.execute(
            "UPDATE followup_queue
             SET status = ?2,
                 attempts = ?3,
                 last_error = ?4,
                 scheduled_for = CASE WHEN ?2 = 'failed' THEN scheduled_for ELSE ?5 END,
                 updated_at = ?6
             WHERE id = ?1",
            params![id, next.as_str(), attempts, error, retry_at, now],
        )?;
        Ok(Some(next))
    }

    /// Complete every active item for `key` with the given reason.
    pub fn cancel_active_followups(
        &self,
        key: &str,
        reason: &str,
        now: &str,
    ) -> Result<usize, ReplyFlowError> {
        let conn = self.lock_conn();
        let n = conn.execute(
            &format!(
                "UPDATE followup_queue
                 SET status = 'completed', analysis_result = ?2, updated_at = ?3
                 WHERE conversation_key = ?1 AND status IN {ACTIVE_STATUSES_SQL}"
            ),
            params![key, reason, now],
        )?;
        Ok(n)
    }

    pub fn followup_status_counts(&self) -> Result<Vec<(String, i64)>, ReplyFlowError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM followup_queue GROUP BY status ORDER BY status",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // --- Follow-up history (append-only) ---

    pub fn insert_history(
        &self,
        key: &str,
        followup_type: FollowupType,
        message: Option<&str>,
        metadata: Option<&str>,
        created_at: &str,
    ) -> Result<i64, ReplyFlowError> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO followup_history (conversation_key, followup_type, message, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![key, followup_type.as_str(), message, metadata, created_at],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn count_history_since(
        &self,
        key: &str,
        types: &[FollowupType],
        since: &str,
    ) -> Result<i64, ReplyFlowError> {
        if types.is_empty() {
            return Ok(0);
        }
        let placeholders = (0..types.len())
            .map(|i| format!("?{}", i + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT COUNT(*) FROM followup_history
             WHERE conversation_key = ?1 AND created_at >= ?2 AND followup_type IN ({placeholders})"
        );
        let mut values: Vec<String> = vec![key.to_string(), since.to_string()];
        values.extend(types.iter().map(|t| t.as_str().to_string()));
        let conn = self.lock_conn();
        let count = conn.query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))?;
        Ok(count)
    }

    /// Most recent record of `followup_type`, optionally bounded by `since`.
    pub fn latest_history(
        &self,
        key: &str,
        followup_type: FollowupType,
        since: Option<&str>,
    ) -> Result<Option<FollowupHistoryRecord>, ReplyFlowError> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT id, conversation_key, followup_type, message, metadata, created_at
             FROM followup_history
             WHERE conversation_key = ?1
               AND followup_type = ?2
               AND (?3 IS NULL OR created_at >= ?3)
             ORDER BY created_at DESC, id DESC
             LIMIT 1",
            params![key, followup_type.as_str(), since],
            row_to_history,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn has_history(
        &self,
        key: &str,
        followup_type: FollowupType,
        since: Option<&str>,
    ) -> Result<bool, ReplyFlowError> {
        Ok(self.latest_history(key, followup_type, since)?.is_some())
    }

    pub fn list_history(
        &self,
        key: &str,
        limit: usize,
    ) -> Result<Vec<FollowupHistoryRecord>, ReplyFlowError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_key, followup_type, message, metadata, created_at
             FROM followup_history
             WHERE conversation_key = ?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![key, limit as i64], row_to_history)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // --- Message tracking ---

    /// Record an inbound message id. Returns false if it was already seen.
    pub fn track_inbound(
        &self,
        message_id: &str,
        key: &str,
        received_at: &str,
    ) -> Result<bool, ReplyFlowError> {
        let conn = self.lock_conn();
        let n = conn.execute(
            "INSERT OR IGNORE INTO message_tracking (message_id, conversation_key, received_at)
             VALUES (?1, ?2, ?3)",
            params![message_id, key, received_at],
        )?;
        Ok(n > 0)
    }

    pub fn get_tracking(&self, message_id: &str) -> Result<Option<TrackingRecord>, ReplyFlowError> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT message_id, conversation_key, received_at, auto_replied, manual_replied, replied_at
             FROM message_tracking WHERE message_id = ?1",
            params![message_id],
            |row| {
                Ok(TrackingRecord {
                    message_id: row.get(0)?,
                    conversation_key: row.get(1)?,
                    received_at: row.get(2)?,
                    auto_replied: row.get::<_, i64>(3)? != 0,
                    manual_replied: row.get::<_, i64>(4)? != 0,
                    replied_at: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    /// Flag every unanswered message of `key` received up to `at` as auto-replied.
    pub fn mark_auto_replied(&self, key: &str, at: &str) -> Result<usize, ReplyFlowError> {
        let conn = self.lock_conn();
        let n = conn.execute(
            "UPDATE message_tracking
             SET auto_replied = 1, replied_at = ?2
             WHERE conversation_key = ?1
               AND auto_replied = 0 AND manual_replied = 0
               AND received_at <= ?2",
            params![key, at],
        )?;
        Ok(n)
    }

    pub fn mark_manual_replied(&self, key: &str, at: &str) -> Result<usize, ReplyFlowError> {
        let conn = self.lock_conn();
        let n = conn.execute(
            "UPDATE message_tracking
             SET manual_replied = 1, replied_at = ?2
             WHERE conversation_key = ?1
               AND auto_replied = 0 AND manual_replied = 0
               AND received_at <= ?2",
            params![key, at],
        )?;
        Ok(n)
    }

    /// Keys with unanswered messages received in `[newer_than, older_than]`.
    pub fn unanswered_conversation_keys(
        &self,
        older_than: &str,
        newer_than: &str,
    ) -> Result<Vec<String>, ReplyFlowError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT conversation_key, MAX(received_at) AS latest
             FROM message_tracking
             WHERE auto_replied = 0 AND manual_replied = 0
               AND received_at <= ?1 AND received_at >= ?2
             GROUP BY conversation_key
             ORDER BY latest DESC",
        )?;
        let rows = stmt.query_map(params![older_than, newer_than], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn delete_tracking_before(&self, before: &str) -> Result<usize, ReplyFlowError> {
        let conn = self.lock_conn();
        let n = conn.execute(
            "DELETE FROM message_tracking WHERE received_at < ?1",
            params![before],
        )?;
        Ok(n)
    }

    // --- App settings ---

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, ReplyFlowError> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT value FROM app_settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn set_setting(&self, key: &str, value: &str, now: &str) -> Result<(), ReplyFlowError> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO app_settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<bool, ReplyFlowError> {
        let conn = self.lock_conn();
        let n = conn.execute("DELETE FROM app_settings WHERE key = ?1", params![key])?;
        Ok(n > 0)
    }

    pub fn list_settings(&self) -> Result<Vec<(String, String)>, ReplyFlowError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare("SELECT key, value FROM app_settings ORDER BY key")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}
