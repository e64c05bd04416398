//! SQLite-backed persistence for scheduled tasks, conversation and failure
//! logs, nudge counters and channel links.
//!
//! Timestamps are stored as epoch milliseconds so readiness and lease
//! checks can be evaluated inside a single SQL statement.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use nudgeclaw_core::error::{NudgeClawError, Result};
use nudgeclaw_core::traits::{AuditLog, BehaviorProvider, ConversationLog, NudgeStateStore};
use nudgeclaw_core::types::{Role, UserBehaviorSnapshot};
use rusqlite::{Connection, OptionalExtension, params};

use crate::channels::{ChannelDirectory, ChannelLink, NotifyTarget};
use crate::store::TaskStore;
use crate::tasks::{NewTask, ScheduledTask, TaskPayload, after_ms};

/// How far back user messages count towards active hours.
const ACTIVE_HOURS_WINDOW_DAYS: i64 = 14;
/// Fewer user messages than this and active hours are reported as unknown.
const ACTIVE_HOURS_MIN_SAMPLES: usize = 5;

const TASK_COLUMNS: &str = "id, owner_id, kind, payload, next_run_at_ms, interval_ms, last_run_at_ms, \
     lease_until_ms, failure_count, created_at_ms, updated_at_ms";

fn db_err(e: rusqlite::Error) -> NudgeClawError {
    NudgeClawError::Database(e.to_string())
}

fn to_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_ms(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Epoch-ms column as a timestamp; a value chrono cannot represent is an error.
fn ms_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    from_ms(ms).ok_or_else(|| {
        tracing::warn!("⚠️ Timestamp {ms} in column {idx} is out of range");
        rusqlite::Error::IntegralValueOutOfRange(idx, ms)
    })
}

fn opt_ms_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(_) => ms_column(row, idx).map(Some),
        None => Ok(None),
    }
}

fn interval_to_sql(interval_ms: Option<u64>) -> Result<Option<i64>> {
    interval_ms
        .map(|ms| {
            i64::try_from(ms).map_err(|_| {
                NudgeClawError::Validation(format!("interval_ms {ms} is out of range"))
            })
        })
        .transpose()
}

/// One failure record from the audit log.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FailureRecord {
    pub owner_id: String,
    pub task_kind: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// One conversation log entry.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConversationEntry {
    pub owner_id: String,
    pub role: String,
    pub text: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

/// SQLite-backed store for all scheduler data.
pub struct SchedulerDb {
    conn: Mutex<Option<Connection>>,
}

impl SchedulerDb {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| NudgeClawError::Database(format!("DB open: {e}")))?;
        Self::from_connection(conn)
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5)).map_err(db_err)?;
        let db = Self {
            conn: Mutex::new(Some(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Run `f` against the open connection.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|e| NudgeClawError::Database(format!("connection poisoned: {e}")))?;
        let conn = guard
            .as_ref()
            .ok_or_else(|| NudgeClawError::Database("database is closed".into()))?;
        f(conn).map_err(db_err)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
            -- Scheduled tasks (one-shot and recurring)
            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                kind TEXT NOT NULL,             -- 'daily_check', 'reminder', 'nudge', 'custom'
                payload TEXT NOT NULL,          -- JSON, shape depends on kind
                next_run_at_ms INTEGER NOT NULL,
                interval_ms INTEGER,            -- NULL = one-shot
                last_run_at_ms INTEGER,
                lease_until_ms INTEGER,         -- locked while in the future
                failure_count INTEGER NOT NULL DEFAULT 0,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_ready ON scheduled_tasks (next_run_at_ms, lease_until_ms);
            CREATE INDEX IF NOT EXISTS idx_tasks_owner ON scheduled_tasks (owner_id);

            -- Conversation log (UI replay)
            CREATE TABLE IF NOT EXISTS conversation_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id TEXT NOT NULL,
                role TEXT NOT NULL,             -- 'user', 'assistant'
                text TEXT NOT NULL,
                source TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversation_owner ON conversation_log (owner_id, role, created_at_ms);

            -- Task failures for operators
            CREATE TABLE IF NOT EXISTS failure_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id TEXT NOT NULL,
                task_kind TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL
            );

            -- Consecutive unanswered nudges per owner
            CREATE TABLE IF NOT EXISTS nudge_state (
                owner_id TEXT PRIMARY KEY,
                consecutive_non_responses INTEGER NOT NULL DEFAULT 0,
                updated_at_ms INTEGER NOT NULL
            );

            -- Where to reach each owner
            CREATE TABLE IF NOT EXISTS channel_links (
                owner_id TEXT PRIMARY KEY,
                target TEXT NOT NULL,           -- JSON NotifyTarget
                created_at_ms INTEGER NOT NULL
            );
         ",
            )
        })
        .map_err(|e| NudgeClawError::Database(format!("Migration: {e}")))
    }

    fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<(ScheduledTask, String)> {
        let kind: String = row.get(2)?;
        let payload_str: String = row.get(3)?;
        let interval_ms = match row.get::<_, Option<i64>>(5)? {
            Some(ms) if ms <= 0 => {
                tracing::warn!("⚠️ Interval {ms} ms is not positive");
                return Err(rusqlite::Error::IntegralValueOutOfRange(5, ms));
            }
            Some(ms) => Some(ms as u64),
            None => None,
        };
        let failure_count: i64 = row.get(8)?;
        // Payload is decoded outside the row mapper so one bad blob degrades
        // to an unknown task instead of failing the whole query.
        let task = ScheduledTask {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            payload: TaskPayload::Unknown {
                kind,
                data: serde_json::Value::Null,
            },
            next_run_at: ms_column(row, 4)?,
            interval_ms,
            last_run_at: opt_ms_column(row, 6)?,
            lease_until: opt_ms_column(row, 7)?,
            failure_count: u32::try_from(failure_count.max(0)).unwrap_or(u32::MAX),
            created_at: ms_column(row, 9)?,
            updated_at: ms_column(row, 10)?,
        };
        Ok((task, payload_str))
    }

    fn decode_task((mut task, payload_str): (ScheduledTask, String)) -> ScheduledTask {
        let kind = task.payload.kind_name().to_string();
        let data: serde_json::Value = serde_json::from_str(&payload_str).unwrap_or_default();
        task.payload = TaskPayload::from_parts(&kind, data.clone()).unwrap_or_else(|e| {
            tracing::warn!("⚠️ Undecodable payload for task {} ({kind}): {e}", task.id);
            TaskPayload::Unknown { kind, data }
        });
        task
    }

    fn query_tasks(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<ScheduledTask>> {
        let raw = self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params, Self::row_to_task)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        Ok(raw.into_iter().map(Self::decode_task).collect())
    }

    // ─── Conversation layer hooks ──────────────────────────────

    /// Record an inbound user message and reset the nudge counter.
    pub async fn record_user_message(&self, owner_id: &str, text: &str, source: &str) -> Result<()> {
        self.append(owner_id, Role::User, text, source).await?;
        self.reset_non_responses(owner_id).await
    }

    /// Most recent conversation entries for an owner, newest first.
    pub fn recent_conversation(&self, owner_id: &str, limit: usize) -> Result<Vec<ConversationEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT owner_id, role, text, source, created_at_ms FROM conversation_log
                 WHERE owner_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![owner_id, limit as i64], |row| {
                Ok(ConversationEntry {
                    owner_id: row.get(0)?,
                    role: row.get(1)?,
                    text: row.get(2)?,
                    source: row.get(3)?,
                    created_at: ms_column(row, 4)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Most recent failures, newest first.
    pub fn recent_failures(&self, limit: usize) -> Result<Vec<FailureRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT owner_id, task_kind, message, created_at_ms FROM failure_log
                 ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit as i64], |row| {
                Ok(FailureRecord {
                    owner_id: row.get(0)?,
                    task_kind: row.get(1)?,
                    message: row.get(2)?,
                    created_at: ms_column(row, 3)?,
                })
            })?;
            rows.collect()
        })
    }

    // ─── Channel links ─────────────────────────────────────────

    /// Link (or relink) a delivery target for an owner.
    pub fn link_channel(&self, owner_id: &str, target: &NotifyTarget) -> Result<()> {
        let json = serde_json::to_string(target)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO channel_links (owner_id, target, created_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(owner_id) DO UPDATE SET target = excluded.target",
                params![owner_id, json, to_ms(Utc::now())],
            )
        })?;
        tracing::info!("🔗 Channel linked for {owner_id}: {}", target.label());
        Ok(())
    }

    pub fn unlink_channel(&self, owner_id: &str) -> Result<bool> {
        let n = self.with_conn(|conn| {
            conn.execute("DELETE FROM channel_links WHERE owner_id = ?1", [owner_id])
        })?;
        Ok(n > 0)
    }
}

#[async_trait]
impl TaskStore for SchedulerDb {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create(&self, task: NewTask) -> Result<ScheduledTask> {
        let task = task.into_task(Utc::now())?;
        let (kind, data) = task.payload.to_parts()?;
        let interval_ms = interval_to_sql(task.interval_ms)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO scheduled_tasks
                 (id, owner_id, kind, payload, next_run_at_ms, interval_ms, last_run_at_ms,
                  lease_until_ms, failure_count, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL, 0, ?7, ?7)",
                params![
                    task.id,
                    task.owner_id,
                    kind,
                    data.to_string(),
                    to_ms(task.next_run_at),
                    interval_ms,
                    to_ms(task.created_at),
                ],
            )
        })?;
        tracing::debug!("📅 Task created: {} ({kind}) for {}", task.id, task.owner_id);
        Ok(task)
    }

    async fn get(&self, task_id: &str) -> Result<Option<ScheduledTask>> {
        let raw = self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = ?1"),
                [task_id],
                Self::row_to_task,
            )
            .optional()
        })?;
        Ok(raw.map(Self::decode_task))
    }

    async fn list_ready(&self, limit: usize) -> Result<Vec<ScheduledTask>> {
        let now = to_ms(Utc::now());
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM scheduled_tasks
                 WHERE next_run_at_ms <= ?1 AND (lease_until_ms IS NULL OR lease_until_ms <= ?1)
                 ORDER BY next_run_at_ms ASC LIMIT ?2"
            ),
            params![now, limit as i64],
        )
    }

    async fn acquire_lease(&self, task_id: &str, lease_ms: u64) -> Result<bool> {
        let now = Utc::now();
        let until = to_ms(after_ms(now, lease_ms)?);
        let now = to_ms(now);
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE scheduled_tasks SET lease_until_ms = ?2, updated_at_ms = ?3
                 WHERE id = ?1 AND (lease_until_ms IS NULL OR lease_until_ms <= ?3)",
                params![task_id, until, now],
            )
        })?;
        Ok(changed == 1)
    }

    async fn renew_lease(&self, task_id: &str, lease_ms: u64) -> Result<bool> {
        let now = Utc::now();
        let until = to_ms(after_ms(now, lease_ms)?);
        let now = to_ms(now);
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE scheduled_tasks SET lease_until_ms = ?2, updated_at_ms = ?3
                 WHERE id = ?1 AND lease_until_ms > ?3",
                params![task_id, until, now],
            )
        })?;
        Ok(changed == 1)
    }

    async fn complete(&self, task_id: &str) -> Result<()> {
        let now = to_ms(Utc::now());
        self.with_conn(|conn| {
            // Recurring rows are advanced, one-shot rows removed; a vanished
            // row matches neither statement.
            conn.execute(
                "UPDATE scheduled_tasks
                 SET next_run_at_ms = ?2 + interval_ms, last_run_at_ms = ?2,
                     lease_until_ms = NULL, failure_count = 0, updated_at_ms = ?2
                 WHERE id = ?1 AND interval_ms IS NOT NULL",
                params![task_id, now],
            )?;
            conn.execute(
                "DELETE FROM scheduled_tasks WHERE id = ?1 AND interval_ms IS NULL",
                [task_id],
            )?;
            Ok(())
        })
    }

    async fn release_lease(&self, task_id: &str) -> Result<()> {
        let now = to_ms(Utc::now());
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE scheduled_tasks
                 SET lease_until_ms = NULL, failure_count = failure_count + 1, updated_at_ms = ?2
                 WHERE id = ?1",
                params![task_id, now],
            )
        })?;
        Ok(())
    }

    async fn reschedule(&self, task_id: &str, next_run_at: DateTime<Utc>) -> Result<()> {
        let now = to_ms(Utc::now());
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE scheduled_tasks
                 SET lease_until_ms = NULL, next_run_at_ms = ?2,
                     failure_count = failure_count + 1, updated_at_ms = ?3
                 WHERE id = ?1",
                params![task_id, to_ms(next_run_at), now],
            )
        })?;
        Ok(())
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<ScheduledTask>> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE owner_id = ?1 ORDER BY created_at_ms"
            ),
            [owner_id],
        )
    }

    async fn delete(&self, task_id: &str) -> Result<bool> {
        let n = self.with_conn(|conn| {
            conn.execute("DELETE FROM scheduled_tasks WHERE id = ?1", [task_id])
        })?;
        Ok(n > 0)
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|e| NudgeClawError::Database(format!("connection poisoned: {e}")))?;
        if let Some(conn) = guard.take() {
            conn.close()
                .map_err(|(_, e)| NudgeClawError::Database(format!("DB close: {e}")))?;
            tracing::info!("💾 Scheduler database closed");
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationLog for SchedulerDb {
    async fn append(&self, owner_id: &str, role: Role, text: &str, source: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversation_log (owner_id, role, text, source, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![owner_id, role.as_str(), text, source, to_ms(Utc::now())],
            )
        })?;
        Ok(())
    }
}

#[async_trait]
impl AuditLog for SchedulerDb {
    async fn record_failure(&self, owner_id: &str, task_kind: &str, message: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO failure_log (owner_id, task_kind, message, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                params![owner_id, task_kind, message, to_ms(Utc::now())],
            )
        })?;
        Ok(())
    }
}

#[async_trait]
impl NudgeStateStore for SchedulerDb {
    async fn increment_non_responses(&self, owner_id: &str) -> Result<u32> {
        let count: i64 = self.with_conn(|conn| {
            conn.query_row(
                "INSERT INTO nudge_state (owner_id, consecutive_non_responses, updated_at_ms)
                 VALUES (?1, 1, ?2)
                 ON CONFLICT(owner_id) DO UPDATE SET
                   consecutive_non_responses = consecutive_non_responses + 1,
                   updated_at_ms = excluded.updated_at_ms
                 RETURNING consecutive_non_responses",
                params![owner_id, to_ms(Utc::now())],
                |row| row.get(0),
            )
        })?;
        Ok(count.max(0) as u32)
    }

    async fn reset_non_responses(&self, owner_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO nudge_state (owner_id, consecutive_non_responses, updated_at_ms)
                 VALUES (?1, 0, ?2)
                 ON CONFLICT(owner_id) DO UPDATE SET
                   consecutive_non_responses = 0, updated_at_ms = excluded.updated_at_ms",
                params![owner_id, to_ms(Utc::now())],
            )
        })?;
        Ok(())
    }

    async fn non_responses(&self, owner_id: &str) -> Result<u32> {
        let count: Option<i64> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT consecutive_non_responses FROM nudge_state WHERE owner_id = ?1",
                [owner_id],
                |row| row.get(0),
            )
            .optional()
        })?;
        Ok(count.unwrap_or(0).max(0) as u32)
    }
}

#[async_trait]
impl BehaviorProvider for SchedulerDb {
    async fn behavior_snapshot(&self, owner_id: &str) -> Result<UserBehaviorSnapshot> {
        let now = Utc::now();
        let since = to_ms(now - Duration::days(ACTIVE_HOURS_WINDOW_DAYS));

        let (last_ms, recent): (Option<i64>, Vec<i64>) = self.with_conn(|conn| {
            let last = conn.query_row(
                "SELECT MAX(created_at_ms) FROM conversation_log WHERE owner_id = ?1 AND role = 'user'",
                [owner_id],
                |row| row.get::<_, Option<i64>>(0),
            )?;
            let mut stmt = conn.prepare(
                "SELECT created_at_ms FROM conversation_log
                 WHERE owner_id = ?1 AND role = 'user' AND created_at_ms >= ?2",
            )?;
            let rows = stmt.query_map(params![owner_id, since], |row| row.get::<_, i64>(0))?;
            Ok((last, rows.collect::<rusqlite::Result<Vec<_>>>()?))
        })?;

        // Owners who never wrote are treated as freshly active.
        let hours_since_last_interaction = last_ms
            .map(|ms| (to_ms(now) - ms).max(0) as f64 / 3_600_000.0)
            .unwrap_or(0.0);

        let active_hours = if recent.len() >= ACTIVE_HOURS_MIN_SAMPLES {
            Some(
                recent
                    .iter()
                    .filter_map(|ms| from_ms(*ms))
                    .map(|t| t.hour() as u8)
                    .collect::<BTreeSet<u8>>(),
            )
        } else {
            None
        };

        Ok(UserBehaviorSnapshot {
            hours_since_last_interaction,
            active_hours,
            consecutive_non_responses: self.non_responses(owner_id).await?,
        })
    }
}

#[async_trait]
impl ChannelDirectory for SchedulerDb {
    async fn channel_for(&self, owner_id: &str) -> Result<Option<ChannelLink>> {
        let target: Option<String> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT target FROM channel_links WHERE owner_id = ?1",
                [owner_id],
                |row| row.get(0),
            )
            .optional()
        })?;
        match target {
            Some(json) => Ok(Some(ChannelLink {
                owner_id: owner_id.to_string(),
                target: serde_json::from_str(&json)?,
            })),
            None => Ok(None),
        }
    }
}
