//! Task definitions: the core data model for scheduled work.

use chrono::{DateTime, Duration, Utc};
use nudgeclaw_core::error::{NudgeClawError, Result};
use serde::{Deserialize, Serialize};

/// Longest accepted recurrence interval: one year.
pub const MAX_INTERVAL_MS: u64 = 366 * 24 * 60 * 60 * 1000;

/// `now` plus `ms` milliseconds, or a validation error when out of range.
pub fn after_ms(now: DateTime<Utc>, ms: u64) -> Result<DateTime<Utc>> {
    i64::try_from(ms)
        .ok()
        .and_then(Duration::try_milliseconds)
        .and_then(|d| now.checked_add_signed(d))
        .ok_or_else(|| NudgeClawError::Validation(format!("offset of {ms} ms is out of range")))
}

/// `now` plus `secs` seconds (may be negative), or a validation error when out of range.
pub fn after_secs(now: DateTime<Utc>, secs: i64) -> Result<DateTime<Utc>> {
    Duration::try_seconds(secs)
        .and_then(|d| now.checked_add_signed(d))
        .ok_or_else(|| NudgeClawError::Validation(format!("offset of {secs} s is out of range")))
}

/// Which handler a task is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    DailyCheck,
    Reminder,
    Nudge,
    Custom,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::DailyCheck => "daily_check",
            TaskKind::Reminder => "reminder",
            TaskKind::Nudge => "nudge",
            TaskKind::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daily_check" => Some(TaskKind::DailyCheck),
            "reminder" => Some(TaskKind::Reminder),
            "nudge" => Some(TaskKind::Nudge),
            "custom" => Some(TaskKind::Custom),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed payload, one shape per task kind.
///
/// Stored as `(kind, data)`; rows whose kind this build does not know decode
/// to `Unknown` so the dispatcher can skip them instead of failing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum TaskPayload {
    DailyCheck {
        #[serde(default)]
        prompt_hint: Option<String>,
    },
    Reminder {
        #[serde(default)]
        message: String,
    },
    Nudge {
        #[serde(default)]
        locale: Option<String>,
    },
    Custom {
        name: String,
        #[serde(default)]
        data: serde_json::Value,
    },
    #[serde(skip)]
    Unknown {
        kind: String,
        data: serde_json::Value,
    },
}

impl TaskPayload {
    /// Known kind, or `None` for payloads written by a newer build.
    pub fn kind(&self) -> Option<TaskKind> {
        match self {
            TaskPayload::DailyCheck { .. } => Some(TaskKind::DailyCheck),
            TaskPayload::Reminder { .. } => Some(TaskKind::Reminder),
            TaskPayload::Nudge { .. } => Some(TaskKind::Nudge),
            TaskPayload::Custom { .. } => Some(TaskKind::Custom),
            TaskPayload::Unknown { .. } => None,
        }
    }

    /// Kind tag as stored.
    pub fn kind_name(&self) -> &str {
        match self {
            TaskPayload::Unknown { kind, .. } => kind,
            other => other.kind().map(|k| k.as_str()).unwrap_or("unknown"),
        }
    }

    /// Split into the stored `(kind, data)` pair.
    pub fn to_parts(&self) -> Result<(String, serde_json::Value)> {
        if let TaskPayload::Unknown { kind, data } = self {
            return Ok((kind.clone(), data.clone()));
        }
        let mut value = serde_json::to_value(self)?;
        let kind = value["kind"].as_str().unwrap_or_default().to_string();
        let data = value["data"].take();
        Ok((kind, data))
    }

    /// Rebuild from a stored `(kind, data)` pair.
    pub fn from_parts(kind: &str, data: serde_json::Value) -> Result<Self> {
        if TaskKind::parse(kind).is_none() {
            return Ok(TaskPayload::Unknown {
                kind: kind.to_string(),
                data,
            });
        }
        let data = if data.is_null() {
            serde_json::json!({})
        } else {
            data
        };
        let payload = serde_json::from_value(serde_json::json!({ "kind": kind, "data": data }))?;
        Ok(payload)
    }
}

/// A scheduled task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Unique task ID.
    pub id: String,
    /// Owner (user/tenant) the task acts on.
    pub owner_id: String,
    /// What to do when triggered.
    pub payload: TaskPayload,
    /// Eligible once `now >= next_run_at`.
    pub next_run_at: DateTime<Utc>,
    /// Recurrence period; `None` for one-shot tasks.
    pub interval_ms: Option<u64>,
    /// Last successful completion.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Locked while in the future.
    pub lease_until: Option<DateTime<Utc>>,
    /// Handler failures since the last success.
    pub failure_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledTask {
    pub fn kind(&self) -> Option<TaskKind> {
        self.payload.kind()
    }

    pub fn is_recurring(&self) -> bool {
        self.interval_ms.is_some()
    }

    /// No lease, or the lease has expired.
    pub fn is_lockable(&self, now: DateTime<Utc>) -> bool {
        match self.lease_until {
            Some(until) => until <= now,
            None => true,
        }
    }

    /// Due and not locked.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at <= now && self.is_lockable(now)
    }
}

/// Request to create a task. The store assigns id and bookkeeping fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub owner_id: String,
    pub payload: TaskPayload,
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub interval_ms: Option<u64>,
}

// An out-of-range interval fails validation later; the first run just falls back to now.
fn first_run(interval_ms: u64) -> DateTime<Utc> {
    let now = Utc::now();
    after_ms(now, interval_ms).unwrap_or(now)
}

impl NewTask {
    pub fn new(owner_id: &str, payload: TaskPayload) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            payload,
            next_run_at: None,
            interval_ms: None,
        }
    }

    /// One-shot reminder delivered verbatim at `at`.
    pub fn reminder(owner_id: &str, message: &str, at: DateTime<Utc>) -> Self {
        Self::new(
            owner_id,
            TaskPayload::Reminder {
                message: message.to_string(),
            },
        )
        .at(at)
    }

    /// Recurring daily check-in, first run after one interval.
    pub fn daily_check(owner_id: &str, interval_ms: u64, prompt_hint: Option<String>) -> Self {
        Self::new(owner_id, TaskPayload::DailyCheck { prompt_hint })
            .at(first_run(interval_ms))
            .every(interval_ms)
    }

    /// Recurring nudge evaluation, first run after one interval.
    pub fn nudge(owner_id: &str, interval_ms: u64, locale: Option<String>) -> Self {
        Self::new(owner_id, TaskPayload::Nudge { locale })
            .at(first_run(interval_ms))
            .every(interval_ms)
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(at);
        self
    }

    pub fn every(mut self, interval_ms: u64) -> Self {
        self.interval_ms = Some(interval_ms);
        self
    }

    /// Check required fields before insertion.
    pub fn validate(&self) -> Result<()> {
        if self.owner_id.trim().is_empty() {
            return Err(NudgeClawError::Validation("owner_id is required".into()));
        }
        if self.payload.kind().is_none() {
            return Err(NudgeClawError::Validation(format!(
                "unknown task type '{}'",
                self.payload.kind_name()
            )));
        }
        if self.next_run_at.is_none() {
            return Err(NudgeClawError::Validation("next_run_at is required".into()));
        }
        match self.interval_ms {
            Some(0) => {
                return Err(NudgeClawError::Validation(
                    "interval_ms must be greater than zero".into(),
                ));
            }
            Some(ms) if ms > MAX_INTERVAL_MS => {
                return Err(NudgeClawError::Validation(format!(
                    "interval_ms must be at most {MAX_INTERVAL_MS}"
                )));
            }
            _ => {}
        }
        Ok(())
    }

    /// Validate and materialize with a fresh id.
    pub fn into_task(self, now: DateTime<Utc>) -> Result<ScheduledTask> {
        self.validate()?;
        let next_run_at = self
            .next_run_at
            .ok_or_else(|| NudgeClawError::Validation("next_run_at is required".into()))?;
        Ok(ScheduledTask {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: self.owner_id,
            payload: self.payload,
            next_run_at,
            interval_ms: self.interval_ms,
            last_run_at: None,
            lease_until: None,
            failure_count: 0,
            created_at: now,
            updated_at: now,
        })
    }
}
