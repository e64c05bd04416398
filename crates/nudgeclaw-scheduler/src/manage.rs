//! Task management: the operations behind "enable daily check-ins",
//! "disable notifications" and per-owner task CRUD.

use std::sync::Arc;

use nudgeclaw_core::config::DailyCheckConfig;
use nudgeclaw_core::error::{NudgeClawError, Result};

use crate::store::TaskStore;
use crate::tasks::{NewTask, ScheduledTask, TaskKind};

#[derive(Clone)]
pub struct TaskManager {
    store: Arc<dyn TaskStore>,
    daily_interval_ms: u64,
    nudge_interval_ms: u64,
}

impl TaskManager {
    pub fn new(store: Arc<dyn TaskStore>, daily: &DailyCheckConfig, nudge_interval_ms: u64) -> Self {
        Self {
            store,
            daily_interval_ms: daily.interval_ms,
            nudge_interval_ms,
        }
    }

    pub async fn create(&self, task: NewTask) -> Result<ScheduledTask> {
        let task = self.store.create(task).await?;
        tracing::info!(
            "📅 Task added: {} ({}) for {}",
            task.id,
            task.payload.kind_name(),
            task.owner_id
        );
        Ok(task)
    }

    pub async fn get(&self, task_id: &str) -> Result<ScheduledTask> {
        self.store
            .get(task_id)
            .await?
            .ok_or_else(|| NudgeClawError::TaskNotFound(task_id.to_string()))
    }

    pub async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<ScheduledTask>> {
        self.store.list_by_owner(owner_id).await
    }

    pub async fn delete(&self, task_id: &str) -> Result<()> {
        if self.store.delete(task_id).await? {
            tracing::info!("🗑️ Task removed: {task_id}");
            Ok(())
        } else {
            Err(NudgeClawError::TaskNotFound(task_id.to_string()))
        }
    }

    /// Schedule the owner's daily check-in unless one exists already.
    pub async fn enable_daily_check(&self, owner_id: &str) -> Result<ScheduledTask> {
        if let Some(existing) = self.find_kind(owner_id, TaskKind::DailyCheck).await? {
            return Ok(existing);
        }
        self.create(NewTask::daily_check(owner_id, self.daily_interval_ms, None))
            .await
    }

    /// Schedule recurring nudge evaluation unless one exists already.
    pub async fn enable_nudges(
        &self,
        owner_id: &str,
        locale: Option<String>,
    ) -> Result<ScheduledTask> {
        if let Some(existing) = self.find_kind(owner_id, TaskKind::Nudge).await? {
            return Ok(existing);
        }
        self.create(NewTask::nudge(owner_id, self.nudge_interval_ms, locale))
            .await
    }

    /// Remove the owner's daily check-ins and nudges. One-shot reminders
    /// the owner set explicitly are kept. Returns how many were removed.
    pub async fn disable_notifications(&self, owner_id: &str) -> Result<usize> {
        let mut removed = 0;
        for task in self.store.list_by_owner(owner_id).await? {
            if matches!(task.kind(), Some(TaskKind::DailyCheck | TaskKind::Nudge))
                && self.store.delete(&task.id).await?
            {
                removed += 1;
            }
        }
        tracing::info!("🔕 Notifications disabled for {owner_id} ({removed} task(s) removed)");
        Ok(removed)
    }

    async fn find_kind(&self, owner_id: &str, kind: TaskKind) -> Result<Option<ScheduledTask>> {
        Ok(self
            .store
            .list_by_owner(owner_id)
            .await?
            .into_iter()
            .find(|t| t.kind() == Some(kind)))
    }
}
