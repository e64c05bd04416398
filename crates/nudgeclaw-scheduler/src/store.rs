//! Task store contract and an in-process implementation.
//!
//! Every lease operation is a single atomic step against the store: the
//! lockability check and the lease write happen together, so two
//! dispatchers can never both see a task as theirs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nudgeclaw_core::error::{NudgeClawError, Result};

use crate::tasks::{NewTask, ScheduledTask, after_ms};

/// Persistent collection of scheduled tasks with atomic lease operations.
#[async_trait]
pub trait TaskStore: Send + Sync {
    fn name(&self) -> &str;

    /// Insert a new task; rejects missing owner, kind or due time.
    async fn create(&self, task: NewTask) -> Result<ScheduledTask>;

    async fn get(&self, task_id: &str) -> Result<Option<ScheduledTask>>;

    /// Up to `limit` ready tasks, earliest `next_run_at` first.
    async fn list_ready(&self, limit: usize) -> Result<Vec<ScheduledTask>>;

    /// Set `lease_until = now + lease_ms` iff the task is lockable.
    /// Returns false when someone else holds a live lease or the task is gone.
    async fn acquire_lease(&self, task_id: &str, lease_ms: u64) -> Result<bool>;

    /// Push a live lease out to `now + lease_ms`. Returns false when there
    /// is no live lease to extend.
    async fn renew_lease(&self, task_id: &str, lease_ms: u64) -> Result<bool>;

    /// Recurring: advance by `interval_ms` from now and unlock.
    /// One-shot: delete. Missing task: no-op.
    async fn complete(&self, task_id: &str) -> Result<()>;

    /// Unlock after a failure, leaving the schedule untouched.
    async fn release_lease(&self, task_id: &str) -> Result<()>;

    /// Unlock after a failure and move the due time to `next_run_at`.
    async fn reschedule(&self, task_id: &str, next_run_at: DateTime<Utc>) -> Result<()>;

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<ScheduledTask>>;

    /// Returns whether a task was removed.
    async fn delete(&self, task_id: &str) -> Result<bool>;

    /// Flush and release the underlying handle.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory task store: for tests and ephemeral single-process runs.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<String, ScheduledTask>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, ScheduledTask>>> {
        self.tasks
            .lock()
            .map_err(|e| NudgeClawError::Database(format!("task store poisoned: {e}")))
    }

    /// Number of stored tasks.
    pub fn len(&self) -> usize {
        self.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create(&self, task: NewTask) -> Result<ScheduledTask> {
        let task = task.into_task(Utc::now())?;
        self.lock()?.insert(task.id.clone(), task.clone());
        tracing::debug!("📅 Task created: {} ({})", task.id, task.payload.kind_name());
        Ok(task)
    }

    async fn get(&self, task_id: &str) -> Result<Option<ScheduledTask>> {
        Ok(self.lock()?.get(task_id).cloned())
    }

    async fn list_ready(&self, limit: usize) -> Result<Vec<ScheduledTask>> {
        let now = Utc::now();
        let mut ready: Vec<ScheduledTask> = self
            .lock()?
            .values()
            .filter(|t| t.is_ready(now))
            .cloned()
            .collect();
        ready.sort_by_key(|t| t.next_run_at);
        ready.truncate(limit);
        Ok(ready)
    }

    async fn acquire_lease(&self, task_id: &str, lease_ms: u64) -> Result<bool> {
        let now = Utc::now();
        let until = after_ms(now, lease_ms)?;
        let mut tasks = self.lock()?;
        match tasks.get_mut(task_id) {
            Some(task) if task.is_lockable(now) => {
                task.lease_until = Some(until);
                task.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn renew_lease(&self, task_id: &str, lease_ms: u64) -> Result<bool> {
        let now = Utc::now();
        let until = after_ms(now, lease_ms)?;
        let mut tasks = self.lock()?;
        match tasks.get_mut(task_id) {
            Some(task) if !task.is_lockable(now) => {
                task.lease_until = Some(until);
                task.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, task_id: &str) -> Result<()> {
        let now = Utc::now();
        let mut tasks = self.lock()?;
        let interval = match tasks.get(task_id) {
            Some(task) => task.interval_ms,
            None => return Ok(()),
        };
        match interval {
            Some(interval_ms) => {
                let next_run_at = after_ms(now, interval_ms)?;
                if let Some(task) = tasks.get_mut(task_id) {
                    task.next_run_at = next_run_at;
                    task.last_run_at = Some(now);
                    task.lease_until = None;
                    task.failure_count = 0;
                    task.updated_at = now;
                }
            }
            None => {
                tasks.remove(task_id);
            }
        }
        Ok(())
    }

    async fn release_lease(&self, task_id: &str) -> Result<()> {
        if let Some(task) = self.lock()?.get_mut(task_id) {
            task.lease_until = None;
            task.failure_count = task.failure_count.saturating_add(1);
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn reschedule(&self, task_id: &str, next_run_at: DateTime<Utc>) -> Result<()> {
        if let Some(task) = self.lock()?.get_mut(task_id) {
            task.lease_until = None;
            task.next_run_at = next_run_at;
            task.failure_count = task.failure_count.saturating_add(1);
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<ScheduledTask>> {
        let mut tasks: Vec<ScheduledTask> = self
            .lock()?
            .values()
            .filter(|t| t.owner_id == owner_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn delete(&self, task_id: &str) -> Result<bool> {
        Ok(self.lock()?.remove(task_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use crate::testing::store_contract;

    #[tokio::test]
    async fn test_memory_store_contract() {
        store_contract(&MemoryTaskStore::new()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_single_winner() {
        let store = std::sync::Arc::new(MemoryTaskStore::new());
        let task = store
            .create(NewTask::reminder("u1", "hi", Utc::now() - Duration::seconds(1)))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let id = task.id.clone();
            handles.push(tokio::spawn(async move {
                store.acquire_lease(&id, 60_000).await.unwrap()
            }));
        }
        let mut wins = 0;
        for h in handles {
            if h.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_unrepresentable_interval_fails_without_poisoning() {
        let store = MemoryTaskStore::new();
        let task = store
            .create(NewTask::reminder("u1", "hi", Utc::now() - Duration::seconds(1)).every(60_000))
            .await
            .unwrap();
        store
            .lock()
            .unwrap()
            .get_mut(&task.id)
            .unwrap()
            .interval_ms = Some(9_000_000_000_000_000_000);

        assert!(store.acquire_lease(&task.id, 60_000).await.unwrap());
        assert!(matches!(
            store.complete(&task.id).await,
            Err(NudgeClawError::Validation(_))
        ));
        // The store stays usable and the lease can still be released.
        store.release_lease(&task.id).await.unwrap();
        let kept = store.get(&task.id).await.unwrap().unwrap();
        assert!(kept.lease_until.is_none());
        assert_eq!(kept.failure_count, 1);
    }
}
