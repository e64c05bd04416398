//! Dispatcher: pulls ready tasks and runs each one in isolation.
//!
//! One call to [`Dispatcher::run_cycle`] is one batch: list ready tasks,
//! then per task acquire the lease, run the handler and either complete or
//! hand the task to the retry policy. Every task runs on its own tokio task
//! with panics caught, so nothing one handler does can abort another.
//!
//! The dispatcher keeps no state between cycles. Overlapping cycles (two
//! cron triggers, or a trigger racing the internal loop) are safe: the
//! lease decides who runs a task, the loser reports it as skipped.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use futures::FutureExt;
use nudgeclaw_core::error::Result;
use nudgeclaw_core::traits::AuditLog;
use serde::Serialize;

use crate::handlers::{HandlerRegistry, is_missing_channel};
use crate::lease::LeaseManager;
use crate::retry::{ImmediateRetryPolicy, RetryDecision, RetryPolicy};
use crate::store::TaskStore;
use crate::tasks::ScheduledTask;

/// A task that failed during a cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskFailure {
    pub task_id: String,
    pub owner_id: String,
    pub kind: String,
    pub message: String,
}

/// Aggregated outcome of one dispatch cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Lost the lease race to another dispatcher.
    pub skipped: usize,
    pub failures: Vec<TaskFailure>,
}

impl CycleReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }

    fn record(&mut self, result: UnitResult) {
        match result {
            UnitResult::Succeeded => self.succeeded += 1,
            UnitResult::Skipped => self.skipped += 1,
            UnitResult::Failed(failure) => {
                self.failed += 1;
                self.failures.push(failure);
            }
        }
    }
}

enum UnitResult {
    Succeeded,
    Skipped,
    Failed(TaskFailure),
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    leases: LeaseManager,
    handlers: HandlerRegistry,
    audit: Arc<dyn AuditLog>,
    retry: Arc<dyn RetryPolicy>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        lease_ms: u64,
        handlers: HandlerRegistry,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            leases: LeaseManager::new(store.clone(), lease_ms),
            store,
            handlers,
            audit,
            retry: Arc::new(ImmediateRetryPolicy),
        }
    }

    pub fn with_retry_policy(mut self, retry: Arc<dyn RetryPolicy>) -> Self {
        self.retry = retry;
        self
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    /// Run one batch of at most `max_batch` ready tasks.
    ///
    /// Only a failure to list ready tasks is returned as an error; anything
    /// that goes wrong for an individual task ends up in the report.
    pub async fn run_cycle(&self, max_batch: usize) -> Result<CycleReport> {
        let ready = self.store.list_ready(max_batch).await?;
        let mut report = CycleReport::default();
        if ready.is_empty() {
            tracing::debug!("⏰ Dispatch cycle: nothing ready");
            return Ok(report);
        }
        tracing::info!("⏰ Dispatch cycle: {} ready task(s)", ready.len());

        let units: Vec<_> = ready
            .into_iter()
            .map(|task| {
                let leased = Arc::new(AtomicBool::new(false));
                let this = self.clone();
                let (unit_task, unit_leased) = (task.clone(), leased.clone());
                let handle = tokio::spawn(async move { this.run_unit(unit_task, &unit_leased).await });
                (task, leased, handle)
            })
            .collect();

        for (task, leased, handle) in units {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    // Died outside the handler guard; unlock only what we locked.
                    tracing::error!("❌ Task unit {} aborted: {e}", task.id);
                    let message = match e.try_into_panic() {
                        Ok(panic) => format!("task unit panicked: {}", panic_message(panic.as_ref())),
                        Err(e) => format!("task unit aborted: {e}"),
                    };
                    self.fail(&task, message, leased.load(Ordering::SeqCst)).await
                }
            };
            report.record(result);
        }

        tracing::info!(
            "✅ Dispatch cycle done: {} succeeded, {} failed, {} skipped",
            report.succeeded,
            report.failed,
            report.skipped
        );
        Ok(report)
    }

    async fn run_unit(&self, task: ScheduledTask, leased: &AtomicBool) -> UnitResult {
        match self.leases.acquire(&task.id).await {
            Ok(true) => leased.store(true, Ordering::SeqCst),
            Ok(false) => return UnitResult::Skipped,
            Err(e) => return self.fail(&task, format!("lease acquire failed: {e}"), false).await,
        }

        let Some(kind) = task.kind() else {
            tracing::warn!(
                "⚠️ Task {} has unknown kind '{}', completing without action",
                task.id,
                task.payload.kind_name()
            );
            return self.finish(&task).await;
        };
        let Some(handler) = self.handlers.get(kind) else {
            tracing::warn!("⚠️ No handler registered for '{kind}', completing task {}", task.id);
            return self.finish(&task).await;
        };

        tracing::debug!("▶️ Running {} task {} for {}", kind, task.id, task.owner_id);
        match AssertUnwindSafe(handler.handle(&task)).catch_unwind().await {
            Ok(Ok(outcome)) => {
                tracing::debug!("✔️ Task {} handled: {outcome:?}", task.id);
                self.finish(&task).await
            }
            Ok(Err(e)) => {
                if is_missing_channel(&e) {
                    tracing::info!("📭 Task {} waiting for a linked channel", task.id);
                }
                self.fail(&task, e.to_string(), true).await
            }
            Err(panic) => {
                let message = format!("handler panicked: {}", panic_message(panic.as_ref()));
                self.fail(&task, message, true).await
            }
        }
    }

    async fn finish(&self, task: &ScheduledTask) -> UnitResult {
        match self.store.complete(&task.id).await {
            Ok(()) => UnitResult::Succeeded,
            Err(e) => self.fail(task, format!("complete failed: {e}"), true).await,
        }
    }

    /// Unlock through the retry policy (when we hold the lease) and audit.
    async fn fail(&self, task: &ScheduledTask, message: String, holds_lease: bool) -> UnitResult {
        let kind = task.payload.kind_name();
        tracing::warn!("⚠️ Task {} ({kind}) for {} failed: {message}", task.id, task.owner_id);

        if holds_lease {
            let unlocked = match self.retry.on_failure(task, Utc::now()) {
                RetryDecision::ReleaseNow => self.leases.release(&task.id).await,
                RetryDecision::RetryAt(at) => {
                    tracing::debug!("🔁 Task {} retries at {at}", task.id);
                    self.store.reschedule(&task.id, at).await
                }
            };
            if let Err(e) = unlocked {
                // The lease still expires on its own.
                tracing::error!("❌ Could not unlock task {}: {e}", task.id);
            }
        }
        if let Err(e) = self.audit.record_failure(&task.owner_id, kind, &message).await {
            tracing::error!("❌ Failure log write failed for task {}: {e}", task.id);
        }

        UnitResult::Failed(TaskFailure {
            task_id: task.id.clone(),
            owner_id: task.owner_id.clone(),
            kind: kind.to_string(),
            message,
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nudge::NudgeEngine;
    use crate::persistence::SchedulerDb;
    use crate::retry::ExponentialBackoffPolicy;
    use crate::store::MemoryTaskStore;
    use crate::tasks::{NewTask, TaskKind, TaskPayload};
    use crate::testing::{CountingHandler, FailingHandler, Fakes, PanickingHandler};
    use chrono::Duration;
    use std::collections::HashSet;
    use std::sync::atomic::Ordering;

    fn past() -> chrono::DateTime<Utc> {
        Utc::now() - Duration::seconds(1)
    }

    fn dispatcher(store: Arc<dyn TaskStore>, fakes: &Fakes) -> Dispatcher {
        let registry = HandlerRegistry::with_defaults(fakes.services(), NudgeEngine::default(), "hint");
        Dispatcher::new(store, 60_000, registry, fakes.audit.clone())
    }

    #[tokio::test]
    async fn test_one_shot_reminder_delivered_and_deleted() {
        let store = Arc::new(MemoryTaskStore::new());
        let fakes = Fakes::new();
        fakes.delivery.link("u1");
        let task = store
            .create(NewTask::reminder("u1", "stretch", past()))
            .await
            .unwrap();

        let report = dispatcher(store.clone(), &fakes).run_cycle(10).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.total(), 1);
        assert_eq!(fakes.delivery.sent(), vec![("u1".into(), "stretch".into())]);
        assert!(store.get(&task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_daily_check_advances_one_interval() {
        let store = Arc::new(MemoryTaskStore::new());
        let fakes = Fakes::new();
        fakes.delivery.link("u1");
        let task = store
            .create(NewTask::daily_check("u1", 86_400_000, None).at(past()))
            .await
            .unwrap();

        let before = Utc::now();
        let report = dispatcher(store.clone(), &fakes).run_cycle(10).await.unwrap();
        assert_eq!(report.succeeded, 1);

        let after = store.get(&task.id).await.unwrap().unwrap();
        let last = after.last_run_at.unwrap();
        assert!(last >= before);
        assert_eq!((after.next_run_at - last).num_milliseconds(), 86_400_000);
        assert!(after.lease_until.is_none());
        assert!(!after.is_ready(Utc::now()));
    }

    #[tokio::test]
    async fn test_concurrent_cycles_run_task_once() {
        let store = Arc::new(MemoryTaskStore::new());
        let fakes = Fakes::new();
        let counting = Arc::new(CountingHandler {
            delay: std::time::Duration::from_millis(50),
            ..CountingHandler::default()
        });
        let registry = HandlerRegistry::new().with(TaskKind::Reminder, counting.clone());
        let dispatcher = Dispatcher::new(store.clone(), 60_000, registry, fakes.audit.clone());
        store
            .create(NewTask::reminder("u1", "hi", past()))
            .await
            .unwrap();

        let (a, b) = tokio::join!(dispatcher.run_cycle(10), dispatcher.run_cycle(10));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.succeeded + b.succeeded, 1);
        assert_eq!(a.skipped + b.skipped, 1);
        assert_eq!(a.failed + b.failed, 0);
    }

    #[tokio::test]
    async fn test_concurrent_cycles_on_two_db_handles_run_task_once() {
        let dir = std::env::temp_dir().join(format!("nudgeclaw-db-{}", uuid::Uuid::new_v4()));
        let path = dir.join("scheduler.db");
        let db_a = Arc::new(SchedulerDb::open(&path).unwrap());
        let db_b = Arc::new(SchedulerDb::open(&path).unwrap());
        let fakes = Fakes::new();
        let counting = Arc::new(CountingHandler {
            delay: std::time::Duration::from_millis(50),
            ..CountingHandler::default()
        });
        let registry = HandlerRegistry::new().with(TaskKind::Reminder, counting.clone());
        let first = Dispatcher::new(db_a.clone(), 60_000, registry.clone(), fakes.audit.clone());
        let second = Dispatcher::new(db_b.clone(), 60_000, registry, fakes.audit.clone());
        let task = db_a
            .create(NewTask::reminder("u1", "hi", past()))
            .await
            .unwrap();

        let (a, b) = tokio::join!(first.run_cycle(10), second.run_cycle(10));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.succeeded + b.succeeded, 1);
        assert_eq!(a.failed + b.failed, 0);
        assert!(db_b.get(&task.id).await.unwrap().is_none());

        db_a.close().await.unwrap();
        db_b.close().await.unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }

    /// Delegates to a memory store but panics when completing.
    struct PanicOnCompleteStore(MemoryTaskStore);

    #[async_trait::async_trait]
    impl TaskStore for PanicOnCompleteStore {
        fn name(&self) -> &str {
            "panic-on-complete"
        }
        async fn create(&self, task: NewTask) -> Result<ScheduledTask> {
            self.0.create(task).await
        }
        async fn get(&self, task_id: &str) -> Result<Option<ScheduledTask>> {
            self.0.get(task_id).await
        }
        async fn list_ready(&self, limit: usize) -> Result<Vec<ScheduledTask>> {
            self.0.list_ready(limit).await
        }
        async fn acquire_lease(&self, task_id: &str, lease_ms: u64) -> Result<bool> {
            self.0.acquire_lease(task_id, lease_ms).await
        }
        async fn renew_lease(&self, task_id: &str, lease_ms: u64) -> Result<bool> {
            self.0.renew_lease(task_id, lease_ms).await
        }
        async fn complete(&self, _task_id: &str) -> Result<()> {
            panic!("complete exploded")
        }
        async fn release_lease(&self, task_id: &str) -> Result<()> {
            self.0.release_lease(task_id).await
        }
        async fn reschedule(&self, task_id: &str, next_run_at: chrono::DateTime<Utc>) -> Result<()> {
            self.0.reschedule(task_id, next_run_at).await
        }
        async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<ScheduledTask>> {
            self.0.list_by_owner(owner_id).await
        }
        async fn delete(&self, task_id: &str) -> Result<bool> {
            self.0.delete(task_id).await
        }
    }

    #[tokio::test]
    async fn test_panic_outside_handler_is_audited_and_unlocked() {
        let store = Arc::new(PanicOnCompleteStore(MemoryTaskStore::new()));
        let fakes = Fakes::new();
        fakes.delivery.link("u1");
        let task = store
            .create(NewTask::reminder("u1", "hi", past()))
            .await
            .unwrap();

        let report = dispatcher(store.clone(), &fakes).run_cycle(10).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 0);
        assert!(report.failures[0].message.contains("complete exploded"));

        let audited = fakes.audit.failures();
        assert_eq!(audited.len(), 1);
        assert_eq!(audited[0].0, "u1");
        assert!(audited[0].2.contains("complete exploded"));

        let kept = store.get(&task.id).await.unwrap().unwrap();
        assert!(kept.lease_until.is_none());
        assert_eq!(kept.failure_count, 1);
        assert!(store.list_ready(10).await.unwrap().iter().any(|t| t.id == task.id));
    }

    #[tokio::test]
    async fn test_failing_task_isolated_and_unlocked() {
        let store = Arc::new(MemoryTaskStore::new());
        let fakes = Fakes::new();
        let mut ids = Vec::new();
        for msg in ["a", "b", "c"] {
            let task = store
                .create(NewTask::reminder("u1", msg, past()))
                .await
                .unwrap();
            ids.push(task.id);
        }
        let broken = ids[1].clone();
        let handler = Arc::new(FailingHandler {
            fail_ids: HashSet::from([broken.clone()]),
        });
        let registry = HandlerRegistry::new().with(TaskKind::Reminder, handler);
        let dispatcher = Dispatcher::new(store.clone(), 60_000, registry, fakes.audit.clone());

        let report = dispatcher.run_cycle(10).await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].task_id, broken);
        assert_eq!(report.failures[0].kind, "reminder");
        assert!(report.failures[0].message.contains("boom"));

        let left = store.get(&broken).await.unwrap().unwrap();
        assert!(left.lease_until.is_none());
        assert_eq!(left.failure_count, 1);
        assert!(left.is_ready(Utc::now()));
        assert!(store.get(&ids[0]).await.unwrap().is_none());
        assert!(store.get(&ids[2]).await.unwrap().is_none());

        let audit = fakes.audit.failures();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].0, "u1");

        // Retried on the next cycle.
        let report = dispatcher.run_cycle(10).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(store.get(&broken).await.unwrap().unwrap().failure_count, 2);
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_failure() {
        let store = Arc::new(MemoryTaskStore::new());
        let fakes = Fakes::new();
        fakes.delivery.link("u1");
        let registry = HandlerRegistry::with_defaults(fakes.services(), NudgeEngine::default(), "hint")
            .with(TaskKind::Custom, Arc::new(PanickingHandler));
        let dispatcher = Dispatcher::new(store.clone(), 60_000, registry, fakes.audit.clone());

        let custom = store
            .create(
                NewTask::new(
                    "u1",
                    TaskPayload::Custom {
                        name: "explode".into(),
                        data: serde_json::Value::Null,
                    },
                )
                .at(past()),
            )
            .await
            .unwrap();
        store
            .create(NewTask::reminder("u1", "fine", past()))
            .await
            .unwrap();

        let report = dispatcher.run_cycle(10).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert!(report.failures[0].message.contains("handler exploded"));
        let left = store.get(&custom.id).await.unwrap().unwrap();
        assert!(left.lease_until.is_none());
    }

    #[tokio::test]
    async fn test_missing_channel_is_reported_failure() {
        let store = Arc::new(MemoryTaskStore::new());
        let fakes = Fakes::new();
        let task = store
            .create(NewTask::daily_check("u1", 86_400_000, None).at(past()))
            .await
            .unwrap();

        let report = dispatcher(store.clone(), &fakes).run_cycle(10).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(report.failures[0].message.contains("no channel linked"));
        assert!(store.get(&task.id).await.unwrap().unwrap().is_ready(Utc::now()));
    }

    #[tokio::test]
    async fn test_unknown_and_unregistered_kinds_succeed() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let past_ms = past().timestamp_millis();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO scheduled_tasks
                 (id, owner_id, kind, payload, next_run_at_ms, interval_ms, last_run_at_ms,
                  lease_until_ms, failure_count, created_at_ms, updated_at_ms)
                 VALUES ('t-x', 'u1', 'weekly_digest', '{}', ?1, NULL, NULL, NULL, 0, ?1, ?1)",
                [past_ms],
            )
        })
        .unwrap();
        db.create(NewTask::reminder("u1", "hi", past())).await.unwrap();

        let fakes = Fakes::new();
        let dispatcher = Dispatcher::new(db.clone(), 60_000, HandlerRegistry::new(), fakes.audit.clone());
        let report = dispatcher.run_cycle(10).await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert!(db.get("t-x").await.unwrap().is_none());
        assert!(fakes.audit.failures().is_empty());
    }

    #[tokio::test]
    async fn test_leased_task_is_not_listed() {
        let store = Arc::new(MemoryTaskStore::new());
        let fakes = Fakes::new();
        fakes.delivery.link("u1");
        let task = store
            .create(NewTask::reminder("u1", "hi", past()))
            .await
            .unwrap();
        let d = dispatcher(store.clone(), &fakes);
        assert!(d.leases().acquire(&task.id).await.unwrap());

        let report = d.run_cycle(10).await.unwrap();
        assert_eq!(report.total(), 0);
        assert!(fakes.delivery.sent().is_empty());
    }

    #[tokio::test]
    async fn test_backoff_policy_moves_due_time() {
        let store = Arc::new(MemoryTaskStore::new());
        let fakes = Fakes::new();
        let task = store
            .create(NewTask::reminder("u1", "hi", past()))
            .await
            .unwrap();
        let handler = Arc::new(FailingHandler {
            fail_ids: HashSet::from([task.id.clone()]),
        });
        let registry = HandlerRegistry::new().with(TaskKind::Reminder, handler);
        let dispatcher = Dispatcher::new(store.clone(), 60_000, registry, fakes.audit.clone())
            .with_retry_policy(Arc::new(ExponentialBackoffPolicy {
                base_ms: 60_000,
                max_ms: 3_600_000,
            }));

        let report = dispatcher.run_cycle(10).await.unwrap();
        assert_eq!(report.failed, 1);
        let left = store.get(&task.id).await.unwrap().unwrap();
        assert!(left.lease_until.is_none());
        assert!(left.next_run_at > Utc::now() + Duration::seconds(30));
        assert_eq!(dispatcher.run_cycle(10).await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_store_unavailable_aborts_cycle() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        db.close().await.unwrap();
        let fakes = Fakes::new();
        let dispatcher = dispatcher(db, &fakes);
        assert!(dispatcher.run_cycle(10).await.is_err());
    }

    #[tokio::test]
    async fn test_batch_limit() {
        let store = Arc::new(MemoryTaskStore::new());
        let fakes = Fakes::new();
        fakes.delivery.link("u1");
        for i in 0..5 {
            store
                .create(NewTask::reminder("u1", &format!("r{i}"), past()))
                .await
                .unwrap();
        }
        let report = dispatcher(store.clone(), &fakes).run_cycle(2).await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(store.len(), 3);
    }
}
