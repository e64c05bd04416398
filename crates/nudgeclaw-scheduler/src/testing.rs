//! Shared fakes and the store contract, compiled for tests only.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use nudgeclaw_core::error::{DeliveryError, NudgeClawError, Result};
use nudgeclaw_core::traits::{
    AuditLog, BehaviorProvider, ConversationLog, DeliveryChannel, MessageGenerator,
    NudgeStateStore,
};
use nudgeclaw_core::types::{Role, UserBehaviorSnapshot};

use crate::handlers::{HandlerOutcome, Services, TaskHandler};
use crate::store::TaskStore;
use crate::tasks::{MAX_INTERVAL_MS, NewTask, ScheduledTask, TaskPayload};

/// Delivery that records every send. Owners must be linked first.
#[derive(Default)]
pub struct RecordingDelivery {
    linked: Mutex<HashSet<String>>,
    sent: Mutex<Vec<(String, String)>>,
    fail: bool,
}

impl RecordingDelivery {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn link(&self, owner_id: &str) {
        self.linked.lock().unwrap().insert(owner_id.to_string());
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryChannel for RecordingDelivery {
    async fn has_channel(&self, owner_id: &str) -> Result<bool, DeliveryError> {
        Ok(self.linked.lock().unwrap().contains(owner_id))
    }

    async fn send(&self, owner_id: &str, text: &str) -> Result<(), DeliveryError> {
        if !self.has_channel(owner_id).await? {
            return Err(DeliveryError::NoChannel(owner_id.to_string()));
        }
        if self.fail {
            return Err(DeliveryError::Failed("channel down".into()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((owner_id.to_string(), text.to_string()));
        Ok(())
    }
}

/// Generator returning a fixed text, or always failing.
pub struct FixedGenerator {
    text: Option<String>,
    calls: AtomicUsize,
}

impl FixedGenerator {
    pub fn new(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            text: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageGenerator for FixedGenerator {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn generate(&self, _owner_id: &str, _prompt_hint: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.text
            .clone()
            .ok_or_else(|| NudgeClawError::Generation("model offline".into()))
    }
}

#[derive(Default)]
pub struct MemoryConversationLog {
    entries: Mutex<Vec<(String, Role, String, String)>>,
}

impl MemoryConversationLog {
    pub fn entries(&self) -> Vec<(String, Role, String, String)> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConversationLog for MemoryConversationLog {
    async fn append(&self, owner_id: &str, role: Role, text: &str, source: &str) -> Result<()> {
        self.entries.lock().unwrap().push((
            owner_id.to_string(),
            role,
            text.to_string(),
            source.to_string(),
        ));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAuditLog {
    failures: Mutex<Vec<(String, String, String)>>,
}

impl MemoryAuditLog {
    pub fn failures(&self) -> Vec<(String, String, String)> {
        self.failures.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn record_failure(&self, owner_id: &str, task_kind: &str, message: &str) -> Result<()> {
        self.failures.lock().unwrap().push((
            owner_id.to_string(),
            task_kind.to_string(),
            message.to_string(),
        ));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryNudgeState {
    counts: Mutex<HashMap<String, u32>>,
}

#[async_trait]
impl NudgeStateStore for MemoryNudgeState {
    async fn increment_non_responses(&self, owner_id: &str) -> Result<u32> {
        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(owner_id.to_string()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn reset_non_responses(&self, owner_id: &str) -> Result<()> {
        self.counts.lock().unwrap().remove(owner_id);
        Ok(())
    }

    async fn non_responses(&self, owner_id: &str) -> Result<u32> {
        Ok(self.counts.lock().unwrap().get(owner_id).copied().unwrap_or(0))
    }
}

/// Same snapshot for every owner.
pub struct FixedBehavior(pub UserBehaviorSnapshot);

#[async_trait]
impl BehaviorProvider for FixedBehavior {
    async fn behavior_snapshot(&self, _owner_id: &str) -> Result<UserBehaviorSnapshot> {
        Ok(self.0.clone())
    }
}

/// Every fake collaborator, kept typed so tests can inspect them.
pub struct Fakes {
    pub delivery: Arc<RecordingDelivery>,
    pub generator: Arc<FixedGenerator>,
    pub conversation: Arc<MemoryConversationLog>,
    pub audit: Arc<MemoryAuditLog>,
    pub nudge_state: Arc<MemoryNudgeState>,
    pub behavior: Arc<FixedBehavior>,
}

impl Fakes {
    pub fn new() -> Self {
        Self::with_behavior(UserBehaviorSnapshot::unknown(0.0))
    }

    pub fn with_behavior(snapshot: UserBehaviorSnapshot) -> Self {
        Self {
            delivery: Arc::new(RecordingDelivery::default()),
            generator: Arc::new(FixedGenerator::new("generated hello")),
            conversation: Arc::new(MemoryConversationLog::default()),
            audit: Arc::new(MemoryAuditLog::default()),
            nudge_state: Arc::new(MemoryNudgeState::default()),
            behavior: Arc::new(FixedBehavior(snapshot)),
        }
    }

    pub fn services(&self) -> Services {
        Services {
            delivery: self.delivery.clone(),
            generator: self.generator.clone(),
            conversation: self.conversation.clone(),
            behavior: self.behavior.clone(),
            nudge_state: self.nudge_state.clone(),
        }
    }
}

/// Fails for the listed task ids, succeeds otherwise.
pub struct FailingHandler {
    pub fail_ids: HashSet<String>,
}

#[async_trait]
impl TaskHandler for FailingHandler {
    fn name(&self) -> &str {
        "failing"
    }

    async fn handle(&self, task: &ScheduledTask) -> Result<HandlerOutcome> {
        if self.fail_ids.contains(&task.id) {
            return Err(NudgeClawError::Other("boom".into()));
        }
        Ok(HandlerOutcome::Skipped {
            reason: "nothing to do".into(),
        })
    }
}

pub struct PanickingHandler;

#[async_trait]
impl TaskHandler for PanickingHandler {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn handle(&self, _task: &ScheduledTask) -> Result<HandlerOutcome> {
        panic!("handler exploded");
    }
}

/// Counts invocations and holds each one open for `delay`.
#[derive(Default)]
pub struct CountingHandler {
    pub calls: AtomicUsize,
    pub delay: std::time::Duration,
}

#[async_trait]
impl TaskHandler for CountingHandler {
    fn name(&self) -> &str {
        "counting"
    }

    async fn handle(&self, _task: &ScheduledTask) -> Result<HandlerOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(HandlerOutcome::Skipped {
            reason: "counted".into(),
        })
    }
}

fn past() -> chrono::DateTime<Utc> {
    Utc::now() - Duration::seconds(1)
}

/// Behavior every `TaskStore` implementation must share.
pub async fn store_contract<S: TaskStore + ?Sized>(store: &S) {
    // Validation
    assert!(matches!(
        store.create(NewTask::reminder("", "hi", past())).await,
        Err(NudgeClawError::Validation(_))
    ));
    assert!(
        store
            .create(NewTask::new("u1", TaskPayload::Reminder { message: "hi".into() }))
            .await
            .is_err()
    );
    assert!(
        store
            .create(NewTask::reminder("u1", "hi", past()).every(0))
            .await
            .is_err()
    );

    // Readiness and ordering
    let later = store
        .create(NewTask::reminder("u1", "later", Utc::now() - Duration::seconds(10)))
        .await
        .unwrap();
    let earlier = store
        .create(NewTask::reminder("u1", "earlier", Utc::now() - Duration::seconds(60)))
        .await
        .unwrap();
    store
        .create(NewTask::reminder("u2", "future", Utc::now() + Duration::hours(1)))
        .await
        .unwrap();
    assert_eq!(earlier.created_at, earlier.updated_at);

    let ready = store.list_ready(10).await.unwrap();
    let ids: Vec<&str> = ready.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec![earlier.id.as_str(), later.id.as_str()]);
    assert_eq!(store.list_ready(1).await.unwrap().len(), 1);

    // Lease exclusivity
    assert!(store.acquire_lease(&earlier.id, 60_000).await.unwrap());
    assert!(!store.acquire_lease(&earlier.id, 60_000).await.unwrap());
    let ready = store.list_ready(10).await.unwrap();
    assert!(ready.iter().all(|t| t.id != earlier.id));
    assert!(store.renew_lease(&earlier.id, 60_000).await.unwrap());
    assert!(!store.renew_lease(&later.id, 60_000).await.unwrap());

    // Release keeps the schedule and counts the failure
    store.release_lease(&earlier.id).await.unwrap();
    let released = store.get(&earlier.id).await.unwrap().unwrap();
    assert!(released.lease_until.is_none());
    assert_eq!(released.failure_count, 1);
    assert_eq!(
        released.next_run_at.timestamp_millis(),
        earlier.next_run_at.timestamp_millis()
    );
    assert!(released.last_run_at.is_none());
    assert!(store.list_ready(10).await.unwrap().iter().any(|t| t.id == earlier.id));

    // Reschedule moves the due time
    let moved_to = Utc::now() + Duration::minutes(30);
    store.acquire_lease(&later.id, 60_000).await.unwrap();
    store.reschedule(&later.id, moved_to).await.unwrap();
    let moved = store.get(&later.id).await.unwrap().unwrap();
    assert!(moved.lease_until.is_none());
    assert_eq!(moved.next_run_at.timestamp_millis(), moved_to.timestamp_millis());
    assert!(!moved.is_ready(Utc::now()));

    // One-shot completion deletes
    store.acquire_lease(&earlier.id, 60_000).await.unwrap();
    store.complete(&earlier.id).await.unwrap();
    assert!(store.get(&earlier.id).await.unwrap().is_none());

    // Recurring completion advances and resets
    let recurring = store
        .create(NewTask::daily_check("u3", 86_400_000, None).at(past()))
        .await
        .unwrap();
    store.acquire_lease(&recurring.id, 60_000).await.unwrap();
    store.release_lease(&recurring.id).await.unwrap();
    store.acquire_lease(&recurring.id, 60_000).await.unwrap();
    let before = Utc::now();
    store.complete(&recurring.id).await.unwrap();
    let after = Utc::now();
    let done = store.get(&recurring.id).await.unwrap().unwrap();
    assert!(done.lease_until.is_none());
    assert_eq!(done.failure_count, 0);
    let last = done.last_run_at.unwrap();
    assert!(last.timestamp_millis() >= before.timestamp_millis());
    assert!(last.timestamp_millis() <= after.timestamp_millis());
    assert_eq!(
        (done.next_run_at - last).num_milliseconds(),
        86_400_000
    );

    // Missing tasks are no-ops
    store.complete("missing").await.unwrap();
    store.release_lease("missing").await.unwrap();
    store.reschedule("missing", Utc::now()).await.unwrap();
    assert!(!store.acquire_lease("missing", 60_000).await.unwrap());
    assert!(store.get("missing").await.unwrap().is_none());

    // Per-owner listing and deletion
    let owned = store.list_by_owner("u1").await.unwrap();
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].id, later.id);
    assert!(store.delete(&later.id).await.unwrap());
    assert!(!store.delete(&later.id).await.unwrap());
    assert!(store.list_by_owner("u1").await.unwrap().is_empty());
    assert_eq!(store.list_by_owner("u2").await.unwrap().len(), 1);

    // Out-of-range intervals and leases are rejected without harming the store
    for bad in [u64::MAX - 10, 9_000_000_000_000_000_000, MAX_INTERVAL_MS + 1] {
        assert!(matches!(
            store.create(NewTask::reminder("u4", "far", past()).every(bad)).await,
            Err(NudgeClawError::Validation(_))
        ));
    }
    let yearly = store
        .create(NewTask::reminder("u4", "yearly", past()).every(MAX_INTERVAL_MS))
        .await
        .unwrap();
    assert!(matches!(
        store.acquire_lease(&yearly.id, u64::MAX).await,
        Err(NudgeClawError::Validation(_))
    ));
    assert!(store.acquire_lease(&yearly.id, 60_000).await.unwrap());
    assert!(matches!(
        store.renew_lease(&yearly.id, u64::MAX).await,
        Err(NudgeClawError::Validation(_))
    ));
    store.complete(&yearly.id).await.unwrap();
    let advanced = store.get(&yearly.id).await.unwrap().unwrap();
    assert_eq!(advanced.interval_ms, Some(MAX_INTERVAL_MS));
    assert_eq!(
        (advanced.next_run_at - advanced.last_run_at.unwrap()).num_milliseconds(),
        MAX_INTERVAL_MS as i64
    );
    assert!(store.list_ready(10).await.unwrap().iter().all(|t| t.id != yearly.id));
    assert_eq!(store.list_by_owner("u4").await.unwrap().len(), 1);
}
