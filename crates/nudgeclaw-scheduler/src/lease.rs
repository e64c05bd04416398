//! Lease manager: self-expiring exclusive claims on task records.
//!
//! The lease lives on the task row itself. A crashed worker simply lets it
//! expire, after which any dispatcher may claim the task again.

use std::sync::Arc;

use nudgeclaw_core::error::Result;

use crate::store::TaskStore;

#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn TaskStore>,
    lease_ms: u64,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn TaskStore>, lease_ms: u64) -> Self {
        Self { store, lease_ms }
    }

    pub fn lease_ms(&self) -> u64 {
        self.lease_ms
    }

    /// Claim the task; false means another worker holds it (or it is gone).
    pub async fn acquire(&self, task_id: &str) -> Result<bool> {
        let acquired = self.store.acquire_lease(task_id, self.lease_ms).await?;
        if !acquired {
            tracing::debug!("🔒 Lease contention on task {task_id}");
        }
        Ok(acquired)
    }

    /// Re-arm a lease the caller already holds, for handlers that run long.
    pub async fn extend(&self, task_id: &str) -> Result<bool> {
        self.store.renew_lease(task_id, self.lease_ms).await
    }

    /// Drop the claim without touching the schedule.
    pub async fn release(&self, task_id: &str) -> Result<()> {
        self.store.release_lease(task_id).await
    }
}
