//! Behavioral context for nudge decisions.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::UserBehaviorSnapshot;

/// Supplies the behavioral snapshot of an owner.
#[async_trait]
pub trait BehaviorProvider: Send + Sync {
    async fn behavior_snapshot(&self, owner_id: &str) -> Result<UserBehaviorSnapshot>;
}

/// Persisted counter of nudges sent without a reply.
///
/// The scheduler increments it; the conversation layer resets it whenever
/// a new user message arrives.
#[async_trait]
pub trait NudgeStateStore: Send + Sync {
    /// Increment and return the new count.
    async fn increment_non_responses(&self, owner_id: &str) -> Result<u32>;
    async fn reset_non_responses(&self, owner_id: &str) -> Result<()>;
    async fn non_responses(&self, owner_id: &str) -> Result<u32>;
}
