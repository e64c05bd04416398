//! Append-only logs: conversation replay and failure audit.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::Role;

/// Conversation history, used for UI replay.
#[async_trait]
pub trait ConversationLog: Send + Sync {
    /// `source` tags the originating handler (e.g. "reminder", "nudge").
    async fn append(&self, owner_id: &str, role: Role, text: &str, source: &str) -> Result<()>;
}

/// Operator-facing record of task failures.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record_failure(&self, owner_id: &str, task_kind: &str, message: &str) -> Result<()>;
}
