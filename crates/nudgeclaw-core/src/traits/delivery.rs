//! Outbound delivery to the owner.

use async_trait::async_trait;

use crate::error::DeliveryError;

/// A channel that can push a text message to an owner.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Whether the owner has any reachable channel linked. A lookup that
    /// could not be answered is `DeliveryError::Failed`, not `false`.
    async fn has_channel(&self, owner_id: &str) -> Result<bool, DeliveryError>;

    /// Send `text`. `DeliveryError::NoChannel` when nothing is linked.
    async fn send(&self, owner_id: &str, text: &str) -> Result<(), DeliveryError>;
}
