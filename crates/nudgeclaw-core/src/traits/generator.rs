//! Personalized message generation.

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait MessageGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, owner_id: &str, prompt_hint: &str) -> Result<String>;
}
