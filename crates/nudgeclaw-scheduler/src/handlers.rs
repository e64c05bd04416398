//! Task handlers: one per task kind, each turning a due task into a message.
//!
//! Handlers only report back. Lease and schedule bookkeeping stays in the
//! dispatcher, so a handler can never leave a task half-completed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Timelike, Utc};
use nudgeclaw_core::error::{DeliveryError, NudgeClawError, Result};
use nudgeclaw_core::traits::{
    BehaviorProvider, ConversationLog, DeliveryChannel, MessageGenerator, NudgeStateStore,
};
use nudgeclaw_core::types::Role;

use crate::nudge::NudgeEngine;
use crate::tasks::{ScheduledTask, TaskKind, TaskPayload};

const DEFAULT_REMINDER_TEXT: &str = "⏰ Reminder";

/// What a successful handler run did.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    Delivered { text: String },
    /// Nothing to send this time; still counts as success.
    Skipped { reason: String },
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, task: &ScheduledTask) -> Result<HandlerOutcome>;
}

/// External collaborators the built-in handlers talk to.
#[derive(Clone)]
pub struct Services {
    pub delivery: Arc<dyn DeliveryChannel>,
    pub generator: Arc<dyn MessageGenerator>,
    pub conversation: Arc<dyn ConversationLog>,
    pub behavior: Arc<dyn BehaviorProvider>,
    pub nudge_state: Arc<dyn NudgeStateStore>,
}

impl Services {
    /// Send, then log the message as an assistant turn.
    ///
    /// A log failure after a successful send is only a warning: failing the
    /// task would make the next cycle send the same message again.
    async fn deliver(&self, owner_id: &str, text: &str, source: &str) -> Result<HandlerOutcome> {
        self.delivery.send(owner_id, text).await?;
        if let Err(e) = self
            .conversation
            .append(owner_id, Role::Assistant, text, source)
            .await
        {
            tracing::warn!("⚠️ Conversation log append failed for {owner_id}: {e}");
        }
        Ok(HandlerOutcome::Delivered {
            text: text.to_string(),
        })
    }
}

// ── daily_check ────────────────────────────────────────────

pub struct DailyCheckHandler {
    services: Services,
    default_hint: String,
}

impl DailyCheckHandler {
    pub fn new(services: Services, default_hint: &str) -> Self {
        Self {
            services,
            default_hint: default_hint.to_string(),
        }
    }
}

#[async_trait]
impl TaskHandler for DailyCheckHandler {
    fn name(&self) -> &str {
        "daily_check"
    }

    async fn handle(&self, task: &ScheduledTask) -> Result<HandlerOutcome> {
        if !self.services.delivery.has_channel(&task.owner_id).await? {
            return Err(DeliveryError::NoChannel(task.owner_id.clone()).into());
        }
        let hint = match &task.payload {
            TaskPayload::DailyCheck {
                prompt_hint: Some(hint),
            } if !hint.trim().is_empty() => hint.as_str(),
            _ => self.default_hint.as_str(),
        };
        let text = self
            .services
            .generator
            .generate(&task.owner_id, hint)
            .await?;
        tracing::debug!(
            "💬 Daily check for {} generated via {}",
            task.owner_id,
            self.services.generator.name()
        );
        self.services
            .deliver(&task.owner_id, &text, self.name())
            .await
    }
}

// ── reminder ───────────────────────────────────────────────

pub struct ReminderHandler {
    services: Services,
}

impl ReminderHandler {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl TaskHandler for ReminderHandler {
    fn name(&self) -> &str {
        "reminder"
    }

    async fn handle(&self, task: &ScheduledTask) -> Result<HandlerOutcome> {
        let text = match &task.payload {
            TaskPayload::Reminder { message } if !message.trim().is_empty() => message.as_str(),
            _ => DEFAULT_REMINDER_TEXT,
        };
        self.services
            .deliver(&task.owner_id, text, self.name())
            .await
    }
}

// ── nudge ──────────────────────────────────────────────────

pub struct NudgeHandler {
    services: Services,
    engine: NudgeEngine,
}

impl NudgeHandler {
    pub fn new(services: Services, engine: NudgeEngine) -> Self {
        Self { services, engine }
    }

    async fn handle_at(&self, task: &ScheduledTask, current_hour: u8) -> Result<HandlerOutcome> {
        let locale = match &task.payload {
            TaskPayload::Nudge { locale } => locale.as_deref(),
            _ => None,
        };
        let snapshot = self
            .services
            .behavior
            .behavior_snapshot(&task.owner_id)
            .await?;
        let decision = self.engine.decide(&snapshot, current_hour, locale);
        if !decision.should_send {
            tracing::debug!(
                "🔕 Nudge suppressed for {} (level {}, {:.1}h idle)",
                task.owner_id,
                decision.level,
                snapshot.hours_since_last_interaction
            );
            return Ok(HandlerOutcome::Skipped {
                reason: format!("suppressed at level {}", decision.level),
            });
        }

        let locale = locale.unwrap_or(self.engine.default_locale());
        let text = if self.engine.wants_generated(decision.level) {
            let hint = self.engine.prompt_hint(&decision, locale);
            match self.services.generator.generate(&task.owner_id, &hint).await {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!("⚠️ Nudge generation failed, using template: {e}");
                    decision.message.clone()
                }
            }
        } else {
            decision.message.clone()
        };

        let outcome = self
            .services
            .deliver(&task.owner_id, &text, self.name())
            .await?;
        match self
            .engine
            .record_non_response(self.services.nudge_state.as_ref(), &task.owner_id)
            .await
        {
            Ok(count) => tracing::info!(
                "📣 Nudge L{} ({}) sent to {} ({count} unanswered)",
                decision.level,
                decision.tone,
                task.owner_id
            ),
            Err(e) => tracing::warn!("⚠️ Could not record non-response for {}: {e}", task.owner_id),
        }
        Ok(outcome)
    }
}

#[async_trait]
impl TaskHandler for NudgeHandler {
    fn name(&self) -> &str {
        "nudge"
    }

    async fn handle(&self, task: &ScheduledTask) -> Result<HandlerOutcome> {
        self.handle_at(task, Utc::now().hour() as u8).await
    }
}

// ── custom ─────────────────────────────────────────────────

/// Placeholder for integrator-defined kinds: succeeds without side effects.
pub struct CustomHandler;

#[async_trait]
impl TaskHandler for CustomHandler {
    fn name(&self) -> &str {
        "custom"
    }

    async fn handle(&self, task: &ScheduledTask) -> Result<HandlerOutcome> {
        let name = match &task.payload {
            TaskPayload::Custom { name, .. } => name.as_str(),
            _ => "",
        };
        tracing::debug!("🧩 Custom task '{name}' for {} (no-op)", task.owner_id);
        Ok(HandlerOutcome::Skipped {
            reason: "custom tasks have no built-in action".into(),
        })
    }
}

/// Handlers keyed by task kind.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in handler for every known kind.
    pub fn with_defaults(services: Services, engine: NudgeEngine, daily_hint: &str) -> Self {
        Self::new()
            .with(
                TaskKind::DailyCheck,
                Arc::new(DailyCheckHandler::new(services.clone(), daily_hint)),
            )
            .with(TaskKind::Reminder, Arc::new(ReminderHandler::new(services.clone())))
            .with(TaskKind::Nudge, Arc::new(NudgeHandler::new(services, engine)))
            .with(TaskKind::Custom, Arc::new(CustomHandler))
    }

    /// Register or replace the handler for `kind`.
    pub fn with(mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Convenience for callers matching on missing prerequisites.
pub fn is_missing_channel(err: &NudgeClawError) -> bool {
    matches!(err, NudgeClawError::Delivery(DeliveryError::NoChannel(_)))
}
