//! Wiring: builds the production object graph from config.

use std::sync::Arc;

use nudgeclaw_core::config::NudgeClawConfig;
use nudgeclaw_core::error::Result;
use nudgeclaw_core::traits::MessageGenerator;
use tokio::task::JoinHandle;

use crate::channels::HttpDelivery;
use crate::dispatch::{CycleReport, Dispatcher};
use crate::engine::spawn_dispatch_loop;
use crate::generator::{OpenAiGenerator, StaticGenerator};
use crate::handlers::{HandlerRegistry, Services};
use crate::manage::TaskManager;
use crate::nudge::NudgeEngine;
use crate::persistence::SchedulerDb;
use crate::retry::policy_from_config;
use crate::store::TaskStore;

/// Everything a process needs to schedule, dispatch and manage tasks.
#[derive(Clone)]
pub struct SchedulerService {
    pub db: Arc<SchedulerDb>,
    pub dispatcher: Dispatcher,
    pub manager: TaskManager,
    max_batch: usize,
    tick_secs: u64,
}

impl SchedulerService {
    /// Open the configured database and build the service around it.
    pub fn from_config(config: &NudgeClawConfig) -> Result<Self> {
        let db = Arc::new(SchedulerDb::open(&config.database.resolved_path())?);
        Ok(Self::with_db(db, config))
    }

    pub fn with_db(db: Arc<SchedulerDb>, config: &NudgeClawConfig) -> Self {
        let generator: Arc<dyn MessageGenerator> = if config.generator.api_key.is_empty() {
            tracing::info!("🧠 No generator API key, using static check-in text");
            Arc::new(StaticGenerator::default())
        } else {
            Arc::new(OpenAiGenerator::from_config(&config.generator))
        };
        let services = Services {
            delivery: Arc::new(HttpDelivery::new(
                db.clone(),
                &config.channels.telegram_bot_token,
            )),
            generator,
            conversation: db.clone(),
            behavior: db.clone(),
            nudge_state: db.clone(),
        };
        let registry = HandlerRegistry::with_defaults(
            services,
            NudgeEngine::new(&config.nudge),
            &config.daily_check.prompt_hint,
        );
        let retry = policy_from_config(&config.scheduler);
        tracing::debug!("🔁 Retry policy: {}", retry.name());
        let dispatcher = Dispatcher::new(
            db.clone(),
            config.scheduler.lease_ms,
            registry,
            db.clone(),
        )
        .with_retry_policy(retry);
        let manager = TaskManager::new(
            db.clone(),
            &config.daily_check,
            config.nudge.nudge_interval_ms,
        );

        Self {
            db,
            dispatcher,
            manager,
            max_batch: config.scheduler.max_batch,
            tick_secs: config.scheduler.tick_secs,
        }
    }

    /// One dispatch cycle with the configured batch size.
    pub async fn run_once(&self) -> Result<CycleReport> {
        self.dispatcher.run_cycle(self.max_batch).await
    }

    /// Start the internal loop; `None` when `tick_secs` is 0.
    pub fn spawn_loop(&self) -> Option<JoinHandle<()>> {
        spawn_dispatch_loop(self.dispatcher.clone(), self.tick_secs, self.max_batch)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.db.close().await
    }
}
