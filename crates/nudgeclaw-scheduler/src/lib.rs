//! # NudgeClaw Scheduler
//!
//! Lease-based background task scheduler and progressive nudge engine.
//!
//! ## Design Principles
//! - One shared store, record-level leases; no broker, no coordinator
//! - Stateless dispatch cycles, safe to trigger concurrently
//! - Per-task isolation: a failing or panicking handler only fails itself
//! - Nudge policy is pure and configurable, collaborators are traits
//!
//! ## Architecture
//! ```text
//! Trigger (cron → POST /scheduler/run, or tokio interval)
//!   └── Dispatcher::run_cycle
//!         ├── TaskStore::list_ready (earliest first, batch limit)
//!         ├── per task (tokio::spawn + catch_unwind)
//!         │     ├── LeaseManager::acquire  ── lost race → skipped
//!         │     ├── HandlerRegistry → daily_check | reminder | nudge | custom
//!         │     │                        └── NudgeEngine (level, tone, template)
//!         │     └── complete  |  RetryPolicy → release / reschedule + AuditLog
//!         └── CycleReport { succeeded, failed, skipped }
//! ```

pub mod channels;
pub mod dispatch;
pub mod engine;
pub mod generator;
pub mod handlers;
pub mod lease;
pub mod manage;
pub mod nudge;
pub mod persistence;
pub mod retry;
pub mod service;
pub mod store;
pub mod tasks;

#[cfg(test)]
mod testing;

pub use channels::{ChannelDirectory, HttpDelivery, NotifyTarget};
pub use dispatch::{CycleReport, Dispatcher, TaskFailure};
pub use handlers::{HandlerOutcome, HandlerRegistry, Services, TaskHandler};
pub use lease::LeaseManager;
pub use manage::TaskManager;
pub use nudge::{NudgeDecision, NudgeEngine, Tone};
pub use persistence::SchedulerDb;
pub use retry::{ExponentialBackoffPolicy, ImmediateRetryPolicy, RetryPolicy};
pub use service::SchedulerService;
pub use store::{MemoryTaskStore, TaskStore};
pub use tasks::{MAX_INTERVAL_MS, NewTask, ScheduledTask, TaskKind, TaskPayload, after_ms, after_secs};
