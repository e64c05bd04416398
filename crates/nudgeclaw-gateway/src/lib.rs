//! # NudgeClaw Gateway
//!
//! HTTP surface over the scheduler: the cron trigger endpoint plus the
//! per-owner task management API.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start_server};
