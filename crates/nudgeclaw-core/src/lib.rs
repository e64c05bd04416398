//! # NudgeClaw Core
//!
//! Shared configuration, errors, and the collaborator traits the scheduler
//! calls out to (behavior context, message generation, delivery, logs).

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::NudgeClawConfig;
pub use error::{DeliveryError, NudgeClawError, Result};
pub use types::UserBehaviorSnapshot;
