//! Collaborator traits: the seams between the scheduler core and the
//! rest of the assistant.

pub mod behavior;
pub mod delivery;
pub mod generator;
pub mod logs;

pub use behavior::{BehaviorProvider, NudgeStateStore};
pub use delivery::DeliveryChannel;
pub use generator::MessageGenerator;
pub use logs::{AuditLog, ConversationLog};
