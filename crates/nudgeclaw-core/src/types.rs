//! Plain data types shared between the scheduler and its collaborators.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Behavioral signals for one owner, as seen by the nudge engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserBehaviorSnapshot {
    /// Hours since the owner last sent a message.
    pub hours_since_last_interaction: f64,
    /// Hours of day (0..=23, UTC) in which the owner has been responsive.
    /// `None` when there is not enough history to tell.
    pub active_hours: Option<BTreeSet<u8>>,
    /// Nudges sent since the owner last replied.
    pub consecutive_non_responses: u32,
}

impl UserBehaviorSnapshot {
    /// Snapshot for an owner with no recorded history.
    pub fn unknown(hours_since_last_interaction: f64) -> Self {
        Self {
            hours_since_last_interaction,
            active_hours: None,
            consecutive_non_responses: 0,
        }
    }
}

/// Who authored a conversation log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
