//! Error types shared across NudgeClaw crates.

use thiserror::Error;

/// Errors raised by the scheduler core and its adapters.
#[derive(Error, Debug)]
pub enum NudgeClawError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid task: {0}")]
    Validation(String),

    #[error("Task '{0}' not found")]
    TaskNotFound(String),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Message generation failed: {0}")]
    Generation(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Outcome of a failed delivery attempt.
///
/// `NoChannel` is a missing prerequisite (the owner never linked anything),
/// `Failed` is a transport error on a channel that does exist.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("no channel linked for owner '{0}'")]
    NoChannel(String),

    #[error("{0}")]
    Failed(String),
}

pub type Result<T, E = NudgeClawError> = std::result::Result<T, E>;
