use thiserror::Error;

use crate::types::{ActionId, ActionStatus};

/// Errors that can occur within the queue subsystem.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored column could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The interval, cron expression or timezone is invalid.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// No action with the given ID exists in the store.
    #[error("Action not found: {id}")]
    ActionNotFound { id: ActionId },

    /// The action exists but is not in a state that allows the change.
    #[error("Action {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: ActionId,
        from: ActionStatus,
        to: ActionStatus,
    },

    /// The enqueue request itself is malformed (e.g. an empty hook name).
    #[error("Invalid action: {0}")]
    InvalidAction(String),
}

impl QueueError {
    pub fn code(&self) -> &'static str {
        match self {
            QueueError::Database(_) => "DATABASE_ERROR",
            QueueError::Serialization(_) => "SERIALIZATION_ERROR",
            QueueError::InvalidSchedule(_) => "INVALID_SCHEDULE",
            QueueError::ActionNotFound { .. } => "ACTION_NOT_FOUND",
            QueueError::InvalidTransition { .. } => "INVALID_TRANSITION",
            QueueError::InvalidAction(_) => "INVALID_ACTION",
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
