//! Error types for the clock core

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Clock terminated: {0}")]
    ClockTerminated(String),
    #[error("Fork action failed: {0}")]
    ActionFailed(String),
    #[error("Failed to spawn fork thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl ClockError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::ClockTerminated(_))
    }
}

pub type Result<T> = std::result::Result<T, ClockError>;
