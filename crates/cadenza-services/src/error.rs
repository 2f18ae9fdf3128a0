//! Error types for the session layer

use cadenza_core::ClockError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Clock error: {0}")]
    Clock(#[from] ClockError),
    #[error("Invalid note: {0}")]
    InvalidNote(String),
    #[error("No clock is active on this thread")]
    NoActiveClock,
    #[error("No instruments to transcribe")]
    EmptyEnsemble,
    #[error("Already transcribing")]
    AlreadyTranscribing,
    #[error("Not transcribing")]
    NotTranscribing,
    #[error("Part not found: {0}")]
    PartNotFound(String),
    #[error("Listener not found: {0}")]
    ListenerNotFound(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
