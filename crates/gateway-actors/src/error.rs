//! # Framework Errors
//!
//! Errors shared by every worker actor and its clients. Worker-specific
//! failures travel boxed inside [`FrameworkError::WorkerError`].

/// Errors that can occur within the worker framework itself.
#[derive(Debug, thiserror::Error)]
pub enum FrameworkError {
    #[error("Actor closed")]
    ActorClosed,
    #[error("Actor dropped response channel")]
    ActorDropped,
    #[error("Worker is paused")]
    Paused,
    #[error("Worker is not running")]
    NotRunning,
    #[error("Worker error: {0}")]
    WorkerError(Box<dyn std::error::Error + Send + Sync>),
    #[error("Worker panicked: {0}")]
    Panicked(String),
}
