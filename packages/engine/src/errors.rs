//! Error taxonomy shared across the engine (spec §7).
//!
//! One enum per concern, `#[from]` conversions at the seams, `anyhow::Result`
//! used at call boundaries — mirrors the teacher's `AuthError` /
//! `VerificationFailedError` style.

use thiserror::Error;

/// Bad input from a user or tool caller.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("message is empty")]
    EmptyMessage,
    #[error("message exceeds {max} characters")]
    MessageTooLong { max: usize },
    #[error("schedule text could not be parsed")]
    UnparseableSchedule,
    #[error("schedule fires sooner than the minimum spacing of {min_seconds}s")]
    ScheduleTooSoon { min_seconds: i64 },
    #[error("user already has {limit} enabled scheduled tasks")]
    ScheduleCapReached { limit: i64 },
    #[error("unknown tenant {0}")]
    UnknownTenant(String),
    #[error("signature verification failed")]
    BadSignature,
    #[error("{0}")]
    Other(String),
}

/// Failure to obtain a reply from the assistant subprocess.
#[derive(Debug, Error)]
pub enum AssistantError {
    #[error("assistant exited with error: {0}")]
    ProcessError(String),
    #[error("assistant call timed out")]
    Timeout,
    #[error("assistant stdout ended unexpectedly")]
    UnexpectedEof,
    #[error("failed to spawn assistant process: {0}")]
    SpawnFailed(String),
    #[error("assistant protocol violation: {0}")]
    ProtocolError(String),
}

/// Failure delivering a message via `MessageTransport`.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error sending message: {0}")]
    Network(String),
    #[error("upstream rejected message: {0}")]
    Rejected(String),
    #[error("no channel configured for tenant {0}")]
    UnresolvedRecipient(String),
}

/// Top-level error type returned from the public entry points
/// (`MessageProcessor`, `Scheduler` tick, `TriggerEngine::handle`).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("assistant error: {0}")]
    Assistant(#[from] AssistantError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("trigger execution failed: {0}")]
    TriggerExecution(String),
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
