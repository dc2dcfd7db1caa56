//! Error taxonomy
//!
//! Malformed inputs are rejected locally and never surface as violations;
//! collaborator failures degrade the aggregate instead of crashing the
//! monitor; rollback-execution failures are retried and then escalated,
//! never silently dropped.

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the guardian
#[derive(Error, Debug)]
pub enum GuardianError {
    #[error("Invalid rule for metric '{metric}': {reason}")]
    InvalidRule { metric: String, reason: String },

    #[error("Invalid metric value for '{metric}': {reason}")]
    InvalidMetric { metric: String, reason: String },

    // Field must not be called `source`: thiserror would treat it as
    // the error's cause and require `std::error::Error` on it.
    #[error("Source '{source_id}' unavailable: {reason}")]
    SourceUnavailable { source_id: String, reason: String },

    #[error("Consultation session {0} not found")]
    SessionNotFound(Uuid),

    #[error("Consultation session {0} already resolved")]
    SessionClosed(Uuid),

    #[error("Representative '{representative}' is not on session {session_id}")]
    UnknownRepresentative {
        session_id: Uuid,
        representative: String,
    },

    #[error("Representative '{representative}' already voted on session {session_id}")]
    DuplicateVote {
        session_id: Uuid,
        representative: String,
    },

    #[error("Rollback execution failed after {attempts} attempts: {last_error}")]
    RollbackExecution { attempts: u32, last_error: String },

    #[error("Dependency '{0}' unavailable, circuit open")]
    DependencyUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GuardianError>;
