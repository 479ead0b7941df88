//! Error taxonomy shared across the session engine.
//!
//! Every public operation returns `Result<T, CoreError>` rather than raising.
//! `CoreError::kind_token` gives the stable prefix used in user-visible
//! failure strings (RPC responses, prompt outcomes) so callers can match on
//! failure class without parsing prose.

use thiserror::Error;

/// Unified error type for the session engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Closed(String),

    #[error("queue is full")]
    QueueFull,

    #[error("deadline exceeded")]
    Timeout,

    #[error("cancelled by caller")]
    Cancelled,

    #[error("{0}")]
    SpawnError(String),

    #[error("no activity within idle timeout")]
    Stalled,

    #[error("session is down")]
    SessionDown,

    #[error("invalid or missing token")]
    AuthError,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    PersistenceError(String),

    #[error("{0}")]
    UnknownTool(String),

    #[error("{0}")]
    BadWorkdir(String),
}

impl CoreError {
    /// Stable prefix token identifying the failure kind, independent of the
    /// human-readable message that follows it.
    #[must_use]
    pub fn kind_token(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::AlreadyExists(_) => "already-exists",
            Self::NotFound(_) => "not-found",
            Self::Closed(_) => "closed",
            Self::QueueFull => "queue-full",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::SpawnError(_) => "spawn-error",
            Self::Stalled => "stalled",
            Self::SessionDown => "session-down",
            Self::AuthError => "auth",
            Self::BadRequest(_) => "bad-request",
            Self::PersistenceError(_) => "persistence",
            Self::UnknownTool(_) => "unknown-tool",
            Self::BadWorkdir(_) => "bad-workdir",
        }
    }

    /// Render as the bounded, kind-prefixed string returned to callers (§7).
    #[must_use]
    pub fn to_user_string(&self) -> String {
        const MAX_LEN: usize = 500;
        let msg = format!("{}: {self}", self.kind_token());
        if msg.len() > MAX_LEN {
            format!("{}...", &msg[..MAX_LEN.min(msg.len())])
        } else {
            msg
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
