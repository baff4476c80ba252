//! Reconciliation Error Types
//!
//! The split that matters is [`ReconcileError::is_retryable`]: retryable
//! infrastructure errors are always propagated for redelivery or requeue and
//! never fall through into a destructive fallback.

use thiserror::Error;

use crate::provider::ProviderError;

#[derive(Error, Debug, Clone)]
pub enum ReconcileError {
    // === Input ===
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Transaction not found: {0}")]
    NotFound(String),

    // === Retryable infrastructure ===
    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Serialization conflict: {0}")]
    Conflict(String),

    #[error("Redis error: {0}")]
    Redis(String),

    // === Non-retryable infrastructure ===
    #[error("Database error: {0}")]
    Database(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // === Pot / claim business errors ===
    #[error("Pot not found: {0}")]
    PotNotFound(String),

    #[error("Only the pot creator may close the pot")]
    Forbidden,

    #[error("Pot still has open slots and has not expired")]
    PotStillOpen,

    #[error("Pot finalization already in progress")]
    FinalizationInProgress,

    #[error("Pot is not accepting claims")]
    PotUnavailable,

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReconcileError {
    /// Error code for logs and API responses
    pub fn code(&self) -> &'static str {
        match self {
            ReconcileError::InvalidPayload(_) => "INVALID_PAYLOAD",
            ReconcileError::NotFound(_) => "NOT_FOUND",
            ReconcileError::Timeout(_) => "TIMEOUT",
            ReconcileError::Conflict(_) => "CONFLICT",
            ReconcileError::Redis(_) => "REDIS_ERROR",
            ReconcileError::Database(_) => "DATABASE_ERROR",
            ReconcileError::Provider(e) => e.code(),
            ReconcileError::PotNotFound(_) => "POT_NOT_FOUND",
            ReconcileError::Forbidden => "FORBIDDEN",
            ReconcileError::PotStillOpen => "POT_STILL_OPEN",
            ReconcileError::FinalizationInProgress => "FINALIZATION_IN_PROGRESS",
            ReconcileError::PotUnavailable => "POT_UNAVAILABLE",
            ReconcileError::RateLimited { .. } => "RATE_LIMITED",
            ReconcileError::InvalidStateTransition(_) => "INVALID_STATE_TRANSITION",
            ReconcileError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Timeouts, cancellation, lock/serialization conflicts and lost
    /// connections: safe and necessary to try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReconcileError::Timeout(_) | ReconcileError::Conflict(_) | ReconcileError::Redis(_)
        )
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, ReconcileError::NotFound(_))
    }
}

/// SQLSTATEs for serialization failure, deadlock and NOWAIT lock contention
const RETRYABLE_SQLSTATES: [&str; 3] = ["40001", "40P01", "55P03"];

impl From<sqlx::Error> for ReconcileError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolTimedOut => ReconcileError::Timeout(e.to_string()),
            sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
                ReconcileError::Timeout(e.to_string())
            }
            sqlx::Error::RowNotFound => ReconcileError::NotFound(e.to_string()),
            sqlx::Error::Database(db)
                if db
                    .code()
                    .is_some_and(|code| RETRYABLE_SQLSTATES.iter().any(|s| *s == code)) =>
            {
                ReconcileError::Conflict(e.to_string())
            }
            // 57014: statement timeout / query canceled
            sqlx::Error::Database(db) if db.code().is_some_and(|code| code == "57014") => {
                ReconcileError::Timeout(e.to_string())
            }
            _ => ReconcileError::Database(e.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for ReconcileError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        ReconcileError::Timeout(e.to_string())
    }
}

impl From<redis::RedisError> for ReconcileError {
    fn from(e: redis::RedisError) -> Self {
        ReconcileError::Redis(e.to_string())
    }
}

impl From<serde_json::Error> for ReconcileError {
    fn from(e: serde_json::Error) -> Self {
        ReconcileError::InvalidPayload(e.to_string())
    }
}
