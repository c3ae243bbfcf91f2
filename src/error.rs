use thiserror::Error;
use uuid::Uuid;

use crate::domain::DomainError;
use crate::ports::{CacheError, LogError, StoreError};

/// Why the validator turned a transaction away. Reported synchronously to the
/// caller; never retried by the core.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    #[error("account is {0}")]
    AccountNotActive(String),
    #[error("amount exceeds the per-transaction ceiling of {limit}")]
    CeilingExceeded { limit: String },
    #[error("amount would exceed the rolling daily limit of {limit}")]
    DailyLimitExceeded { limit: String },
    #[error("amount would exceed the rolling monthly limit of {limit}")]
    MonthlyLimitExceeded { limit: String },
    #[error("too many operations this minute (max {max})")]
    TooManyPerMinute { max: i64 },
    #[error("too many operations today (max {max})")]
    TooManyPerDay { max: i64 },
    #[error("usage counters unavailable")]
    CounterUnavailable,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid transaction: {0}")]
    InvalidTransaction(#[from] DomainError),

    #[error("transaction rejected: {0}")]
    Rejected(#[from] RejectionReason),

    #[error("{0} is busy, try again")]
    Busy(String),

    #[error("transaction {0} not found")]
    NotFound(Uuid),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("rollback failed for transaction {id}: {detail}")]
    RollbackFailed { id: Uuid, detail: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("event log error: {0}")]
    Log(#[from] LogError),
}

impl CoreError {
    /// Contention and validation rejections are safe for the caller to retry
    /// or correct; everything else indicates work the core handles
    /// asynchronously or surfaces to an operator.
    pub fn is_caller_retryable(&self) -> bool {
        matches!(self, CoreError::Busy(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_is_the_only_caller_retryable_class() {
        assert!(CoreError::Busy("account abc".into()).is_caller_retryable());
        assert!(!CoreError::Rejected(RejectionReason::CounterUnavailable).is_caller_retryable());
        assert!(!CoreError::NotFound(Uuid::new_v4()).is_caller_retryable());
    }

    #[test]
    fn rejection_messages_name_the_limit() {
        let reason = RejectionReason::CeilingExceeded {
            limit: "1000000".into(),
        };
        assert!(reason.to_string().contains("1000000"));
    }
}
