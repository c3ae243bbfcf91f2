//! Lifecycle events published for downstream consumers.
//!
//! The retry pipeline's contract is carried on the envelope itself: a typed
//! retry counter and the last failure reason, rather than ad hoc metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stream topics the core publishes to.
pub mod topics {
    pub const LIFECYCLE: &str = "events:transactions";
    pub const RETRY: &str = "events:transactions:retry";
    pub const DEAD_LETTER: &str = "events:transactions:dlq";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Initiated,
    Completed,
    Failed,
    Cancelled,
    Compensated,
    CompensationFailed,
    RecoveryCompleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Initiated => "initiated",
            EventType::Completed => "completed",
            EventType::Failed => "failed",
            EventType::Cancelled => "cancelled",
            EventType::Compensated => "compensated",
            EventType::CompensationFailed => "compensation_failed",
            EventType::RecoveryCompleted => "recovery_completed",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable fact describing a transaction's state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub transaction_id: Uuid,
    pub event_type: EventType,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TransactionEvent {
    pub fn new(transaction_id: Uuid, event_type: EventType) -> Self {
        Self {
            transaction_id,
            event_type,
            retry_count: 0,
            last_error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_detail(transaction_id: Uuid, event_type: EventType, detail: String) -> Self {
        Self {
            last_error: Some(detail),
            ..Self::new(transaction_id, event_type)
        }
    }

    /// Copy for re-enqueueing onto the retry channel.
    pub fn next_retry(&self, failure: String) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            last_error: Some(failure),
            timestamp: Utc::now(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_retry_increments_counter_and_records_failure() {
        let event = TransactionEvent::new(Uuid::new_v4(), EventType::Completed);
        let retried = event.next_retry("notification target unreachable".into());

        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.transaction_id, event.transaction_id);
        assert_eq!(retried.event_type, event.event_type);
        assert_eq!(
            retried.last_error.as_deref(),
            Some("notification target unreachable")
        );

        let again = retried.next_retry("still down".into());
        assert_eq!(again.retry_count, 2);
    }

    #[test]
    fn serializes_with_snake_case_event_type() {
        let event = TransactionEvent::new(Uuid::new_v4(), EventType::RecoveryCompleted);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "recovery_completed");
        assert_eq!(json["retry_count"], 0);
        assert!(json.get("last_error").is_none());
    }
}
