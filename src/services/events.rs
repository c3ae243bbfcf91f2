//! Lifecycle event publishing and the retry pipeline.
//!
//! The relay consumes the lifecycle and retry topics at-least-once. A failed
//! delivery is re-enqueued with its counter bumped until the retry budget is
//! spent, then routed to the dead-letter topic. An entry is only ever acked
//! after its follow-up destination has durably accepted it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::domain::event::topics;
use crate::domain::TransactionEvent;
use crate::ports::{EventLog, LogEntry, LogError};

pub const MAX_RETRY_ATTEMPTS: u32 = 3;
pub const CONSUMER_GROUP: &str = "remit-core";

const READ_BATCH: usize = 16;
const READ_BLOCK_MS: u64 = 1000;

/// Publishes lifecycle facts. Fire-and-forget for callers: the append is
/// durable once the log acknowledges it, and a publish failure is logged
/// rather than failing the money movement it describes.
#[derive(Clone)]
pub struct EventPublisher {
    log: Arc<dyn EventLog>,
}

impl EventPublisher {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self { log }
    }

    pub async fn publish(&self, topic: &str, event: &TransactionEvent) {
        if let Err(e) = self.log.publish(topic, event).await {
            error!(
                topic,
                transaction_id = %event.transaction_id,
                event_type = %event.event_type,
                error = %e,
                "failed to publish lifecycle event"
            );
        }
    }
}

/// Downstream processing of a delivered event (completion hooks,
/// notification fan-out). Implementations are external collaborators.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &TransactionEvent) -> anyhow::Result<()>;
}

/// Default handler: surface the event in the logs. Deployments plug in
/// their own delivery integrations.
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn handle(&self, event: &TransactionEvent) -> anyhow::Result<()> {
        info!(
            transaction_id = %event.transaction_id,
            event_type = %event.event_type,
            retry_count = event.retry_count,
            "transaction event"
        );
        Ok(())
    }
}

pub struct EventRelay {
    log: Arc<dyn EventLog>,
    handler: Arc<dyn EventHandler>,
    group: String,
    consumer: String,
}

impl EventRelay {
    pub fn new(log: Arc<dyn EventLog>, handler: Arc<dyn EventHandler>, consumer: String) -> Self {
        Self {
            log,
            handler,
            group: CONSUMER_GROUP.to_string(),
            consumer,
        }
    }

    pub async fn ensure_groups(&self) -> Result<(), LogError> {
        for topic in [topics::LIFECYCLE, topics::RETRY, topics::DEAD_LETTER] {
            self.log.ensure_group(topic, &self.group).await?;
        }
        Ok(())
    }

    /// Long-lived consumer loop over the lifecycle and retry topics.
    pub async fn run(&self) {
        if let Err(e) = self.ensure_groups().await {
            error!(error = %e, "failed to create consumer groups");
        }
        info!(consumer = %self.consumer, "event relay started");

        loop {
            for topic in [topics::LIFECYCLE, topics::RETRY] {
                if let Err(e) = self.drain_once(topic).await {
                    error!(topic, error = %e, "event relay batch failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Process one read batch from `topic`. Returns how many entries were
    /// handled.
    pub async fn drain_once(&self, topic: &str) -> Result<usize, LogError> {
        let entries = self
            .log
            .read_group(topic, &self.group, &self.consumer, READ_BATCH, READ_BLOCK_MS)
            .await?;
        let drained = entries.len();

        for entry in entries {
            self.dispatch(topic, entry).await?;
        }
        Ok(drained)
    }

    async fn dispatch(&self, topic: &str, entry: LogEntry) -> Result<(), LogError> {
        match self.handler.handle(&entry.event).await {
            Ok(()) => {
                self.log.ack(topic, &self.group, &entry.id).await?;
            }
            Err(failure) if entry.event.retry_count < MAX_RETRY_ATTEMPTS => {
                let next = entry.event.next_retry(failure.to_string());
                // Durably parked on the retry channel before the ack.
                self.log.publish(topics::RETRY, &next).await?;
                self.log.ack(topic, &self.group, &entry.id).await?;
                warn!(
                    transaction_id = %next.transaction_id,
                    retry_count = next.retry_count,
                    error = %failure,
                    "event processing failed, re-enqueued"
                );
            }
            Err(failure) => {
                let dead = TransactionEvent {
                    last_error: Some(failure.to_string()),
                    timestamp: Utc::now(),
                    ..entry.event.clone()
                };
                self.log.publish(topics::DEAD_LETTER, &dead).await?;
                self.log.ack(topic, &self.group, &entry.id).await?;
                error!(
                    transaction_id = %dead.transaction_id,
                    event_type = %dead.event_type,
                    "event exhausted its retry budget, dead-lettered"
                );
            }
        }
        Ok(())
    }
}

/// Push a dead-lettered entry back onto the retry channel with a fresh
/// budget. Returns false when the entry id is unknown.
pub async fn requeue_dead_letter(
    log: &Arc<dyn EventLog>,
    entry_id: &str,
) -> Result<bool, LogError> {
    let entries = log.read_range(topics::DEAD_LETTER, 1000).await?;
    let Some(entry) = entries.into_iter().find(|e| e.id == entry_id) else {
        return Ok(false);
    };

    let revived = TransactionEvent {
        retry_count: 0,
        timestamp: Utc::now(),
        ..entry.event
    };
    log.publish(topics::RETRY, &revived).await?;
    info!(entry_id, transaction_id = %revived.transaction_id, "dead-letter entry requeued");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventType;
    use crate::testutil::MemoryEventLog;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    struct FailingHandler {
        calls: AtomicU32,
    }

    #[async_trait]
    impl EventHandler for FailingHandler {
        async fn handle(&self, _event: &TransactionEvent) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("downstream unavailable")
        }
    }

    struct FlakyHandler {
        calls: AtomicU32,
        succeed_after: u32,
    }

    #[async_trait]
    impl EventHandler for FlakyHandler {
        async fn handle(&self, _event: &TransactionEvent) -> anyhow::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.succeed_after {
                anyhow::bail!("transient failure")
            }
            Ok(())
        }
    }

    fn relay_with(
        log: Arc<MemoryEventLog>,
        handler: Arc<dyn EventHandler>,
    ) -> EventRelay {
        EventRelay::new(log, handler, "worker-test".to_string())
    }

    async fn drain_both(relay: &EventRelay) -> usize {
        relay.drain_once(topics::LIFECYCLE).await.unwrap()
            + relay.drain_once(topics::RETRY).await.unwrap()
    }

    #[tokio::test]
    async fn successful_handling_acks_without_retry() {
        let log = Arc::new(MemoryEventLog::new());
        let publisher = EventPublisher::new(log.clone());
        publisher
            .publish(
                topics::LIFECYCLE,
                &TransactionEvent::new(Uuid::new_v4(), EventType::Completed),
            )
            .await;

        let relay = relay_with(log.clone(), Arc::new(LoggingEventHandler));
        assert_eq!(drain_both(&relay).await, 1);

        assert!(log.entries(topics::RETRY).is_empty());
        assert!(log.entries(topics::DEAD_LETTER).is_empty());
        assert_eq!(log.acked_count(topics::LIFECYCLE), 1);
    }

    #[tokio::test]
    async fn failing_event_is_retried_three_times_then_dead_lettered() {
        let log = Arc::new(MemoryEventLog::new());
        let handler = Arc::new(FailingHandler {
            calls: AtomicU32::new(0),
        });
        let relay = relay_with(log.clone(), handler.clone());

        let publisher = EventPublisher::new(log.clone());
        publisher
            .publish(
                topics::LIFECYCLE,
                &TransactionEvent::new(Uuid::new_v4(), EventType::Failed),
            )
            .await;

        // Initial delivery plus three retries, then nothing left to drain.
        for _ in 0..4 {
            drain_both(&relay).await;
        }
        assert_eq!(drain_both(&relay).await, 0);

        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);

        // Each retry bumped the stored counter by exactly one.
        let retried: Vec<u32> = log
            .events(topics::RETRY)
            .iter()
            .map(|e| e.retry_count)
            .collect();
        assert_eq!(retried, vec![1, 2, 3]);

        let dead = log.events(topics::DEAD_LETTER);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count, MAX_RETRY_ATTEMPTS);
        assert_eq!(dead[0].last_error.as_deref(), Some("downstream unavailable"));
    }

    #[tokio::test]
    async fn recovery_mid_retry_stops_the_pipeline() {
        let log = Arc::new(MemoryEventLog::new());
        let handler = Arc::new(FlakyHandler {
            calls: AtomicU32::new(0),
            succeed_after: 2,
        });
        let relay = relay_with(log.clone(), handler);

        EventPublisher::new(log.clone())
            .publish(
                topics::LIFECYCLE,
                &TransactionEvent::new(Uuid::new_v4(), EventType::Completed),
            )
            .await;

        for _ in 0..4 {
            drain_both(&relay).await;
        }

        assert_eq!(log.events(topics::RETRY).len(), 2);
        assert!(log.entries(topics::DEAD_LETTER).is_empty());
    }

    #[tokio::test]
    async fn requeue_resets_the_retry_budget() {
        let log = Arc::new(MemoryEventLog::new());
        let handler = Arc::new(FailingHandler {
            calls: AtomicU32::new(0),
        });
        let relay = relay_with(log.clone(), handler);

        EventPublisher::new(log.clone())
            .publish(
                topics::LIFECYCLE,
                &TransactionEvent::new(Uuid::new_v4(), EventType::Completed),
            )
            .await;
        for _ in 0..4 {
            drain_both(&relay).await;
        }
        let dead_id = log.entries(topics::DEAD_LETTER)[0].id.clone();

        let log_port: Arc<dyn EventLog> = log.clone();
        assert!(requeue_dead_letter(&log_port, &dead_id).await.unwrap());
        assert!(!requeue_dead_letter(&log_port, "missing-id").await.unwrap());

        let revived = log.events(topics::RETRY);
        assert_eq!(revived.last().unwrap().retry_count, 0);
    }
}
