//! Ports consumed by the core: the account/balance store, the transaction
//! repository, the key-value cache, and the durable event log. Adapters live
//! in `crate::adapters`; tests run against in-memory implementations.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{Account, LimitOverride, Transaction, TransactionEvent, TransactionStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("event log backend error: {0}")]
    Backend(String),
    #[error("malformed log entry: {0}")]
    Malformed(String),
}

/// Actor/account lookup and the balance-write primitive.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Account, StoreError>;

    /// Write the given absolute balances. Either every write lands or none
    /// do; callers hold the actor locks for all touched accounts.
    async fn write_balances(&self, changes: &[(Uuid, BigDecimal)]) -> Result<(), StoreError>;
}

/// Append-only transaction records with compare-and-set status transitions.
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    async fn insert(&self, tx: &Transaction) -> Result<(), StoreError>;

    /// Transition `id` from `from` to `to`, recording `error_detail` when
    /// present. Fails with `Conflict` when the row is no longer in `from`,
    /// which is what makes concurrent sweeps idempotent.
    async fn transition_status(
        &self,
        id: Uuid,
        from: TransactionStatus,
        to: TransactionStatus,
        error_detail: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Transaction, StoreError>;

    async fn history(
        &self,
        account: Uuid,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// Pending transactions created before `cutoff`, oldest first.
    async fn stale_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// Completed outflow (transfers out + withdrawals) for an account since
    /// `since`. Authoritative fallback for the rolling usage counters.
    async fn outflow_since(
        &self,
        account: Uuid,
        since: DateTime<Utc>,
    ) -> Result<BigDecimal, StoreError>;

    async fn active_limit_override(
        &self,
        account: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<LimitOverride>, StoreError>;
}

/// Key-value cache with the primitives the lock manager and validator need.
#[async_trait]
pub trait Cache: Send + Sync {
    /// SET key value NX EX ttl. Returns true when the key was absent.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, CacheError>;

    /// Delete `key` only if it still holds `expected`. Returns true when the
    /// key was deleted.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, CacheError>;

    /// Atomically increment a counter, attaching `ttl_secs` on first use.
    /// Returns the post-increment value.
    async fn incr_ex(&self, key: &str, ttl_secs: u64) -> Result<i64, CacheError>;

    /// Atomically add `delta` to `key` only when it already exists. Returns
    /// None when the key was absent.
    async fn incr_by_if_present(&self, key: &str, delta: i64) -> Result<Option<i64>, CacheError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError>;
}

/// One durable log entry as delivered to a consumer group.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub id: String,
    pub event: TransactionEvent,
}

/// Durable append-only log with publish-with-ack and consumer-group delivery.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append and return the entry id once the log has acknowledged it.
    async fn publish(&self, topic: &str, event: &TransactionEvent) -> Result<String, LogError>;

    /// Idempotently create the consumer group for `topic`.
    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), LogError>;

    /// Read up to `count` undelivered entries for the group, blocking up to
    /// `block_ms`. Delivery is at-least-once; entries stay pending until
    /// acked.
    async fn read_group(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<LogEntry>, LogError>;

    async fn ack(&self, topic: &str, group: &str, entry_id: &str) -> Result<(), LogError>;

    /// Inspection read from the start of a topic, outside any group.
    async fn read_range(&self, topic: &str, count: usize) -> Result<Vec<LogEntry>, LogError>;
}
