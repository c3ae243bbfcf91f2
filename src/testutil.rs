//! In-memory implementations of the ports so the suite runs without
//! Postgres or Redis. Mutexes are held only across synchronous sections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    Account, LimitOverride, Transaction, TransactionEvent, TransactionKind, TransactionStatus,
};
use crate::ports::{
    AccountStore, Cache, CacheError, EventLog, LogEntry, LogError, StoreError,
    TransactionRepository,
};

// --- Accounts ---

pub struct MemoryAccountStore {
    accounts: Mutex<HashMap<Uuid, Account>>,
    /// Toggle to simulate a balance-write outage.
    pub fail_writes: AtomicBool,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self {
            accounts: Mutex::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn insert(&self, account: Account) {
        self.accounts.lock().unwrap().insert(account.id, account);
    }

    pub fn balance_of(&self, id: Uuid) -> BigDecimal {
        self.accounts.lock().unwrap()[&id].balance.clone()
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn get(&self, id: Uuid) -> Result<Account, StoreError> {
        self.accounts
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("account {}", id)))
    }

    async fn write_balances(&self, changes: &[(Uuid, BigDecimal)]) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected write failure".into()));
        }
        let mut accounts = self.accounts.lock().unwrap();
        // All-or-nothing: verify before mutating anything.
        for (id, _) in changes {
            if !accounts.contains_key(id) {
                return Err(StoreError::NotFound(format!("account {}", id)));
            }
        }
        for (id, balance) in changes {
            if let Some(account) = accounts.get_mut(id) {
                account.balance = balance.clone();
            }
        }
        Ok(())
    }
}

// --- Transactions ---

pub struct MemoryTransactionRepository {
    rows: Mutex<HashMap<Uuid, Transaction>>,
    overrides: Mutex<Vec<LimitOverride>>,
}

impl MemoryTransactionRepository {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            overrides: Mutex::new(Vec::new()),
        }
    }

    /// Place a row directly, bypassing the processor.
    pub fn put(&self, tx: Transaction) {
        self.rows.lock().unwrap().insert(tx.id, tx);
    }

    pub fn get(&self, id: Uuid) -> Transaction {
        self.rows.lock().unwrap()[&id].clone()
    }

    pub fn add_override(&self, exception: LimitOverride) {
        self.overrides.lock().unwrap().push(exception);
    }
}

#[async_trait]
impl TransactionRepository for MemoryTransactionRepository {
    async fn insert(&self, tx: &Transaction) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(&tx.id) {
            return Err(StoreError::Conflict(format!("transaction {}", tx.id)));
        }
        rows.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: TransactionStatus,
        to: TransactionStatus,
        error_detail: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("transaction {}", id)))?;
        if row.status != from {
            return Err(StoreError::Conflict(format!(
                "transaction {} is no longer {}",
                id, from
            )));
        }
        row.status = to;
        if let Some(detail) = error_detail {
            row.error_detail = Some(detail.to_string());
        }
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Transaction, StoreError> {
        self.rows
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("transaction {}", id)))
    }

    async fn history(
        &self,
        account: Uuid,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Transaction>, StoreError> {
        let rows = self.rows.lock().unwrap();
        let mut matched: Vec<Transaction> = rows
            .values()
            .filter(|tx| {
                tx.source_account == Some(account) || tx.destination_account == Some(account)
            })
            .filter(|tx| from.map_or(true, |f| tx.created_at >= f))
            .filter(|tx| to.map_or(true, |t| tx.created_at <= t))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matched)
    }

    async fn stale_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Transaction>, StoreError> {
        let rows = self.rows.lock().unwrap();
        let mut matched: Vec<Transaction> = rows
            .values()
            .filter(|tx| tx.status == TransactionStatus::Pending && tx.created_at < cutoff)
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        matched.truncate(limit as usize);
        Ok(matched)
    }

    async fn outflow_since(
        &self,
        account: Uuid,
        since: DateTime<Utc>,
    ) -> Result<BigDecimal, StoreError> {
        let rows = self.rows.lock().unwrap();
        let total = rows
            .values()
            .filter(|tx| {
                tx.source_account == Some(account)
                    && tx.status == TransactionStatus::Completed
                    && matches!(
                        tx.kind,
                        TransactionKind::Transfer | TransactionKind::Withdrawal
                    )
                    && tx.created_at >= since
            })
            .fold(BigDecimal::from(0), |acc, tx| acc + &tx.amount);
        Ok(total)
    }

    async fn active_limit_override(
        &self,
        account: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<LimitOverride>, StoreError> {
        let overrides = self.overrides.lock().unwrap();
        Ok(overrides
            .iter()
            .find(|o| o.account_id == account && o.is_active_at(at))
            .cloned())
    }
}

// --- Cache ---

struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    /// Toggle to simulate the backing store being unreachable.
    pub fail: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            fail: AtomicBool::new(false),
        }
    }

    fn check_available(&self) -> Result<(), CacheError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CacheError::Backend("injected cache outage".into()));
        }
        Ok(())
    }

    fn purge(entries: &mut HashMap<String, CacheEntry>) {
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at.map_or(true, |at| at > now));
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, CacheError> {
        self.check_available()?;
        let mut entries = self.entries.lock().unwrap();
        Self::purge(&mut entries);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, CacheError> {
        self.check_available()?;
        let mut entries = self.entries.lock().unwrap();
        Self::purge(&mut entries);
        match entries.get(key) {
            Some(entry) if entry.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn incr_ex(&self, key: &str, ttl_secs: u64) -> Result<i64, CacheError> {
        self.check_available()?;
        let mut entries = self.entries.lock().unwrap();
        Self::purge(&mut entries);
        match entries.get_mut(key) {
            Some(entry) => {
                let next = entry.value.parse::<i64>().unwrap_or(0) + 1;
                entry.value = next.to_string();
                Ok(next)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    CacheEntry {
                        value: "1".to_string(),
                        expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
                    },
                );
                Ok(1)
            }
        }
    }

    async fn incr_by_if_present(&self, key: &str, delta: i64) -> Result<Option<i64>, CacheError> {
        self.check_available()?;
        let mut entries = self.entries.lock().unwrap();
        Self::purge(&mut entries);
        match entries.get_mut(key) {
            Some(entry) => {
                let next = entry.value.parse::<i64>().unwrap_or(0) + delta;
                entry.value = next.to_string();
                Ok(Some(next))
            }
            None => Ok(None),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check_available()?;
        let mut entries = self.entries.lock().unwrap();
        Self::purge(&mut entries);
        Ok(entries.get(key).map(|e| e.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), CacheError> {
        self.check_available()?;
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check_available()?;
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        self.check_available()?;
        let mut entries = self.entries.lock().unwrap();
        Self::purge(&mut entries);
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

// --- Event log ---

pub struct MemoryEventLog {
    streams: Mutex<HashMap<String, Vec<LogEntry>>>,
    /// (topic, group) -> index of the next undelivered entry.
    cursors: Mutex<HashMap<(String, String), usize>>,
    acked: Mutex<Vec<(String, String, String)>>,
    next_id: AtomicU64,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
            acked: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn entries(&self, topic: &str) -> Vec<LogEntry> {
        self.streams
            .lock()
            .unwrap()
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    pub fn events(&self, topic: &str) -> Vec<TransactionEvent> {
        self.entries(topic).into_iter().map(|e| e.event).collect()
    }

    pub fn acked_count(&self, topic: &str) -> usize {
        self.acked
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _, _)| t == topic)
            .count()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn publish(&self, topic: &str, event: &TransactionEvent) -> Result<String, LogError> {
        let id = format!("{}-0", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.streams
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .push(LogEntry {
                id: id.clone(),
                event: event.clone(),
            });
        Ok(id)
    }

    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), LogError> {
        self.cursors
            .lock()
            .unwrap()
            .entry((topic.to_string(), group.to_string()))
            .or_insert(0);
        Ok(())
    }

    async fn read_group(
        &self,
        topic: &str,
        group: &str,
        _consumer: &str,
        count: usize,
        _block_ms: u64,
    ) -> Result<Vec<LogEntry>, LogError> {
        let streams = self.streams.lock().unwrap();
        let mut cursors = self.cursors.lock().unwrap();
        let cursor = cursors
            .entry((topic.to_string(), group.to_string()))
            .or_insert(0);

        let entries = streams.get(topic).map(Vec::as_slice).unwrap_or(&[]);
        let batch: Vec<LogEntry> = entries
            .iter()
            .skip(*cursor)
            .take(count)
            .cloned()
            .collect();
        *cursor += batch.len();
        Ok(batch)
    }

    async fn ack(&self, topic: &str, group: &str, entry_id: &str) -> Result<(), LogError> {
        self.acked.lock().unwrap().push((
            topic.to_string(),
            group.to_string(),
            entry_id.to_string(),
        ));
        Ok(())
    }

    async fn read_range(&self, topic: &str, count: usize) -> Result<Vec<LogEntry>, LogError> {
        let mut entries = self.entries(topic);
        entries.truncate(count);
        Ok(entries)
    }
}
