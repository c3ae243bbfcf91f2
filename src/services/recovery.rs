//! Recovery sweep for transactions stuck in `Pending`.
//!
//! Runs on a fixed schedule, wholly independent of the online processor: the
//! two share nothing but the persisted transaction state and the lock
//! primitive. A stuck transaction is completed when its balances are
//! consistent and its accounts active, and handed to compensation otherwise.
//! The actor locks plus the status compare-and-set make re-running the sweep
//! (or racing a concurrent instance) a no-op.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use cron::Schedule;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::event::topics;
use crate::domain::{
    Account, EventType, Transaction, TransactionEvent, TransactionKind, TransactionStatus,
};
use crate::error::CoreError;
use crate::ports::{AccountStore, StoreError, TransactionRepository};
use crate::services::compensation::CompensationService;
use crate::services::events::EventPublisher;
use crate::services::lock::LockManager;

const REASON_UNABLE: &str = "unable to complete during recovery";
const REASON_INCONSISTENT: &str = "inconsistent balances during recovery";

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Age past which a pending transaction is considered stuck.
    pub staleness_minutes: i64,
    pub batch_size: i64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            staleness_minutes: 15,
            batch_size: 50,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub completed: usize,
    pub compensated: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum RecoveryOutcome {
    Completed,
    Compensated,
    Skipped,
}

pub struct RecoverySweep {
    accounts: Arc<dyn AccountStore>,
    transactions: Arc<dyn TransactionRepository>,
    locks: LockManager,
    compensation: CompensationService,
    publisher: EventPublisher,
    config: RecoveryConfig,
}

impl RecoverySweep {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        transactions: Arc<dyn TransactionRepository>,
        locks: LockManager,
        compensation: CompensationService,
        publisher: EventPublisher,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            accounts,
            transactions,
            locks,
            compensation,
            publisher,
            config,
        }
    }

    /// Long-lived loop driven by a cron schedule.
    pub async fn run(&self, schedule: Schedule) {
        info!("recovery sweep started");
        loop {
            let now = Utc::now();
            let Some(next) = schedule.after(&now).next() else {
                warn!("recovery schedule yields no further runs, stopping");
                return;
            };
            let wait = (next - now)
                .to_std()
                .unwrap_or(std::time::Duration::from_secs(0));
            tokio::time::sleep(wait).await;

            match self.sweep_once().await {
                Ok(report) if report.examined > 0 => {
                    info!(
                        examined = report.examined,
                        completed = report.completed,
                        compensated = report.compensated,
                        skipped = report.skipped,
                        failed = report.failed,
                        "recovery sweep finished"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "recovery sweep failed"),
            }
        }
    }

    /// One pass over transactions stuck past the staleness threshold.
    pub async fn sweep_once(&self) -> Result<SweepReport, CoreError> {
        let cutoff = Utc::now() - ChronoDuration::minutes(self.config.staleness_minutes);
        let stale = self
            .transactions
            .stale_pending(cutoff, self.config.batch_size)
            .await?;

        let mut report = SweepReport {
            examined: stale.len(),
            ..SweepReport::default()
        };

        for tx in stale {
            match self.recover_one(&tx).await {
                Ok(RecoveryOutcome::Completed) => report.completed += 1,
                Ok(RecoveryOutcome::Compensated) => report.compensated += 1,
                Ok(RecoveryOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    error!(id = %tx.id, error = %e, "failed to recover stuck transaction");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn recover_one(&self, tx: &Transaction) -> Result<RecoveryOutcome, CoreError> {
        let keys: Vec<String> = tx.lock_keys().iter().map(Uuid::to_string).collect();
        let guards = match self.locks.acquire_all(&keys).await {
            Ok(guards) => guards,
            // Another worker owns the actor; the next sweep will see this
            // transaction again if it is still stuck.
            Err(CoreError::Busy(_)) => return Ok(RecoveryOutcome::Skipped),
            Err(other) => return Err(other),
        };

        let outcome = self.recover_locked(tx).await;
        for guard in guards {
            if let Err(e) = guard.release().await {
                warn!(error = %e, "failed to release actor lock");
            }
        }
        outcome
    }

    async fn recover_locked(&self, tx: &Transaction) -> Result<RecoveryOutcome, CoreError> {
        // Re-read under lock: a concurrent sweep or the processor may have
        // already driven this transaction to a terminal state.
        let current = match self.transactions.get_by_id(tx.id).await {
            Ok(current) => current,
            Err(StoreError::NotFound(_)) => return Ok(RecoveryOutcome::Skipped),
            Err(other) => return Err(other.into()),
        };
        if current.status != TransactionStatus::Pending {
            return Ok(RecoveryOutcome::Skipped);
        }

        let accounts = match self.load_accounts(&current).await {
            Ok(accounts) => accounts,
            Err(StoreError::NotFound(_)) => {
                self.compensation.compensate(&current, REASON_UNABLE).await?;
                return Ok(RecoveryOutcome::Compensated);
            }
            Err(other) => return Err(other.into()),
        };

        if !balances_consistent(&current, &accounts) {
            self.compensation
                .compensate(&current, REASON_INCONSISTENT)
                .await?;
            return Ok(RecoveryOutcome::Compensated);
        }

        if accounts.iter().any(|a| !a.status.is_active()) {
            self.compensation.compensate(&current, REASON_UNABLE).await?;
            return Ok(RecoveryOutcome::Compensated);
        }

        self.complete(&current, &accounts).await?;
        Ok(RecoveryOutcome::Completed)
    }

    async fn load_accounts(&self, tx: &Transaction) -> Result<Vec<Account>, StoreError> {
        let mut accounts = Vec::with_capacity(2);
        if let Some(src) = tx.source_account {
            accounts.push(self.accounts.get(src).await?);
        }
        if let Some(dst) = tx.destination_account {
            accounts.push(self.accounts.get(dst).await?);
        }
        Ok(accounts)
    }

    /// Apply the balance effects and mark the transaction completed. Runs
    /// under the actor locks; the Pending→Completed compare-and-set is the
    /// final guard against a double apply.
    async fn complete(&self, tx: &Transaction, accounts: &[Account]) -> Result<(), CoreError> {
        let changes = match tx.kind {
            TransactionKind::Transfer => {
                let src = &accounts[0];
                let dst = &accounts[1];
                vec![
                    (src.id, &src.balance - &tx.amount),
                    (dst.id, &dst.balance + &tx.amount),
                ]
            }
            TransactionKind::Withdrawal => {
                let src = &accounts[0];
                vec![(src.id, &src.balance - &tx.amount)]
            }
            TransactionKind::Deposit => {
                let dst = &accounts[0];
                vec![(dst.id, &dst.balance + &tx.amount)]
            }
        };

        self.accounts.write_balances(&changes).await?;
        self.transactions
            .transition_status(
                tx.id,
                TransactionStatus::Pending,
                TransactionStatus::Completed,
                None,
            )
            .await?;
        self.publisher
            .publish(
                topics::LIFECYCLE,
                &TransactionEvent::with_detail(
                    tx.id,
                    EventType::RecoveryCompleted,
                    "completed by recovery".to_string(),
                ),
            )
            .await;
        info!(id = %tx.id, "stuck transaction completed by recovery");
        Ok(())
    }
}

/// A stuck transaction is internally consistent when the recorded amount can
/// still be applied: outgoing money is covered by the source balance, and an
/// already-credited destination has not drifted negative.
fn balances_consistent(tx: &Transaction, accounts: &[Account]) -> bool {
    match tx.kind {
        TransactionKind::Transfer | TransactionKind::Withdrawal => accounts
            .first()
            .map(|src| src.balance >= tx.amount)
            .unwrap_or(false),
        TransactionKind::Deposit => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AccountStatus;
    use crate::services::lock::LockConfig;
    use crate::testutil::{
        MemoryAccountStore, MemoryCache, MemoryEventLog, MemoryTransactionRepository,
    };
    use bigdecimal::BigDecimal;
    use std::str::FromStr;

    fn amount(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    struct Fixture {
        accounts: Arc<MemoryAccountStore>,
        transactions: Arc<MemoryTransactionRepository>,
        log: Arc<MemoryEventLog>,
        cache: Arc<MemoryCache>,
    }

    fn fixture() -> Fixture {
        Fixture {
            accounts: Arc::new(MemoryAccountStore::new()),
            transactions: Arc::new(MemoryTransactionRepository::new()),
            log: Arc::new(MemoryEventLog::new()),
            cache: Arc::new(MemoryCache::new()),
        }
    }

    fn sweep(fx: &Fixture) -> RecoverySweep {
        let publisher = EventPublisher::new(fx.log.clone());
        let locks = LockManager::new(
            fx.cache.clone(),
            LockConfig {
                backoff_ms: 1,
                max_attempts: 2,
                ..LockConfig::default()
            },
        );
        let compensation = CompensationService::new(
            fx.accounts.clone(),
            fx.transactions.clone(),
            publisher.clone(),
        );
        RecoverySweep::new(
            fx.accounts.clone(),
            fx.transactions.clone(),
            locks,
            compensation,
            publisher,
            RecoveryConfig::default(),
        )
    }

    fn seed_account(fx: &Fixture, balance: &str, status: AccountStatus) -> Uuid {
        let id = Uuid::new_v4();
        fx.accounts.insert(Account {
            id,
            balance: amount(balance),
            status,
        });
        id
    }

    /// A pending transfer created before the staleness threshold.
    fn stale_transfer(fx: &Fixture, src: Uuid, dst: Uuid, value: &str) -> Transaction {
        let mut tx = Transaction::new(
            TransactionKind::Transfer,
            Some(src),
            Some(dst),
            amount(value),
            String::new(),
        )
        .unwrap();
        tx.created_at = Utc::now() - ChronoDuration::minutes(30);
        tx.updated_at = tx.created_at;
        fx.transactions.put(tx.clone());
        tx
    }

    #[tokio::test]
    async fn stale_consistent_transfer_is_completed() {
        let fx = fixture();
        let src = seed_account(&fx, "100.00", AccountStatus::Active);
        let dst = seed_account(&fx, "0.00", AccountStatus::Active);
        let tx = stale_transfer(&fx, src, dst, "40.00");

        let report = sweep(&fx).sweep_once().await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.completed, 1);

        assert_eq!(fx.accounts.balance_of(src), amount("60.00"));
        assert_eq!(fx.accounts.balance_of(dst), amount("40.00"));
        assert_eq!(
            fx.transactions.get(tx.id).status,
            TransactionStatus::Completed
        );

        let events = fx.log.events(topics::LIFECYCLE);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::RecoveryCompleted);
        assert_eq!(events[0].last_error.as_deref(), Some("completed by recovery"));
    }

    #[tokio::test]
    async fn fresh_pending_transactions_are_left_alone() {
        let fx = fixture();
        let src = seed_account(&fx, "100.00", AccountStatus::Active);
        let dst = seed_account(&fx, "0.00", AccountStatus::Active);
        let tx = Transaction::new(
            TransactionKind::Transfer,
            Some(src),
            Some(dst),
            amount("40.00"),
            String::new(),
        )
        .unwrap();
        fx.transactions.put(tx.clone());

        let report = sweep(&fx).sweep_once().await.unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(
            fx.transactions.get(tx.id).status,
            TransactionStatus::Pending
        );
    }

    #[tokio::test]
    async fn insufficient_source_is_compensated_as_inconsistent() {
        let fx = fixture();
        let src = seed_account(&fx, "10.00", AccountStatus::Active);
        let dst = seed_account(&fx, "0.00", AccountStatus::Active);
        let tx = stale_transfer(&fx, src, dst, "40.00");

        let report = sweep(&fx).sweep_once().await.unwrap();
        assert_eq!(report.compensated, 1);

        let stored = fx.transactions.get(tx.id);
        assert_eq!(stored.status, TransactionStatus::RolledBack);
        assert_eq!(stored.error_detail.as_deref(), Some(REASON_INCONSISTENT));
    }

    #[tokio::test]
    async fn inactive_account_is_compensated_as_unable() {
        let fx = fixture();
        let src = seed_account(&fx, "100.00", AccountStatus::Active);
        let dst = seed_account(&fx, "0.00", AccountStatus::Frozen);
        let tx = stale_transfer(&fx, src, dst, "40.00");

        let report = sweep(&fx).sweep_once().await.unwrap();
        assert_eq!(report.compensated, 1);

        let stored = fx.transactions.get(tx.id);
        assert_eq!(stored.status, TransactionStatus::RolledBack);
        assert_eq!(stored.error_detail.as_deref(), Some(REASON_UNABLE));
    }

    #[tokio::test]
    async fn sweep_is_idempotent_against_rerun() {
        let fx = fixture();
        let src = seed_account(&fx, "100.00", AccountStatus::Active);
        let dst = seed_account(&fx, "0.00", AccountStatus::Active);
        stale_transfer(&fx, src, dst, "40.00");

        let sweeper = sweep(&fx);
        let first = sweeper.sweep_once().await.unwrap();
        assert_eq!(first.completed, 1);

        // The transaction is Completed now; a second pass finds nothing.
        let second = sweeper.sweep_once().await.unwrap();
        assert_eq!(second.examined, 0);
        assert_eq!(fx.accounts.balance_of(src), amount("60.00"));
    }

    #[tokio::test]
    async fn concurrent_sweeps_apply_effects_exactly_once() {
        let fx = fixture();
        let src = seed_account(&fx, "100.00", AccountStatus::Active);
        let dst = seed_account(&fx, "0.00", AccountStatus::Active);
        stale_transfer(&fx, src, dst, "40.00");

        let a = sweep(&fx);
        let b = sweep(&fx);
        let (ra, rb) = tokio::join!(a.sweep_once(), b.sweep_once());
        let total = ra.unwrap().completed + rb.unwrap().completed;

        assert_eq!(total, 1);
        assert_eq!(fx.accounts.balance_of(src), amount("60.00"));
        assert_eq!(fx.accounts.balance_of(dst), amount("40.00"));
    }

    #[tokio::test]
    async fn stale_withdrawal_recovers() {
        let fx = fixture();
        let src = seed_account(&fx, "100.00", AccountStatus::Active);
        let mut tx = Transaction::new(
            TransactionKind::Withdrawal,
            Some(src),
            None,
            amount("25.00"),
            String::new(),
        )
        .unwrap();
        tx.created_at = Utc::now() - ChronoDuration::minutes(30);
        fx.transactions.put(tx.clone());

        let report = sweep(&fx).sweep_once().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(fx.accounts.balance_of(src), amount("75.00"));
    }
}
