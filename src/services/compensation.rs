//! Compensation: reverse the balance effects of a transaction after the
//! fact and mark it rolled back. A reversal that cannot be written lands the
//! transaction in `RollbackFailed`, the one state left for an operator.

use std::sync::Arc;

use bigdecimal::BigDecimal;
use tracing::{error, info};
use uuid::Uuid;

use crate::domain::event::topics;
use crate::domain::{EventType, Transaction, TransactionEvent, TransactionKind, TransactionStatus};
use crate::error::CoreError;
use crate::ports::{AccountStore, TransactionRepository};
use crate::services::events::EventPublisher;

#[derive(Clone)]
pub struct CompensationService {
    accounts: Arc<dyn AccountStore>,
    transactions: Arc<dyn TransactionRepository>,
    publisher: EventPublisher,
}

impl CompensationService {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        transactions: Arc<dyn TransactionRepository>,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            accounts,
            transactions,
            publisher,
        }
    }

    /// Reverse `tx` and mark it `RolledBack`, or mark it `RollbackFailed`
    /// and propagate when the reversal write does not land. Either way one
    /// lifecycle event carries the reason.
    pub async fn compensate(&self, tx: &Transaction, reason: &str) -> Result<(), CoreError> {
        if !TransactionStatus::can_transition(tx.status, TransactionStatus::RolledBack) {
            return Err(CoreError::InvalidOperation(format!(
                "cannot compensate a {} transaction",
                tx.status
            )));
        }

        let changes = self.reversal_changes(tx).await?;
        match self.accounts.write_balances(&changes).await {
            Ok(()) => {
                self.transactions
                    .transition_status(tx.id, tx.status, TransactionStatus::RolledBack, Some(reason))
                    .await?;
                self.publisher
                    .publish(
                        topics::LIFECYCLE,
                        &TransactionEvent::with_detail(
                            tx.id,
                            EventType::Compensated,
                            reason.to_string(),
                        ),
                    )
                    .await;
                info!(id = %tx.id, reason, "transaction compensated");
                Ok(())
            }
            Err(failure) => {
                let detail = format!("{}; reversal failed: {}", reason, failure);
                self.transactions
                    .transition_status(
                        tx.id,
                        tx.status,
                        TransactionStatus::RollbackFailed,
                        Some(&detail),
                    )
                    .await?;
                self.publisher
                    .publish(
                        topics::LIFECYCLE,
                        &TransactionEvent::with_detail(
                            tx.id,
                            EventType::CompensationFailed,
                            detail.clone(),
                        ),
                    )
                    .await;
                error!(id = %tx.id, detail, "compensation failed, manual intervention required");
                Err(CoreError::RollbackFailed { id: tx.id, detail })
            }
        }
    }

    /// The write set that undoes the transaction's balance effects.
    async fn reversal_changes(
        &self,
        tx: &Transaction,
    ) -> Result<Vec<(Uuid, BigDecimal)>, CoreError> {
        let changes = match tx.kind {
            TransactionKind::Transfer => {
                let src_id = tx.source_account.expect("shape validated at construction");
                let dst_id = tx
                    .destination_account
                    .expect("shape validated at construction");
                let src = self.accounts.get(src_id).await?;
                let dst = self.accounts.get(dst_id).await?;
                vec![
                    (src.id, &src.balance + &tx.amount),
                    (dst.id, &dst.balance - &tx.amount),
                ]
            }
            TransactionKind::Withdrawal => {
                let src_id = tx.source_account.expect("shape validated at construction");
                let src = self.accounts.get(src_id).await?;
                vec![(src.id, &src.balance + &tx.amount)]
            }
            TransactionKind::Deposit => {
                let dst_id = tx
                    .destination_account
                    .expect("shape validated at construction");
                let dst = self.accounts.get(dst_id).await?;
                vec![(dst.id, &dst.balance - &tx.amount)]
            }
        };
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Account, AccountStatus};
    use crate::testutil::{MemoryAccountStore, MemoryEventLog, MemoryTransactionRepository};
    use std::str::FromStr;

    fn amount(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    struct Fixture {
        accounts: Arc<MemoryAccountStore>,
        transactions: Arc<MemoryTransactionRepository>,
        log: Arc<MemoryEventLog>,
        service: CompensationService,
    }

    fn fixture() -> Fixture {
        let accounts = Arc::new(MemoryAccountStore::new());
        let transactions = Arc::new(MemoryTransactionRepository::new());
        let log = Arc::new(MemoryEventLog::new());
        let service = CompensationService::new(
            accounts.clone(),
            transactions.clone(),
            EventPublisher::new(log.clone()),
        );
        Fixture {
            accounts,
            transactions,
            log,
            service,
        }
    }

    fn seed_account(fx: &Fixture, balance: &str) -> Uuid {
        let id = Uuid::new_v4();
        fx.accounts.insert(Account {
            id,
            balance: amount(balance),
            status: AccountStatus::Active,
        });
        id
    }

    fn completed_transfer(fx: &Fixture, src: Uuid, dst: Uuid, value: &str) -> Transaction {
        let mut tx = Transaction::new(
            TransactionKind::Transfer,
            Some(src),
            Some(dst),
            amount(value),
            String::new(),
        )
        .unwrap();
        tx.status = TransactionStatus::Completed;
        fx.transactions.put(tx.clone());
        tx
    }

    #[tokio::test]
    async fn transfer_reversal_credits_source_and_debits_destination() {
        let fx = fixture();
        // Balances as they stand after the forward transfer of 30.00.
        let src = seed_account(&fx, "70.00");
        let dst = seed_account(&fx, "130.00");
        let tx = completed_transfer(&fx, src, dst, "30.00");

        fx.service.compensate(&tx, "operator reversal").await.unwrap();

        assert_eq!(fx.accounts.balance_of(src), amount("100.00"));
        assert_eq!(fx.accounts.balance_of(dst), amount("100.00"));

        let stored = fx.transactions.get(tx.id);
        assert_eq!(stored.status, TransactionStatus::RolledBack);
        assert_eq!(stored.error_detail.as_deref(), Some("operator reversal"));

        let events = fx.log.events(topics::LIFECYCLE);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Compensated);
        assert_eq!(events[0].last_error.as_deref(), Some("operator reversal"));
    }

    #[tokio::test]
    async fn withdrawal_reversal_credits_source() {
        let fx = fixture();
        let src = seed_account(&fx, "40.00");
        let mut tx = Transaction::new(
            TransactionKind::Withdrawal,
            Some(src),
            None,
            amount("60.00"),
            String::new(),
        )
        .unwrap();
        tx.status = TransactionStatus::Completed;
        fx.transactions.put(tx.clone());

        fx.service.compensate(&tx, "atm failure").await.unwrap();
        assert_eq!(fx.accounts.balance_of(src), amount("100.00"));
    }

    #[tokio::test]
    async fn deposit_reversal_debits_destination() {
        let fx = fixture();
        let dst = seed_account(&fx, "100.00");
        let mut tx = Transaction::new(
            TransactionKind::Deposit,
            None,
            Some(dst),
            amount("25.00"),
            String::new(),
        )
        .unwrap();
        tx.status = TransactionStatus::Completed;
        fx.transactions.put(tx.clone());

        fx.service.compensate(&tx, "chargeback").await.unwrap();
        assert_eq!(fx.accounts.balance_of(dst), amount("75.00"));
    }

    #[tokio::test]
    async fn reversal_write_failure_marks_rollback_failed() {
        let fx = fixture();
        let src = seed_account(&fx, "70.00");
        let dst = seed_account(&fx, "130.00");
        let tx = completed_transfer(&fx, src, dst, "30.00");
        fx.accounts
            .fail_writes
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let result = fx.service.compensate(&tx, "recovery").await;
        assert!(matches!(result, Err(CoreError::RollbackFailed { id, .. }) if id == tx.id));

        // Balances untouched, status terminal, event emitted.
        assert_eq!(fx.accounts.balance_of(src), amount("70.00"));
        let stored = fx.transactions.get(tx.id);
        assert_eq!(stored.status, TransactionStatus::RollbackFailed);

        let events = fx.log.events(topics::LIFECYCLE);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::CompensationFailed);
    }

    #[tokio::test]
    async fn terminal_states_other_than_completed_cannot_be_compensated() {
        let fx = fixture();
        let src = seed_account(&fx, "100.00");
        let mut tx = Transaction::new(
            TransactionKind::Withdrawal,
            Some(src),
            None,
            amount("10.00"),
            String::new(),
        )
        .unwrap();
        tx.status = TransactionStatus::Cancelled;
        fx.transactions.put(tx.clone());

        let result = fx.service.compensate(&tx, "nope").await;
        assert!(matches!(result, Err(CoreError::InvalidOperation(_))));
        assert_eq!(fx.accounts.balance_of(src), amount("100.00"));
    }
}
