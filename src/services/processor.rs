//! Transaction state machine and processor.
//!
//! Drives a money movement from submission to a terminal state: structural
//! validation, limit checks, actor locking, the atomic balance mutation, and
//! exactly one lifecycle event per transition. Balance effects for a transfer
//! are two writes that land together or not at all.

use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::event::topics;
use crate::domain::{
    AccountStatus, EventType, Transaction, TransactionEvent, TransactionKind, TransactionStatus,
};
use crate::error::CoreError;
use crate::ports::{AccountStore, StoreError, TransactionRepository};
use crate::services::events::EventPublisher;
use crate::services::lock::LockManager;
use crate::services::validator::LimitValidator;

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub kind: TransactionKind,
    pub source_account: Option<Uuid>,
    pub destination_account: Option<Uuid>,
    pub amount: BigDecimal,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    pub id: Uuid,
    pub status: TransactionStatus,
}

/// Why a balance mutation could not be applied. Recorded as the failed
/// transaction's error detail.
#[derive(Debug, Error)]
enum MutationError {
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("account {0} is {1}")]
    AccountNotActive(Uuid, AccountStatus),
    #[error("{0}")]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct TransactionProcessor {
    accounts: Arc<dyn AccountStore>,
    transactions: Arc<dyn TransactionRepository>,
    validator: Arc<LimitValidator>,
    locks: LockManager,
    publisher: EventPublisher,
}

impl TransactionProcessor {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        transactions: Arc<dyn TransactionRepository>,
        validator: Arc<LimitValidator>,
        locks: LockManager,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            accounts,
            transactions,
            validator,
            locks,
            publisher,
        }
    }

    /// Submit a money movement and drive it to a terminal state. Validation
    /// and contention problems surface as errors; a mutation failure is
    /// recorded on the transaction itself, which lands `Failed`.
    pub async fn submit(&self, request: SubmitRequest) -> Result<TransactionResult, CoreError> {
        let tx = Transaction::new(
            request.kind,
            request.source_account,
            request.destination_account,
            request.amount,
            request.description,
        )?;

        let actor = self.accounts.get(tx.primary_actor()).await?;
        self.validator.validate(&actor, &tx.amount, tx.kind).await?;

        let keys: Vec<String> = tx.lock_keys().iter().map(Uuid::to_string).collect();
        let guards = self.locks.acquire_all(&keys).await?;
        let outcome = self.execute(&tx).await;
        for guard in guards {
            if let Err(e) = guard.release().await {
                warn!(error = %e, "failed to release actor lock");
            }
        }
        outcome
    }

    async fn execute(&self, tx: &Transaction) -> Result<TransactionResult, CoreError> {
        self.transactions.insert(tx).await?;
        self.publisher
            .publish(
                topics::LIFECYCLE,
                &TransactionEvent::new(tx.id, EventType::Initiated),
            )
            .await;

        match self.apply_effects(tx).await {
            Ok(()) => {
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
                        &TransactionEvent::new(tx.id, EventType::Completed),
                    )
                    .await;
                self.validator
                    .record_usage(tx.primary_actor(), &tx.amount, tx.kind)
                    .await;
                info!(id = %tx.id, kind = %tx.kind, "transaction completed");
                Ok(TransactionResult {
                    id: tx.id,
                    status: TransactionStatus::Completed,
                })
            }
            Err(failure) => {
                let detail = failure.to_string();
                self.transactions
                    .transition_status(
                        tx.id,
                        TransactionStatus::Pending,
                        TransactionStatus::Failed,
                        Some(&detail),
                    )
                    .await?;
                self.publisher
                    .publish(
                        topics::LIFECYCLE,
                        &TransactionEvent::with_detail(tx.id, EventType::Failed, detail.clone()),
                    )
                    .await;
                warn!(id = %tx.id, kind = %tx.kind, detail, "transaction failed");
                Ok(TransactionResult {
                    id: tx.id,
                    status: TransactionStatus::Failed,
                })
            }
        }
    }

    /// Re-read the touched accounts under lock and apply the balance deltas
    /// as one unit of work.
    async fn apply_effects(&self, tx: &Transaction) -> Result<(), MutationError> {
        let changes = match tx.kind {
            TransactionKind::Transfer => {
                let src_id = tx.source_account.expect("shape validated at construction");
                let dst_id = tx
                    .destination_account
                    .expect("shape validated at construction");
                let src = self.accounts.get(src_id).await?;
                let dst = self.accounts.get(dst_id).await?;
                if !src.status.is_active() {
                    return Err(MutationError::AccountNotActive(src.id, src.status));
                }
                if !dst.status.is_active() {
                    return Err(MutationError::AccountNotActive(dst.id, dst.status));
                }
                if src.balance < tx.amount {
                    return Err(MutationError::InsufficientFunds);
                }
                vec![
                    (src.id, &src.balance - &tx.amount),
                    (dst.id, &dst.balance + &tx.amount),
                ]
            }
            TransactionKind::Withdrawal => {
                let src_id = tx.source_account.expect("shape validated at construction");
                let src = self.accounts.get(src_id).await?;
                if !src.status.is_active() {
                    return Err(MutationError::AccountNotActive(src.id, src.status));
                }
                if src.balance < tx.amount {
                    return Err(MutationError::InsufficientFunds);
                }
                vec![(src.id, &src.balance - &tx.amount)]
            }
            TransactionKind::Deposit => {
                let dst_id = tx
                    .destination_account
                    .expect("shape validated at construction");
                let dst = self.accounts.get(dst_id).await?;
                if !dst.status.is_active() {
                    return Err(MutationError::AccountNotActive(dst.id, dst.status));
                }
                vec![(dst.id, &dst.balance + &tx.amount)]
            }
        };

        self.accounts.write_balances(&changes).await?;
        Ok(())
    }

    /// Cancel a transaction that has not started mutating balances. Legal
    /// only while `Pending`; the actor locks serialize this against the
    /// processor and the recovery sweep.
    pub async fn cancel(&self, id: Uuid) -> Result<TransactionResult, CoreError> {
        let tx = self.get_by_id(id).await?;
        let keys: Vec<String> = tx.lock_keys().iter().map(Uuid::to_string).collect();
        let guards = self.locks.acquire_all(&keys).await?;
        let outcome = self.cancel_locked(id).await;
        for guard in guards {
            if let Err(e) = guard.release().await {
                warn!(error = %e, "failed to release actor lock");
            }
        }
        outcome
    }

    async fn cancel_locked(&self, id: Uuid) -> Result<TransactionResult, CoreError> {
        let current = self.get_by_id(id).await?;
        if current.status != TransactionStatus::Pending {
            return Err(CoreError::InvalidOperation(format!(
                "cannot cancel a {} transaction",
                current.status
            )));
        }

        self.transactions
            .transition_status(
                id,
                TransactionStatus::Pending,
                TransactionStatus::Cancelled,
                None,
            )
            .await?;
        self.publisher
            .publish(
                topics::LIFECYCLE,
                &TransactionEvent::new(id, EventType::Cancelled),
            )
            .await;
        info!(%id, "transaction cancelled");
        Ok(TransactionResult {
            id,
            status: TransactionStatus::Cancelled,
        })
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Transaction, CoreError> {
        match self.transactions.get_by_id(id).await {
            Ok(tx) => Ok(tx),
            Err(StoreError::NotFound(_)) => Err(CoreError::NotFound(id)),
            Err(other) => Err(other.into()),
        }
    }

    pub async fn history(
        &self,
        account: Uuid,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Transaction>, CoreError> {
        Ok(self.transactions.history(account, from, to).await?)
    }
}
