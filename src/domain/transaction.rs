//! Transaction domain entity.
//! Framework-agnostic representation of a money movement and its lifecycle.

use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Transfer,
    Deposit,
    Withdrawal,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Transfer => "transfer",
            TransactionKind::Deposit => "deposit",
            TransactionKind::Withdrawal => "withdrawal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "transfer" => Some(TransactionKind::Transfer),
            "deposit" => Some(TransactionKind::Deposit),
            "withdrawal" => Some(TransactionKind::Withdrawal),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    RolledBack,
    RollbackFailed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::RolledBack => "rolled_back",
            TransactionStatus::RollbackFailed => "rollback_failed",
            TransactionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TransactionStatus::Pending),
            "completed" => Some(TransactionStatus::Completed),
            "failed" => Some(TransactionStatus::Failed),
            "rolled_back" => Some(TransactionStatus::RolledBack),
            "rollback_failed" => Some(TransactionStatus::RollbackFailed),
            "cancelled" => Some(TransactionStatus::Cancelled),
            _ => None,
        }
    }

    /// Pending is the only non-terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }

    /// Legal transition table. Completed may still be rolled back by
    /// compensation; every other terminal state is immutable.
    pub fn can_transition(from: TransactionStatus, to: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (from, to),
            (Pending, Completed)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Pending, RolledBack)
                | (Pending, RollbackFailed)
                | (Completed, RolledBack)
                | (Completed, RollbackFailed)
        )
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("amount must be strictly positive")]
    NonPositiveAmount,
    #[error("amount has more than two fractional digits")]
    AmountTooPrecise,
    #[error("a transfer requires both source and destination accounts")]
    TransferAccountsMissing,
    #[error("a transfer requires distinct source and destination accounts")]
    TransferSameAccount,
    #[error("a deposit takes a destination account only")]
    DepositShape,
    #[error("a withdrawal takes a source account only")]
    WithdrawalShape,
}

/// Domain entity representing a money movement.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: Uuid,
    pub kind: TransactionKind,
    pub source_account: Option<Uuid>,
    pub destination_account: Option<Uuid>,
    pub amount: BigDecimal,
    pub status: TransactionStatus,
    pub description: String,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Build a new pending transaction, enforcing the structural invariants
    /// for the given kind.
    pub fn new(
        kind: TransactionKind,
        source_account: Option<Uuid>,
        destination_account: Option<Uuid>,
        amount: BigDecimal,
        description: String,
    ) -> Result<Self, DomainError> {
        if amount <= BigDecimal::zero() {
            return Err(DomainError::NonPositiveAmount);
        }
        if amount_minor_units(&amount).is_none() {
            return Err(DomainError::AmountTooPrecise);
        }

        match kind {
            TransactionKind::Transfer => match (source_account, destination_account) {
                (Some(src), Some(dst)) if src == dst => {
                    return Err(DomainError::TransferSameAccount)
                }
                (Some(_), Some(_)) => {}
                _ => return Err(DomainError::TransferAccountsMissing),
            },
            TransactionKind::Deposit => {
                if destination_account.is_none() || source_account.is_some() {
                    return Err(DomainError::DepositShape);
                }
            }
            TransactionKind::Withdrawal => {
                if source_account.is_none() || destination_account.is_some() {
                    return Err(DomainError::WithdrawalShape);
                }
            }
        }

        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            kind,
            source_account,
            destination_account,
            amount,
            status: TransactionStatus::Pending,
            description,
            error_detail: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// The actor whose limits govern this transaction: the account money
    /// leaves, or the credited account for a deposit.
    pub fn primary_actor(&self) -> Uuid {
        match self.kind {
            TransactionKind::Transfer | TransactionKind::Withdrawal => self
                .source_account
                .expect("shape validated at construction"),
            TransactionKind::Deposit => self
                .destination_account
                .expect("shape validated at construction"),
        }
    }

    /// Accounts to lock, in the fixed total order (Uuid ordering) that keeps
    /// mirror-image transfers from deadlocking.
    pub fn lock_keys(&self) -> Vec<Uuid> {
        let mut keys: Vec<Uuid> = self
            .source_account
            .iter()
            .chain(self.destination_account.iter())
            .copied()
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

/// Convert a fixed-point amount to integer minor units (cents).
/// Returns None when the amount carries more than two fractional digits.
pub fn amount_minor_units(amount: &BigDecimal) -> Option<i64> {
    let scaled = amount * BigDecimal::from(100);
    let (_, exponent) = scaled.normalized().as_bigint_and_exponent();
    if exponent > 0 {
        return None;
    }
    scaled.to_i64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn amount(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).expect("valid decimal")
    }

    #[test]
    fn transfer_requires_both_accounts() {
        let src = Uuid::new_v4();
        let result = Transaction::new(
            TransactionKind::Transfer,
            Some(src),
            None,
            amount("10.00"),
            "rent".into(),
        );
        assert_eq!(result.unwrap_err(), DomainError::TransferAccountsMissing);
    }

    #[test]
    fn transfer_rejects_same_account() {
        let acct = Uuid::new_v4();
        let result = Transaction::new(
            TransactionKind::Transfer,
            Some(acct),
            Some(acct),
            amount("10.00"),
            String::new(),
        );
        assert_eq!(result.unwrap_err(), DomainError::TransferSameAccount);
    }

    #[test]
    fn deposit_takes_destination_only() {
        let acct = Uuid::new_v4();
        assert!(Transaction::new(
            TransactionKind::Deposit,
            None,
            Some(acct),
            amount("5"),
            String::new(),
        )
        .is_ok());

        let result = Transaction::new(
            TransactionKind::Deposit,
            Some(acct),
            Some(Uuid::new_v4()),
            amount("5"),
            String::new(),
        );
        assert_eq!(result.unwrap_err(), DomainError::DepositShape);
    }

    #[test]
    fn withdrawal_takes_source_only() {
        let acct = Uuid::new_v4();
        assert!(Transaction::new(
            TransactionKind::Withdrawal,
            Some(acct),
            None,
            amount("5"),
            String::new(),
        )
        .is_ok());

        let result = Transaction::new(
            TransactionKind::Withdrawal,
            None,
            Some(acct),
            amount("5"),
            String::new(),
        );
        assert_eq!(result.unwrap_err(), DomainError::WithdrawalShape);
    }

    #[test]
    fn rejects_non_positive_amounts() {
        let acct = Uuid::new_v4();
        for bad in ["0", "-1.00"] {
            let result = Transaction::new(
                TransactionKind::Deposit,
                None,
                Some(acct),
                amount(bad),
                String::new(),
            );
            assert_eq!(result.unwrap_err(), DomainError::NonPositiveAmount);
        }
    }

    #[test]
    fn rejects_sub_cent_precision() {
        let acct = Uuid::new_v4();
        let result = Transaction::new(
            TransactionKind::Deposit,
            None,
            Some(acct),
            amount("1.005"),
            String::new(),
        );
        assert_eq!(result.unwrap_err(), DomainError::AmountTooPrecise);
    }

    #[test]
    fn minor_units_conversion() {
        assert_eq!(amount_minor_units(&amount("12.34")), Some(1234));
        assert_eq!(amount_minor_units(&amount("100")), Some(10000));
        assert_eq!(amount_minor_units(&amount("0.10")), Some(10));
        assert_eq!(amount_minor_units(&amount("0.005")), None);
    }

    #[test]
    fn new_transaction_starts_pending() {
        let tx = Transaction::new(
            TransactionKind::Deposit,
            None,
            Some(Uuid::new_v4()),
            amount("20.00"),
            "payroll".into(),
        )
        .unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert!(tx.error_detail.is_none());
    }

    #[test]
    fn lock_keys_are_sorted_and_unique() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let tx = Transaction::new(
            TransactionKind::Transfer,
            Some(a.max(b)),
            Some(a.min(b)),
            amount("1.00"),
            String::new(),
        )
        .unwrap();
        assert_eq!(tx.lock_keys(), vec![a.min(b), a.max(b)]);
    }

    #[test]
    fn transition_table() {
        use TransactionStatus::*;
        assert!(TransactionStatus::can_transition(Pending, Completed));
        assert!(TransactionStatus::can_transition(Pending, Failed));
        assert!(TransactionStatus::can_transition(Pending, Cancelled));
        assert!(TransactionStatus::can_transition(Completed, RolledBack));
        assert!(TransactionStatus::can_transition(Completed, RollbackFailed));

        assert!(!TransactionStatus::can_transition(Completed, Pending));
        assert!(!TransactionStatus::can_transition(Failed, Completed));
        assert!(!TransactionStatus::can_transition(Cancelled, Completed));
        assert!(!TransactionStatus::can_transition(RolledBack, Completed));
        assert!(!TransactionStatus::can_transition(RollbackFailed, RolledBack));
    }

    #[test]
    fn status_round_trips_through_text() {
        use TransactionStatus::*;
        for status in [Pending, Completed, Failed, RolledBack, RollbackFailed, Cancelled] {
            assert_eq!(TransactionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TransactionStatus::parse("unknown"), None);
    }
}
