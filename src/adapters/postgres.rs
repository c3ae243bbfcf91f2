//! Postgres implementations of the account store and transaction repository.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use crate::domain::{
    Account, AccountStatus, LimitOverride, Transaction, TransactionKind, TransactionStatus,
};
use crate::ports::{AccountStore, StoreError, TransactionRepository};

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// Postgres-backed account store. Balances are written as absolute values
/// inside a single database transaction.
#[derive(Clone)]
pub struct PostgresAccountStore {
    pool: PgPool,
}

impl PostgresAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for PostgresAccountStore {
    async fn get(&self, id: Uuid) -> Result<Account, StoreError> {
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT id, balance, status FROM accounts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_domain())
            .transpose()?
            .ok_or_else(|| StoreError::NotFound(format!("account {}", id)))
    }

    async fn write_balances(&self, changes: &[(Uuid, BigDecimal)]) -> Result<(), StoreError> {
        let mut db_tx = self.pool.begin().await?;

        for (account_id, new_balance) in changes {
            let result = sqlx::query(
                "UPDATE accounts SET balance = $2, updated_at = NOW() WHERE id = $1",
            )
            .bind(account_id)
            .bind(new_balance)
            .execute(&mut *db_tx)
            .await?;

            if result.rows_affected() != 1 {
                db_tx.rollback().await?;
                return Err(StoreError::NotFound(format!("account {}", account_id)));
            }
        }

        db_tx.commit().await?;
        Ok(())
    }
}

/// Postgres-backed transaction repository.
#[derive(Clone)]
pub struct PostgresTransactionRepository {
    pool: PgPool,
}

impl PostgresTransactionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionRepository for PostgresTransactionRepository {
    async fn insert(&self, tx: &Transaction) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO transactions (
                id, kind, source_account, destination_account, amount, status,
                description, error_detail, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(tx.id)
        .bind(tx.kind.as_str())
        .bind(tx.source_account)
        .bind(tx.destination_account)
        .bind(&tx.amount)
        .bind(tx.status.as_str())
        .bind(&tx.description)
        .bind(&tx.error_detail)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: TransactionStatus,
        to: TransactionStatus,
        error_detail: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET status = $3, error_detail = COALESCE($4, error_detail), updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(error_detail)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        // Distinguish a lost CAS race from a missing row.
        let exists: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM transactions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        match exists {
            Some(_) => Err(StoreError::Conflict(format!(
                "transaction {} is no longer {}",
                id, from
            ))),
            None => Err(StoreError::NotFound(format!("transaction {}", id))),
        }
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Transaction, StoreError> {
        let row = sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM transactions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_domain())
            .transpose()?
            .ok_or_else(|| StoreError::NotFound(format!("transaction {}", id)))
    }

    async fn history(
        &self,
        account: Uuid,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Transaction>, StoreError> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT * FROM transactions
            WHERE (source_account = $1 OR destination_account = $1)
              AND ($2::timestamptz IS NULL OR created_at >= $2)
              AND ($3::timestamptz IS NULL OR created_at <= $3)
            ORDER BY created_at DESC
            "#,
        )
        .bind(account)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_domain()).collect()
    }

    async fn stale_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Transaction>, StoreError> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT * FROM transactions
            WHERE status = 'pending' AND created_at < $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_domain()).collect()
    }

    async fn outflow_since(
        &self,
        account: Uuid,
        since: DateTime<Utc>,
    ) -> Result<BigDecimal, StoreError> {
        let total: BigDecimal = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount), 0)
            FROM transactions
            WHERE source_account = $1
              AND status = 'completed'
              AND kind IN ('transfer', 'withdrawal')
              AND created_at >= $2
            "#,
        )
        .bind(account)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }

    async fn active_limit_override(
        &self,
        account: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<LimitOverride>, StoreError> {
        let row = sqlx::query_as::<_, LimitOverrideRow>(
            r#"
            SELECT account_id, max_amount, starts_at, expires_at
            FROM limit_overrides
            WHERE account_id = $1 AND starts_at <= $2 AND expires_at > $2
            ORDER BY expires_at DESC
            LIMIT 1
            "#,
        )
        .bind(account)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into_domain()))
    }
}

/// Internal row type for SQLx. Not exposed outside the adapter.
#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    balance: BigDecimal,
    status: String,
}

impl AccountRow {
    fn into_domain(self) -> Result<Account, StoreError> {
        let status = AccountStatus::parse(&self.status).ok_or_else(|| {
            StoreError::Backend(format!("unknown account status '{}'", self.status))
        })?;
        Ok(Account {
            id: self.id,
            balance: self.balance,
            status,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    kind: String,
    source_account: Option<Uuid>,
    destination_account: Option<Uuid>,
    amount: BigDecimal,
    status: String,
    description: String,
    error_detail: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TransactionRow {
    fn into_domain(self) -> Result<Transaction, StoreError> {
        let kind = TransactionKind::parse(&self.kind).ok_or_else(|| {
            StoreError::Backend(format!("unknown transaction kind '{}'", self.kind))
        })?;
        let status = TransactionStatus::parse(&self.status).ok_or_else(|| {
            StoreError::Backend(format!("unknown transaction status '{}'", self.status))
        })?;
        Ok(Transaction {
            id: self.id,
            kind,
            source_account: self.source_account,
            destination_account: self.destination_account,
            amount: self.amount,
            status,
            description: self.description,
            error_detail: self.error_detail,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LimitOverrideRow {
    account_id: Uuid,
    max_amount: BigDecimal,
    starts_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl LimitOverrideRow {
    fn into_domain(self) -> LimitOverride {
        LimitOverride {
            account_id: self.account_id,
            max_amount: self.max_amount,
            starts_at: self.starts_at,
            expires_at: self.expires_at,
        }
    }
}
