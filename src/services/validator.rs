//! Limit and frequency enforcement.
//!
//! Pure decision logic over the actor's rolling usage, backed by the cache
//! for hot reads and falling back to the authoritative transaction history
//! on a miss. Frequency counters are cache-incremented with window-aligned
//! TTLs and fail closed when the backing store is unavailable.

use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::transaction::amount_minor_units;
use crate::domain::TransactionKind;
use crate::domain::Account;
use crate::error::{CoreError, RejectionReason};
use crate::ports::{Cache, TransactionRepository};

const USAGE_PREFIX: &str = "limits:";

#[derive(Debug, Clone)]
pub struct LimitConfig {
    pub per_transaction_ceiling: BigDecimal,
    pub daily_limit: BigDecimal,
    pub monthly_limit: BigDecimal,
    pub max_ops_per_minute: i64,
    pub max_ops_per_day: i64,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            per_transaction_ceiling: BigDecimal::from(1_000_000),
            daily_limit: BigDecimal::from(2_000_000),
            monthly_limit: BigDecimal::from(20_000_000),
            max_ops_per_minute: 10,
            max_ops_per_day: 200,
        }
    }
}

pub struct LimitValidator {
    transactions: Arc<dyn TransactionRepository>,
    cache: Arc<dyn Cache>,
    config: LimitConfig,
}

impl LimitValidator {
    pub fn new(
        transactions: Arc<dyn TransactionRepository>,
        cache: Arc<dyn Cache>,
        config: LimitConfig,
    ) -> Self {
        Self {
            transactions,
            cache,
            config,
        }
    }

    /// Approve or reject `amount` for the given actor. Checks short-circuit
    /// on the first failure: account status, then the amount ceilings
    /// (unless an active override raises them past this amount), then the
    /// operation-frequency counters, which an override never bypasses.
    pub async fn validate(
        &self,
        account: &Account,
        amount: &BigDecimal,
        kind: TransactionKind,
    ) -> Result<(), CoreError> {
        if !account.status.is_active() {
            return Err(RejectionReason::AccountNotActive(account.status.to_string()).into());
        }

        let now = Utc::now();
        let bypass_ceilings = match self
            .transactions
            .active_limit_override(account.id, now)
            .await?
        {
            Some(exception) if amount <= &exception.max_amount => {
                debug!(account = %account.id, "limit exception active, ceilings bypassed");
                true
            }
            _ => false,
        };

        if !bypass_ceilings {
            if amount > &self.config.per_transaction_ceiling {
                return Err(RejectionReason::CeilingExceeded {
                    limit: self.config.per_transaction_ceiling.to_string(),
                }
                .into());
            }

            // Rolling outflow totals only constrain money leaving the actor.
            if matches!(kind, TransactionKind::Transfer | TransactionKind::Withdrawal) {
                let daily = self.rolling_total(account.id, Window::Day, now).await?;
                if &daily + amount > self.config.daily_limit {
                    return Err(RejectionReason::DailyLimitExceeded {
                        limit: self.config.daily_limit.to_string(),
                    }
                    .into());
                }

                let monthly = self.rolling_total(account.id, Window::Month, now).await?;
                if &monthly + amount > self.config.monthly_limit {
                    return Err(RejectionReason::MonthlyLimitExceeded {
                        limit: self.config.monthly_limit.to_string(),
                    }
                    .into());
                }
            }
        }

        self.check_frequency(account.id, now).await?;
        Ok(())
    }

    /// Fixed-window operation counters. A counter that cannot be
    /// incremented fails closed: unlimited throughput is worse than a
    /// spurious rejection.
    async fn check_frequency(&self, account: Uuid, now: DateTime<Utc>) -> Result<(), CoreError> {
        let minute_key = format!(
            "{}{}:opm:{}",
            USAGE_PREFIX,
            account,
            now.timestamp() / 60
        );
        let per_minute = match self.cache.incr_ex(&minute_key, 120).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "per-minute counter unavailable, failing closed");
                return Err(RejectionReason::CounterUnavailable.into());
            }
        };
        if per_minute > self.config.max_ops_per_minute {
            return Err(RejectionReason::TooManyPerMinute {
                max: self.config.max_ops_per_minute,
            }
            .into());
        }

        let day_key = format!(
            "{}{}:opd:{}",
            USAGE_PREFIX,
            account,
            now.format("%Y%m%d")
        );
        let per_day = match self
            .cache
            .incr_ex(&day_key, secs_until_next_midnight(now))
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "per-day counter unavailable, failing closed");
                return Err(RejectionReason::CounterUnavailable.into());
            }
        };
        if per_day > self.config.max_ops_per_day {
            return Err(RejectionReason::TooManyPerDay {
                max: self.config.max_ops_per_day,
            }
            .into());
        }

        Ok(())
    }

    /// Cached rolling outflow total in minor units; recomputed from the
    /// authoritative history on a miss and seeded with a window-aligned TTL.
    async fn rolling_total(
        &self,
        account: Uuid,
        window: Window,
        now: DateTime<Utc>,
    ) -> Result<BigDecimal, CoreError> {
        let key = window.total_key(account, now);

        match self.cache.get(&key).await {
            Ok(Some(raw)) => {
                if let Ok(minor) = raw.parse::<i64>() {
                    return Ok(BigDecimal::from(minor) / BigDecimal::from(100));
                }
                warn!(key, "discarding unparseable rolling total");
            }
            Ok(None) => {}
            Err(e) => {
                // The authoritative history still answers; only the
                // fast path is gone.
                warn!(error = %e, "rolling-total cache read failed");
            }
        }

        let total = self
            .transactions
            .outflow_since(account, window.start(now))
            .await?;

        if let Some(minor) = amount_minor_units(&total) {
            if let Err(e) = self
                .cache
                .set_ex(&key, &minor.to_string(), window.secs_until_end(now))
                .await
            {
                debug!(error = %e, "failed to seed rolling total");
            }
        }

        Ok(total)
    }

    /// Fold a completed outflow into the cached totals. Only keys that are
    /// already seeded are touched; an absent key is rebuilt from history on
    /// the next read. Best-effort: a cache fault here never fails the
    /// transaction that was already applied.
    pub async fn record_usage(&self, account: Uuid, amount: &BigDecimal, kind: TransactionKind) {
        if !matches!(kind, TransactionKind::Transfer | TransactionKind::Withdrawal) {
            return;
        }
        let Some(minor) = amount_minor_units(amount) else {
            return;
        };

        let now = Utc::now();
        for window in [Window::Day, Window::Month] {
            let key = window.total_key(account, now);
            if let Err(e) = self.cache.incr_by_if_present(&key, minor).await {
                warn!(error = %e, key, "failed to record usage");
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Window {
    Day,
    Month,
}

impl Window {
    fn total_key(self, account: Uuid, now: DateTime<Utc>) -> String {
        match self {
            Window::Day => format!("{}{}:total:day:{}", USAGE_PREFIX, account, now.format("%Y%m%d")),
            Window::Month => {
                format!("{}{}:total:month:{}", USAGE_PREFIX, account, now.format("%Y%m"))
            }
        }
    }

    fn start(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Window::Day => day_start(now),
            Window::Month => month_start(now),
        }
    }

    fn secs_until_end(self, now: DateTime<Utc>) -> u64 {
        match self {
            Window::Day => secs_until_next_midnight(now),
            Window::Month => secs_until_next_month(now),
        }
    }
}

fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc()
}

fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc()
}

fn secs_until_next_midnight(now: DateTime<Utc>) -> u64 {
    let next = (now.date_naive() + Days::new(1)).and_hms_opt(0, 0, 0).unwrap().and_utc();
    (next - now).num_seconds().max(1) as u64
}

fn secs_until_next_month(now: DateTime<Utc>) -> u64 {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    let next = NaiveDate::from_ymd_opt(year, month, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc();
    (next - now).num_seconds().max(1) as u64
}
