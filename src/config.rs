use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};
use bigdecimal::BigDecimal;
use cron::Schedule;
use dotenvy::dotenv;

use crate::services::lock::LockConfig;
use crate::services::recovery::RecoveryConfig;
use crate::services::validator::LimitConfig;

const DEFAULT_RECOVERY_SCHEDULE: &str = "0 */5 * * * *";

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    /// Name this worker registers with the event-log consumer group.
    pub consumer_name: String,
    pub limits: LimitConfig,
    pub lock: LockConfig,
    pub recovery: RecoveryConfig,
    pub recovery_schedule: Schedule,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok(); // Load .env file if present

        let schedule_expr =
            env::var("RECOVERY_SCHEDULE").unwrap_or_else(|_| DEFAULT_RECOVERY_SCHEDULE.into());
        let recovery_schedule = Schedule::from_str(&schedule_expr)
            .with_context(|| format!("RECOVERY_SCHEDULE '{}' is not a valid cron expression", schedule_expr))?;

        Ok(Config {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            consumer_name: env::var("CONSUMER_NAME").unwrap_or_else(|_| "worker-1".to_string()),
            limits: LimitConfig {
                per_transaction_ceiling: decimal_env("PER_TRANSACTION_CEILING", "1000000")?,
                daily_limit: decimal_env("DAILY_LIMIT", "2000000")?,
                monthly_limit: decimal_env("MONTHLY_LIMIT", "20000000")?,
                max_ops_per_minute: parsed_env("MAX_OPS_PER_MINUTE", 10)?,
                max_ops_per_day: parsed_env("MAX_OPS_PER_DAY", 200)?,
            },
            lock: LockConfig {
                ttl_secs: parsed_env("LOCK_TTL_SECS", 10)?,
                max_attempts: parsed_env("LOCK_MAX_ATTEMPTS", 5)?,
                backoff_ms: parsed_env("LOCK_BACKOFF_MS", 100)?,
                stale_multiplier: parsed_env("LOCK_STALE_MULTIPLIER", 5)?,
            },
            recovery: RecoveryConfig {
                staleness_minutes: parsed_env("RECOVERY_STALENESS_MINUTES", 15)?,
                batch_size: parsed_env("RECOVERY_BATCH_SIZE", 50)?,
            },
            recovery_schedule,
        })
    }
}

fn parsed_env<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{} is not a valid value", name)),
        Err(_) => Ok(default),
    }
}

fn decimal_env(name: &str, default: &str) -> Result<BigDecimal> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    BigDecimal::from_str(&raw).with_context(|| format!("{} is not a valid decimal", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_recovery_schedule_parses() {
        assert!(Schedule::from_str(DEFAULT_RECOVERY_SCHEDULE).is_ok());
    }

    #[test]
    fn decimal_defaults_parse() {
        assert_eq!(
            decimal_env("UNSET_DECIMAL_VAR", "1000000").unwrap(),
            BigDecimal::from(1_000_000)
        );
    }
}
