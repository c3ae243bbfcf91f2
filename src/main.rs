use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use remit_core::adapters::{
    create_pool, PostgresAccountStore, PostgresTransactionRepository, RedisCache, RedisEventLog,
};
use remit_core::cli::{self, Cli, Commands, DlqCommands, TxCommands};
use remit_core::config::Config;
use remit_core::ports::{AccountStore, Cache, EventLog, TransactionRepository};
use remit_core::services::{
    CompensationService, EventPublisher, EventRelay, LimitValidator, LockManager,
    LoggingEventHandler, RecoverySweep, TransactionProcessor,
};
use remit_core::startup;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let config = Config::from_env()?;

    // Setup logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let pool = create_pool(&config.database_url).await?;
    let redis_client = redis::Client::open(config.redis_url.as_str())?;

    let accounts: Arc<dyn AccountStore> = Arc::new(PostgresAccountStore::new(pool.clone()));
    let transactions: Arc<dyn TransactionRepository> =
        Arc::new(PostgresTransactionRepository::new(pool.clone()));
    let cache: Arc<dyn Cache> = Arc::new(RedisCache::new(redis_client.clone()));
    let log: Arc<dyn EventLog> = Arc::new(RedisEventLog::new(redis_client));

    let publisher = EventPublisher::new(log.clone());
    let locks = LockManager::new(cache.clone(), config.lock.clone());
    let validator = Arc::new(LimitValidator::new(
        transactions.clone(),
        cache.clone(),
        config.limits.clone(),
    ));
    let processor = TransactionProcessor::new(
        accounts.clone(),
        transactions.clone(),
        validator,
        locks.clone(),
        publisher.clone(),
    );
    let compensation =
        CompensationService::new(accounts.clone(), transactions.clone(), publisher.clone());
    let sweep = RecoverySweep::new(
        accounts,
        transactions,
        locks.clone(),
        compensation,
        publisher,
        config.recovery.clone(),
    );

    match args.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let report = startup::validate_environment(&config, &pool).await?;
            report.print();
            if !report.is_valid() {
                anyhow::bail!("startup validation failed");
            }

            let relay = EventRelay::new(
                log.clone(),
                Arc::new(LoggingEventHandler),
                config.consumer_name.clone(),
            );
            let schedule = config.recovery_schedule.clone();

            tokio::spawn(async move { relay.run().await });
            tokio::spawn(async move { sweep.run(schedule).await });
            let janitor_locks = locks.clone();
            tokio::spawn(async move {
                janitor_locks
                    .run_janitor(std::time::Duration::from_secs(60))
                    .await
            });

            tracing::info!("remit-core worker started");
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down");
        }
        Commands::Sweep => cli::handle_sweep(&sweep).await?,
        Commands::Tx(TxCommands::Cancel { tx_id }) => {
            cli::handle_tx_cancel(&processor, tx_id).await?
        }
        Commands::Tx(TxCommands::Show { tx_id }) => cli::handle_tx_show(&processor, tx_id).await?,
        Commands::Dlq(DlqCommands::List) => cli::handle_dlq_list(&log).await?,
        Commands::Dlq(DlqCommands::Requeue { entry_id }) => {
            cli::handle_dlq_requeue(&log, &entry_id).await?
        }
        Commands::Config => cli::handle_config_validate(&config)?,
    }

    Ok(())
}
