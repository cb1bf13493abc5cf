use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use tx_watchbot::categorize::CategorizationTrigger;
use tx_watchbot::categorizer::{Categorizer, OpenAiCategorizer};
use tx_watchbot::channel::{MessageChannel, TelegramChannel};
use tx_watchbot::config;
use tx_watchbot::db;
use tx_watchbot::notifier::Notifier;
use tx_watchbot::provider::{FinanceProvider, LunchMoneyClient};
use tx_watchbot::scheduler::{Scheduler, SchedulerSettings};

/// How long shutdown waits for in-flight categorizations.
const CATEGORIZATION_DRAIN: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let retry = cfg.retry_policy();
    let bot = Bot::new(cfg.telegram.bot_token.clone());
    let channel: Arc<dyn MessageChannel> = Arc::new(TelegramChannel::new(bot));
    let provider: Arc<dyn FinanceProvider> =
        Arc::new(LunchMoneyClient::with_base_url(&cfg.provider.base_url)?);
    let notifier = Arc::new(Notifier::new(pool.clone(), channel, retry));

    let categorizations = TaskTracker::new();
    let trigger = match OpenAiCategorizer::from_config(&cfg.categorizer)? {
        Some(categorizer) => {
            info!(model = %cfg.categorizer.model, "categorization enabled");
            let categorizer: Arc<dyn Categorizer> = Arc::new(categorizer);
            Some(CategorizationTrigger::new(
                pool.clone(),
                provider.clone(),
                categorizer,
                notifier.clone(),
                categorizations.clone(),
                retry.call_timeout,
            ))
        }
        None => {
            info!("categorization disabled");
            None
        }
    };

    let scheduler = Scheduler::new(
        pool.clone(),
        provider,
        notifier,
        trigger,
        retry,
        SchedulerSettings::from_config(&cfg),
    );

    let shutdown = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));

    info!("starting transaction watcher");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    shutdown.cancel();
    scheduler_task.await?;

    categorizations.close();
    if tokio::time::timeout(CATEGORIZATION_DRAIN, categorizations.wait())
        .await
        .is_err()
    {
        warn!(
            remaining = categorizations.len(),
            "categorization tasks still running at shutdown"
        );
    }
    pool.close().await;
    Ok(())
}
