use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use tx_watchbot::accounts;
use tx_watchbot::config;
use tx_watchbot::db::{self, SessionSettings};
use tx_watchbot::model::AuthStatus;
use tx_watchbot::provider::LunchMoneyClient;

#[derive(Debug, Parser)]
#[command(author, version, about = "Administrative actions on watcher sessions")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a session or re-authorize an existing one with a new token
    Register {
        #[arg(long)]
        user_id: i64,
        #[arg(long)]
        token: String,
        #[arg(long)]
        poll_interval_secs: Option<i64>,
    },
    /// Reset an expired or blocked session to active
    Reactivate {
        #[arg(long)]
        user_id: i64,
    },
    /// Change per-user preferences
    Settings {
        #[arg(long)]
        user_id: i64,
        #[arg(long)]
        poll_interval_secs: Option<i64>,
        #[arg(long)]
        timezone: Option<String>,
        #[arg(long)]
        categorize: Option<bool>,
        #[arg(long)]
        mark_reviewed: Option<bool>,
        #[arg(long)]
        poll_pending: Option<bool>,
        #[arg(long)]
        tagging: Option<bool>,
        #[arg(long)]
        show_datetime: Option<bool>,
        #[arg(long)]
        auto_mark_reviewed: Option<bool>,
    },
    /// List users whose recipient became unreachable
    BlockedUsers,
    /// Delete every row of a blocked user
    DeleteUser {
        #[arg(long)]
        user_id: i64,
    },
    /// Stop notifying about one of the user's accounts
    IgnoreAccount {
        #[arg(long)]
        user_id: i64,
        #[arg(long)]
        account_id: i64,
    },
    UnignoreAccount {
        #[arg(long)]
        user_id: i64,
        #[arg(long)]
        account_id: i64,
    },
    /// Print metric totals for the last N days
    Stats {
        #[arg(long, default_value = "7")]
        days: i64,
    },
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

    match args.command {
        Command::Register {
            user_id,
            token,
            poll_interval_secs,
        } => {
            let interval = poll_interval_secs.unwrap_or(cfg.app.default_poll_interval_secs);
            if interval <= 0 {
                bail!("poll interval must be > 0");
            }
            db::register_session(&pool, user_id, &token, interval).await?;
            info!(user_id, interval, "session registered");
        }
        Command::Reactivate { user_id } => {
            db::set_auth_status(&pool, user_id, AuthStatus::Active).await?;
            info!(user_id, "session reactivated");
        }
        Command::Settings {
            user_id,
            poll_interval_secs,
            timezone,
            categorize,
            mark_reviewed,
            poll_pending,
            tagging,
            show_datetime,
            auto_mark_reviewed,
        } => {
            if matches!(poll_interval_secs, Some(i) if i <= 0) {
                bail!("poll interval must be > 0");
            }
            let settings = SessionSettings {
                poll_interval_secs,
                timezone,
                categorization_enabled: categorize,
                mark_reviewed_after_categorized: mark_reviewed,
                poll_pending,
                tagging,
                show_datetime,
                auto_mark_reviewed,
            };
            db::update_settings(&pool, user_id, &settings).await?;
            info!(user_id, "settings updated");
        }
        Command::BlockedUsers => {
            let users = db::blocked_users(&pool).await?;
            if users.is_empty() {
                println!("no blocked users");
            }
            for u in users {
                println!("{}\t{} deliveries", u.user_id, u.deliveries);
            }
        }
        Command::DeleteUser { user_id } => {
            if !db::delete_user_data(&pool, user_id).await? {
                bail!("user {} is not blocked; refusing to delete", user_id);
            }
            info!(user_id, "user data deleted");
        }
        Command::IgnoreAccount {
            user_id,
            account_id,
        } => {
            let provider = LunchMoneyClient::with_base_url(&cfg.provider.base_url)?;
            accounts::ignore_account(&pool, &provider, user_id, account_id).await?;
        }
        Command::UnignoreAccount {
            user_id,
            account_id,
        } => {
            db::unignore_account(&pool, user_id, account_id).await?;
            info!(user_id, account_id, "account no longer ignored");
        }
        Command::Stats { days } => {
            let to = Utc::now().date_naive();
            let from = to - Duration::days(days.max(1) - 1);
            println!("metrics from {} to {}", from, to);
            for total in db::metric_totals(&pool, from, to).await? {
                println!("{:<32} {}", total.key, total.value);
            }
        }
    }

    pool.close().await;
    Ok(())
}
