mod cli;
mod commands;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;

use feedsync_core::config::load_dotenv;
use feedsync_core::Config;
use feedsync_queue::{FeedStore, PgStore};

use crate::cli::{CliArgs, Command};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    load_dotenv();
    let args = CliArgs::parse();

    let config = match args.profile.as_deref() {
        Some(profile) => Config::for_profile(profile),
        None => Config::from_env(),
    };
    config.validate().context("invalid configuration")?;
    config.log_summary();

    let store = PgStore::connect(&config.postgres)
        .await
        .context("failed to connect to PostgreSQL")?;

    match args.command {
        Command::Migrate => commands::migrate(&store).await,
        Command::Schedule => {
            let ok = commands::schedule(&config, shared(store)).await?;
            if !ok {
                error!("scheduling pass failed");
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Reap { stale_after_minutes } => {
            commands::reap(&config, shared(store), stale_after_minutes).await
        }
        Command::Work { source, max_jobs } => {
            commands::work(&config, shared(store), source, max_jobs).await
        }
        Command::Serve => commands::serve(&config, store).await,
        Command::Sources(cmd) => commands::sources(&store, cmd).await,
        Command::Jobs(cmd) => commands::jobs(&store, cmd).await,
    }
}

fn shared(store: PgStore) -> Arc<dyn FeedStore> {
    Arc::new(store)
}
