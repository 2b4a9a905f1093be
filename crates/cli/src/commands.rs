//! Subcommand implementations.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::info;

use feedsync_core::{Config, JobFilter, JobStatus, NewSource, Source, SourceId};
use feedsync_queue::{FeedStore, JobQueue, PgStore, SourceRegistry};
use feedsync_scheduler::{HttpFeedCollector, Reaper, Scheduler, Service, Worker};

use crate::cli::{AddSource, JobsCommand, SourcesCommand};

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn collector(config: &Config) -> Result<Arc<HttpFeedCollector>> {
    let collector = HttpFeedCollector::new(&config.worker.user_agent, config.worker.collect_timeout())
        .context("failed to build HTTP client")?;
    Ok(Arc::new(collector))
}

pub async fn migrate(store: &PgStore) -> Result<()> {
    store.migrate().await.context("failed to apply migrations")?;
    println!("migrations applied");
    Ok(())
}

/// Returns whether the pass succeeded, so `main` can set the exit code.
pub async fn schedule(config: &Config, store: Arc<dyn FeedStore>) -> Result<bool> {
    let scheduler = Scheduler::new(store, config.scheduler.pass_timeout());
    let summary = scheduler.trigger().await;
    print_json(&summary)?;
    Ok(summary.success)
}

pub async fn reap(config: &Config, store: Arc<dyn FeedStore>, stale_after_minutes: Option<u32>) -> Result<()> {
    let stale_after = match stale_after_minutes {
        Some(0) => bail!("--stale-after-minutes must be at least 1"),
        Some(m) => chrono::Duration::minutes(i64::from(m)),
        None => config.scheduler.stale_after(),
    };
    let reaper = Reaper::new(store, stale_after, config.scheduler.reap_timeout());
    let report = reaper.run().await.context("reaper pass failed")?;
    print_json(&report)
}

pub async fn work(
    config: &Config,
    store: Arc<dyn FeedStore>,
    source: Option<i64>,
    max_jobs: Option<u32>,
) -> Result<()> {
    let worker = Worker::new(store, collector(config)?, config.worker.collect_timeout());
    let max_jobs = max_jobs.unwrap_or(config.worker.max_jobs_per_drain);
    let report = worker
        .drain(source.map(SourceId), max_jobs, config.worker.pause())
        .await
        .context("worker drain failed")?;
    print_json(&report)
}

pub async fn serve(config: &Config, store: PgStore) -> Result<()> {
    store.migrate().await.context("failed to apply migrations")?;
    let service = Service::new(
        Arc::new(store),
        collector(config)?,
        &config.scheduler,
        &config.worker,
    )
    .context("invalid service cadence")?;

    service
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for Ctrl-C");
            }
        })
        .await;
    Ok(())
}

pub async fn sources(store: &dyn FeedStore, cmd: SourcesCommand) -> Result<()> {
    let now = Utc::now();
    match cmd {
        SourcesCommand::Add(AddSource { name, feed_url, interval, inactive }) => {
            let mut req = NewSource::new(name, feed_url);
            req.interval_minutes = interval;
            if inactive {
                req = req.inactive();
            }
            let source = store.register_source(req, now).await.context("failed to register source")?;
            info!(source_id = %source.id, name = %source.name, "source registered");
            print_json(&source)
        }
        SourcesCommand::List => {
            let sources = store.list_sources().await.context("failed to list sources")?;
            print_sources(&sources);
            Ok(())
        }
        SourcesCommand::Enable { id } => {
            let source = store.set_active(SourceId(id), true, now).await?;
            print_json(&source)
        }
        SourcesCommand::Disable { id } => {
            let source = store.set_active(SourceId(id), false, now).await?;
            print_json(&source)
        }
        SourcesCommand::Interval { id, minutes } => {
            let source = store.set_interval(SourceId(id), minutes, now).await?;
            print_json(&source)
        }
    }
}

pub async fn jobs(store: &dyn FeedStore, cmd: JobsCommand) -> Result<()> {
    match cmd {
        JobsCommand::List { source, status, limit } => {
            let status = status
                .map(|s| s.to_uppercase().parse::<JobStatus>())
                .transpose()?;
            let filter = JobFilter {
                source_id: source.map(SourceId),
                status,
                limit: Some(limit),
            };
            let jobs = store.list_jobs(&filter).await.context("failed to list jobs")?;
            print_json(&jobs)
        }
    }
}

fn print_sources(sources: &[Source]) {
    println!(
        "{:>5}  {:<24} {:>8} {:>8}  {:<6} {:<25}  URL",
        "ID", "NAME", "ACTIVE", "EVERY", "STATUS", "LAST COLLECTED"
    );
    for s in sources {
        let last = s
            .last_collected_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>5}  {:<24} {:>8} {:>7}m  {:<6} {:<25}  {}",
            s.id.0,
            s.name,
            s.active,
            s.interval_minutes,
            s.collection_status.as_str(),
            last,
            s.feed_url
        );
    }
}
