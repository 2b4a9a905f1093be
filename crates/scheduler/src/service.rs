//! Long-running service: the scheduling trigger, the worker pool and the
//! reaper, each on its own cron cadence.
//!
//! Startup runs one scheduling pass (boot sync) before the worker pool
//! starts, so the first drain already sees its jobs. Every later pass that
//! creates jobs wakes idle workers right away instead of waiting for their
//! next tick.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use feedsync_core::config::{SchedulerConfig, WorkerConfig};
use feedsync_core::FeedError;
use feedsync_queue::FeedStore;

use crate::cadence::Cadence;
use crate::collector::FeedCollector;
use crate::reaper::Reaper;
use crate::scheduler::Scheduler;
use crate::worker::Worker;

pub struct Service {
    store: Arc<dyn FeedStore>,
    collector: Arc<dyn FeedCollector>,
    scheduler: Arc<Scheduler>,
    reaper: Arc<Reaper>,
    schedule_cadence: Cadence,
    reap_cadence: Cadence,
    drain_cadence: Cadence,
    run_on_start: bool,
    worker: WorkerConfig,
    wake: Arc<Notify>,
}

impl Service {
    pub fn new(
        store: Arc<dyn FeedStore>,
        collector: Arc<dyn FeedCollector>,
        scheduler: &SchedulerConfig,
        worker: &WorkerConfig,
    ) -> Result<Self, FeedError> {
        Ok(Self {
            scheduler: Arc::new(Scheduler::new(store.clone(), scheduler.pass_timeout())),
            reaper: Arc::new(Reaper::new(
                store.clone(),
                scheduler.stale_after(),
                scheduler.reap_timeout(),
            )),
            schedule_cadence: Cadence::parse(&scheduler.schedule_cron)?,
            reap_cadence: Cadence::parse(&scheduler.reap_cron)?,
            drain_cadence: Cadence::parse(&worker.drain_cron)?,
            run_on_start: scheduler.run_on_start,
            worker: worker.clone(),
            store,
            collector,
            wake: Arc::new(Notify::new()),
        })
    }

    /// Run every loop until `signal` resolves, then stop them and wait.
    ///
    /// A drain interrupted by shutdown leaves its current job PROCESSING;
    /// the reaper fails it once it turns stale.
    pub async fn run_until<F>(self, signal: F)
    where
        F: Future<Output = ()>,
    {
        let (stop_tx, stop_rx) = watch::channel(false);

        if self.run_on_start {
            let summary = self.scheduler.trigger().await;
            info!(created = summary.created, success = summary.success, "boot sync finished");
        }

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        for n in 0..self.worker.concurrency {
            handles.push(self.spawn_worker(n, stop_rx.clone()));
        }
        handles.push(self.spawn_scheduler(stop_rx.clone()));
        handles.push(self.spawn_reaper(stop_rx));

        info!(
            schedule = %self.schedule_cadence.expr(),
            drain = %self.drain_cadence.expr(),
            reap = %self.reap_cadence.expr(),
            workers = self.worker.concurrency,
            "feedsync service started"
        );

        signal.await;
        info!("shutdown requested");
        let _ = stop_tx.send(true);

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "service task panicked");
            }
        }
        info!("feedsync service stopped");
    }

    fn spawn_scheduler(&self, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let scheduler = self.scheduler.clone();
        let cadence = self.schedule_cadence.clone();
        let wake = self.wake.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    fired = cadence.tick() => {
                        if !fired {
                            warn!(cron = %cadence.expr(), "schedule cadence has no future fire time");
                            break;
                        }
                    }
                    _ = stop.changed() => break,
                }
                let summary = scheduler.trigger().await;
                if summary.created > 0 {
                    wake.notify_waiters();
                }
            }
            info!("scheduling loop stopped");
        })
    }

    fn spawn_reaper(&self, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let reaper = self.reaper.clone();
        let cadence = self.reap_cadence.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    fired = cadence.tick() => {
                        if !fired {
                            warn!(cron = %cadence.expr(), "reap cadence has no future fire time");
                            break;
                        }
                    }
                    _ = stop.changed() => break,
                }
                if let Err(e) = reaper.run().await {
                    warn!(error = %e, transient = e.is_transient(), "reaper pass failed");
                }
            }
            info!("reaper loop stopped");
        })
    }

    fn spawn_worker(&self, n: u32, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let worker = Worker::new(
            self.store.clone(),
            self.collector.clone(),
            self.worker.collect_timeout(),
        );
        let cadence = self.drain_cadence.clone();
        let wake = self.wake.clone();
        let max_jobs = self.worker.max_jobs_per_drain;
        let pause = self.worker.pause();
        tokio::spawn(async move {
            info!(worker = %worker.id(), n, "worker started");
            loop {
                // registered before draining so a pass that lands mid-drain still wakes us
                let woken = wake.notified();
                tokio::pin!(woken);
                woken.as_mut().enable();

                tokio::select! {
                    _ = drain_once(&worker, max_jobs, pause) => {}
                    _ = stop.changed() => break,
                }
                tokio::select! {
                    fired = cadence.tick() => {
                        if !fired {
                            break;
                        }
                    }
                    _ = &mut woken => {}
                    _ = stop.changed() => break,
                }
            }
            info!(worker = %worker.id(), "worker stopped");
        })
    }
}

async fn drain_once(worker: &Worker, max_jobs: u32, pause: Duration) {
    if let Err(e) = worker.drain(None, max_jobs, pause).await {
        warn!(worker = %worker.id(), error = %e, "drain aborted");
    }
}
