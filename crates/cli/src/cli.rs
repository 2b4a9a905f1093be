use clap::{Args, Parser, Subcommand};

/// Schedules feed collection jobs and runs the workers that execute them.
///
/// Reads its settings from the environment (and `.env`); see
/// `Config::from_env` for the keys.
#[derive(Parser, Debug)]
#[command(name = "feedsync", version, about = "Feed collection scheduler and worker")]
pub struct CliArgs {
    /// Config profile; keys are looked up as `{PROFILE}_{KEY}` first.
    #[arg(long, env = "FEEDSYNC_PROFILE")]
    pub profile: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Apply the database schema.
    Migrate,

    /// Run one scheduling pass and print the summary as JSON.
    Schedule,

    /// Fail PROCESSING jobs that have been running for too long.
    Reap {
        /// Override REAP_STALE_AFTER_MINUTES.
        #[arg(long)]
        stale_after_minutes: Option<u32>,
    },

    /// Process pending jobs with the HTTP collector, then exit.
    Work {
        /// Only take jobs of this source.
        #[arg(long)]
        source: Option<i64>,

        /// Override WORKER_MAX_JOBS_PER_DRAIN.
        #[arg(long)]
        max_jobs: Option<u32>,
    },

    /// Run the scheduler, the worker pool and the reaper until Ctrl-C.
    Serve,

    /// Manage feed sources.
    #[command(subcommand)]
    Sources(SourcesCommand),

    /// Inspect jobs.
    #[command(subcommand)]
    Jobs(JobsCommand),
}

#[derive(Subcommand, Debug)]
pub enum SourcesCommand {
    /// Register a new source.
    Add(AddSource),

    /// List all sources.
    List,

    /// Make a source eligible for scheduling.
    Enable { id: i64 },

    /// Stop scheduling a source (running jobs are unaffected).
    Disable { id: i64 },

    /// Change a source's polling interval.
    Interval { id: i64, minutes: u32 },
}

#[derive(Args, Debug)]
pub struct AddSource {
    /// Unique source name.
    pub name: String,

    /// URL the collector fetches.
    pub feed_url: String,

    /// Polling interval in minutes (default 240).
    #[arg(long)]
    pub interval: Option<u32>,

    /// Register the source disabled.
    #[arg(long)]
    pub inactive: bool,
}

#[derive(Subcommand, Debug)]
pub enum JobsCommand {
    /// List jobs, newest first.
    List {
        #[arg(long)]
        source: Option<i64>,

        /// PENDING, PROCESSING, SUCCEEDED or FAILED.
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}
