//! CLI argument parsing for the cadence daemon

use std::path::PathBuf;

use cadence_scheduler::IntervalUnit;
use chrono::{DateTime, Utc};
use clap::{ArgGroup, Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(author, version, about = "Persistent job scheduler", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides CADENCE_CONFIG)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the scheduler loop and health endpoint (default)
    Run,

    /// Manage registered jobs
    Jobs {
        #[command(subcommand)]
        action: JobsCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum JobsCommand {
    /// List all jobs in the namespace
    List,

    /// Show one job with its decoded task
    Show {
        #[arg(required = true)]
        id: String,
    },

    /// Delete a job
    Remove {
        #[arg(required = true)]
        id: String,
    },

    /// Enable a job and compute its next run
    Enable {
        #[arg(required = true)]
        id: String,
    },

    /// Disable a job; it keeps its definition but never fires
    Disable {
        #[arg(required = true)]
        id: String,
    },

    /// Make a job due on the next tick
    RunNow {
        #[arg(required = true)]
        id: String,
    },

    /// Register a new job
    Add(AddArgs),
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("when").required(true).args(["at", "every", "cron"])))]
pub struct AddArgs {
    /// Unique job name within the namespace
    #[arg(required = true)]
    pub name: String,

    /// Dotted path of the function to run, e.g. `reports.tasks.nightly`
    #[arg(long)]
    pub callable: String,

    /// Run once at this RFC 3339 instant
    #[arg(long)]
    pub at: Option<DateTime<Utc>>,

    /// Run every N units
    #[arg(long)]
    pub every: Option<u64>,

    /// Interval unit: seconds, minutes, hours, days or weeks
    #[arg(long, default_value = "seconds")]
    pub unit: IntervalUnit,

    /// Interval grid anchor (RFC 3339)
    #[arg(long, requires = "every")]
    pub start_at: Option<DateTime<Utc>>,

    /// Cron expression (5 or 6 fields, or a macro such as @daily)
    #[arg(long)]
    pub cron: Option<String>,

    /// IANA timezone for the cron expression
    #[arg(long, requires = "cron")]
    pub timezone: Option<String>,

    /// Number of runs before the job is exhausted (interval and cron)
    #[arg(long, conflicts_with = "at")]
    pub repeat: Option<u32>,

    /// Queue the task is enqueued on
    #[arg(short, long, default_value = "default")]
    pub queue: String,

    /// Positional argument; prefix with int:, bool:, datetime: or str:
    #[arg(long = "arg")]
    pub args: Vec<String>,

    /// Keyword argument as key=value; value takes the same prefixes as --arg
    #[arg(long = "kwarg")]
    pub kwargs: Vec<String>,

    /// Seconds the worker may spend on the task
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Seconds the worker keeps the result; -1 keeps it forever
    #[arg(long, allow_negative_numbers = true)]
    pub result_ttl: Option<i64>,

    /// Enqueue ahead of tasks already waiting on the queue
    #[arg(long)]
    pub at_front: bool,

    /// Register the job disabled
    #[arg(long)]
    pub disabled: bool,
}
