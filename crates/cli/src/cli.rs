//! Command-line arguments.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use queuectl_core::JobState;
use queuectl_infra::config::{DB_PATH_ENV, DEFAULT_DB_PATH, SettingKey};

/// Persistent background job queue.
///
/// Results are printed to stdout as JSON lines; logs go to stderr
/// (`RUST_LOG`, `QUEUECTL_LOG_FORMAT=json`).
#[derive(Debug, Parser)]
#[command(name = "queuectl", version, about)]
pub struct Cli {
    /// SQLite database file shared by every queuectl process
    #[arg(long, global = true, env = DB_PATH_ENV, default_value = DEFAULT_DB_PATH)]
    pub db: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Enqueue a job from a JSON spec, e.g. '{"id":"job1","command":"echo hi"}'
    Enqueue {
        /// Job spec: `command` (required), `id`, `max_retries`
        spec: String,
    },

    /// Start or stop workers
    #[command(subcommand)]
    Worker(WorkerCommand),

    /// Job counts per state
    Status,

    /// List active jobs, oldest eligible first
    List {
        #[arg(long, value_parser = parse_state)]
        state: Option<JobState>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Inspect and re-inject dead jobs
    #[command(subcommand)]
    Dlq(DlqCommand),

    /// Read or change persisted queue settings
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Enqueue one succeeding and one failing job and run them to completion
    SmokeTest,
}

#[derive(Debug, Subcommand)]
pub enum WorkerCommand {
    /// Run workers in the foreground until stopped (Ctrl-C or `worker stop`)
    Start {
        /// Number of concurrent workers
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
        count: u16,

        /// Lease duration in seconds
        #[arg(long, default_value_t = 300)]
        lease_secs: u64,

        /// Poll interval in milliseconds when the queue is empty
        #[arg(long, default_value_t = 1000)]
        poll_ms: u64,

        /// Per-job execution timeout in seconds
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,

        /// Consecutive store failures a worker tolerates before exiting
        #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..))]
        max_store_failures: u32,

        /// Exit once no outstanding work is left
        #[arg(long)]
        drain: bool,
    },

    /// Ask running workers to exit after their current job
    Stop,
}

#[derive(Debug, Subcommand)]
pub enum DlqCommand {
    /// List dead jobs
    List,

    /// Re-inject a dead job as pending with attempts reset
    Retry {
        id: String,

        /// Replace the job's command before re-injecting it
        #[arg(long)]
        command: Option<String>,
    },

    /// Discard a dead job permanently
    Delete { id: String },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print a setting (all settings when no key is given)
    Get {
        #[arg(value_parser = parse_setting_key)]
        key: Option<SettingKey>,
    },

    /// Change a setting: backoff_base, backoff_unit_ms, max_retries
    Set {
        #[arg(value_parser = parse_setting_key)]
        key: SettingKey,
        value: String,
    },
}

fn parse_state(raw: &str) -> Result<JobState, String> {
    raw.parse::<JobState>().map_err(|e| e.to_string())
}

fn parse_setting_key(raw: &str) -> Result<SettingKey, String> {
    raw.parse::<SettingKey>().map_err(|e| e.to_string())
}
