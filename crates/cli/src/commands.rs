//! Command execution.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::json;
use tracing::{error, info};

use queuectl_core::{JobId, JobSpec, JobState};
use queuectl_infra::jobs::{JobFilter, ShellRunner, SqliteJobStore, WorkerConfig, WorkerPool};
use queuectl_infra::{JobLookup, QueueService};

use crate::cli::{Cli, Command, ConfigCommand, DlqCommand, WorkerCommand};
use crate::render::{self, StatusView};

type Queue = QueueService<SqliteJobStore>;

/// Open the database and execute one command.
pub async fn run(cli: Cli) -> Result<()> {
    let store = SqliteJobStore::open(&cli.db)
        .await
        .with_context(|| format!("failed to open queue database {}", cli.db.display()))?;
    let queue = QueueService::new(store.clone());

    let result = cli.command.execute(&queue).await;
    store.close().await;
    result
}

impl Command {
    pub async fn execute(&self, queue: &Queue) -> Result<()> {
        match self {
            Self::Enqueue { spec } => {
                let job = queue.enqueue_json(spec).await.context("enqueue failed")?;
                render::line(&job)
            }
            Self::Worker(command) => command.execute(queue).await,
            Self::Status => {
                let view = StatusView {
                    stats: queue.status().await.context("failed to read status")?,
                    stop_requested: queue.stop_requested().await?,
                };
                render::line(&view)
            }
            Self::List { state, limit } => list(queue, *state, *limit).await,
            Self::Dlq(command) => command.execute(queue).await,
            Self::Config(command) => command.execute(queue).await,
            Self::SmokeTest => smoke_test(queue).await,
        }
    }
}

impl WorkerCommand {
    pub async fn execute(&self, queue: &Queue) -> Result<()> {
        match self {
            Self::Start {
                count,
                lease_secs,
                poll_ms,
                timeout_secs,
                max_store_failures,
                drain,
            } => {
                let config = WorkerConfig::default()
                    .with_lease_duration(Duration::from_secs(*lease_secs))
                    .with_poll_interval(Duration::from_millis(*poll_ms))
                    .with_execution_timeout(Duration::from_secs(*timeout_secs))
                    .with_max_store_failures(*max_store_failures)
                    .draining(*drain);
                start_workers(queue, config, usize::from(*count)).await
            }
            Self::Stop => {
                queue
                    .request_stop()
                    .await
                    .context("failed to set the stop flag")?;
                render::line(&json!({ "stop_requested": true }))
            }
        }
    }
}

impl DlqCommand {
    pub async fn execute(&self, queue: &Queue) -> Result<()> {
        let dlq = queue.dlq();
        match self {
            Self::List => render::lines(&dlq.list().await?),
            Self::Retry { id, command } => {
                let id = JobId::parse(id.as_str())?;
                let job = match command {
                    Some(command) => dlq.requeue_with_command(&id, command.as_str()).await,
                    None => dlq.requeue(&id).await,
                }
                .with_context(|| format!("failed to requeue {id}"))?;
                render::line(&job)
            }
            Self::Delete { id } => {
                let id = JobId::parse(id.as_str())?;
                let entry = dlq
                    .delete(&id)
                    .await
                    .with_context(|| format!("failed to delete {id}"))?;
                render::line(&entry)
            }
        }
    }
}

impl ConfigCommand {
    pub async fn execute(&self, queue: &Queue) -> Result<()> {
        match self {
            Self::Get { key: Some(key) } => {
                let value = queue.config_get(*key).await?;
                render::line(&json!({ "key": key, "value": value }))
            }
            Self::Get { key: None } => render::line(&queue.settings().await?),
            Self::Set { key, value } => {
                let settings = queue
                    .config_set(*key, value)
                    .await
                    .with_context(|| format!("failed to set {key}"))?;
                render::line(&settings)
            }
        }
    }
}

async fn list(queue: &Queue, state: Option<JobState>, limit: Option<usize>) -> Result<()> {
    // Dead jobs live in the DLQ table.
    if state == Some(JobState::Dead) {
        let mut dead = queue.dlq().list().await?;
        if let Some(limit) = limit {
            dead.truncate(limit);
        }
        return render::lines(&dead);
    }

    let mut filter = JobFilter {
        state,
        ..JobFilter::default()
    };
    if let Some(limit) = limit {
        filter = filter.with_limit(limit);
    }
    render::lines(&queue.list(&filter).await?)
}

async fn start_workers(queue: &Queue, config: WorkerConfig, count: usize) -> Result<()> {
    queue
        .clear_stop()
        .await
        .context("failed to clear the stop flag")?;

    let pool = WorkerPool::spawn(queue.store().clone(), ShellRunner::new(), config, count)
        .context("failed to start workers")?;

    let trigger = pool.trigger();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; finishing in-flight jobs");
            trigger.fire();
        }
    });

    let results = pool.join().await;
    interrupt.abort();

    let mut failed = 0usize;
    for result in results {
        match result {
            Ok(summary) => render::line(&summary)?,
            Err(e) => {
                error!(error = %e, "worker exited with an error");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{failed} worker(s) exited with an error");
    }
    Ok(())
}

async fn smoke_test(queue: &Queue) -> Result<()> {
    let succeeding = queue
        .enqueue(JobSpec {
            id: None,
            command: "echo Hello from smoke test".to_string(),
            max_retries: Some(3),
        })
        .await?;
    let failing = queue
        .enqueue(JobSpec {
            id: None,
            command: "nonexistent_cmd_xyz".to_string(),
            max_retries: Some(2),
        })
        .await?;
    render::line(&succeeding)?;
    render::line(&failing)?;

    queue.clear_stop().await?;
    let config = WorkerConfig::default()
        .with_name("smoke")
        .with_poll_interval(Duration::from_millis(200))
        .draining(true);
    let pool = WorkerPool::spawn(queue.store().clone(), ShellRunner::new(), config, 2)?;
    for result in pool.join().await {
        render::line(&result?)?;
    }

    let dead = queue.dlq().list().await?;
    render::lines(&dead)?;

    let succeeded = matches!(
        queue.find(&succeeding.id).await?,
        JobLookup::Active(job) if job.state == JobState::Completed
    );
    let dead_lettered = dead.iter().any(|entry| entry.job.id == failing.id);
    if !succeeded || !dead_lettered {
        bail!(
            "smoke test failed: {} completed = {succeeded}, {} dead-lettered = {dead_lettered}",
            succeeding.id,
            failing.id
        );
    }

    render::line(&json!({ "smoke_test": "passed" }))
}
