//! Worker loop: claim, execute, report.
//!
//! Workers never talk to each other. Each one polls the shared store, and
//! the store's atomic claim decides who runs what. A stop request (watch
//! channel or the store's stop flag) is only observed between jobs, so the
//! job in flight is always executed and reported before the worker exits.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use queuectl_core::{FailureOutcome, Job, WorkerId};

use super::runner::{CommandRunner, ExecutionError, ExecutionReport};
use super::store::{JobStore, StoreError};

/// Cap on the sleep between failing store cycles.
const MAX_STORE_BACKOFF: Duration = Duration::from_secs(30);

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// How long a claim stays exclusive
    pub lease_duration: Duration,
    /// Sleep between polls when nothing is eligible
    pub poll_interval: Duration,
    /// Per-job execution bound; the child is killed past it
    pub execution_timeout: Duration,
    /// Consecutive unavailable-store cycles tolerated before giving up
    pub max_store_failures: u32,
    /// Exit once the active table has no outstanding work
    pub drain: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            lease_duration: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
            execution_timeout: Duration::from_secs(60),
            max_store_failures: 10,
            drain: false,
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll_interval = poll;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_max_store_failures(mut self, failures: u32) -> Self {
        self.max_store_failures = failures;
        self
    }

    pub fn draining(mut self, drain: bool) -> Self {
        self.drain = drain;
        self
    }

    /// A running job must never become reclaimable: the lease has to
    /// outlive the execution timeout.
    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.poll_interval.is_zero() {
            return Err(WorkerError::InvalidConfig(
                "poll interval must be non-zero".to_string(),
            ));
        }
        if self.execution_timeout.is_zero() {
            return Err(WorkerError::InvalidConfig(
                "execution timeout must be non-zero".to_string(),
            ));
        }
        if self.lease_duration <= self.execution_timeout {
            return Err(WorkerError::InvalidConfig(format!(
                "lease duration {:?} must be longer than execution timeout {:?}",
                self.lease_duration, self.execution_timeout
            )));
        }
        if self.max_store_failures == 0 {
            return Err(WorkerError::InvalidConfig(
                "store failure budget must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Worker error.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("invalid worker configuration: {0}")]
    InvalidConfig(String),
    #[error("store unavailable for {failures} consecutive cycles: {source}")]
    StoreUnavailable {
        failures: u32,
        #[source]
        source: StoreError,
    },
    #[error("worker task crashed: {0}")]
    Crashed(String),
}

/// Result of one claim/execute/report cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing was eligible.
    Idle,
    Processed(JobOutcome),
}

/// What happened to a processed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    RetryScheduled {
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    },
    DeadLettered {
        attempts: u32,
    },
    /// The lease was taken over before the report; the result was discarded.
    LeaseLost,
}

/// Why a worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    ShutdownRequested,
    StopFlag,
    Drained,
}

/// Counters reported when a worker exits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub worker: WorkerId,
    pub name: String,
    pub processed: u64,
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub lease_lost: u64,
    pub exit: ExitReason,
}

#[derive(Debug, Default)]
struct Counters {
    processed: u64,
    completed: u64,
    retried: u64,
    dead_lettered: u64,
    lease_lost: u64,
}

impl Counters {
    fn record(&mut self, outcome: &JobOutcome) {
        self.processed += 1;
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::RetryScheduled { .. } => self.retried += 1,
            JobOutcome::DeadLettered { .. } => self.dead_lettered += 1,
            JobOutcome::LeaseLost => self.lease_lost += 1,
        }
    }
}

/// One worker: a claim/execute/report loop over a shared store.
pub struct Worker<S, R> {
    id: WorkerId,
    config: WorkerConfig,
    store: S,
    runner: R,
}

impl<S: JobStore, R: CommandRunner> Worker<S, R> {
    pub fn new(store: S, runner: R, config: WorkerConfig) -> Result<Self, WorkerError> {
        config.validate()?;
        Ok(Self {
            id: WorkerId::new(),
            config,
            store,
            runner,
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Claim at most one job, run it and report the result.
    pub async fn run_once(&self) -> Result<CycleOutcome, StoreError> {
        let Some(job) = self
            .store
            .claim_next(self.id, self.config.lease_duration)
            .await?
        else {
            return Ok(CycleOutcome::Idle);
        };

        debug!(
            worker = %self.config.name,
            job_id = %job.id,
            attempts = job.attempts,
            command = %job.command,
            "claimed job"
        );

        let result = self.runner.run(&job, self.config.execution_timeout).await;
        let outcome = self.report(&job, result).await?;
        Ok(CycleOutcome::Processed(outcome))
    }

    /// Report an execution result. An unavailable store is retried with
    /// backoff while this worker's lease is still valid, so a finished job
    /// is not dropped on a transient outage.
    async fn report(
        &self,
        job: &Job,
        result: Result<ExecutionReport, ExecutionError>,
    ) -> Result<JobOutcome, StoreError> {
        let mut failures = 0u32;
        let reported = loop {
            match self.try_report(job, &result).await {
                Err(e) if e.is_unavailable() => {
                    failures += 1;
                    let lease_valid = job
                        .lease_expires_at
                        .is_some_and(|expires| self.store.now() < expires);
                    if !lease_valid || failures >= self.config.max_store_failures {
                        break Err(e);
                    }
                    let delay = self.store_backoff_delay(failures);
                    error!(
                        worker = %self.config.name,
                        job_id = %job.id,
                        error = %e,
                        failures,
                        delay = ?delay,
                        "store unavailable while reporting; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => break other,
            }
        };

        match reported {
            Err(StoreError::LeaseLost { .. }) | Err(StoreError::NotFound(_)) => {
                warn!(
                    worker = %self.config.name,
                    job_id = %job.id,
                    "lease lost before report; result discarded"
                );
                Ok(JobOutcome::LeaseLost)
            }
            other => other,
        }
    }

    async fn try_report(
        &self,
        job: &Job,
        result: &Result<ExecutionReport, ExecutionError>,
    ) -> Result<JobOutcome, StoreError> {
        match result {
            Ok(report) => {
                let done = self.store.mark_completed(&job.id, self.id).await?;
                info!(
                    worker = %self.config.name,
                    job_id = %done.id,
                    attempts = done.attempts,
                    duration_ms = u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX),
                    "job completed"
                );
                debug!(job_id = %done.id, stdout = %report.stdout, "job output");
                Ok(JobOutcome::Completed)
            }
            Err(failure) => {
                let message = failure.to_string();
                let outcome = self.store.mark_failed(&job.id, self.id, &message).await?;
                Ok(match outcome {
                    FailureOutcome::RetryScheduled {
                        attempts,
                        next_attempt_at,
                    } => {
                        info!(
                            worker = %self.config.name,
                            job_id = %job.id,
                            attempts,
                            error = %message,
                            next_attempt_at = %next_attempt_at,
                            "job failed; retry scheduled"
                        );
                        JobOutcome::RetryScheduled {
                            attempts,
                            next_attempt_at,
                        }
                    }
                    FailureOutcome::DeadLettered { attempts } => {
                        warn!(
                            worker = %self.config.name,
                            job_id = %job.id,
                            attempts,
                            error = %message,
                            "job dead-lettered"
                        );
                        JobOutcome::DeadLettered { attempts }
                    }
                })
            }
        }
    }

    /// Exponential in `failures`, capped at `MAX_STORE_BACKOFF`.
    fn store_backoff_delay(&self, failures: u32) -> Duration {
        self.config
            .poll_interval
            .saturating_mul(1 << failures.min(5))
            .min(MAX_STORE_BACKOFF)
    }

    /// Run until shutdown, the store's stop flag, or (in drain mode) an
    /// empty queue. Dropping the shutdown sender counts as a shutdown.
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<WorkerSummary, WorkerError> {
        info!(worker = %self.config.name, worker_id = %self.id, "worker started");

        let mut counters = Counters::default();
        let mut consecutive_failures = 0u32;

        let exit = loop {
            if *shutdown.borrow() {
                break ExitReason::ShutdownRequested;
            }

            match self.store.stop_requested().await {
                Ok(true) => break ExitReason::StopFlag,
                Ok(false) => {}
                Err(e) => {
                    if self
                        .back_off(e, &mut consecutive_failures, &mut shutdown)
                        .await?
                    {
                        break ExitReason::ShutdownRequested;
                    }
                    continue;
                }
            }

            match self.run_once().await {
                Ok(CycleOutcome::Processed(outcome)) => {
                    consecutive_failures = 0;
                    counters.record(&outcome);
                }
                Ok(CycleOutcome::Idle) => {
                    consecutive_failures = 0;

                    if self.config.drain {
                        match self.store.stats().await {
                            Ok(stats) if stats.outstanding() == 0 => break ExitReason::Drained,
                            Ok(_) => {}
                            Err(e) => {
                                if self
                                    .back_off(e, &mut consecutive_failures, &mut shutdown)
                                    .await?
                                {
                                    break ExitReason::ShutdownRequested;
                                }
                                continue;
                            }
                        }
                    }

                    if sleep_or_shutdown(&mut shutdown, self.config.poll_interval).await {
                        break ExitReason::ShutdownRequested;
                    }
                }
                Err(e) => {
                    if self
                        .back_off(e, &mut consecutive_failures, &mut shutdown)
                        .await?
                    {
                        break ExitReason::ShutdownRequested;
                    }
                }
            }
        };

        info!(
            worker = %self.config.name,
            processed = counters.processed,
            exit = ?exit,
            "worker stopped"
        );

        Ok(WorkerSummary {
            worker: self.id,
            name: self.config.name.clone(),
            processed: counters.processed,
            completed: counters.completed,
            retried: counters.retried,
            dead_lettered: counters.dead_lettered,
            lease_lost: counters.lease_lost,
            exit,
        })
    }

    /// Log a store error and sleep with exponential backoff. Returns
    /// `Ok(true)` if shutdown was requested while sleeping.
    async fn back_off(
        &self,
        err: StoreError,
        consecutive_failures: &mut u32,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool, WorkerError> {
        if !err.is_unavailable() {
            error!(worker = %self.config.name, error = %err, "store operation failed");
            return Ok(sleep_or_shutdown(shutdown, self.config.poll_interval).await);
        }

        *consecutive_failures += 1;
        error!(
            worker = %self.config.name,
            error = %err,
            failures = *consecutive_failures,
            "store unavailable"
        );

        if *consecutive_failures >= self.config.max_store_failures {
            return Err(WorkerError::StoreUnavailable {
                failures: *consecutive_failures,
                source: err,
            });
        }

        let delay = self.store_backoff_delay(*consecutive_failures);
        debug!(worker = %self.config.name, delay = ?delay, "backing off before next cycle");
        Ok(sleep_or_shutdown(shutdown, delay).await)
    }
}

impl<S, R> Worker<S, R>
where
    S: JobStore + 'static,
    R: CommandRunner + 'static,
{
    /// Run this worker on the tokio runtime.
    pub fn spawn(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<Result<WorkerSummary, WorkerError>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}

/// Sleep for `delay` unless shutdown is signalled first. Returns whether
/// shutdown was requested.
async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

/// Fires the shared shutdown signal of a worker pool.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger(Arc<watch::Sender<bool>>);

impl ShutdownTrigger {
    pub fn fire(&self) {
        self.0.send_replace(true);
    }
}

/// Spawns `count` workers over one store.
pub struct WorkerPool;

impl WorkerPool {
    pub fn spawn<S, R>(
        store: S,
        runner: R,
        config: WorkerConfig,
        count: usize,
    ) -> Result<WorkerPoolHandle, WorkerError>
    where
        S: JobStore + Clone + 'static,
        R: CommandRunner + Clone + 'static,
    {
        if count == 0 {
            return Err(WorkerError::InvalidConfig(
                "worker count must be at least 1".to_string(),
            ));
        }
        config.validate()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut joins = Vec::with_capacity(count);
        for index in 1..=count {
            let config = config
                .clone()
                .with_name(format!("{}-{index}", config.name));
            let worker = Worker::new(store.clone(), runner.clone(), config)?;
            joins.push(worker.spawn(shutdown_rx.clone()));
        }

        info!(workers = count, "worker pool started");
        Ok(WorkerPoolHandle {
            shutdown: Arc::new(shutdown_tx),
            joins,
        })
    }
}

/// Handle to control running workers.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: Arc<watch::Sender<bool>>,
    joins: Vec<JoinHandle<Result<WorkerSummary, WorkerError>>>,
}

impl WorkerPoolHandle {
    /// Ask every worker to exit after its current job.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger(self.shutdown.clone())
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Wait for every worker to exit.
    pub async fn join(self) -> Vec<Result<WorkerSummary, WorkerError>> {
        let mut results = Vec::with_capacity(self.joins.len());
        for join in self.joins {
            results.push(match join.await {
                Ok(result) => result,
                Err(e) => Err(WorkerError::Crashed(e.to_string())),
            });
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::in_memory::InMemoryJobStore;
    use crate::config::{QueueSettings, SettingKey};
    use crate::jobs::store::{JobFilter, JobStats};
    use async_trait::async_trait;
    use queuectl_core::{DeadLetterEntry, JobId, JobSpec, JobState, ManualClock};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    /// Succeeds for commands equal to "ok", fails otherwise; records what ran.
    #[derive(Debug, Clone, Default)]
    struct ScriptedRunner {
        ran: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(
            &self,
            job: &Job,
            _timeout: Duration,
        ) -> Result<ExecutionReport, ExecutionError> {
            self.ran.lock().unwrap().push(job.id.to_string());
            if job.command == "ok" {
                Ok(ExecutionReport {
                    duration: Duration::ZERO,
                    stdout: String::new(),
                })
            } else {
                Err(ExecutionError::NonZeroExit {
                    code: Some(1),
                    stderr: String::new(),
                })
            }
        }
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig::default()
            .with_poll_interval(Duration::from_millis(5))
            .with_lease_duration(Duration::from_secs(30))
            .with_execution_timeout(Duration::from_secs(5))
    }

    async fn enqueue(store: &InMemoryJobStore, id: &str, command: &str, max_retries: u32) {
        let job = JobSpec::new(id, command)
            .with_max_retries(max_retries)
            .into_job(3, store.now())
            .unwrap();
        store.insert(job).await.unwrap();
    }

    #[test]
    fn config_requires_lease_longer_than_timeout() {
        assert!(WorkerConfig::default().validate().is_ok());

        let bad = WorkerConfig::default()
            .with_lease_duration(Duration::from_secs(10))
            .with_execution_timeout(Duration::from_secs(10));
        assert!(matches!(bad.validate(), Err(WorkerError::InvalidConfig(_))));

        let bad = WorkerConfig::default().with_poll_interval(Duration::ZERO);
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn run_once_completes_and_schedules_retries() {
        let clock = ManualClock::starting_now();
        let store = InMemoryJobStore::with_clock(Arc::new(clock.clone()));
        enqueue(&store, "good", "ok", 2).await;
        enqueue(&store, "bad", "fail", 2).await;

        let worker = Worker::new(store.clone(), ScriptedRunner::default(), fast_config()).unwrap();

        // "bad" sorts before "good" at the same next_attempt_at
        let first = worker.run_once().await.unwrap();
        assert!(matches!(
            first,
            CycleOutcome::Processed(JobOutcome::RetryScheduled { attempts: 1, .. })
        ));
        assert_eq!(
            worker.run_once().await.unwrap(),
            CycleOutcome::Processed(JobOutcome::Completed)
        );
        assert_eq!(worker.run_once().await.unwrap(), CycleOutcome::Idle);

        clock.advance(chrono::Duration::seconds(2));
        assert_eq!(
            worker.run_once().await.unwrap(),
            CycleOutcome::Processed(JobOutcome::DeadLettered { attempts: 2 })
        );
        assert!(store.dlq_get(&JobId::parse("bad").unwrap()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn report_after_reclaim_is_discarded() {
        let clock = ManualClock::starting_now();
        let store = InMemoryJobStore::with_clock(Arc::new(clock.clone()));
        enqueue(&store, "job", "ok", 3).await;

        let slow = Worker::new(store.clone(), ScriptedRunner::default(), fast_config()).unwrap();
        let job = store
            .claim_next(slow.id(), Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        clock.advance(chrono::Duration::seconds(31));
        let rescuer = WorkerId::new();
        store
            .claim_next(rescuer, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let outcome = slow
            .report(
                &job,
                Err(ExecutionError::TimedOut {
                    after: Duration::from_secs(5),
                }),
            )
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::LeaseLost);

        let stored = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Processing);
        assert_eq!(stored.owner, Some(rescuer));
        assert_eq!(stored.attempts, 0);
    }

    /// Delegates to an in-memory store but fails the first
    /// `completion_outages` calls to `mark_completed` as unavailable.
    #[derive(Clone)]
    struct FlakyStore {
        inner: InMemoryJobStore,
        completion_outages: Arc<AtomicU32>,
    }

    #[async_trait]
    impl JobStore for FlakyStore {
        fn now(&self) -> DateTime<Utc> {
            self.inner.now()
        }

        async fn insert(&self, job: Job) -> Result<Job, StoreError> {
            self.inner.insert(job).await
        }

        async fn get(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
            self.inner.get(id).await
        }

        async fn claim_next(
            &self,
            worker: WorkerId,
            lease_duration: Duration,
        ) -> Result<Option<Job>, StoreError> {
            self.inner.claim_next(worker, lease_duration).await
        }

        async fn mark_completed(&self, id: &JobId, worker: WorkerId) -> Result<Job, StoreError> {
            let outage = self
                .completion_outages
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if outage {
                return Err(StoreError::Unavailable("database is locked".to_string()));
            }
            self.inner.mark_completed(id, worker).await
        }

        async fn mark_failed(
            &self,
            id: &JobId,
            worker: WorkerId,
            error: &str,
        ) -> Result<FailureOutcome, StoreError> {
            self.inner.mark_failed(id, worker, error).await
        }

        async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
            self.inner.list(filter).await
        }

        async fn stats(&self) -> Result<JobStats, StoreError> {
            self.inner.stats().await
        }

        async fn dlq_list(&self) -> Result<Vec<DeadLetterEntry>, StoreError> {
            self.inner.dlq_list().await
        }

        async fn dlq_get(&self, id: &JobId) -> Result<Option<DeadLetterEntry>, StoreError> {
            self.inner.dlq_get(id).await
        }

        async fn dlq_requeue(&self, id: &JobId, command: Option<String>) -> Result<Job, StoreError> {
            self.inner.dlq_requeue(id, command).await
        }

        async fn dlq_delete(&self, id: &JobId) -> Result<DeadLetterEntry, StoreError> {
            self.inner.dlq_delete(id).await
        }

        async fn settings(&self) -> Result<QueueSettings, StoreError> {
            self.inner.settings().await
        }

        async fn set_setting(
            &self,
            key: SettingKey,
            value: &str,
        ) -> Result<QueueSettings, StoreError> {
            self.inner.set_setting(key, value).await
        }

        async fn stop_requested(&self) -> Result<bool, StoreError> {
            self.inner.stop_requested().await
        }

        async fn set_stop_requested(&self, stop: bool) -> Result<(), StoreError> {
            self.inner.set_stop_requested(stop).await
        }
    }

    #[tokio::test]
    async fn completion_survives_a_transient_store_outage() {
        let inner = InMemoryJobStore::with_clock(Arc::new(ManualClock::starting_now()));
        enqueue(&inner, "job", "ok", 3).await;
        let store = FlakyStore {
            inner: inner.clone(),
            completion_outages: Arc::new(AtomicU32::new(1)),
        };

        let worker = Worker::new(store.clone(), ScriptedRunner::default(), fast_config()).unwrap();
        assert_eq!(
            worker.run_once().await.unwrap(),
            CycleOutcome::Processed(JobOutcome::Completed)
        );
        assert_eq!(store.completion_outages.load(Ordering::SeqCst), 0);

        let stored = inner.get(&JobId::parse("job").unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.owner, None);
    }

    #[tokio::test]
    async fn report_gives_up_once_the_lease_has_expired() {
        let clock = ManualClock::starting_now();
        let inner = InMemoryJobStore::with_clock(Arc::new(clock.clone()));
        enqueue(&inner, "job", "ok", 3).await;
        let store = FlakyStore {
            inner: inner.clone(),
            completion_outages: Arc::new(AtomicU32::new(u32::MAX)),
        };

        let worker = Worker::new(store, ScriptedRunner::default(), fast_config()).unwrap();
        let job = inner
            .claim_next(worker.id(), Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        clock.advance(chrono::Duration::seconds(31));

        let result = worker
            .report(
                &job,
                Ok(ExecutionReport {
                    duration: Duration::ZERO,
                    stdout: String::new(),
                }),
            )
            .await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    /// Signals when execution starts, then takes `delay` to succeed.
    #[derive(Debug, Clone)]
    struct GatedRunner {
        started: Arc<Notify>,
        delay: Duration,
    }

    #[async_trait]
    impl CommandRunner for GatedRunner {
        async fn run(
            &self,
            _job: &Job,
            _timeout: Duration,
        ) -> Result<ExecutionReport, ExecutionError> {
            self.started.notify_one();
            tokio::time::sleep(self.delay).await;
            Ok(ExecutionReport {
                duration: self.delay,
                stdout: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn shutdown_during_execution_finishes_the_job() {
        let store = InMemoryJobStore::new();
        enqueue(&store, "slow", "sleep", 3).await;

        let started = Arc::new(Notify::new());
        let runner = GatedRunner {
            started: started.clone(),
            delay: Duration::from_millis(200),
        };
        let handle = WorkerPool::spawn(store.clone(), runner, fast_config(), 1).unwrap();

        started.notified().await;
        handle.trigger().fire();

        let results = handle.join().await;
        assert_eq!(results.len(), 1);
        let summary = results.into_iter().next().unwrap().unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.exit, ExitReason::ShutdownRequested);

        let stored = store.get(&JobId::parse("slow").unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
    }

    #[tokio::test]
    async fn drain_mode_exits_when_queue_is_empty() {
        let store = InMemoryJobStore::new();
        store
            .set_setting(SettingKey::BackoffUnitMs, "1")
            .await
            .unwrap();
        enqueue(&store, "a", "ok", 2).await;
        enqueue(&store, "b", "fail", 2).await;

        let runner = ScriptedRunner::default();
        let worker = Worker::new(store.clone(), runner.clone(), fast_config().draining(true)).unwrap();
        let (_tx, rx) = watch::channel(false);

        let summary = worker.run(rx).await.unwrap();
        assert_eq!(summary.exit, ExitReason::Drained);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.retried, 1);
        assert_eq!(summary.dead_lettered, 1);

        let ran = runner.ran.lock().unwrap().clone();
        assert_eq!(ran.iter().filter(|id| *id == "b").count(), 2);
        assert_eq!(store.stats().await.unwrap().dead, 1);
    }

    #[tokio::test]
    async fn stop_flag_ends_the_loop() {
        let store = InMemoryJobStore::new();
        store.set_stop_requested(true).await.unwrap();

        let worker = Worker::new(store, ScriptedRunner::default(), fast_config()).unwrap();
        let (_tx, rx) = watch::channel(false);

        let summary = worker.run(rx).await.unwrap();
        assert_eq!(summary.exit, ExitReason::StopFlag);
        assert_eq!(summary.processed, 0);
    }

    #[tokio::test]
    async fn pool_shutdown_stops_idle_workers() {
        let store = InMemoryJobStore::new();
        let handle = WorkerPool::spawn(store, ScriptedRunner::default(), fast_config(), 3).unwrap();
        assert_eq!(handle.len(), 3);

        handle.trigger().fire();
        let results = handle.join().await;

        assert_eq!(results.len(), 3);
        for result in results {
            assert_eq!(result.unwrap().exit, ExitReason::ShutdownRequested);
        }
    }

    #[test]
    fn pool_rejects_zero_workers() {
        let result = WorkerPool::spawn(
            InMemoryJobStore::new(),
            ScriptedRunner::default(),
            fast_config(),
            0,
        );
        assert!(matches!(result, Err(WorkerError::InvalidConfig(_))));
    }
}
