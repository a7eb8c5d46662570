//! Job store contract.
//!
//! Every state transition is one atomic conditional write, so several worker
//! processes can share a store without any in-memory coordination.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use queuectl_core::{DeadLetterEntry, DomainError, FailureOutcome, Job, JobId, JobState, WorkerId};

use crate::config::{QueueSettings, SettingKey, SettingsError};

/// Durable job store.
///
/// Implementations must guarantee:
/// - `claim_next` hands a given eligible job to exactly one caller
/// - `mark_completed` / `mark_failed` only succeed for the current lease holder
/// - a job id lives in exactly one of the active table and the DLQ
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Current time as seen by the store (injected clock).
    fn now(&self) -> DateTime<Utc>;

    /// Insert a new job. Fails with `DuplicateId` if the id exists in the
    /// active table or in the DLQ.
    async fn insert(&self, job: Job) -> Result<Job, StoreError>;

    /// Get an active job by id.
    async fn get(&self, id: &JobId) -> Result<Option<Job>, StoreError>;

    /// Claim the oldest eligible job (or an expired lease) for `worker`.
    /// Returns `None` if nothing is eligible.
    async fn claim_next(
        &self,
        worker: WorkerId,
        lease_duration: Duration,
    ) -> Result<Option<Job>, StoreError>;

    /// `processing → completed`; `LeaseLost` if `worker` no longer owns the job.
    async fn mark_completed(&self, id: &JobId, worker: WorkerId) -> Result<Job, StoreError>;

    /// Record a failed attempt; reschedules with backoff or moves the job to
    /// the DLQ when the retry budget is exhausted.
    async fn mark_failed(
        &self,
        id: &JobId,
        worker: WorkerId,
        error: &str,
    ) -> Result<FailureOutcome, StoreError>;

    /// List active jobs, ordered by `next_attempt_at` then id.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Counts per state.
    async fn stats(&self) -> Result<JobStats, StoreError>;

    /// List dead-lettered jobs, oldest move first.
    async fn dlq_list(&self) -> Result<Vec<DeadLetterEntry>, StoreError>;

    /// Get a dead-lettered job by id.
    async fn dlq_get(&self, id: &JobId) -> Result<Option<DeadLetterEntry>, StoreError>;

    /// Move a dead job back to the active table as a fresh pending job
    /// (attempts reset). `command` replaces the stored command when given.
    async fn dlq_requeue(&self, id: &JobId, command: Option<String>) -> Result<Job, StoreError>;

    /// Permanently discard a dead job.
    async fn dlq_delete(&self, id: &JobId) -> Result<DeadLetterEntry, StoreError>;

    /// Persisted queue settings.
    async fn settings(&self) -> Result<QueueSettings, StoreError>;

    /// Validate and persist one setting; returns the updated settings.
    async fn set_setting(&self, key: SettingKey, value: &str) -> Result<QueueSettings, StoreError>;

    /// Whether a stop was requested for all workers sharing this store.
    async fn stop_requested(&self) -> Result<bool, StoreError>;

    async fn set_stop_requested(&self, stop: bool) -> Result<(), StoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job already exists: {0}")]
    DuplicateId(JobId),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("lease on job {id} lost by worker {worker}")]
    LeaseLost { id: JobId, worker: WorkerId },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

impl StoreError {
    /// Transient persistence failure; callers may retry.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Filter for `JobStore::list`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn state(state: JobState) -> Self {
        Self {
            state: Some(state),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.state.is_none_or(|s| s == job.state)
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead: usize,
    /// Pending or failed jobs whose `next_attempt_at` has passed
    pub ready: usize,
    /// Pending or failed jobs still waiting on backoff
    pub delayed: usize,
}

impl JobStats {
    /// Jobs that still need a worker (waiting or leased).
    pub fn outstanding(&self) -> usize {
        self.pending + self.failed + self.processing
    }

    pub(crate) fn count(&mut self, job: &Job, now: DateTime<Utc>) {
        match job.state {
            JobState::Pending => self.pending += 1,
            JobState::Processing => self.processing += 1,
            JobState::Completed => self.completed += 1,
            JobState::Failed => self.failed += 1,
            JobState::Dead => self.dead += 1,
        }
        if job.state.is_waiting() {
            if job.next_attempt_at <= now {
                self.ready += 1;
            } else {
                self.delayed += 1;
            }
        }
    }
}

/// `now + lease_duration`, rejecting durations chrono cannot represent.
pub(crate) fn lease_deadline(
    now: DateTime<Utc>,
    lease_duration: Duration,
) -> Result<DateTime<Utc>, StoreError> {
    chrono::Duration::from_std(lease_duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .ok_or_else(|| {
            StoreError::Domain(DomainError::validation(format!(
                "lease duration {lease_duration:?} out of range"
            )))
        })
}
