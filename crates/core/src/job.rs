//! Job record and lifecycle state machine.
//!
//! Legal paths: `pending → (processing → failed)* → (processing → completed | dead)`.
//! A `processing` job whose lease expired may be claimed again (reclaim); the
//! reclaim keeps `attempts` as it was.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, WorkerId};

/// Default retry budget when neither the job spec nor the settings provide one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, waiting to be claimed
    Pending,
    /// Leased by a worker
    Processing,
    /// Exited 0
    Completed,
    /// Failed at least once, waiting for its backoff to elapse
    Failed,
    /// Retry budget exhausted; lives in the DLQ table
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }

    /// States a worker may claim once `next_attempt_at` has passed.
    pub fn is_waiting(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Failed)
    }

    /// Whether the state machine allows `self → next`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Failed, Processing)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Dead)
        )
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(DomainError::UnknownState(other.to_string())),
        }
    }
}

/// A unit of work: one shell command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub state: JobState,
    /// Failed executions recorded so far
    pub attempts: u32,
    pub max_retries: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub owner: Option<WorkerId>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// What `Job::fail` decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailureOutcome {
    /// Job stays active in `failed` until `next_attempt_at`.
    RetryScheduled {
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Job exhausted its retry budget and moves to the DLQ.
    DeadLettered { attempts: u32 },
}

impl Job {
    /// Create a pending job, immediately eligible.
    pub fn new(id: JobId, command: impl Into<String>, max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            command: command.into(),
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            next_attempt_at: now,
            owner: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    /// Whether a worker may claim this job at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Pending | JobState::Failed => self.next_attempt_at <= now,
            JobState::Processing => self.lease_expires_at.is_some_and(|at| at < now),
            JobState::Completed | JobState::Dead => false,
        }
    }

    /// Claim order: oldest eligible first, ties broken by id.
    pub fn claim_order_key(&self) -> (DateTime<Utc>, &JobId) {
        (self.next_attempt_at, &self.id)
    }

    /// Whether `worker` currently holds the lease.
    pub fn is_owned_by(&self, worker: WorkerId) -> bool {
        self.state == JobState::Processing && self.owner == Some(worker)
    }

    /// Lease the job to `worker` until `lease_expires_at`.
    pub fn claim(
        &mut self,
        worker: WorkerId,
        lease_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if !self.state.can_transition_to(JobState::Processing) {
            return Err(DomainError::illegal(self.state, JobState::Processing));
        }
        if !self.is_claimable(now) {
            return Err(DomainError::validation(format!(
                "job {} is not eligible for claim yet",
                self.id
            )));
        }
        self.state = JobState::Processing;
        self.owner = Some(worker);
        self.lease_expires_at = Some(lease_expires_at);
        self.updated_at = now;
        Ok(())
    }

    /// Record a successful execution.
    pub fn complete(&mut self, worker: WorkerId, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.is_owned_by(worker) {
            return Err(DomainError::NotOwner(worker.to_string()));
        }
        self.state = JobState::Completed;
        self.owner = None;
        self.lease_expires_at = None;
        self.last_error = None;
        self.updated_at = now;
        Ok(())
    }

    /// Record a failed execution and decide between retry and dead-letter.
    pub fn fail(
        &mut self,
        worker: WorkerId,
        error: impl Into<String>,
        now: DateTime<Utc>,
        backoff: &BackoffPolicy,
    ) -> DomainResult<FailureOutcome> {
        if !self.is_owned_by(worker) {
            return Err(DomainError::NotOwner(worker.to_string()));
        }
        self.attempts = self.attempts.saturating_add(1);
        self.last_error = Some(error.into());
        self.owner = None;
        self.lease_expires_at = None;
        self.updated_at = now;

        if self.attempts >= self.max_retries {
            self.state = JobState::Dead;
            return Ok(FailureOutcome::DeadLettered {
                attempts: self.attempts,
            });
        }

        self.state = JobState::Failed;
        self.next_attempt_at = backoff.next_attempt_at(now, self.attempts);
        Ok(FailureOutcome::RetryScheduled {
            attempts: self.attempts,
            next_attempt_at: self.next_attempt_at,
        })
    }
}

/// Job submission as accepted from callers (JSON).
///
/// ```json
/// {"id": "job1", "command": "echo hi", "max_retries": 3}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub command: String,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl JobSpec {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            command: command.into(),
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn from_json(raw: &str) -> DomainResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| DomainError::validation(format!("invalid job spec: {e}")))
    }

    /// Build the pending job, filling defaults.
    pub fn into_job(self, default_max_retries: u32, now: DateTime<Utc>) -> DomainResult<Job> {
        if self.command.trim().is_empty() {
            return Err(DomainError::validation("command must not be empty"));
        }
        let id = match self.id {
            Some(id) => JobId::parse(id)?,
            None => JobId::generate(),
        };
        let max_retries = self.max_retries.unwrap_or(default_max_retries);
        Ok(Job::new(id, self.command, max_retries, now))
    }
}

/// Terminal snapshot of a job that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    #[serde(flatten)]
    pub job: Job,
    pub moved_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(mut job: Job, moved_at: DateTime<Utc>) -> Self {
        job.state = JobState::Dead;
        job.owner = None;
        job.lease_expires_at = None;
        job.updated_at = moved_at;
        Self { job, moved_at }
    }

    /// Fresh active job for re-injection: same id, attempts reset, immediately
    /// eligible. `command` replaces the original command when given.
    pub fn to_requeued(&self, command: Option<String>, now: DateTime<Utc>) -> Job {
        let mut job = Job::new(
            self.job.id.clone(),
            command.unwrap_or_else(|| self.job.command.clone()),
            self.job.max_retries,
            now,
        );
        job.created_at = self.job.created_at;
        job
    }
}
